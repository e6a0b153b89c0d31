//! The channel simulator.
//!
//! One [`Simulator`] owns a speaker queue and a rolling topic for a single
//! community. Each cycle pops a speaker, generates a line that tries to carry
//! on from the previous post's last word, pushes anyone named in the line back
//! near the front of the queue, publishes it under the speaker's identity and
//! then sleeps for a normally distributed delay.
//!
//! Cycles that produce nothing (unknown speaker, no model, no text) are retried
//! without a delay. A run of such cycles longer than `max_consecutive_skips`
//! is reported as a stall and paced like a post.

pub mod mentions;
pub mod pacing;
pub mod queue;
pub mod social_order;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use flume::Sender;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::SimulatorConfig;
use crate::corpus::{LinkPool, ModelSource};
use crate::database::BotDatabase;
use crate::markov::SentenceGenerator;
use crate::names::remove_mentions;
use crate::publisher::{OutgoingPost, Publisher};
use crate::roster::{SpeakerProfile, SpeakerRoster};

pub use mentions::{find_mentions, Mentions};
pub use pacing::PacingPolicy;
pub use queue::{SpeakerQueue, TOKEN_MENTION_MAX_SLOT};
pub use social_order::SocialOrder;

/// Looks up the channel simulated posts go to.
pub trait ChannelSource: Send + Sync {
    fn simulation_channel(&self, community_id: &str) -> Result<Option<String>>;
}

impl ChannelSource for BotDatabase {
    fn simulation_channel(&self, community_id: &str) -> Result<Option<String>> {
        self.get_simulation_channel(community_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimPhase {
    Idle,
    Selecting,
    Generating,
    Publishing,
    Pacing,
    /// The social-order model stopped producing speakers; the loop has exited.
    Halted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    UnknownSpeaker,
    NoModel,
    ModelError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedSpeaker {
    pub speaker_id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Text was generated. `published` is false when the publisher failed.
    Posted {
        speaker_id: String,
        text: String,
        published: bool,
        delay: Duration,
    },
    /// The speaker resolved but no text could be generated.
    NoText { speaker_id: String },
    /// Too many consecutive speakers could not be resolved or produced no
    /// text.
    Stalled { skipped: usize, delay: Duration },
}

impl CycleOutcome {
    /// Delay to charge before the next cycle, if any.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            CycleOutcome::Posted { delay, .. } | CycleOutcome::Stalled { delay, .. } => {
                Some(*delay)
            }
            CycleOutcome::NoText { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub skipped: Vec<SkippedSpeaker>,
    pub outcome: CycleOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimulatorEvent {
    StateChanged {
        phase: SimPhase,
        enabled: bool,
    },
    Posted {
        speaker_id: String,
        display_name: String,
        channel_id: Option<String>,
        text: String,
        embed_url: Option<String>,
        published: bool,
    },
    Skipped {
        speaker_id: String,
        reason: SkipReason,
    },
    TopicChanged {
        topic: Option<String>,
    },
    Stalled {
        skipped: usize,
    },
    Error {
        message: String,
    },
}

impl SimulatorEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SimulatorEvent::StateChanged { .. } => "state_changed",
            SimulatorEvent::Posted { .. } => "posted",
            SimulatorEvent::Skipped { .. } => "skipped",
            SimulatorEvent::TopicChanged { .. } => "topic_changed",
            SimulatorEvent::Stalled { .. } => "stalled",
            SimulatorEvent::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorStatus {
    pub community_id: String,
    pub enabled: bool,
    pub phase: SimPhase,
    pub queue_len: usize,
    pub topic: Option<String>,
    pub total_posts: u64,
    pub last_speaker: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// The on/off gate for the loop. Clones share one state.
#[derive(Debug, Clone)]
pub struct SimulationSwitch {
    tx: Arc<watch::Sender<bool>>,
}

impl SimulationSwitch {
    pub fn new(enabled: bool) -> Self {
        let (tx, _rx) = watch::channel(enabled);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_on(&self) -> bool {
        *self.tx.borrow()
    }

    /// Set the gate and return the previous value.
    pub fn set(&self, enabled: bool) -> bool {
        self.tx.send_replace(enabled)
    }

    /// Flip the gate and return the new value.
    pub fn toggle(&self) -> bool {
        let mut now = false;
        self.tx.send_modify(|enabled| {
            *enabled = !*enabled;
            now = *enabled;
        });
        now
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Read side handed to the control API and command router.
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    pub switch: SimulationSwitch,
    status: watch::Receiver<SimulatorStatus>,
}

impl SimulatorHandle {
    /// A handle with no loop behind it. Its status only follows the switch.
    pub fn detached(community_id: impl Into<String>, switch: SimulationSwitch) -> Self {
        let (_tx, status) = watch::channel(SimulatorStatus {
            community_id: community_id.into(),
            enabled: switch.is_on(),
            phase: SimPhase::Idle,
            queue_len: 0,
            topic: None,
            total_posts: 0,
            last_speaker: None,
            last_error: None,
            updated_at: Utc::now(),
        });
        Self { switch, status }
    }

    pub fn community_id(&self) -> String {
        self.status.borrow().community_id.clone()
    }

    pub fn status(&self) -> SimulatorStatus {
        let mut status = self.status.borrow().clone();
        status.enabled = self.switch.is_on();
        status
    }
}

#[derive(Debug, Clone)]
pub struct SimulatorSettings {
    pub community_id: String,
    pub topic_attempts: usize,
    pub topic_reset_interval: u64,
    pub max_consecutive_skips: usize,
    pub max_failed_generations: usize,
    pub embed_rate: f64,
    pub pacing: PacingPolicy,
}

impl SimulatorSettings {
    pub fn from_config(config: &SimulatorConfig) -> Self {
        Self {
            community_id: config.community_id.clone(),
            topic_attempts: config.topic_attempts,
            topic_reset_interval: config.topic_reset_interval,
            max_consecutive_skips: config.max_consecutive_skips,
            max_failed_generations: config.max_failed_generations,
            embed_rate: config.embed_rate,
            pacing: PacingPolicy::new(config.post_avg_secs, config.post_stddev_secs),
        }
    }
}

/// Collaborators the loop depends on.
pub struct SimulatorContext {
    pub roster: Arc<dyn SpeakerRoster>,
    pub models: Arc<dyn ModelSource>,
    pub social_order: SocialOrder,
    pub channels: Arc<dyn ChannelSource>,
    pub publisher: Arc<dyn Publisher>,
    pub links: LinkPool,
    pub events: Sender<SimulatorEvent>,
}

pub struct Simulator {
    ctx: SimulatorContext,
    settings: SimulatorSettings,
    switch: SimulationSwitch,
    status_tx: watch::Sender<SimulatorStatus>,
    queue: SpeakerQueue,
    topic: Option<String>,
    total_posts: u64,
    failed_generations: usize,
    silent_cycles: usize,
    phase: SimPhase,
    last_speaker: Option<String>,
    last_error: Option<String>,
    rng: StdRng,
}

impl Simulator {
    pub fn new(
        ctx: SimulatorContext,
        settings: SimulatorSettings,
        switch: SimulationSwitch,
        rng: StdRng,
    ) -> Self {
        let (status_tx, _rx) = watch::channel(SimulatorStatus {
            community_id: settings.community_id.clone(),
            enabled: switch.is_on(),
            phase: SimPhase::Idle,
            queue_len: 0,
            topic: None,
            total_posts: 0,
            last_speaker: None,
            last_error: None,
            updated_at: Utc::now(),
        });
        Self {
            ctx,
            settings,
            switch,
            status_tx,
            queue: SpeakerQueue::new(),
            topic: None,
            total_posts: 0,
            failed_generations: 0,
            silent_cycles: 0,
            phase: SimPhase::Idle,
            last_speaker: None,
            last_error: None,
            rng,
        }
    }

    pub fn with_queue(mut self, queue: SpeakerQueue) -> Self {
        self.queue = queue;
        self.publish_status();
        self
    }

    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            switch: self.switch.clone(),
            status: self.status_tx.subscribe(),
        }
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn set_topic(&mut self, topic: Option<String>) {
        self.topic = topic;
    }

    pub fn queue(&self) -> &SpeakerQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut SpeakerQueue {
        &mut self.queue
    }

    pub fn total_posts(&self) -> u64 {
        self.total_posts
    }

    pub fn phase(&self) -> SimPhase {
        self.phase
    }

    /// Run one cycle: select, generate, publish.
    ///
    /// Only social-order exhaustion is returned as an error; every other
    /// failure is reported through the outcome and the event bus.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.set_phase(SimPhase::Selecting);

        let mut skipped = Vec::new();
        let (profile, generator) = loop {
            if skipped.len() >= self.settings.max_consecutive_skips.max(1) {
                tracing::error!(
                    "Simulator skipped {} consecutive speakers without finding one to post",
                    skipped.len()
                );
                let count = skipped.len();
                let outcome = self.stall(
                    count,
                    format!("{} consecutive speakers could not be resolved", count),
                );
                return Ok(CycleReport { skipped, outcome });
            }

            let speaker_id = self
                .queue
                .pop_next(&self.ctx.social_order, &mut self.rng)?;
            match self.resolve(&speaker_id) {
                Ok(resolved) => break resolved,
                Err(reason) => {
                    tracing::debug!("Skipping speaker {}: {:?}", speaker_id, reason);
                    self.emit(SimulatorEvent::Skipped {
                        speaker_id: speaker_id.clone(),
                        reason: reason.clone(),
                    });
                    skipped.push(SkippedSpeaker { speaker_id, reason });
                }
            }
        };

        self.set_phase(SimPhase::Generating);
        let Some(text) = self.generate(generator.as_ref()) else {
            self.failed_generations += 1;
            tracing::debug!(
                "No text for {} (topic {:?}, {} failed in a row)",
                profile.id,
                self.topic,
                self.failed_generations
            );
            if self.failed_generations >= self.settings.max_failed_generations.max(1)
                && self.topic.is_some()
            {
                tracing::info!("Clearing topic after {} failed generations", self.failed_generations);
                self.change_topic(None);
            }

            self.silent_cycles += 1;
            if self.silent_cycles >= self.settings.max_consecutive_skips.max(1) {
                let count = self.silent_cycles;
                tracing::error!("Simulator produced no text for {} cycles in a row", count);
                let outcome = self.stall(
                    count,
                    format!("{} consecutive speakers produced no text", count),
                );
                return Ok(CycleReport { skipped, outcome });
            }

            self.publish_status();
            return Ok(CycleReport {
                skipped,
                outcome: CycleOutcome::NoText {
                    speaker_id: profile.id,
                },
            });
        };
        self.failed_generations = 0;
        self.silent_cycles = 0;

        let mentions = find_mentions(&text, &self.ctx.roster.profiles());
        self.queue.notify_mentioned(&mentions.by_name, &mut self.rng);
        self.queue
            .notify_mentioned_within(&mentions.by_token, TOKEN_MENTION_MAX_SLOT, &mut self.rng);

        self.total_posts += 1;
        let interval = self.settings.topic_reset_interval;
        if interval > 0 && self.total_posts % interval == 0 {
            tracing::debug!("Resetting topic after {} posts", self.total_posts);
            self.change_topic(None);
        } else {
            self.change_topic(topic_from(&text));
        }

        self.set_phase(SimPhase::Publishing);
        let published = self.publish(&profile, &text).await;
        self.last_speaker = Some(profile.id.clone());

        let delay = self.settings.pacing.next_delay(&mut self.rng);
        self.publish_status();
        Ok(CycleReport {
            skipped,
            outcome: CycleOutcome::Posted {
                speaker_id: profile.id,
                text,
                published,
                delay,
            },
        })
    }

    /// Drive cycles until `shutdown` fires (or its sender is dropped).
    ///
    /// Returns an error only when the social-order model is exhausted.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut enabled = self.switch.subscribe();
        tracing::info!(
            "Simulator starting for community {} (enabled: {})",
            self.settings.community_id,
            *enabled.borrow()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !*enabled.borrow_and_update() {
                self.set_phase(SimPhase::Idle);
                tokio::select! {
                    armed = wait_until_enabled(&mut enabled) => {
                        if !armed {
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
                continue;
            }

            let report = match self.run_cycle().await {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!("Simulator halted: {:#}", e);
                    self.record_error(format!("{:#}", e));
                    self.set_phase(SimPhase::Halted);
                    return Err(e);
                }
            };

            match report.outcome.delay() {
                Some(delay) => {
                    self.set_phase(SimPhase::Pacing);
                    tracing::debug!("Next post in {:.0}s", delay.as_secs_f64());
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                // Undelayed retries must still let other tasks run.
                None => tokio::task::yield_now().await,
            }
        }

        self.set_phase(SimPhase::Idle);
        tracing::info!("Simulator stopped after {} posts", self.total_posts);
        Ok(())
    }

    fn resolve(
        &self,
        speaker_id: &str,
    ) -> std::result::Result<(SpeakerProfile, Box<dyn SentenceGenerator>), SkipReason> {
        let profile = self
            .ctx
            .roster
            .resolve(speaker_id)
            .ok_or(SkipReason::UnknownSpeaker)?;
        match self
            .ctx
            .models
            .load_generator(&self.settings.community_id, speaker_id)
        {
            Ok(Some(generator)) => Ok((profile, generator)),
            Ok(None) => Err(SkipReason::NoModel),
            Err(e) => {
                tracing::warn!("Failed to load model for {}: {:#}", speaker_id, e);
                Err(SkipReason::ModelError(format!("{:#}", e)))
            }
        }
    }

    /// Try to continue the topic, then fall back to one unconstrained line.
    fn generate(&mut self, generator: &dyn SentenceGenerator) -> Option<String> {
        if let Some(topic) = self.topic.clone() {
            for _ in 0..self.settings.topic_attempts {
                let Some(sentence) = generator.generate(Some(&topic), &mut self.rng) else {
                    continue;
                };
                // The line starts with the topic word itself; post what follows it.
                if let Some((_, rest)) = sentence.split_once(' ') {
                    if !rest.trim().is_empty() {
                        return Some(rest.to_string());
                    }
                }
            }
        }
        generator.generate(None, &mut self.rng)
    }

    async fn publish(&mut self, profile: &SpeakerProfile, text: &str) -> bool {
        let text = remove_mentions(text, self.ctx.roster.as_ref());
        let embed_url = if self.rng.gen_bool(self.settings.embed_rate.clamp(0.0, 1.0)) {
            self.ctx.links.random_image(&mut self.rng).map(str::to_string)
        } else {
            None
        };

        let channel_id = match self.ctx.channels.simulation_channel(&self.settings.community_id) {
            Ok(channel) => channel,
            Err(e) => {
                self.record_error(format!("Failed to read simulation channel: {:#}", e));
                None
            }
        };

        let published = match channel_id.as_deref() {
            None => {
                self.record_error(format!(
                    "No simulation channel set for community {}",
                    self.settings.community_id
                ));
                false
            }
            Some(channel) => {
                let post = OutgoingPost {
                    channel_id: channel.to_string(),
                    text: text.clone(),
                    display_name: Some(profile.display_name.clone()),
                    avatar_url: profile.avatar_url.clone(),
                    embed_url: embed_url.clone(),
                };
                match self.ctx.publisher.post(&post).await {
                    Ok(()) => {
                        tracing::info!("{}: {}", profile.display_name, text);
                        true
                    }
                    Err(e) => {
                        self.record_error(format!(
                            "Failed to publish for {}: {:#}",
                            profile.display_name, e
                        ));
                        false
                    }
                }
            }
        };

        self.emit(SimulatorEvent::Posted {
            speaker_id: profile.id.clone(),
            display_name: profile.display_name.clone(),
            channel_id,
            text,
            embed_url,
            published,
        });
        published
    }

    /// Report a stall and charge a normal pacing delay for it.
    fn stall(&mut self, count: usize, message: String) -> CycleOutcome {
        self.silent_cycles = 0;
        self.emit(SimulatorEvent::Stalled { skipped: count });
        self.record_error(message);
        let delay = self.settings.pacing.next_delay(&mut self.rng);
        self.publish_status();
        CycleOutcome::Stalled {
            skipped: count,
            delay,
        }
    }

    fn change_topic(&mut self, topic: Option<String>) {
        if self.topic != topic {
            self.topic = topic.clone();
            self.emit(SimulatorEvent::TopicChanged { topic });
        }
    }

    fn record_error(&mut self, message: String) {
        tracing::warn!("{}", message);
        self.last_error = Some(message.clone());
        self.emit(SimulatorEvent::Error { message });
    }

    fn set_phase(&mut self, phase: SimPhase) {
        if self.phase != phase {
            self.phase = phase;
            self.emit(SimulatorEvent::StateChanged {
                phase,
                enabled: self.switch.is_on(),
            });
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(SimulatorStatus {
            community_id: self.settings.community_id.clone(),
            enabled: self.switch.is_on(),
            phase: self.phase,
            queue_len: self.queue.len(),
            topic: self.topic.clone(),
            total_posts: self.total_posts,
            last_speaker: self.last_speaker.clone(),
            last_error: self.last_error.clone(),
            updated_at: Utc::now(),
        });
    }

    fn emit(&self, event: SimulatorEvent) {
        let _ = self.ctx.events.send(event);
    }
}

/// Last word of a line with non-word characters removed. An empty result
/// means there is no topic.
pub fn topic_from(text: &str) -> Option<String> {
    let last = text.split_whitespace().last()?;
    let cleaned: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

async fn wait_until_enabled(enabled: &mut watch::Receiver<bool>) -> bool {
    enabled.wait_for(|on| *on).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_is_last_word_without_punctuation() {
        assert_eq!(topic_from("banana split is great"), Some("great".to_string()));
        assert_eq!(topic_from("is it great?!"), Some("great".to_string()));
        assert_eq!(topic_from("snake_case works"), Some("works".to_string()));
        assert_eq!(topic_from("ends with ..."), None);
        assert_eq!(topic_from("   "), None);
    }

    #[test]
    fn switch_toggles_and_reports_previous_value() {
        let switch = SimulationSwitch::new(false);
        assert!(!switch.is_on());
        assert!(switch.toggle());
        assert!(switch.is_on());
        assert!(switch.set(false));
        assert!(!switch.is_on());
        let clone = switch.clone();
        clone.set(true);
        assert!(switch.is_on());
    }

    #[tokio::test]
    async fn switch_wakes_waiting_subscriber() {
        let switch = SimulationSwitch::new(false);
        let mut rx = switch.subscribe();
        let waiter = tokio::spawn(async move { wait_until_enabled(&mut rx).await });
        tokio::task::yield_now().await;
        switch.set(true);
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn stalled_and_posted_charge_delay_but_no_text_does_not() {
        let delay = Duration::from_secs(5);
        assert_eq!(
            CycleOutcome::Stalled { skipped: 3, delay }.delay(),
            Some(delay)
        );
        assert_eq!(
            CycleOutcome::NoText {
                speaker_id: "a".into()
            }
            .delay(),
            None
        );
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = SimulatorEvent::Skipped {
            speaker_id: "7".into(),
            reason: SkipReason::NoModel,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "skipped");
        assert_eq!(value["reason"]["kind"], "no_model");
        assert_eq!(event.event_type(), "skipped");
    }
}
