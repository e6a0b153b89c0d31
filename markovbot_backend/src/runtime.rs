use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Receiver;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::commands::{CommandRouter, CommandSettings};
use crate::config::BotConfig;
use crate::corpus::{CorpusStore, LinkPool, NameDirectory, ServerDirectory};
use crate::database::BotDatabase;
use crate::deathmatch::Deathmatch;
use crate::ingest::load_social_order_model;
use crate::publisher::{LogPublisher, Publisher, WebhookPublisher};
use crate::roster::{DirectoryRoster, SpeakerRoster};
use crate::simulator::{
    SimulationSwitch, Simulator, SimulatorContext, SimulatorEvent, SimulatorHandle,
    SimulatorSettings, SocialOrder,
};

/// Everything the backend binary serves, wired from one config.
pub struct BackendRuntime {
    pub config: BotConfig,
    pub db: Arc<BotDatabase>,
    pub router: Arc<CommandRouter>,
    pub simulator: SimulatorHandle,
    event_rx: Receiver<SimulatorEvent>,
    pending: Option<Simulator>,
}

impl BackendRuntime {
    /// Load every data file and build the simulator and command router.
    ///
    /// A missing social-order model or simulation channel is fatal.
    pub fn bootstrap(config: BotConfig) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let sim_config = &config.simulator;
        if sim_config.community_id.trim().is_empty() {
            anyhow::bail!("No community configured (set simulator.community_id or MARKOVBOT_COMMUNITY_ID)");
        }
        let community_id = sim_config.community_id.clone();

        let db = Arc::new(
            BotDatabase::new(&config.database_path)
                .with_context(|| format!("Failed to open database {}", config.database_path))?,
        );

        let names = NameDirectory::load(Path::new(&config.names_file))?;
        let servers = ServerDirectory::load(Path::new(&config.servers_file))?;
        let links = LinkPool::load(Path::new(&config.links_file))?;
        tracing::info!(
            "Loaded {} names and {} servers",
            names.len(),
            servers.entries().len()
        );
        if links.is_empty() {
            tracing::warn!("No links loaded; simulated posts will carry no embeds");
        }

        let social_model = load_social_order_model(Path::new(&config.sim_model_file))?;
        tracing::info!(
            "Social order model has {} sequences",
            social_model.sentence_count()
        );

        match &sim_config.channel_id {
            Some(channel) => db.set_simulation_channel(&community_id, channel)?,
            None => {
                if db.get_simulation_channel(&community_id)?.is_none() {
                    anyhow::bail!(
                        "No simulation channel for community {} (set simulator.channel_id or use setsim)",
                        community_id
                    );
                }
            }
        }

        let roster: Arc<dyn SpeakerRoster> = Arc::new(
            DirectoryRoster::new(&names, &sim_config.ignore_users)
                .with_profiles_file(Path::new(&config.profiles_file))?,
        );
        let store = Arc::new(CorpusStore::new(&config.models_dir, &config.messages_dir));

        let publisher: Arc<dyn Publisher> = match sim_config.webhook_url.as_deref() {
            Some(url) if !url.trim().is_empty() => {
                tracing::info!("Publishing simulated posts through webhook");
                Arc::new(WebhookPublisher::new(url.trim()))
            }
            _ => {
                tracing::warn!("No webhook configured; simulated posts only go to the log");
                Arc::new(LogPublisher)
            }
        };

        let (event_tx, event_rx) = flume::unbounded();
        let switch = SimulationSwitch::new(sim_config.start_enabled);
        let simulator = Simulator::new(
            SimulatorContext {
                roster: roster.clone(),
                models: store.clone(),
                social_order: SocialOrder::new(Box::new(social_model), sim_config.max_fill_attempts),
                channels: db.clone(),
                publisher,
                links: links.clone(),
                events: event_tx,
            },
            SimulatorSettings::from_config(sim_config),
            switch,
            StdRng::from_entropy(),
        );
        let handle = simulator.handle();

        let mut router = CommandRouter::new(
            CommandSettings::from_config(&config),
            db.clone(),
            store,
            Arc::new(names),
            Arc::new(servers),
            roster,
        )
        .with_links(links)
        .with_simulator(handle.clone());
        match Deathmatch::load(Path::new(&config.deathmatch_file)) {
            Ok(deathmatch) => router = router.with_deathmatch(deathmatch),
            Err(e) => tracing::warn!("Deathmatch disabled: {:#}", e),
        }

        Ok(Self {
            config,
            db,
            router: Arc::new(router),
            simulator: handle,
            event_rx,
            pending: Some(simulator),
        })
    }

    /// Receiver for simulator events. Every clone competes for the same
    /// events, so only the event bridge should hold one.
    pub fn events(&self) -> Receiver<SimulatorEvent> {
        self.event_rx.clone()
    }

    /// Start the simulator loop. Only the first call spawns anything.
    pub fn spawn_simulator(&mut self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let simulator = self.pending.take()?;
        Some(tokio::spawn(async move {
            if let Err(e) = simulator.run(shutdown).await {
                tracing::error!("Simulator loop error: {:#}", e);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markov::MarkovChain;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> BotConfig {
        let path = |name: &str| dir.path().join(name).to_string_lossy().into_owned();
        let mut config = BotConfig {
            messages_dir: path("messages"),
            models_dir: path("models"),
            names_file: path("names.txt"),
            servers_file: path("servers.txt"),
            links_file: path("links.txt"),
            deathmatch_file: path("deathmatch.txt"),
            profiles_file: path("bots.json"),
            sim_model_file: path("sim_model.json"),
            database_path: path("markovbot.db"),
            ..BotConfig::default()
        };
        config.simulator.community_id = "guild".to_string();
        config
    }

    fn write_social_model(dir: &TempDir) {
        let chain = MarkovChain::from_corpus("1 2 1 2\n2 1 2 1\n", 2);
        std::fs::write(dir.path().join("sim_model.json"), chain.to_json().unwrap()).unwrap();
    }

    #[test]
    fn bootstrap_requires_social_order_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.simulator.channel_id = Some("chan".to_string());
        assert!(BackendRuntime::bootstrap(config).is_err());
    }

    #[test]
    fn bootstrap_requires_a_simulation_channel() {
        let dir = tempfile::tempdir().unwrap();
        write_social_model(&dir);
        assert!(BackendRuntime::bootstrap(config_in(&dir)).is_err());
    }

    #[test]
    fn bootstrap_stores_configured_channel() {
        let dir = tempfile::tempdir().unwrap();
        write_social_model(&dir);
        let mut config = config_in(&dir);
        config.simulator.channel_id = Some("chan".to_string());
        config.simulator.start_enabled = false;

        let runtime = BackendRuntime::bootstrap(config).unwrap();
        assert_eq!(
            runtime.db.get_simulation_channel("guild").unwrap(),
            Some("chan".to_string())
        );
        let status = runtime.simulator.status();
        assert_eq!(status.community_id, "guild");
        assert!(!status.enabled);
    }

    #[test]
    fn bootstrap_rejects_missing_community() {
        let dir = tempfile::tempdir().unwrap();
        write_social_model(&dir);
        let mut config = config_in(&dir);
        config.simulator.community_id.clear();
        config.simulator.channel_id = Some("chan".to_string());
        assert!(BackendRuntime::bootstrap(config).is_err());
    }
}
