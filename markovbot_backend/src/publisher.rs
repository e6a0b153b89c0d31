//! Where simulated posts go.
//!
//! `WebhookPublisher` posts through a chat webhook, which lets each message
//! carry the speaker's display name and avatar. `LogPublisher` only writes the
//! post to the log and is used when no webhook is configured.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::http_client::build_http_client_with_timeout;

/// Hard cap on message content accepted by chat webhooks.
pub const MAX_WEBHOOK_CONTENT: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingPost {
    pub channel_id: String,
    pub text: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub embed_url: Option<String>,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn post(&self, post: &OutgoingPost) -> Result<()>;
}

/// `**name**: text`, the form used whenever a post cannot impersonate.
pub fn format_attributed(post: &OutgoingPost) -> String {
    match post.display_name.as_deref() {
        Some(name) => format!("**{}**: {}", name, post.text),
        None => post.text.clone(),
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub struct WebhookPublisher {
    client: reqwest::Client,
    webhook_url: String,
}

impl WebhookPublisher {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            client: build_http_client_with_timeout(Some(Duration::from_secs(30))),
            webhook_url: webhook_url.into(),
        }
    }

    pub fn payload(post: &OutgoingPost) -> serde_json::Value {
        let mut body = serde_json::json!({
            "content": truncate_chars(&post.text, MAX_WEBHOOK_CONTENT),
        });
        if let Some(name) = post.display_name.as_deref() {
            body["username"] = serde_json::Value::String(name.to_string());
        }
        if let Some(avatar) = post.avatar_url.as_deref() {
            body["avatar_url"] = serde_json::Value::String(avatar.to_string());
        }
        if let Some(embed) = post.embed_url.as_deref() {
            body["embeds"] = serde_json::json!([{ "image": { "url": embed } }]);
        }
        body
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn post(&self, post: &OutgoingPost) -> Result<()> {
        self.client
            .post(&self.webhook_url)
            .json(&Self::payload(post))
            .send()
            .await
            .context("Failed to reach webhook")?
            .error_for_status()
            .context("Webhook rejected post")?;

        tracing::debug!(
            "Webhook post to channel {} as {:?}",
            post.channel_id,
            post.display_name
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn post(&self, post: &OutgoingPost) -> Result<()> {
        match post.embed_url.as_deref() {
            Some(embed) => tracing::info!(
                "[{}] {} ({})",
                post.channel_id,
                format_attributed(post),
                embed
            ),
            None => tracing::info!("[{}] {}", post.channel_id, format_attributed(post)),
        }
        Ok(())
    }
}
