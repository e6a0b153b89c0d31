//! Telegram front end for chat commands.
//!
//! When `TELEGRAM_BOT_TOKEN` is set, spawns a long-polling tokio task that
//! routes prefixed text messages through the [`CommandRouter`] and sends the
//! replies back to the chat. The chat id stands in for both the community and
//! the channel.
//!
//! Optional: `TELEGRAM_CHAT_ID` restricts the bot to one chat, and
//! `TELEGRAM_ADMIN_IDS` (comma separated user ids) grants admin commands.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::commands::{CommandContext, CommandRouter};
use crate::http_client::build_http_client_with_timeout;
use crate::server::ServerState;

/// Telegram enforces a 4096-character limit per message.
const MAX_MESSAGE_CHARS: usize = 4096;
const POLL_TIMEOUT_SECS: u64 = 30;

// ─── Telegram API types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
}

#[derive(Deserialize)]
struct Update {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Deserialize)]
struct TelegramMessage {
    chat: TelegramChat,
    from: Option<TelegramUser>,
    text: Option<String>,
}

#[derive(Deserialize)]
struct TelegramChat {
    id: i64,
}

#[derive(Deserialize)]
struct TelegramUser {
    id: i64,
    first_name: String,
    username: Option<String>,
}

// ─── Public entry point ───────────────────────────────────────────────────────

/// Spawn the Telegram bot task if `TELEGRAM_BOT_TOKEN` is set.
/// Does nothing (returns immediately) when the env var is absent.
pub fn spawn_telegram_bot(state: Arc<ServerState>) {
    let token = match std::env::var("TELEGRAM_BOT_TOKEN") {
        Ok(t) if !t.trim().is_empty() => t.trim().to_string(),
        _ => return,
    };

    let allowed_chat_id: Option<i64> = std::env::var("TELEGRAM_CHAT_ID")
        .ok()
        .and_then(|s| s.trim().parse().ok());
    let admins = parse_admin_ids(&std::env::var("TELEGRAM_ADMIN_IDS").unwrap_or_default());

    tokio::spawn(async move {
        tracing::info!(
            "Telegram bot active (allowed_chat_id: {:?}, admins: {})",
            allowed_chat_id,
            admins.len()
        );
        run_bot(state.router.clone(), token, allowed_chat_id, admins).await;
    });
}

fn parse_admin_ids(raw: &str) -> HashSet<i64> {
    raw.split(',')
        .filter_map(|id| id.trim().parse().ok())
        .collect()
}

// ─── Bot loop ─────────────────────────────────────────────────────────────────

async fn run_bot(
    router: Arc<CommandRouter>,
    token: String,
    allowed_chat_id: Option<i64>,
    admins: HashSet<i64>,
) {
    let api_base = format!("https://api.telegram.org/bot{}", token);
    let client = build_http_client_with_timeout(Some(Duration::from_secs(POLL_TIMEOUT_SECS + 10)));
    let mut offset: i64 = 0;

    loop {
        let updates = match poll_updates(&client, &api_base, offset).await {
            Some(u) => u,
            None => continue,
        };

        for update in updates {
            offset = update.update_id + 1;

            let Some(msg) = update.message else {
                continue;
            };
            let chat_id = msg.chat.id;

            if let Some(allowed) = allowed_chat_id {
                if chat_id != allowed {
                    tracing::debug!(
                        "Telegram: ignoring message from unauthorized chat {}",
                        chat_id
                    );
                    continue;
                }
            }

            let text = match msg.text {
                Some(t) if t.trim_start().starts_with(router.prefix()) => t,
                _ => continue,
            };

            let ctx = command_context(chat_id, msg.from.as_ref(), &admins);
            tracing::info!("Telegram [chat {}] {}: {:?}", chat_id, ctx.author_name, text);

            let router = router.clone();
            let replies = match tokio::task::spawn_blocking(move || router.dispatch(&ctx, &text)).await {
                Ok(replies) => replies,
                Err(e) => {
                    tracing::error!("Telegram: command task failed: {}", e);
                    continue;
                }
            };
            for reply in replies {
                if !reply.trim().is_empty() {
                    send_message(&client, &api_base, chat_id, &reply).await;
                }
            }
        }
    }
}

fn command_context(chat_id: i64, from: Option<&TelegramUser>, admins: &HashSet<i64>) -> CommandContext {
    let (author_id, author_name, is_admin) = match from {
        Some(user) => (
            user.id.to_string(),
            user.username.clone().unwrap_or_else(|| user.first_name.clone()),
            admins.contains(&user.id),
        ),
        None => (String::new(), String::new(), false),
    };
    CommandContext {
        community_id: chat_id.to_string(),
        channel_id: chat_id.to_string(),
        author_id,
        author_name,
        is_admin,
        members: None,
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn poll_updates(
    client: &reqwest::Client,
    api_base: &str,
    offset: i64,
) -> Option<Vec<Update>> {
    let url = format!("{}/getUpdates", api_base);
    let params = serde_json::json!({
        "offset": offset,
        "timeout": POLL_TIMEOUT_SECS,
        "allowed_updates": ["message"]
    });

    let resp = match client.post(&url).json(&params).send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("Telegram getUpdates error: {}", e);
            tokio::time::sleep(Duration::from_secs(5)).await;
            return None;
        }
    };

    let body: TelegramResponse<Vec<Update>> = match resp.json().await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("Telegram getUpdates parse error: {}", e);
            tokio::time::sleep(Duration::from_secs(5)).await;
            return None;
        }
    };

    if !body.ok {
        tracing::warn!("Telegram API returned ok=false");
        tokio::time::sleep(Duration::from_secs(10)).await;
        return None;
    }

    Some(body.result.unwrap_or_default())
}

fn truncate_message(text: &str) -> &str {
    match text.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

async fn send_message(client: &reqwest::Client, api_base: &str, chat_id: i64, text: &str) {
    let url = format!("{}/sendMessage", api_base);
    let payload = serde_json::json!({ "chat_id": chat_id, "text": truncate_message(text) });

    match client.post(&url).json(&payload).send().await {
        Ok(r) if r.status().is_success() => {
            tracing::debug!("Telegram: sent reply to chat {}", chat_id);
        }
        Ok(r) => {
            tracing::warn!("Telegram sendMessage failed: HTTP {}", r.status());
        }
        Err(e) => {
            tracing::error!("Telegram sendMessage error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_ids_ignore_garbage() {
        let admins = parse_admin_ids(" 1, 22 ,x,,-5");
        assert_eq!(admins, HashSet::from([1, 22, -5]));
    }

    #[test]
    fn context_uses_chat_as_community_and_channel() {
        let user = TelegramUser {
            id: 22,
            first_name: "Alice".to_string(),
            username: None,
        };
        let ctx = command_context(-100, Some(&user), &HashSet::from([22]));
        assert_eq!(ctx.community_id, "-100");
        assert_eq!(ctx.channel_id, "-100");
        assert_eq!(ctx.author_name, "Alice");
        assert!(ctx.is_admin);

        let anonymous = command_context(-100, None, &HashSet::from([22]));
        assert!(!anonymous.is_admin);
    }

    #[test]
    fn long_replies_are_truncated_on_char_boundary() {
        let text = "é".repeat(MAX_MESSAGE_CHARS + 3);
        assert_eq!(truncate_message(&text).chars().count(), MAX_MESSAGE_CHARS);
        assert_eq!(truncate_message("short"), "short");
    }

    #[test]
    fn updates_deserialize_with_sender() {
        let raw = r#"{"ok":true,"result":[{"update_id":5,"message":{"chat":{"id":9},"from":{"id":3,"first_name":"Bo","username":"bob"},"text":"$snap"}}]}"#;
        let body: TelegramResponse<Vec<Update>> = serde_json::from_str(raw).unwrap();
        let updates = body.result.unwrap();
        let message = updates[0].message.as_ref().unwrap();
        assert_eq!(message.from.as_ref().unwrap().username.as_deref(), Some("bob"));
        assert_eq!(message.text.as_deref(), Some("$snap"));
    }
}
