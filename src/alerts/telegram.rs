// =============================================================================
// Alert channel contract (spec §6) + Telegram implementation
// =============================================================================
//
// `send`/`get_updates` is the entire contract the operator loop depends on;
// everything else here is Telegram's Bot API shape for satisfying it.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub text: Option<String>,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: u64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn send(&self, msg: &str) -> Result<()>;
    async fn get_updates(&self, offset: u64, timeout_secs: u64) -> Result<Vec<Update>>;
}

pub struct TelegramChannel {
    client: reqwest::Client,
    token: String,
    chat_id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramEnvelope<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<T>,
}

impl TelegramChannel {
    pub fn new(token: String, chat_id: i64) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            chat_id,
        }
    }

    fn url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.token, method)
    }
}

#[async_trait]
impl AlertChannel for TelegramChannel {
    #[instrument(skip(self, msg))]
    async fn send(&self, msg: &str) -> Result<()> {
        let body = json!({ "chat_id": self.chat_id, "text": msg });
        let resp = self
            .client
            .post(self.url("sendMessage"))
            .json(&body)
            .send()
            .await
            .context("sendMessage request failed")?;
        let envelope: TelegramEnvelope<serde_json::Value> =
            resp.json().await.context("failed to parse sendMessage response")?;
        if !envelope.ok {
            anyhow::bail!("sendMessage rejected: {}", envelope.description.unwrap_or_default());
        }
        Ok(())
    }

    /// Long-polls `getUpdates`. `timeout_secs` is passed straight through
    /// to Telegram's long-poll parameter; the HTTP client's own timeout is
    /// not this method's concern, the caller picks a client sized for it.
    #[instrument(skip(self))]
    async fn get_updates(&self, offset: u64, timeout_secs: u64) -> Result<Vec<Update>> {
        let body = json!({ "offset": offset, "timeout": timeout_secs });
        let resp = self
            .client
            .post(self.url("getUpdates"))
            .json(&body)
            .timeout(std::time::Duration::from_secs(timeout_secs + 10))
            .send()
            .await
            .context("getUpdates request failed")?;
        let envelope: TelegramEnvelope<Vec<Update>> =
            resp.json().await.context("failed to parse getUpdates response")?;
        if !envelope.ok {
            anyhow::bail!("getUpdates rejected: {}", envelope.description.unwrap_or_default());
        }
        let updates = envelope.result.unwrap_or_default();
        debug!(count = updates.len(), "polled telegram updates");
        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_parses_command_message() {
        let json = json!({
            "update_id": 42,
            "message": {
                "text": "/status",
                "chat": { "id": 100 },
                "from": { "id": 7, "username": "op" }
            }
        });
        let update: Update = serde_json::from_value(json).unwrap();
        assert_eq!(update.update_id, 42);
        let message = update.message.unwrap();
        assert_eq!(message.text.as_deref(), Some("/status"));
        assert_eq!(message.chat.id, 100);
        assert_eq!(message.from.unwrap().id, 7);
    }

    #[test]
    fn update_without_message_is_none() {
        let json = json!({ "update_id": 1 });
        let update: Update = serde_json::from_value(json).unwrap();
        assert!(update.message.is_none());
    }

    #[test]
    fn telegram_url_embeds_token_and_method() {
        let channel = TelegramChannel::new("TEST_TOKEN".to_string(), 1);
        assert_eq!(channel.url("sendMessage"), "https://api.telegram.org/botTEST_TOKEN/sendMessage");
    }
}
