//! Telegram sink: posts summaries to one chat through the Bot API.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;

use crate::error::ChannelError;
use crate::pipeline::capability::DeliverCapability;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const API_BASE: &str = "https://api.telegram.org";

/// Telegram sink configuration.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub chat_id: String,
}

impl TelegramConfig {
    /// Returns `None` unless both `TELEGRAM_BOT_TOKEN` and `TELEGRAM_CHAT_ID` are set.
    pub fn from_env() -> Option<Self> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .filter(|s| !s.trim().is_empty())?;
        let chat_id = std::env::var("TELEGRAM_CHAT_ID")
            .ok()
            .filter(|s| !s.trim().is_empty())?;
        Some(Self {
            bot_token: SecretString::from(bot_token),
            chat_id,
        })
    }
}

pub struct TelegramSink {
    config: Option<TelegramConfig>,
    client: reqwest::Client,
    api_base: String,
    /// Fired by `cancel()`; swapped for a fresh one so later sends still work.
    cancel: Mutex<CancellationToken>,
}

impl TelegramSink {
    pub fn new(config: Option<TelegramConfig>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            api_base: API_BASE.to_string(),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Point at a different Bot API host (self-hosted server, tests).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    fn api_url(&self, token: &str, method: &str) -> String {
        format!("{}/bot{token}/{method}", self.api_base.trim_end_matches('/'))
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Send a text message, splitting at Telegram's length limit.
    async fn send_message(&self, config: &TelegramConfig, text: &str) -> Result<(), ChannelError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(config, &chunk).await?;
        }
        Ok(())
    }

    /// Send a single chunk, Markdown first with plain-text fallback.
    async fn send_message_chunk(
        &self,
        config: &TelegramConfig,
        text: &str,
    ) -> Result<(), ChannelError> {
        let url = self.api_url(config.bot_token.expose_secret(), "sendMessage");

        let markdown_body = serde_json::json!({
            "chat_id": config.chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });
        let markdown_resp = self
            .client
            .post(&url)
            .json(&markdown_body)
            .send()
            .await
            .map_err(send_failed)?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        if markdown_status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ChannelError::AuthFailed {
                name: "telegram".into(),
                reason: "bot token rejected".into(),
            });
        }
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        let plain_body = serde_json::json!({
            "chat_id": config.chat_id,
            "text": text,
        });
        let plain_resp = self
            .client
            .post(&url)
            .json(&plain_body)
            .send()
            .await
            .map_err(send_failed)?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!(
                    "sendMessage failed (markdown: {markdown_status}, plain: {plain_err})"
                ),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl DeliverCapability for TelegramSink {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(
        &self,
        content: &str,
        _metadata: &BTreeMap<String, String>,
    ) -> Result<(), ChannelError> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured {
                name: "telegram".into(),
            })?;

        let token = self.current_token();
        tokio::select! {
            _ = token.cancelled() => Err(ChannelError::Cancelled { name: "telegram".into() }),
            r = self.send_message(config, content) => {
                if r.is_ok() {
                    tracing::debug!(chat_id = %config.chat_id, chars = content.chars().count(), "Telegram message sent");
                }
                r
            }
        }
    }

    fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    fn cancel(&self) {
        let mut token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
    }
}

fn send_failed(e: reqwest::Error) -> ChannelError {
    ChannelError::SendFailed {
        name: "telegram".into(),
        reason: e.to_string(),
    }
}

/// Split `text` into chunks of at most `max_len` bytes, preferring newline
/// then space boundaries, never cutting inside a UTF-8 sequence.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = max_len;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }

        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(limit);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { limit } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}
