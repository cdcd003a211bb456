//! LLM integration: summarizes items with an Anthropic model via rig-core.
//!
//! The summarizer keeps a small engine state machine. `cleanup()` interrupts
//! whatever request is in flight and closes the engine; the next `process`
//! call reopens it with a fresh session.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::message::AssistantContent;
use rig::completion::{CompletionError, CompletionModel};
use rig::providers::anthropic;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;

use crate::error::LlmError;
use crate::pipeline::capability::ProcessCapability;
use crate::pipeline::types::Item;

const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const PROVIDER: &str = "anthropic";

const SYSTEM_PROMPT: &str = "You summarize emails for a busy reader. Reply with a short \
    plain-text summary (at most five sentences) covering who wants what and any dates, \
    numbers or action items. Do not add a greeting or a preamble.";

type AnthropicClient = rig::client::Client<anthropic::client::AnthropicExt>;
type AnthropicModel = <AnthropicClient as CompletionClient>::CompletionModel;

/// Configuration for the summarizer.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub model: String,
    pub max_tokens: u64,
    pub timeout: Duration,
}

impl LlmConfig {
    /// `ANTHROPIC_API_KEY` and `RELAY_MODEL`. A missing key leaves the
    /// summarizer not ready instead of failing here.
    pub fn from_env() -> Self {
        Self {
            api_key: SecretString::from(std::env::var("ANTHROPIC_API_KEY").unwrap_or_default()),
            model: std::env::var("RELAY_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            max_tokens: std::env::var("RELAY_MAX_TOKENS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(512),
            timeout: Duration::from_secs(45),
        }
    }
}

// ── Engine ──────────────────────────────────────────────────────────

/// Lifecycle of the underlying engine.
enum EngineState {
    Uninitialized,
    Ready {
        model: AnthropicModel,
        /// Fired by `cleanup()` to interrupt in-flight requests.
        session: CancellationToken,
    },
    Closed,
}

/// `ProcessCapability` backed by an Anthropic model through rig.
pub struct Summarizer {
    config: LlmConfig,
    state: Mutex<EngineState>,
}

impl Summarizer {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            state: Mutex::new(EngineState::Uninitialized),
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Open the engine if needed and hand back the model and session.
    fn open(&self) -> Result<(AnthropicModel, CancellationToken), LlmError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let EngineState::Ready { model, session } = &*state {
            return Ok((model.clone(), session.clone()));
        }

        let client: AnthropicClient = anthropic::Client::new(self.config.api_key.expose_secret())
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.into(),
                reason: format!("Failed to create Anthropic client: {e}"),
            })?;
        let model = client.completion_model(&self.config.model);
        let session = CancellationToken::new();
        tracing::info!("Summarizer engine opened (model: {})", self.config.model);
        *state = EngineState::Ready {
            model: model.clone(),
            session: session.clone(),
        };
        Ok((model, session))
    }

    async fn complete(&self, model: &AnthropicModel, prompt: String) -> Result<String, LlmError> {
        let request = model
            .completion_request(prompt)
            .preamble(SYSTEM_PROMPT.to_string())
            .max_tokens(self.config.max_tokens)
            .send();

        let response = tokio::time::timeout(self.config.timeout, request)
            .await
            .map_err(|_| LlmError::RequestFailed {
                provider: PROVIDER.into(),
                reason: format!("no response after {}s", self.config.timeout.as_secs()),
            })?
            .map_err(completion_error)?;

        join_text(response.choice.iter())
    }
}

#[async_trait]
impl ProcessCapability for Summarizer {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn process(&self, item: &Item) -> Result<String, LlmError> {
        if !self.is_ready() {
            return Err(LlmError::NotReady("ANTHROPIC_API_KEY is not set".into()));
        }

        let (model, session) = self.open()?;
        let prompt = build_prompt(item);

        tokio::select! {
            _ = session.cancelled() => Err(LlmError::Interrupted),
            r = self.complete(&model, prompt) => r,
        }
    }

    fn is_ready(&self) -> bool {
        !self.config.api_key.expose_secret().trim().is_empty()
    }

    fn cleanup(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let EngineState::Ready { session, .. } = &*state {
            session.cancel();
            tracing::info!("Summarizer engine closed");
        }
        *state = EngineState::Closed;
    }
}

/// Provider-reported failures keep their text verbatim.
fn completion_error(e: CompletionError) -> LlmError {
    match e {
        CompletionError::ProviderError(message) => LlmError::Engine(message),
        CompletionError::ResponseError(reason) => LlmError::InvalidResponse {
            provider: PROVIDER.into(),
            reason,
        },
        other => LlmError::RequestFailed {
            provider: PROVIDER.into(),
            reason: other.to_string(),
        },
    }
}

/// User message sent for one item.
fn build_prompt(item: &Item) -> String {
    let mut prompt = format!("Subject: {}\n", item.subject);
    if let Some(from) = item.metadata.get("from") {
        prompt.push_str(&format!("From: {from}\n"));
    }
    if let Some(date) = item.metadata.get("date") {
        prompt.push_str(&format!("Date: {date}\n"));
    }
    prompt.push('\n');
    prompt.push_str(&item.body);
    prompt
}

/// Concatenate the text blocks of a completion, skipping tool calls.
fn join_text<'a>(blocks: impl IntoIterator<Item = &'a AssistantContent>) -> Result<String, LlmError> {
    let text = blocks
        .into_iter()
        .filter_map(|block| match block {
            AssistantContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");

    let text = text.trim();
    if text.is_empty() {
        return Err(LlmError::InvalidResponse {
            provider: PROVIDER.into(),
            reason: "response contained no text".into(),
        });
    }
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(key: &str) -> LlmConfig {
        LlmConfig {
            api_key: SecretString::from(key),
            model: "claude-test".into(),
            max_tokens: 256,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn ready_only_with_key() {
        assert!(Summarizer::new(config("sk-test")).is_ready());
        assert!(!Summarizer::new(config("  ")).is_ready());
    }

    #[tokio::test]
    async fn process_without_key_is_not_ready() {
        let err = Summarizer::new(config(""))
            .process(&Item::new("1", "s", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::NotReady(_)));
    }

    #[test]
    fn cleanup_closes_and_process_reopens() {
        let s = Summarizer::new(config("sk-test"));
        let (_, first) = s.open().unwrap();
        s.cleanup();
        assert!(first.is_cancelled());
        assert!(matches!(*s.state.lock().unwrap(), EngineState::Closed));

        // Idempotent
        s.cleanup();

        let (_, second) = s.open().unwrap();
        assert!(!second.is_cancelled());
        assert!(matches!(*s.state.lock().unwrap(), EngineState::Ready { .. }));
    }

    #[test]
    fn prompt_includes_metadata() {
        let item = Item::new("1", "Launch", "We ship Friday.")
            .with_meta("from", "pm@example.com")
            .with_meta("date", "Mon, 6 Oct 2026 10:00:00 +0000");
        let prompt = build_prompt(&item);
        assert!(prompt.starts_with("Subject: Launch\nFrom: pm@example.com\n"));
        assert!(prompt.ends_with("\n\nWe ship Friday."));
    }

    #[test]
    fn summary_joins_text_blocks() {
        let blocks = vec![
            AssistantContent::text("First."),
            AssistantContent::text("Second."),
        ];
        assert_eq!(join_text(&blocks).unwrap(), "First.\nSecond.");
    }

    #[test]
    fn empty_summary_is_invalid() {
        assert!(matches!(
            join_text(&Vec::<AssistantContent>::new()),
            Err(LlmError::InvalidResponse { .. })
        ));
        assert!(matches!(
            join_text(&vec![AssistantContent::text("   ")]),
            Err(LlmError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn provider_error_text_passes_through() {
        let err = completion_error(CompletionError::ProviderError("model overloaded".into()));
        assert!(matches!(err, LlmError::Engine(ref m) if m == "model overloaded"));
        assert_eq!(err.to_string(), "model overloaded");

        let err = completion_error(CompletionError::ResponseError("no choices".into()));
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }
}
