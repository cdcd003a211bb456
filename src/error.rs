//! Error types for inbox-relay.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Source and sink I/O errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} is not configured")]
    NotConfigured { name: String },

    #[error("Fetch from {name} failed: {reason}")]
    FetchFailed { name: String, reason: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Failed to mark {id} processed on {name}: {reason}")]
    MarkFailed {
        name: String,
        id: String,
        reason: String,
    },

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Operation on channel {name} was cancelled")]
    Cancelled { name: String },
}

/// Content processor errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Processor is not ready: {0}")]
    NotReady(String),

    #[error("Request interrupted by cleanup")]
    Interrupted,

    /// Opaque failure text from the underlying engine, passed through as-is.
    #[error("{0}")]
    Engine(String),
}

/// Pipeline-level errors.
///
/// `Configuration`, `NetworkUnavailable` and `Fetch` abort a whole batch;
/// `InvalidItem`, `Processing` and `Delivery` stay inside the per-item
/// sub-pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("Pipeline not configured: {0}")]
    Configuration(String),

    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Invalid item: {0}")]
    InvalidItem(String),

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Another run is already in progress")]
    AlreadyRunning,

    #[error("Run timed out after {0:?}")]
    Timeout(Duration),
}

impl PipelineError {
    /// Whether a scheduler should try this run again later.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Configuration(_))
    }
}

/// Source failures seen by the coordinator. Missing or rejected credentials
/// are configuration problems; everything else, including a source that
/// aborted on its own, is a retryable fetch failure.
impl From<ChannelError> for PipelineError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::NotConfigured { .. } | ChannelError::AuthFailed { .. } => {
                Self::Configuration(e.to_string())
            }
            other => Self::Fetch(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_is_not_retryable() {
        assert!(!PipelineError::Configuration("no creds".into()).is_retryable());
        assert!(PipelineError::Fetch("timeout".into()).is_retryable());
        assert!(PipelineError::NetworkUnavailable("down".into()).is_retryable());
        assert!(PipelineError::Timeout(Duration::from_secs(60)).is_retryable());
        assert!(PipelineError::AlreadyRunning.is_retryable());
    }

    #[test]
    fn channel_errors_map_to_pipeline_taxonomy() {
        let e: PipelineError = ChannelError::NotConfigured {
            name: "email".into(),
        }
        .into();
        assert!(matches!(e, PipelineError::Configuration(_)));

        let e: PipelineError = ChannelError::AuthFailed {
            name: "email".into(),
            reason: "bad password".into(),
        }
        .into();
        assert!(matches!(e, PipelineError::Configuration(ref m) if m.contains("bad password")));

        let e: PipelineError = ChannelError::FetchFailed {
            name: "email".into(),
            reason: "connection reset".into(),
        }
        .into();
        assert!(matches!(e, PipelineError::Fetch(ref m) if m.contains("connection reset")));
    }

    #[test]
    fn source_side_cancel_is_a_retryable_fetch_failure() {
        let e: PipelineError = ChannelError::Cancelled {
            name: "email".into(),
        }
        .into();
        assert!(matches!(e, PipelineError::Fetch(_)));
        assert!(e.is_retryable());
    }

    #[test]
    fn engine_error_passes_text_through() {
        let e = LlmError::Engine("model overloaded (529)".into());
        assert_eq!(e.to_string(), "model overloaded (529)");
    }
}
