//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Default delivery template. `{{name}}` placeholders are filled from the
/// item's metadata plus `id`, `subject` and `summary`.
pub const DEFAULT_TEMPLATE: &str =
    "📧 *{{subject}}*\nFrom: {{from}}\nDate: {{date}}\n\n{{summary}}";

/// Per-batch coordinator settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Fixed pause between consecutive items (downstream rate limits).
    pub item_delay: Duration,
    /// Maximum body length in characters before truncation.
    pub max_content_chars: usize,
    /// Delivery template.
    pub template: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            item_delay: Duration::from_secs(1),
            max_content_chars: 10_000,
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

/// Backoff settings shared by the runner and `retry_with_backoff`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay; the first retry waits `base * 2`.
    pub base_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    /// Consecutive failures before the cool-down kicks in.
    pub max_attempts: u32,
    /// Fixed wait after `max_attempts` consecutive failures.
    pub cool_down: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            cool_down: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Continuous runner settings.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Items requested per batch.
    pub batch_size: usize,
    /// Sleep between successful cycles.
    pub cycle_interval: Duration,
    /// Upper bound on waiting for connectivity before a cycle.
    pub network_wait: Duration,
    /// How often connectivity is re-probed while waiting.
    pub network_poll_interval: Duration,
    /// Hard wall-clock limit for a single `run_once`.
    pub run_timeout: Duration,
    /// Extra batches pulled in one cycle while the source keeps returning full batches.
    pub max_drain_batches: usize,
    /// Command history cap.
    pub history_cap: usize,
    pub retry: RetryConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            cycle_interval: Duration::from_secs(900), // 15 minutes
            network_wait: Duration::from_secs(30),
            network_poll_interval: Duration::from_secs(2),
            run_timeout: Duration::from_secs(60),
            max_drain_batches: 5,
            history_cap: 100,
            retry: RetryConfig::default(),
        }
    }
}

/// Which outbound sink the binary wires up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Telegram,
    Email,
}

impl FromStr for SinkKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "telegram" => Ok(Self::Telegram),
            "email" | "smtp" => Ok(Self::Email),
            other => Err(ConfigError::InvalidValue {
                key: "RELAY_SINK".into(),
                message: format!("unknown sink '{other}' (expected telegram or email)"),
            }),
        }
    }
}

/// Everything the binary reads from the environment.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub pipeline: PipelineConfig,
    pub runner: RunnerConfig,
    /// Address probed for connectivity (`host:port`).
    pub network_probe: String,
    /// Optional source query applied to every unread fetch.
    pub query: Option<String>,
    pub sink: SinkKind,
}

impl RelayConfig {
    /// Build config from `RELAY_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let pipeline = PipelineConfig {
            item_delay: Duration::from_millis(env_or("RELAY_ITEM_DELAY_MS", 1000)),
            max_content_chars: env_or("RELAY_MAX_CONTENT_CHARS", 10_000),
            template: std::env::var("RELAY_TEMPLATE")
                .unwrap_or_else(|_| DEFAULT_TEMPLATE.to_string()),
        };

        let retry = RetryConfig {
            base_delay: Duration::from_millis(env_or("RELAY_RETRY_BASE_MS", 1000)),
            max_delay: Duration::from_millis(env_or("RELAY_RETRY_MAX_MS", 60_000)),
            max_attempts: env_or("RELAY_RETRY_MAX_ATTEMPTS", 5),
            cool_down: Duration::from_secs(env_or("RELAY_COOL_DOWN_SECS", 300)),
        };

        let runner = RunnerConfig {
            batch_size: env_or("RELAY_BATCH_SIZE", 10),
            cycle_interval: Duration::from_secs(env_or("RELAY_CYCLE_INTERVAL_SECS", 900)),
            network_wait: Duration::from_secs(env_or("RELAY_NETWORK_WAIT_SECS", 30)),
            run_timeout: Duration::from_secs(env_or("RELAY_RUN_TIMEOUT_SECS", 60)),
            history_cap: env_or("RELAY_HISTORY_CAP", 100),
            retry,
            ..RunnerConfig::default()
        };

        if runner.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_BATCH_SIZE".into(),
                message: "must be at least 1".into(),
            });
        }
        if runner.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_RETRY_MAX_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }

        let sink = match std::env::var("RELAY_SINK") {
            Ok(s) => s.parse()?,
            Err(_) => SinkKind::Telegram,
        };

        Ok(Self {
            pipeline,
            runner,
            network_probe: std::env::var("RELAY_NETWORK_PROBE")
                .unwrap_or_else(|_| "1.1.1.1:53".to_string()),
            query: std::env::var("RELAY_QUERY")
                .ok()
                .filter(|q| !q.trim().is_empty()),
            sink,
        })
    }
}

/// Parse an environment variable, falling back to `default` when unset or malformed.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let p = PipelineConfig::default();
        assert_eq!(p.item_delay, Duration::from_secs(1));
        assert_eq!(p.max_content_chars, 10_000);

        let r = RunnerConfig::default();
        assert_eq!(r.cycle_interval, Duration::from_secs(900));
        assert_eq!(r.network_wait, Duration::from_secs(30));
        assert_eq!(r.run_timeout, Duration::from_secs(60));
        assert_eq!(r.history_cap, 100);
        assert_eq!(r.retry.max_attempts, 5);
        assert_eq!(r.retry.cool_down, Duration::from_secs(300));
    }

    #[test]
    fn sink_kind_parses() {
        assert_eq!("telegram".parse::<SinkKind>().unwrap(), SinkKind::Telegram);
        assert_eq!(" Email ".parse::<SinkKind>().unwrap(), SinkKind::Email);
        assert_eq!("smtp".parse::<SinkKind>().unwrap(), SinkKind::Email);
        assert!("pigeon".parse::<SinkKind>().is_err());
    }

    #[test]
    fn env_or_falls_back_on_missing_var() {
        let v: u64 = env_or("RELAY_TEST_DEFINITELY_UNSET_VAR", 42);
        assert_eq!(v, 42);
    }
}
