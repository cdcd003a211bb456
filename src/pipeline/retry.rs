//! Exponential backoff with jitter, plus a generic async retry wrapper.
//!
//! `delay = min(base * 2^attempt, max)`, then ±25% uniform jitter, never
//! negative. Attempt 1 is the first *retry*, so it already waits `2 * base`.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RetryConfig;

/// Symmetric jitter applied to every computed delay.
pub const JITTER_RATIO: f64 = 0.25;

/// Deterministic part of the backoff: `min(base * 2^attempt, max)`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |d| d.min(max))
}

/// Backoff delay with jitter drawn from the thread-local RNG.
pub fn compute_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    compute_delay_with_rng(attempt, base, max, &mut rand::thread_rng())
}

/// Backoff delay with jitter drawn from `rng`.
pub fn compute_delay_with_rng<R: Rng + ?Sized>(
    attempt: u32,
    base: Duration,
    max: Duration,
    rng: &mut R,
) -> Duration {
    let capped = backoff_delay(attempt, base, max);
    let factor = rng.gen_range(-JITTER_RATIO..=JITTER_RATIO);
    apply_jitter(capped, factor)
}

/// Scale `delay` by `1 + factor`, clamped at zero.
pub fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    let secs = (delay.as_secs_f64() * (1.0 + factor)).max(0.0);
    Duration::try_from_secs_f64(secs).unwrap_or(delay)
}

/// Backoff policy bound to a `RetryConfig`.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Jittered delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        compute_delay(attempt, self.config.base_delay, self.config.max_delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn cool_down(&self) -> Duration {
        self.config.cool_down
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

/// What the caller should wait after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStep {
    /// Backoff before the next attempt.
    pub delay: Duration,
    /// Extra fixed wait once too many failures piled up.
    pub cool_down: Option<Duration>,
}

/// Failure bookkeeping for one logical operation (a fetch, a runner cycle).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub consecutive_failures: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self) {
        self.attempt = 0;
        self.consecutive_failures = 0;
    }

    /// Count a failure and work out the wait. Once `max_attempts` consecutive
    /// failures are reached the cool-down applies and the counter resets.
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> RetryStep {
        self.attempt += 1;
        self.consecutive_failures += 1;
        let delay = policy.delay_for(self.consecutive_failures);

        if self.consecutive_failures >= policy.max_attempts() {
            self.consecutive_failures = 0;
            self.attempt = 0;
            return RetryStep {
                delay,
                cool_down: Some(policy.cool_down()),
            };
        }

        RetryStep {
            delay,
            cool_down: None,
        }
    }
}

/// Run `action` until it succeeds, up to `policy.max_attempts()` tries,
/// backing off between tries. Gives up early with the last error once
/// `cancel` fires.
pub async fn retry_with_backoff<T, E, F, Fut>(
    name: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut action: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0u32;
    loop {
        match action().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation = name, retries = attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts() || cancel.is_cancelled() {
                    warn!(operation = name, attempts = attempt, error = %e, "Giving up");
                    return Err(e);
                }

                let delay = policy.delay_for(attempt);
                warn!(
                    operation = name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(e),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::atomic::{AtomicU32, Ordering};

    const BASE: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(60);

    #[test]
    fn backoff_doubles_from_first_retry() {
        assert_eq!(backoff_delay(1, BASE, MAX), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, BASE, MAX), Duration::from_secs(4));
        assert_eq!(backoff_delay(5, BASE, MAX), Duration::from_secs(32));
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_delay(6, BASE, MAX), MAX);
        assert_eq!(backoff_delay(40, BASE, MAX), MAX);
        assert_eq!(backoff_delay(u32::MAX, BASE, MAX), MAX);
    }

    #[test]
    fn backoff_is_monotonic() {
        let mut prev = Duration::ZERO;
        for attempt in 0..64 {
            let d = backoff_delay(attempt, BASE, MAX);
            assert!(d >= prev, "attempt {attempt}: {d:?} < {prev:?}");
            prev = d;
        }
    }

    #[test]
    fn jitter_stays_within_quarter() {
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..20 {
            let nominal = backoff_delay(attempt, BASE, MAX).as_secs_f64();
            for _ in 0..50 {
                let d = compute_delay_with_rng(attempt, BASE, MAX, &mut rng).as_secs_f64();
                assert!(d >= nominal * 0.75 - 1e-9, "{d} below band of {nominal}");
                assert!(d <= nominal * 1.25 + 1e-9, "{d} above band of {nominal}");
            }
        }
    }

    #[test]
    fn jitter_is_deterministic_with_seed() {
        let a = compute_delay_with_rng(3, BASE, MAX, &mut StdRng::seed_from_u64(99));
        let b = compute_delay_with_rng(3, BASE, MAX, &mut StdRng::seed_from_u64(99));
        assert_eq!(a, b);
    }

    #[test]
    fn apply_jitter_never_negative() {
        assert_eq!(apply_jitter(Duration::from_secs(4), -2.0), Duration::ZERO);
        assert_eq!(apply_jitter(Duration::from_secs(4), 0.25), Duration::from_secs(5));
        assert_eq!(apply_jitter(Duration::ZERO, 0.25), Duration::ZERO);
    }

    #[test]
    fn retry_state_escalates_to_cool_down() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            cool_down: Duration::from_secs(300),
            ..RetryConfig::default()
        });
        let mut state = RetryState::new();

        assert_eq!(state.record_failure(&policy).cool_down, None);
        assert_eq!(state.record_failure(&policy).cool_down, None);
        let step = state.record_failure(&policy);
        assert_eq!(step.cool_down, Some(Duration::from_secs(300)));
        assert_eq!(state.consecutive_failures, 0);

        // Counter starts over after the cool-down.
        assert_eq!(state.record_failure(&policy).cool_down, None);
        assert_eq!(state.consecutive_failures, 1);
    }

    #[test]
    fn retry_state_resets_on_success() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::new();
        state.record_failure(&policy);
        state.record_failure(&policy);
        state.record_success();
        assert_eq!(state, RetryState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_backoff_succeeds_after_failures() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 5,
            ..RetryConfig::default()
        });
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, String> =
            retry_with_backoff("flaky", &policy, &CancellationToken::new(), || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(format!("fail {n}")) } else { Ok(n) }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_backoff_gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            ..RetryConfig::default()
        });
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), String> =
            retry_with_backoff("broken", &policy, &CancellationToken::new(), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            })
            .await;
        assert_eq!(result, Err("down".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_with_backoff_stops_when_cancelled() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_secs(3600),
            max_delay: Duration::from_secs(3600),
            ..RetryConfig::default()
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), String> = retry_with_backoff("cancelled", &policy, &cancel, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down".to_string())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
