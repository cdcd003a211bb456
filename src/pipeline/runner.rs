//! Continuous runner: repeated batches with network gating and backoff.
//!
//! Each cycle waits (bounded) for connectivity, runs a batch through the
//! command layer, and keeps pulling batches while the source hands back
//! full, clean ones. Successful cycles sleep `cycle_interval`; failed ones
//! back off exponentially, with a cool-down after too many in a row.
//! Configuration errors stop the loop for good.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::RunnerConfig;
use crate::error::PipelineError;
use crate::net::{ConnectivityProbe, wait_for_network};
use crate::pipeline::command::{Command, CommandInvoker};
use crate::pipeline::retry::{RetryPolicy, RetryState};
use crate::pipeline::types::PipelineResult;

/// Result of a single `run_once`, as a scheduler sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Success(PipelineResult),
    /// Transient trouble; try again later.
    Retry { reason: String },
    /// Permanent; retrying will not help until something is reconfigured.
    Failure { reason: String },
}

impl RunOutcome {
    /// Map a run result onto what the scheduler should do next.
    pub fn classify(result: Result<PipelineResult, PipelineError>) -> Self {
        match result {
            Ok(r) if r.cancelled => Self::Retry {
                reason: r.summary(),
            },
            Ok(r) => Self::Success(r),
            Err(e) if !e.is_retryable() => Self::Failure {
                reason: e.to_string(),
            },
            Err(e) => Self::Retry {
                reason: e.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

pub struct ContinuousRunner {
    invoker: Arc<CommandInvoker>,
    probe: Arc<dyn ConnectivityProbe>,
    config: RunnerConfig,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl ContinuousRunner {
    pub fn new(
        invoker: Arc<CommandInvoker>,
        probe: Arc<dyn ConnectivityProbe>,
        config: RunnerConfig,
    ) -> Self {
        let policy = RetryPolicy::new(config.retry.clone());
        Self {
            invoker,
            probe,
            config,
            policy,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn invoker(&self) -> &Arc<CommandInvoker> {
        &self.invoker
    }

    /// Stop the loop and cancel whatever run is in flight.
    pub fn cancel(&self) {
        info!("Runner cancellation requested");
        self.shutdown.cancel();
        self.invoker.coordinator().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Loop until cancelled. Returns `Err` only for a permanent error.
    pub async fn run(&self) -> Result<(), PipelineError> {
        info!(
            batch_size = self.config.batch_size,
            interval_secs = self.config.cycle_interval.as_secs(),
            "Continuous runner started"
        );
        let mut retry = RetryState::new();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let wait = match self.run_cycle(&self.shutdown, true).await {
                Ok(result) if result.cancelled && self.shutdown.is_cancelled() => break,
                Ok(result) => {
                    retry.record_success();
                    info!(summary = %result.summary(), "Cycle complete");
                    self.config.cycle_interval
                }
                Err(PipelineError::Cancelled) => break,
                Err(e) if !e.is_retryable() => {
                    error!(error = %e, "Runner stopping on permanent error");
                    return Err(e);
                }
                Err(e) => {
                    let step = retry.record_failure(&self.policy);
                    let wait = step.delay + step.cool_down.unwrap_or_default();
                    if step.cool_down.is_some() {
                        warn!(
                            error = %e,
                            wait_secs = wait.as_secs(),
                            "Too many consecutive failures, cooling down"
                        );
                    } else {
                        warn!(
                            error = %e,
                            failures = retry.consecutive_failures,
                            wait_ms = wait.as_millis() as u64,
                            "Cycle failed, backing off"
                        );
                    }
                    wait
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Continuous runner stopped");
        Ok(())
    }

    /// Run a single batch under the wall-clock limit. On expiry the run is
    /// cancelled through the normal cleanup path and reported as `Retry`.
    pub async fn run_once(&self) -> RunOutcome {
        let cancel = self.shutdown.child_token();
        let run = self.run_cycle(&cancel, false);
        tokio::pin!(run);

        let result = tokio::select! {
            r = &mut run => r,
            _ = tokio::time::sleep(self.config.run_timeout) => {
                warn!(timeout_secs = self.config.run_timeout.as_secs(), "Run timed out, cancelling");
                cancel.cancel();
                match run.await {
                    Ok(partial) => warn!(summary = %partial.summary(), "Timed-out run stopped"),
                    Err(e) => warn!(error = %e, "Timed-out run stopped"),
                }
                Err(PipelineError::Timeout(self.config.run_timeout))
            }
        };

        let outcome = RunOutcome::classify(result);
        match &outcome {
            RunOutcome::Success(r) => info!(summary = %r.summary(), "Run succeeded"),
            RunOutcome::Retry { reason } => warn!(reason = %reason, "Run will be retried"),
            RunOutcome::Failure { reason } => error!(reason = %reason, "Run failed"),
        }
        outcome
    }

    async fn run_cycle(
        &self,
        cancel: &CancellationToken,
        drain: bool,
    ) -> Result<PipelineResult, PipelineError> {
        let online = wait_for_network(
            self.probe.as_ref(),
            self.config.network_wait,
            self.config.network_poll_interval,
            cancel,
        )
        .await;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if !online {
            return Err(PipelineError::NetworkUnavailable(format!(
                "no connectivity after {}s",
                self.config.network_wait.as_secs()
            )));
        }

        let batch_size = self.config.batch_size;
        let mut last = self.dispatch_batch(batch_size, cancel).await?;
        if !drain {
            return Ok(last);
        }

        let mut total = last.clone();
        let mut drained = 0;
        while last.total() == batch_size
            && last.failure_count == 0
            && !last.cancelled
            && drained < self.config.max_drain_batches
            && !cancel.is_cancelled()
        {
            drained += 1;
            info!(drained, "Source returned a full batch, fetching more");
            last = match self.dispatch_batch(batch_size, cancel).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "Follow-up batch failed; keeping earlier results");
                    break;
                }
            };
            total.success_count += last.success_count;
            total.failure_count += last.failure_count;
            total.messages.extend(last.messages.iter().cloned());
            total.cancelled |= last.cancelled;
        }
        Ok(total)
    }

    /// Dispatch a batch, forwarding `cancel` to the coordinator once the run
    /// has registered.
    async fn dispatch_batch(
        &self,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult, PipelineError> {
        let dispatch = self.invoker.dispatch(Command::RunBatch { count });
        tokio::pin!(dispatch);
        let mut forwarded = false;

        loop {
            tokio::select! {
                biased;
                r = &mut dispatch => return r,
                _ = cancel.cancelled(), if !forwarded => {
                    forwarded = true;
                    self.invoker.coordinator().cancel();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_outcomes() {
        let ok = PipelineResult {
            success_count: 2,
            ..PipelineResult::default()
        };
        assert_eq!(RunOutcome::classify(Ok(ok.clone())), RunOutcome::Success(ok));

        assert!(matches!(
            RunOutcome::classify(Err(PipelineError::Configuration("no token".into()))),
            RunOutcome::Failure { .. }
        ));
        assert!(matches!(
            RunOutcome::classify(Err(PipelineError::Fetch("reset".into()))),
            RunOutcome::Retry { .. }
        ));
        assert!(matches!(
            RunOutcome::classify(Err(PipelineError::NetworkUnavailable("down".into()))),
            RunOutcome::Retry { .. }
        ));
        assert!(matches!(
            RunOutcome::classify(Err(PipelineError::AlreadyRunning)),
            RunOutcome::Retry { .. }
        ));
    }

    #[test]
    fn cancelled_result_is_retry() {
        let cancelled = PipelineResult {
            cancelled: true,
            ..PipelineResult::default()
        };
        assert!(matches!(
            RunOutcome::classify(Ok(cancelled)),
            RunOutcome::Retry { .. }
        ));
    }

    #[test]
    fn item_failures_still_count_as_success() {
        let partial = PipelineResult {
            success_count: 1,
            failure_count: 1,
            messages: vec!["2: Processing failed: boom".into()],
            cancelled: false,
        };
        assert!(RunOutcome::classify(Ok(partial)).is_success());
    }
}
