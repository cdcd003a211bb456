//! Fixed-interval scheduling of `run_once`.
//!
//! A lighter alternative to the continuous loop for hosts that already own
//! the process lifetime: each tick runs one bounded batch. A `Failure`
//! outcome (bad configuration) ends the schedule.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::pipeline::runner::{ContinuousRunner, RunOutcome};

/// Bounds for the tick period. `tokio::time::interval` rejects zero, and
/// deadlines past the far future overflow `Instant`.
const MIN_PERIOD: Duration = Duration::from_secs(1);
const MAX_PERIOD: Duration = Duration::from_secs(30 * 24 * 60 * 60);

struct Scheduled {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct Scheduler {
    runner: Arc<ContinuousRunner>,
    current: Mutex<Option<Scheduled>>,
}

impl Scheduler {
    pub fn new(runner: Arc<ContinuousRunner>) -> Self {
        Self {
            runner,
            current: Mutex::new(None),
        }
    }

    /// Run every `interval_minutes`, starting now. Replaces any previous
    /// schedule. Zero is treated as one minute.
    pub fn schedule(&self, interval_minutes: u64) {
        self.schedule_every(Duration::from_secs(interval_minutes.max(1).saturating_mul(60)));
    }

    /// `period` is clamped to one second .. thirty days.
    pub fn schedule_every(&self, period: Duration) {
        let period = period.clamp(MIN_PERIOD, MAX_PERIOD);
        let cancel = CancellationToken::new();
        let runner = Arc::clone(&self.runner);
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            info!(period_secs = period.as_secs(), "Scheduled runs started");
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {}
                }

                if let RunOutcome::Failure { reason } = runner.run_once().await {
                    error!(reason = %reason, "Scheduled run failed permanently; unscheduling");
                    break;
                }
            }
            info!("Scheduled runs stopped");
        });

        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Scheduled { handle, cancel });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
    }

    /// Stop future ticks. A run already in flight finishes normally.
    pub fn cancel_schedule(&self) {
        if let Some(scheduled) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            scheduled.cancel.cancel();
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_schedule();
    }
}
