//! Pipeline coordinator: drives fetched items through
//! validate → process → deliver → mark-processed, one at a time.
//!
//! At most one run is active per coordinator; overlapping calls are rejected
//! with `PipelineError::AlreadyRunning` instead of queued. Each run gets its
//! own cancellation token. Stage futures and the inter-item delay race that
//! token, so `cancel()` from another task takes effect at the next await
//! point; the losing stage future is dropped and cleanup runs on the
//! processing task:
//!
//! 1. `BatchCancelled`
//! 2. `fetcher.cancel()`
//! 3. `processor.cleanup()`
//! 4. `deliverer.cancel()`
//! 5. `BatchFinished` with the counts so far
//!
//! A panic in any of steps 2–4 is logged and the remaining steps still run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::pipeline::capability::{DeliverCapability, FetchCapability, ProcessCapability};
use crate::pipeline::events::{EventNotifier, PipelineEvent};
use crate::pipeline::format::{DeliveryTemplate, delivery_metadata, validate};
use crate::pipeline::types::{BatchState, Item, PipelineResult, PipelineState};

const SAMPLE_SUBJECT: &str = "Weekly engineering update";
const SAMPLE_BODY: &str = "Hi team,\n\n\
    The storage migration finished on Tuesday with no downtime. Query latency on the \
    reporting cluster dropped by roughly 30%. Next week we start moving the billing \
    service onto the new queue; expect a short maintenance window on Thursday evening.\n\n\
    Please review the rollout checklist before Wednesday.\n\nThanks,\nPlatform";
const SAMPLE_FROM: &str = "platform-team@example.com";

/// How a single item left the per-item sub-pipeline.
#[derive(Debug)]
enum ItemOutcome {
    Delivered,
    Failed(String),
    Cancelled,
}

/// Orchestrates fetch → process → deliver over the injected capabilities.
pub struct PipelineCoordinator {
    fetcher: Arc<dyn FetchCapability>,
    processor: Arc<dyn ProcessCapability>,
    deliverer: Arc<dyn DeliverCapability>,
    notifier: Arc<EventNotifier>,
    config: PipelineConfig,
    template: DeliveryTemplate,
    is_processing: AtomicBool,
    /// Token of the run in flight, if any.
    run_token: Mutex<Option<CancellationToken>>,
    state: Mutex<PipelineState>,
}

/// Releases the processing flag when a run ends, including when the run
/// future is dropped mid-flight.
struct RunGuard<'a> {
    coordinator: &'a PipelineCoordinator,
    token: CancellationToken,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *self
            .coordinator
            .run_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.coordinator.is_processing.store(false, Ordering::Release);
    }
}

impl PipelineCoordinator {
    pub fn new(
        fetcher: Arc<dyn FetchCapability>,
        processor: Arc<dyn ProcessCapability>,
        deliverer: Arc<dyn DeliverCapability>,
        notifier: Arc<EventNotifier>,
        config: PipelineConfig,
    ) -> Self {
        let template = DeliveryTemplate::new(config.template.clone());
        Self {
            fetcher,
            processor,
            deliverer,
            notifier,
            config,
            template,
            is_processing: AtomicBool::new(false),
            run_token: Mutex::new(None),
            state: Mutex::new(PipelineState::Idle),
        }
    }

    pub fn notifier(&self) -> &Arc<EventNotifier> {
        &self.notifier
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request cancellation of the run in flight. No-op when idle; safe to
    /// call repeatedly and from any task.
    pub fn cancel(&self) {
        let token = self
            .run_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match token {
            Some(token) => {
                if !token.is_cancelled() {
                    info!(state = %self.state(), "Cancellation requested");
                }
                token.cancel();
            }
            None => debug!("Cancel requested with no run in progress"),
        }
    }

    /// Fetch up to `count` items and run each through the sub-pipeline.
    ///
    /// Configuration and fetch failures emit `BatchFinished{0,0}` and return
    /// the error. A cancelled run returns `Ok` with `cancelled` set.
    pub async fn run_batch(&self, count: usize) -> Result<PipelineResult, PipelineError> {
        let guard = self.begin_run()?;
        let token = guard.token.clone();
        info!(count, source = self.fetcher.name(), "Starting batch");

        if let Err(e) = self.check_configured(true) {
            error!(error = %e, "Batch aborted before fetch");
            return Err(self.abort_batch(e));
        }

        self.set_state(PipelineState::Fetching);
        let fetched = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(self.finish_cancelled(BatchState::default())),
            r = self.fetcher.fetch_unread(count) => r,
        };

        let items = match fetched {
            Ok(items) => items,
            Err(e) => {
                error!(source = self.fetcher.name(), error = %e, "Fetch failed");
                return Err(self.abort_batch(PipelineError::from(e)));
            }
        };

        if items.is_empty() {
            info!("Nothing to process");
            self.set_state(PipelineState::Completed);
            self.notify(PipelineEvent::BatchFinished {
                success_count: 0,
                failure_count: 0,
            });
            return Ok(PipelineResult::empty());
        }

        let total = items.len();
        info!(fetched = total, "Fetched items");
        for item in &items {
            self.notify(PipelineEvent::ItemFetched {
                id: item.id.clone(),
                subject: item.subject.clone(),
            });
        }

        let mut batch = BatchState::new(items);
        let mut first = true;

        while let Some(item) = batch.remaining.pop_front() {
            if !first {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.config.item_delay) => {}
                }
            }
            first = false;

            if token.is_cancelled() {
                break;
            }

            match self.process_item(&item, &token, true).await {
                ItemOutcome::Delivered => batch.record_success(),
                ItemOutcome::Failed(message) => batch.record_failure(message),
                ItemOutcome::Cancelled => break,
            }
        }

        if token.is_cancelled() {
            return Ok(self.finish_cancelled(batch));
        }

        self.set_state(PipelineState::Completed);
        let result = batch.finish();
        debug_assert_eq!(result.total(), total);
        info!(summary = %result.summary(), "Batch complete");
        self.notify(PipelineEvent::BatchFinished {
            success_count: result.success_count,
            failure_count: result.failure_count,
        });
        Ok(result)
    }

    /// Run a manually submitted item through the sub-pipeline, bypassing fetch.
    /// An empty `date` is replaced with the current time.
    pub async fn process_manual(
        &self,
        subject: &str,
        content: &str,
        from: &str,
        date: &str,
    ) -> Result<PipelineResult, PipelineError> {
        let date = if date.trim().is_empty() {
            Utc::now().to_rfc2822()
        } else {
            date.to_string()
        };
        let item = Item::new(format!("manual-{}", Uuid::new_v4()), subject, content)
            .with_meta("from", from)
            .with_meta("date", date)
            .with_meta("origin", "manual");
        self.run_single(item).await
    }

    /// Run the built-in sample item, for demos and setup checks.
    pub async fn process_sample(&self) -> Result<PipelineResult, PipelineError> {
        let item = Item::new(format!("sample-{}", Uuid::new_v4()), SAMPLE_SUBJECT, SAMPLE_BODY)
            .with_meta("from", SAMPLE_FROM)
            .with_meta("date", Utc::now().to_rfc2822())
            .with_meta("origin", "sample");
        self.run_single(item).await
    }

    async fn run_single(&self, item: Item) -> Result<PipelineResult, PipelineError> {
        let guard = self.begin_run()?;
        let token = guard.token.clone();
        info!(id = %item.id, "Processing single item");

        // Synthetic items never touch the source.
        if let Err(e) = self.check_configured(false) {
            error!(error = %e, "Single item aborted");
            return Err(self.abort_batch(e));
        }

        self.notify(PipelineEvent::ItemFetched {
            id: item.id.clone(),
            subject: item.subject.clone(),
        });

        let mut batch = BatchState::default();
        match self.process_item(&item, &token, false).await {
            ItemOutcome::Delivered => batch.record_success(),
            ItemOutcome::Failed(message) => batch.record_failure(message),
            ItemOutcome::Cancelled => {}
        }

        if token.is_cancelled() {
            return Ok(self.finish_cancelled(batch));
        }

        self.set_state(PipelineState::Completed);
        let result = batch.finish();
        self.notify(PipelineEvent::BatchFinished {
            success_count: result.success_count,
            failure_count: result.failure_count,
        });
        Ok(result)
    }

    // ── Per-item sub-pipeline ───────────────────────────────────────

    async fn process_item(
        &self,
        item: &Item,
        token: &CancellationToken,
        mark_processed: bool,
    ) -> ItemOutcome {
        self.set_state(PipelineState::Validating);
        let item = match validate(item, self.config.max_content_chars) {
            Ok(valid) => valid,
            Err(e) => return self.item_failed(item, e),
        };
        debug!(id = %item.id, chars = item.body.chars().count(), "Item validated");

        self.set_state(PipelineState::Processing);
        self.notify(PipelineEvent::ProcessingStarted {
            id: item.id.clone(),
            subject: item.subject.clone(),
        });

        let processed = tokio::select! {
            biased;
            _ = token.cancelled() => return ItemOutcome::Cancelled,
            r = self.processor.process(&item) => r,
        };
        let summary = match processed {
            Ok(text) => text,
            Err(e) => return self.item_failed(&item, PipelineError::Processing(e.to_string())),
        };

        self.notify(PipelineEvent::ProcessingFinished {
            id: item.id.clone(),
            subject: item.subject.clone(),
            summary: summary.clone(),
        });

        let content = self.template.render(&item, &summary);
        let metadata = delivery_metadata(&item);

        self.set_state(PipelineState::Delivering);
        let delivered = tokio::select! {
            biased;
            _ = token.cancelled() => return ItemOutcome::Cancelled,
            r = self.deliverer.deliver(&content, &metadata) => r,
        };
        if let Err(e) = delivered {
            return self.item_failed(&item, PipelineError::Delivery(e.to_string()));
        }

        if mark_processed {
            self.set_state(PipelineState::MarkingProcessed);
            // Delivered either way; a failed mark only means the source may
            // offer the item again.
            if let Err(e) = self.fetcher.mark_processed(&item.id).await {
                warn!(id = %item.id, error = %e, "Failed to mark item processed");
            }
        }

        info!(id = %item.id, sink = self.deliverer.name(), "Item delivered");
        self.notify(PipelineEvent::ItemDelivered {
            id: item.id.clone(),
            subject: item.subject.clone(),
            success: true,
            message: "Delivered".to_string(),
        });
        ItemOutcome::Delivered
    }

    fn item_failed(&self, item: &Item, error: PipelineError) -> ItemOutcome {
        warn!(id = %item.id, error = %error, "Item failed");
        self.notify(PipelineEvent::ItemDelivered {
            id: item.id.clone(),
            subject: item.subject.clone(),
            success: false,
            message: error.to_string(),
        });
        ItemOutcome::Failed(format!("{}: {}", item.id, error))
    }

    // ── Run lifecycle ───────────────────────────────────────────────

    fn begin_run(&self) -> Result<RunGuard<'_>, PipelineError> {
        if self
            .is_processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Rejected run: another run is already in progress");
            return Err(PipelineError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        *self.run_token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        Ok(RunGuard {
            coordinator: self,
            token,
        })
    }

    /// Verify every capability the run needs. `include_source` is false for
    /// synthetic items.
    fn check_configured(&self, include_source: bool) -> Result<(), PipelineError> {
        let mut missing = Vec::new();
        if include_source && !self.fetcher.is_configured() {
            missing.push(format!("source '{}'", self.fetcher.name()));
        }
        if !self.processor.is_ready() {
            missing.push(format!("processor '{}'", self.processor.name()));
        }
        if !self.deliverer.is_configured() {
            missing.push(format!("sink '{}'", self.deliverer.name()));
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Configuration(format!(
                "{} not configured",
                missing.join(", ")
            )))
        }
    }

    /// Batch-fatal exit: zero result, then hand the error back.
    fn abort_batch(&self, error: PipelineError) -> PipelineError {
        self.set_state(PipelineState::Completed);
        self.notify(PipelineEvent::BatchFinished {
            success_count: 0,
            failure_count: 0,
        });
        error
    }

    fn finish_cancelled(&self, mut batch: BatchState) -> PipelineResult {
        self.set_state(PipelineState::Cancelled);
        info!(
            succeeded = batch.success_count,
            failed = batch.failure_count,
            abandoned = batch.remaining.len(),
            "Run cancelled, cleaning up"
        );

        self.notify(PipelineEvent::BatchCancelled);
        isolate("fetcher.cancel", || self.fetcher.cancel());
        isolate("processor.cleanup", || self.processor.cleanup());
        isolate("deliverer.cancel", || self.deliverer.cancel());

        batch.cancelled = true;
        self.notify(PipelineEvent::BatchFinished {
            success_count: batch.success_count,
            failure_count: batch.failure_count,
        });
        batch.finish()
    }

    fn set_state(&self, next: PipelineState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.can_transition_to(next) {
            debug!(from = %*state, to = %next, "Unexpected pipeline state transition");
        }
        *state = next;
    }

    fn notify(&self, event: PipelineEvent) {
        self.notifier.notify(&event);
    }
}

/// Run a cleanup step, logging instead of propagating a panic.
fn isolate(step: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(step, "Cleanup step panicked; continuing");
    }
}
