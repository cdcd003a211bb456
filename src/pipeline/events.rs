//! Pipeline lifecycle events and their fan-out to listeners.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Lifecycle event emitted by the coordinator.
///
/// For one item the order is always `ItemFetched → ProcessingStarted →
/// ProcessingFinished → ItemDelivered` (stages that never ran are skipped).
/// `BatchFinished` is the last event of every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    ItemFetched {
        id: String,
        subject: String,
    },
    ProcessingStarted {
        id: String,
        subject: String,
    },
    ProcessingFinished {
        id: String,
        subject: String,
        summary: String,
    },
    ItemDelivered {
        id: String,
        subject: String,
        success: bool,
        message: String,
    },
    BatchFinished {
        success_count: usize,
        failure_count: usize,
    },
    BatchCancelled,
}

impl PipelineEvent {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ItemFetched { .. } => "item_fetched",
            Self::ProcessingStarted { .. } => "processing_started",
            Self::ProcessingFinished { .. } => "processing_finished",
            Self::ItemDelivered { .. } => "item_delivered",
            Self::BatchFinished { .. } => "batch_finished",
            Self::BatchCancelled => "batch_cancelled",
        }
    }

    /// Item id, for per-item events.
    pub fn item_id(&self) -> Option<&str> {
        match self {
            Self::ItemFetched { id, .. }
            | Self::ProcessingStarted { id, .. }
            | Self::ProcessingFinished { id, .. }
            | Self::ItemDelivered { id, .. } => Some(id),
            Self::BatchFinished { .. } | Self::BatchCancelled => None,
        }
    }
}

/// Error a listener may report; logged and otherwise ignored.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Observer of pipeline events.
pub trait PipelineListener: Send + Sync {
    fn on_event(&self, event: &PipelineEvent) -> Result<(), ListenerError>;
}

impl<F> PipelineListener for F
where
    F: Fn(&PipelineEvent) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_event(&self, event: &PipelineEvent) -> Result<(), ListenerError> {
        self(event)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered multicast of events to zero or more listeners.
///
/// Delivery is synchronous, in subscription order, on a snapshot of the
/// listener list. A listener that errors or panics never stops delivery to
/// the ones after it.
pub struct EventNotifier {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn PipelineListener>)>>,
    next_id: AtomicU64,
}

impl EventNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self, listener: Arc<dyn PipelineListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        debug!(listener = id.0, "Listener subscribed");
        id
    }

    /// Remove a listener. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        before != listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver an event to every listener.
    pub fn notify(&self, event: &PipelineEvent) {
        let snapshot: Vec<(ListenerId, Arc<dyn PipelineListener>)> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(listener = id.0, event = event.label(), error = %e, "Listener failed");
                }
                Err(_) => {
                    warn!(listener = id.0, event = event.label(), "Listener panicked");
                }
            }
        }
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

// ── Stock listeners ─────────────────────────────────────────────────

/// Traces every event.
pub struct LoggingListener;

impl PipelineListener for LoggingListener {
    fn on_event(&self, event: &PipelineEvent) -> Result<(), ListenerError> {
        match event {
            PipelineEvent::ItemFetched { id, subject } => {
                debug!(id = %id, subject = %subject, "Item fetched");
            }
            PipelineEvent::ProcessingStarted { id, .. } => {
                debug!(id = %id, "Processing started");
            }
            PipelineEvent::ProcessingFinished { id, summary, .. } => {
                debug!(id = %id, summary_len = summary.len(), "Processing finished");
            }
            PipelineEvent::ItemDelivered {
                id,
                subject,
                success,
                message,
            } => {
                if *success {
                    info!(id = %id, subject = %subject, "Item delivered");
                } else {
                    warn!(id = %id, subject = %subject, reason = %message, "Item failed");
                }
            }
            PipelineEvent::BatchFinished {
                success_count,
                failure_count,
            } => {
                info!(
                    succeeded = success_count,
                    failed = failure_count,
                    "Batch finished"
                );
            }
            PipelineEvent::BatchCancelled => info!("Batch cancelled"),
        }
        Ok(())
    }
}

/// Re-publishes events on a broadcast channel for UI / notification layers.
pub struct BroadcastListener {
    tx: broadcast::Sender<PipelineEvent>,
}

impl BroadcastListener {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(capacity);
        Arc::new(Self { tx })
    }

    /// Subscribe to the re-published stream.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl PipelineListener for BroadcastListener {
    fn on_event(&self, event: &PipelineEvent) -> Result<(), ListenerError> {
        // ok if nobody is listening yet
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}
