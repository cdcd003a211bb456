//! Shared types for the relay pipeline.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

// ── Item ────────────────────────────────────────────────────────────

/// One unit of content flowing through the pipeline (an email, a chat message).
///
/// Immutable once fetched; preprocessing produces modified copies.
/// Ids are not deduplicated; the source is trusted to hand out unique ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Source-native identifier (IMAP UID, chat message id, generated UUID).
    pub id: String,
    pub subject: String,
    pub body: String,
    /// Source-specific extras (`from`, `date`, `message_id`, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Item {
    pub fn new(id: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subject: subject.into(),
            body: body.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Copy with a replaced body.
    pub fn with_body(&self, body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..self.clone()
        }
    }

    /// Copy with a replaced subject.
    pub fn with_subject(&self, subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..self.clone()
        }
    }

    /// True when both subject and body are empty after trimming.
    pub fn is_blank(&self) -> bool {
        self.subject.trim().is_empty() && self.body.trim().is_empty()
    }
}

// ── Batch bookkeeping ───────────────────────────────────────────────

/// Transient state of one `run_batch` call.
#[derive(Debug, Default)]
pub struct BatchState {
    pub remaining: VecDeque<Item>,
    pub success_count: usize,
    pub failure_count: usize,
    pub cancelled: bool,
    pub messages: Vec<String>,
}

impl BatchState {
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            remaining: items.into(),
            ..Self::default()
        }
    }

    pub fn record_success(&mut self) {
        self.success_count += 1;
    }

    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.failure_count += 1;
        self.messages.push(message.into());
    }

    /// Freeze into the caller-facing result.
    pub fn finish(self) -> PipelineResult {
        PipelineResult {
            success_count: self.success_count,
            failure_count: self.failure_count,
            messages: self.messages,
            cancelled: self.cancelled,
        }
    }
}

/// Aggregate outcome reported once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success_count: usize,
    pub failure_count: usize,
    /// Per-item failure messages, in processing order.
    pub messages: Vec<String>,
    pub cancelled: bool,
}

impl PipelineResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn total(&self) -> usize {
        self.success_count + self.failure_count
    }

    /// Human-readable batch summary.
    pub fn summary(&self) -> String {
        let mut s = format!(
            "Processed {} items: {} succeeded, {} failed",
            self.total(),
            self.success_count,
            self.failure_count
        );
        if self.cancelled {
            s.push_str(" (cancelled)");
        }
        s
    }
}

// ── Run state machine ───────────────────────────────────────────────

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Fetching,
    Validating,
    Processing,
    Delivering,
    MarkingProcessed,
    Completed,
    Cancelled,
}

impl PipelineState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: PipelineState) -> bool {
        use PipelineState::*;

        if target == Cancelled {
            return !self.is_terminal();
        }

        matches!(
            (self, target),
            // A new run (or manual submission) starts from rest
            (Idle | Completed | Cancelled, Fetching) |
            (Idle | Completed | Cancelled, Validating) |
            // Configuration check failed before fetch
            (Idle | Completed | Cancelled, Completed) |
            (Fetching, Completed) | (Fetching, Validating) |
            (Validating, Processing) | (Validating, Validating) | (Validating, Completed) |
            (Processing, Delivering) | (Processing, Validating) | (Processing, Completed) |
            (Delivering, MarkingProcessed) | (Delivering, Validating) | (Delivering, Completed) |
            (MarkingProcessed, Validating) | (MarkingProcessed, Completed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Whether a run is underway.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != Self::Idle
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Validating => "validating",
            Self::Processing => "processing",
            Self::Delivering => "delivering",
            Self::MarkingProcessed => "marking_processed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}
