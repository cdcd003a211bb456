//! Command layer over the coordinator.
//!
//! Every operation goes through `CommandInvoker` so there is one place that
//! records what ran and how it went.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::pipeline::coordinator::PipelineCoordinator;
use crate::pipeline::types::PipelineResult;

/// A pipeline operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    RunBatch {
        count: usize,
    },
    ProcessOne {
        subject: String,
        content: String,
        from: String,
        date: String,
    },
    ProcessSample,
}

impl Command {
    pub fn label(&self) -> &'static str {
        match self {
            Self::RunBatch { .. } => "run_batch",
            Self::ProcessOne { .. } => "process_one",
            Self::ProcessSample => "process_sample",
        }
    }
}

/// One executed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: Command,
    pub executed_at: DateTime<Utc>,
    /// True when the run finished without failures or cancellation.
    pub outcome: bool,
    pub message: String,
}

/// Executes commands against a coordinator and keeps a bounded history.
pub struct CommandInvoker {
    coordinator: Arc<PipelineCoordinator>,
    history: Mutex<VecDeque<CommandRecord>>,
    cap: usize,
}

impl CommandInvoker {
    pub fn new(coordinator: Arc<PipelineCoordinator>, cap: usize) -> Self {
        Self {
            coordinator,
            history: Mutex::new(VecDeque::with_capacity(cap.min(128))),
            cap: cap.max(1),
        }
    }

    pub fn coordinator(&self) -> &Arc<PipelineCoordinator> {
        &self.coordinator
    }

    /// Run a command and return the coordinator's result. The command is
    /// recorded whatever the outcome.
    pub async fn dispatch(&self, command: Command) -> Result<PipelineResult, PipelineError> {
        info!(command = command.label(), "Executing command");
        let executed_at = Utc::now();
        let result = match &command {
            Command::RunBatch { count } => self.coordinator.run_batch(*count).await,
            Command::ProcessOne {
                subject,
                content,
                from,
                date,
            } => {
                self.coordinator
                    .process_manual(subject, content, from, date)
                    .await
            }
            Command::ProcessSample => self.coordinator.process_sample().await,
        };

        let (outcome, message) = match &result {
            Ok(r) => (r.failure_count == 0 && !r.cancelled, r.summary()),
            Err(e) => (false, e.to_string()),
        };
        self.record(CommandRecord {
            command,
            executed_at,
            outcome,
            message,
        })
        .await;

        result
    }

    /// Run a command; true when it finished without failures or cancellation.
    pub async fn execute(&self, command: Command) -> bool {
        matches!(self.dispatch(command).await, Ok(r) if r.failure_count == 0 && !r.cancelled)
    }

    /// Drop the newest history entry. Deliveries cannot be recalled, so no
    /// command has an inverse and this always returns false.
    pub async fn undo_last(&self) -> bool {
        match self.history.lock().await.pop_back() {
            Some(record) => {
                warn!(
                    command = record.command.label(),
                    "Undo requested; delivered content cannot be recalled"
                );
            }
            None => info!("Undo requested with empty history"),
        }
        false
    }

    /// Oldest first.
    pub async fn history(&self) -> Vec<CommandRecord> {
        self.history.lock().await.iter().cloned().collect()
    }

    pub async fn clear_history(&self) {
        self.history.lock().await.clear();
    }

    async fn record(&self, record: CommandRecord) {
        let mut history = self.history.lock().await;
        while history.len() >= self.cap {
            history.pop_front();
        }
        history.push_back(record);
    }
}
