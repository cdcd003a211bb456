//! Relay pipeline.
//!
//! Items flow from a `FetchCapability` through validation and a
//! `ProcessCapability` to a `DeliverCapability`, one at a time:
//!
//! 1. `PipelineCoordinator::run_batch()`: fetch, then per item validate →
//!    process → render → deliver → mark processed
//! 2. `CommandInvoker`: every operation runs as a recorded `Command`
//! 3. `ContinuousRunner` / `Scheduler`: repeated runs with network gating
//!    and backoff
//!
//! Progress is published as `PipelineEvent`s through an `EventNotifier`.

pub mod capability;
pub mod command;
pub mod coordinator;
pub mod events;
pub mod format;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod types;

pub use capability::{DeliverCapability, FetchCapability, ProcessCapability};
pub use command::{Command, CommandInvoker, CommandRecord};
pub use coordinator::PipelineCoordinator;
pub use events::{
    BroadcastListener, EventNotifier, ListenerError, ListenerId, LoggingListener, PipelineEvent,
    PipelineListener,
};
pub use runner::{ContinuousRunner, RunOutcome};
pub use scheduler::Scheduler;
pub use types::{Item, PipelineResult, PipelineState};
