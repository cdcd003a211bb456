//! Capability traits the coordinator depends on.
//!
//! Implementations are pure I/O: fetching from a source, turning an item into
//! text, pushing text to a sink. Sequencing, counting and cancellation live in
//! `PipelineCoordinator`.
//!
//! Every method is called from the coordinator's single processing task,
//! except `cancel()` / `cleanup()`, which may arrive from another task at any
//! time and must therefore be idempotent and must not block.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::{ChannelError, LlmError};
use crate::pipeline::types::Item;

/// Inbound source (mailbox, chat feed).
#[async_trait]
pub trait FetchCapability: Send + Sync {
    /// Source name for logging (e.g. "email").
    fn name(&self) -> &str;

    /// Fetch up to `count` unread items, honouring the query set via `set_query`.
    async fn fetch_unread(&self, count: usize) -> Result<Vec<Item>, ChannelError>;

    /// Fetch up to `count` items matching a source-specific query.
    async fn fetch_by_query(&self, query: &str, count: usize) -> Result<Vec<Item>, ChannelError>;

    /// Set (or clear) the default query applied by `fetch_unread`.
    fn set_query(&self, query: Option<String>);

    /// Tell the source an item has been handled. Repeating it for the same id
    /// must be harmless.
    async fn mark_processed(&self, id: &str) -> Result<(), ChannelError>;

    fn is_configured(&self) -> bool;

    /// Abort any in-flight fetch.
    fn cancel(&self);
}

/// Content processor (typically a language model).
#[async_trait]
pub trait ProcessCapability: Send + Sync {
    fn name(&self) -> &str;

    /// Turn an item into deliverable text. Engine errors come back verbatim.
    async fn process(&self, item: &Item) -> Result<String, LlmError>;

    fn is_ready(&self) -> bool;

    /// Interrupt any in-flight call and release the engine session.
    fn cleanup(&self);
}

/// Outbound sink (bot channel, mailbox).
#[async_trait]
pub trait DeliverCapability: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(
        &self,
        content: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), ChannelError>;

    fn is_configured(&self) -> bool;

    /// Abort any in-flight delivery.
    fn cancel(&self);
}
