//! Inbox Relay: fetch, summarize and forward messages.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod net;
pub mod pipeline;
