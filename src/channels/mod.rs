//! Concrete sources and sinks.

pub mod email;
pub mod telegram;

pub use email::{EmailConfig, EmailSink, EmailSource};
pub use telegram::{TelegramConfig, TelegramSink};
