//! Core types shared by the client and server halves.
//!
//! - **IDs**: Strongly-typed identifiers (MessageId, QueueName, ...)
//! - **Errors**: Error taxonomy with thiserror derives
//! - **Config**: Configuration structures for calls, cleanup and dispatch

mod config;
mod errors;
mod ids;

pub use config::{ClientConfig, Config, DispatcherConfig, JanitorConfig, ObservabilityConfig};
pub use errors::{Error, Result};
pub use ids::{ConnectionId, MessageId, QueueName};
