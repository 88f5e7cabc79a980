//! # Queue RPC - request/reply method calls over message queues
//!
//! Synchronous-looking calls on top of a fire-and-forget queue transport:
//! - Private reply channel per call (a temporary queue), no correlation ids
//! - Deadline-bound reply handles that resolve exactly once
//! - Remote failures carried back as an `ERROR` reply property
//! - Client proxies and server dispatchers built once from a declared shape
//!
//! ## Architecture
//!
//! ```text
//!   ServiceProxy ─→ RequestSender ─→ [queue] ─→ ListenerServer
//!        ▲               │                          │
//!        │          PendingCall ←── [temp queue] ←── ListenerDispatcher
//!        │               │
//!        └───────── ResourceJanitor (safety-net releases)
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod client;
pub mod codec;
pub mod janitor;
pub mod server;
pub mod transport;
pub mod types;

// Internal utilities
pub mod observability;

pub use client::{PendingCall, RequestSender, ServiceProxy};
pub use janitor::ResourceJanitor;
pub use server::{ListenerDispatcher, ListenerServer, MessageService};
pub use types::{Config, Error, Result};

#[doc(hidden)]
pub mod __private {
    pub use async_trait::async_trait;
}
