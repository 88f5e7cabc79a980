//! Messaging transport contract.
//!
//! The broker is an external collaborator: this module only defines the
//! connection → session → producer/consumer surface the request/reply engine
//! drives, plus the message value that travels through it. `memory` provides
//! an in-process broker implementing the contract.
//!
//! Every transport resource is [`Closeable`]. Release order for a call is
//! always consumer → session → connection.

pub mod memory;
mod properties;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::types::{Error, MessageId, QueueName, Result};

pub use properties::HeaderValue;

/// Reserved reply property carrying the `"<kind>: <message>"` failure reason.
pub const ERROR_HEADER: &str = "ERROR";

/// String-keyed scalar property bag.
pub type Headers = HashMap<String, HeaderValue>;

// =============================================================================
// Destinations and messages
// =============================================================================

/// A queue address. Temporary destinations are created per call and belong to
/// the connection that created them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub name: QueueName,
    pub temporary: bool,
}

impl Destination {
    /// A named, durable queue.
    pub fn queue(name: QueueName) -> Self {
        Self {
            name,
            temporary: false,
        }
    }

    pub fn temporary(name: QueueName) -> Self {
        Self {
            name,
            temporary: true,
        }
    }

    /// A named queue from a plain string. Empty names are rejected.
    pub fn named(name: impl Into<String>) -> Result<Self> {
        QueueName::from_string(name.into())
            .map(Self::queue)
            .map_err(Error::protocol_violation)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.temporary {
            write!(f, "temp-queue://{}", self.name)
        } else {
            write!(f, "queue://{}", self.name)
        }
    }
}

/// Message payload. Only text messages carry calls; anything else is a
/// protocol violation for the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    Text(Option<String>),
    Bytes(Vec<u8>),
}

/// A transport message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub body: MessageBody,
    pub reply_to: Option<Destination>,
    pub properties: Headers,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Text message with the given body.
    pub fn text(text: Option<String>) -> Self {
        Self::with_body(MessageBody::Text(text))
    }

    /// Non-text message.
    pub fn bytes(bytes: Vec<u8>) -> Self {
        Self::with_body(MessageBody::Bytes(bytes))
    }

    fn with_body(body: MessageBody) -> Self {
        Self {
            id: MessageId::new(),
            body,
            reply_to: None,
            properties: Headers::new(),
            timestamp: Utc::now(),
        }
    }

    /// Text body, if this is a text message carrying text.
    pub fn text_body(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(text) => text.as_deref(),
            MessageBody::Bytes(_) => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self.body, MessageBody::Text(_))
    }
}

// =============================================================================
// Transport traits
// =============================================================================

/// A transport resource that can be released.
#[async_trait]
pub trait Closeable: Send + Sync {
    async fn close(&self) -> Result<()>;
}

/// Creates connections to the broker.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + fmt::Debug {
    async fn create_connection(&self) -> Result<Box<dyn Connection>>;
}

/// A broker connection. Delivery to consumers starts after [`Connection::start`].
#[async_trait]
pub trait Connection: Closeable {
    async fn create_session(&self) -> Result<Box<dyn Session>>;

    async fn start(&self) -> Result<()>;
}

/// A single-threaded context for producing and consuming messages.
#[async_trait]
pub trait Session: Closeable {
    /// Ephemeral, exclusive destination owned by this session's connection.
    async fn create_temporary_queue(&self) -> Result<Destination>;

    async fn create_producer(&self, destination: &Destination) -> Result<Box<dyn Producer>>;

    async fn create_consumer(&self, destination: &Destination) -> Result<Box<dyn Consumer>>;
}

#[async_trait]
pub trait Producer: Closeable {
    async fn send(&self, message: Message) -> Result<()>;
}

#[async_trait]
pub trait Consumer: Closeable {
    /// Blocking receive. `Ok(None)` when nothing arrived within `timeout`;
    /// a `None` timeout waits until a message arrives or the consumer closes.
    async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Message>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> QueueName {
        QueueName::from_string(s.to_string()).unwrap()
    }

    #[test]
    fn test_destination_display() {
        assert_eq!(Destination::queue(name("orders")).to_string(), "queue://orders");
        assert_eq!(
            Destination::temporary(name("tmp-1")).to_string(),
            "temp-queue://tmp-1"
        );
    }

    #[test]
    fn test_text_body_access() {
        let message = Message::text(Some("{}".to_string()));
        assert!(message.is_text());
        assert_eq!(message.text_body(), Some("{}"));

        let empty = Message::text(None);
        assert!(empty.is_text());
        assert_eq!(empty.text_body(), None);

        let binary = Message::bytes(vec![1, 2, 3]);
        assert!(!binary.is_text());
        assert_eq!(binary.text_body(), None);
    }

    #[test]
    fn test_messages_get_distinct_ids() {
        assert_ne!(Message::text(None).id, Message::text(None).id);
    }
}
