//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. The
//! variant names double as the failure kind reported on the wire when a
//! server-side failure is turned into an `ERROR` reply.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for request/reply calls.
#[derive(Error, Debug)]
pub enum Error {
    /// The underlying transport failed while sending or receiving.
    #[error("transport failure: {0}")]
    Transport(String),

    /// No reply arrived within the deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The remote handler failed. Only the `"<kind>: <message>"` reason
    /// crosses the wire.
    #[error("remote execution failure: {0}")]
    RemoteExecution(String),

    /// A call waited with the configured default deadline and did not complete.
    #[error("execution failure: {0}")]
    Execution(String),

    /// Non-text message, zero or multiple handlers, invalid method declaration.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Codec errors not originating from serde_json.
    #[error("codec error: {0}")]
    Codec(String),
}

impl Error {
    /// Failure kind name, as carried in `ERROR` replies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Transport(_) => "TransportFailure",
            Error::Timeout(_) => "Timeout",
            Error::RemoteExecution(_) => "RemoteExecutionFailure",
            Error::Execution(_) => "ExecutionFailure",
            Error::ProtocolViolation(_) => "ProtocolViolation",
            Error::Serialization(_) | Error::Codec(_) => "SerializationFailure",
        }
    }

    /// Message without the kind prefix of the `Display` output.
    pub fn reason(&self) -> String {
        match self {
            Error::Transport(msg)
            | Error::Timeout(msg)
            | Error::RemoteExecution(msg)
            | Error::Execution(msg)
            | Error::ProtocolViolation(msg)
            | Error::Codec(msg) => msg.clone(),
            Error::Serialization(e) => e.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

// Convenience constructors
impl Error {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn remote_execution(msg: impl Into<String>) -> Self {
        Self::RemoteExecution(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }
}
