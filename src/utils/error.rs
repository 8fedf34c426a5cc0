//! The `error` module defines the error types used across `minimq`.
//!
//! Each layer owns one enum: the record codec, the line protocol, the
//! persistence log and the client runtime. Broker-side errors are logged and
//! the offending unit is dropped; client-side errors are surfaced to the
//! caller only after local recovery (retry, reconnect) has been exhausted.

use std::path::PathBuf;

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

/// Failure to decode a delimited message record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed message record: expected at least 3 fields, found {fields}")]
    Malformed { fields: usize },

    #[error("message field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("message field `{field}` contains a reserved sequence ({reserved:?})")]
    ReservedSequence {
        field: &'static str,
        reserved: &'static str,
    },
}

/// Failure to interpret one line of the command protocol.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("line has no `COMMAND:payload` separator: {0:?}")]
    MissingSeparator(String),

    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("bad {command} payload: {source}")]
    BadPayload {
        command: &'static str,
        #[source]
        source: CodecError,
    },
}

/// Failure while touching the on-disk message log.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("message log {} failed during {operation}: {source}", .path.display())]
    Io {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl PersistenceError {
    pub(crate) fn io(path: &std::path::Path, operation: &'static str, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            operation,
            source,
        }
    }
}

/// Error type returned by application listeners.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for producer and consumer operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("connection closed by broker")]
    ConnectionClosed,

    #[error("line framing error: {0}")]
    Framing(#[from] LinesCodecError),

    #[error("no pooled connection became available within {waited_ms}ms")]
    PoolTimeout { waited_ms: u64 },

    #[error("broker did not answer within {timeout_ms}ms")]
    RequestTimeout { timeout_ms: u64 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("malformed record from broker: {0}")]
    Codec(#[from] CodecError),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("delivery failed after {attempts} attempt(s): {source}")]
    DeliveryFailed {
        attempts: u32,
        #[source]
        source: Box<ClientError>,
    },

    #[error("no reply for correlation id {correlation_id} within {timeout_ms}ms")]
    Timeout {
        correlation_id: String,
        timeout_ms: u64,
    },

    #[error("invalid client configuration: {0}")]
    Config(String),

    #[error("consumer is already running")]
    AlreadyRunning,
}

impl ClientError {
    /// Transport failures invalidate the connection they happened on and are
    /// recovered by retrying or reconnecting.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Connection(_)
                | Self::ConnectionClosed
                | Self::Framing(_)
                | Self::PoolTimeout { .. }
                | Self::RequestTimeout { .. }
        )
    }

    /// Only set for request-reply deadlines, never for transport stalls.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
