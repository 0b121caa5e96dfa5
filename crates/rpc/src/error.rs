//! Error types for the streaming engine.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC operations.
///
/// End of data is not an error: `receive` reports it as `Ok(None)`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Operation attempted after the direction was closed or failed.
    #[error("The {0} direction is closed")]
    ClosedDirection(Direction),

    /// The underlying channel failed. Terminal for both directions.
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The caller withdrew the call before completion.
    #[error("Call cancelled")]
    Cancelled,

    /// The call deadline expired.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// The remote handler failed.
    #[error("Handler failure: {0}")]
    Handler(Status),

    /// Header or trailer metadata was set twice.
    #[error("{0} metadata has already been set")]
    MetadataAlreadySet(MetadataKind),

    /// The peer broke the stream protocol.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A message could not be converted to or from bytes.
    #[error("Codec error: {0}")]
    Codec(String),
}

impl Error {
    /// Whether the call ended because it was cancelled or timed out.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout(_))
    }
}

/// Transport-level errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Failed to establish a connection or stream.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid endpoint address.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Any other transport error.
    #[error("{0}")]
    Other(String),
}

/// One of the two directions of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Outbound messages.
    Send,
    /// Inbound messages.
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Receive => f.write_str("receive"),
        }
    }
}

/// The two kinds of out-of-band metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetadataKind {
    /// Sent once before or with the first message.
    Header,
    /// Sent once when the stream closes.
    Trailer,
}

impl fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header => f.write_str("Header"),
            Self::Trailer => f.write_str("Trailer"),
        }
    }
}

/// Status codes carried by a failed stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    /// The call was cancelled.
    Cancelled,
    /// Unknown error.
    Unknown,
    /// The request was malformed.
    InvalidArgument,
    /// The deadline expired before completion.
    DeadlineExceeded,
    /// No handler for the method.
    NotFound,
    /// The server is out of capacity.
    ResourceExhausted,
    /// The method exists but not with this shape.
    Unimplemented,
    /// Internal handler error.
    Internal,
    /// The peer is unreachable.
    Unavailable,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
        };
        f.write_str(name)
    }
}

/// Failure reported by a server-side handler.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct Status {
    /// Error code for categorization.
    pub code: Code,
    /// Human-readable error message.
    pub message: String,
}

impl Status {
    /// Create a status with the given code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// `INVALID_ARGUMENT` status.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    /// `NOT_FOUND` status.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    /// `UNIMPLEMENTED` status.
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    /// `RESOURCE_EXHAUSTED` status.
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    /// `INTERNAL` status.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }
}

impl From<Error> for Status {
    fn from(error: Error) -> Self {
        match error {
            Error::Handler(status) => status,
            Error::Cancelled => Self::new(Code::Cancelled, error.to_string()),
            Error::Timeout(_) => Self::new(Code::DeadlineExceeded, error.to_string()),
            Error::Codec(_) => Self::invalid_argument(error.to_string()),
            Error::Transport(_) => Self::new(Code::Unavailable, error.to_string()),
            Error::ClosedDirection(_) | Error::MetadataAlreadySet(_) | Error::Protocol(_) => {
                Self::internal(error.to_string())
            }
        }
    }
}
