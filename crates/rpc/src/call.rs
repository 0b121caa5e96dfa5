//! Per-call state shared by both peers: shape, identity, metadata and cancellation.

use std::fmt;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::transport::StreamHead;

/// The four RPC shapes, all restrictions of the bidirectional stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamShape {
    /// One request, one response.
    Unary,
    /// One request, many responses.
    ServerStreaming,
    /// Many requests, one response.
    ClientStreaming,
    /// Independent sequences of requests and responses.
    Bidirectional,
}

impl StreamShape {
    /// Whether the client may send more than one request.
    #[must_use]
    pub const fn client_streams(self) -> bool {
        matches!(self, Self::ClientStreaming | Self::Bidirectional)
    }

    /// Whether the server may send more than one response.
    #[must_use]
    pub const fn server_streams(self) -> bool {
        matches!(self, Self::ServerStreaming | Self::Bidirectional)
    }
}

impl fmt::Display for StreamShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unary => f.write_str("unary"),
            Self::ServerStreaming => f.write_str("server-streaming"),
            Self::ClientStreaming => f.write_str("client-streaming"),
            Self::Bidirectional => f.write_str("bidirectional"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Deadline {
    at: Instant,
    timeout: Duration,
}

/// Cancellation signal of a call: a token plus an optional deadline.
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    token: CancellationToken,
    deadline: Option<Deadline>,
}

impl Cancellation {
    /// Create a cancellation from a token and an optional timeout starting now.
    #[must_use]
    pub fn new(token: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            token,
            deadline: timeout.map(|timeout| Deadline {
                at: Instant::now() + timeout,
                timeout,
            }),
        }
    }

    /// Cancel the call.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The underlying token.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the call was cancelled or its deadline has passed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.check().is_err()
    }

    /// Fail with `Cancelled` or `Timeout` if the call can no longer proceed.
    ///
    /// # Errors
    ///
    /// Returns the reason the call stopped.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline.at => Err(Error::Timeout(deadline.timeout)),
            _ => Ok(()),
        }
    }

    /// Resolve once the call is cancelled or times out, with the matching error.
    pub async fn cancelled(&self) -> Error {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                () = self.token.cancelled() => Error::Cancelled,
                () = sleep_until(deadline.at) => Error::Timeout(deadline.timeout),
            },
            None => {
                self.token.cancelled().await;
                Error::Cancelled
            }
        }
    }
}

/// Everything known about a call when its stream is opened.
#[derive(Clone, Debug)]
pub struct CallInfo {
    id: Uuid,
    method: String,
    shape: StreamShape,
    metadata: Metadata,
    cancellation: Cancellation,
}

impl CallInfo {
    /// Describe a new call with a fresh stream id.
    pub fn new(
        method: impl Into<String>,
        shape: StreamShape,
        metadata: Metadata,
        cancellation: Cancellation,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            method: method.into(),
            shape,
            metadata,
            cancellation,
        }
    }

    pub(crate) fn from_head(head: StreamHead, cancellation: Cancellation) -> Self {
        Self {
            id: head.id,
            method: head.method,
            shape: head.shape,
            metadata: head.metadata,
            cancellation,
        }
    }

    pub(crate) fn head(&self) -> StreamHead {
        StreamHead {
            id: self.id,
            method: self.method.clone(),
            shape: self.shape,
            metadata: self.metadata.clone(),
        }
    }

    /// Stream id, identical on both peers.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Fully qualified method name.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Shape of the call.
    #[must_use]
    pub const fn shape(&self) -> StreamShape {
        self.shape
    }

    /// Request metadata sent by the client when the stream was opened.
    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Cancellation signal of the call.
    #[must_use]
    pub const fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }
}

/// Per-call options supplied by the caller.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Request metadata, fixed once the call starts.
    pub metadata: Metadata,
    /// Deadline for the whole call. Falls back to the client default.
    pub timeout: Option<Duration>,
    /// Token the caller can trigger to withdraw the call.
    pub cancel: CancellationToken,
}

impl CallOptions {
    /// Default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach request metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set a deadline for the call.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use `token` to cancel the call.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// Single response of a unary or client-streaming call, with its metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response<T> {
    /// The response message.
    pub message: T,
    /// Header metadata sent by the server.
    pub header: Metadata,
    /// Trailer metadata sent by the server.
    pub trailer: Metadata,
}

impl<T> Response<T> {
    /// Take the message, discarding metadata.
    pub fn into_inner(self) -> T {
        self.message
    }

    /// Convert the message, keeping metadata.
    ///
    /// # Errors
    ///
    /// Returns the conversion error.
    pub fn try_map<U, F>(self, convert: F) -> Result<Response<U>>
    where
        F: FnOnce(T) -> Result<U>,
    {
        Ok(Response {
            message: convert(self.message)?,
            header: self.header,
            trailer: self.trailer,
        })
    }
}
