//! Transport abstraction consumed by the engine.
//!
//! A transport delivers already-framed values: it never parses message payloads.
//! Implementations (in-memory, sockets, ...) live in separate crates.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::call::StreamShape;
use crate::error::{Status, TransportError};
use crate::metadata::Metadata;

/// A single unit of traffic on a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Header metadata, sent by the server before or with its first message.
    Header(Metadata),
    /// One message payload.
    Message(Bytes),
    /// The client will send no further messages.
    EndOfStream,
    /// Terminal server frame carrying trailers and the failure status, if any.
    Trailer {
        /// Trailer metadata.
        metadata: Metadata,
        /// `None` when the handler succeeded.
        status: Option<Status>,
    },
    /// The client abandoned the call.
    Cancel,
}

/// What a client sends when opening a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamHead {
    /// Stream id, shared by both peers.
    pub id: Uuid,
    /// Fully qualified method name.
    pub method: String,
    /// Shape requested by the client.
    pub shape: StreamShape,
    /// Request metadata.
    pub metadata: Metadata,
}

/// One side of an open stream: ordered outbound and inbound frame queues.
#[derive(Debug)]
pub struct Duplex {
    /// Frames to the peer.
    pub outbound: mpsc::Sender<Frame>,
    /// Frames from the peer.
    pub inbound: mpsc::Receiver<Frame>,
}

impl Duplex {
    /// Create two connected ends, each with queues bounded by `capacity`.
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (left_tx, right_rx) = mpsc::channel(capacity.max(1));
        let (right_tx, left_rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                outbound: left_tx,
                inbound: left_rx,
            },
            Self {
                outbound: right_tx,
                inbound: right_rx,
            },
        )
    }
}

/// A stream opened by a remote client, as seen by the server.
#[derive(Debug)]
pub struct IncomingStream {
    /// What the client asked for.
    pub head: StreamHead,
    /// Server end of the stream.
    pub duplex: Duplex,
}

/// Client side of a transport: opens streams over an established connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new logical stream for `head`.
    async fn open_stream(&self, head: StreamHead) -> Result<Duplex, TransportError>;
}

/// Server side of a transport: yields streams opened by clients.
///
/// Dropping a listener stops it accepting. Streams not yet accepted fail.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next stream. `ConnectionClosed` means the listener is gone.
    async fn accept(&self) -> Result<IncomingStream, TransportError>;
}
