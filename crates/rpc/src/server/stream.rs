//! Server end of a stream channel.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::call::{CallInfo, Cancellation};
use crate::error::{Direction, Error, MetadataKind, Result, Status, TransportError};
use crate::inbound::{Inbound, InboundState};
use crate::metadata::Metadata;
use crate::transport::{Duplex, Frame};

/// Server view of a stream, handed to handlers and server interceptors.
#[async_trait]
pub trait ServerStream: Send + Sync {
    /// Call this stream belongs to.
    fn info(&self) -> &CallInfo;

    /// Next request, `Ok(None)` once the client closed its send direction.
    async fn receive(&self) -> Result<Option<Bytes>>;

    /// Send one response. Flushes the header first if it has not been sent.
    async fn send(&self, message: Bytes) -> Result<()>;

    /// Set the header sent with the first response.
    ///
    /// Fails with `MetadataAlreadySet` if a header was already set or sent.
    fn set_header(&self, metadata: Metadata) -> Result<()>;

    /// Send the header now, merged after anything passed to `set_header`.
    ///
    /// Fails with `MetadataAlreadySet` if the header was already sent.
    async fn send_header(&self, metadata: Metadata) -> Result<()>;

    /// Set the trailer sent when the stream finishes.
    ///
    /// Fails with `MetadataAlreadySet` if a trailer was already set.
    fn set_trailer(&self, metadata: Metadata) -> Result<()>;
}

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Empty,
    Pending(Metadata),
    Flushed,
}

impl Slot {
    fn set(&mut self, metadata: Metadata, kind: MetadataKind) -> Result<()> {
        match self {
            Self::Empty => {
                *self = Self::Pending(metadata);
                Ok(())
            }
            Self::Pending(_) | Self::Flushed => Err(Error::MetadataAlreadySet(kind)),
        }
    }

    /// Value to put on the wire, `None` if it already went out.
    fn take_for_flush(&mut self) -> Option<Metadata> {
        match std::mem::replace(self, Self::Flushed) {
            Self::Empty => Some(Metadata::new()),
            Self::Pending(metadata) => Some(metadata),
            Self::Flushed => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SendState {
    Open,
    Closed,
    Finished,
}

#[derive(Debug)]
struct Outbound {
    frames: mpsc::Sender<Frame>,
    state: SendState,
}

/// `ServerStream` over the server end of a transport `Duplex`.
#[derive(Debug)]
pub struct TransportServerStream {
    info: CallInfo,
    outbound: Mutex<Outbound>,
    inbound: Mutex<InboundState>,
    header: SyncMutex<Slot>,
    trailer: SyncMutex<Slot>,
}

impl TransportServerStream {
    /// Wrap an accepted stream. Spawns the task reading client frames.
    pub fn new(info: CallInfo, duplex: Duplex, inbound_capacity: usize) -> Self {
        let (events, events_rx) = mpsc::channel(inbound_capacity.max(1));
        tokio::spawn(demux(
            duplex.inbound,
            duplex.outbound.clone(),
            events,
            info.cancellation().clone(),
        ));

        Self {
            info,
            outbound: Mutex::new(Outbound {
                frames: duplex.outbound,
                state: SendState::Open,
            }),
            inbound: Mutex::new(InboundState::new(events_rx)),
            header: SyncMutex::new(Slot::Empty),
            trailer: SyncMutex::new(Slot::Empty),
        }
    }

    /// End the stream: flush the header if needed, then send trailer and status.
    ///
    /// Later calls do nothing. Delivery failures are ignored since the client is gone.
    pub async fn finish(&self, result: std::result::Result<(), Status>) {
        let mut outbound = self.outbound.lock().await;
        if outbound.state == SendState::Finished {
            return;
        }
        outbound.state = SendState::Finished;

        if let Err(error) = self.flush_header(&outbound).await {
            debug!(stream_id = %self.info.id(), %error, "Client gone before header");
            return;
        }

        let metadata = self.trailer.lock().take_for_flush().unwrap_or_default();
        if let Err(status) = &result {
            debug!(stream_id = %self.info.id(), %status, "Finishing stream with error");
        }
        let frame = Frame::Trailer {
            metadata,
            status: result.err(),
        };
        if let Err(error) = self.write(&outbound, frame).await {
            debug!(stream_id = %self.info.id(), %error, "Client gone before trailer");
        }
    }

    async fn write(&self, outbound: &Outbound, frame: Frame) -> Result<()> {
        let cancellation = self.info.cancellation();
        tokio::select! {
            biased;
            error = cancellation.cancelled() => Err(error),
            sent = outbound.frames.send(frame) => {
                sent.map_err(|_| TransportError::ConnectionClosed.into())
            }
        }
    }

    async fn flush_header(&self, outbound: &Outbound) -> Result<()> {
        let header = self.header.lock().take_for_flush();
        match header {
            Some(metadata) => self.write(outbound, Frame::Header(metadata)).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ServerStream for TransportServerStream {
    fn info(&self) -> &CallInfo {
        &self.info
    }

    async fn receive(&self) -> Result<Option<Bytes>> {
        let mut inbound = self.inbound.lock().await;
        inbound.receive(self.info.cancellation(), |_| {}).await
    }

    async fn send(&self, message: Bytes) -> Result<()> {
        let mut outbound = self.outbound.lock().await;
        if outbound.state != SendState::Open {
            return Err(Error::ClosedDirection(Direction::Send));
        }

        self.flush_header(&outbound).await?;
        self.write(&outbound, Frame::Message(message)).await?;
        if !self.info.shape().server_streams() {
            outbound.state = SendState::Closed;
        }
        Ok(())
    }

    fn set_header(&self, metadata: Metadata) -> Result<()> {
        self.header.lock().set(metadata, MetadataKind::Header)
    }

    async fn send_header(&self, metadata: Metadata) -> Result<()> {
        let outbound = self.outbound.lock().await;
        let header = {
            let mut slot = self.header.lock();
            match slot.take_for_flush() {
                Some(mut pending) => {
                    pending.merge(metadata);
                    pending
                }
                None => return Err(Error::MetadataAlreadySet(MetadataKind::Header)),
            }
        };
        self.write(&outbound, Frame::Header(header)).await
    }

    fn set_trailer(&self, metadata: Metadata) -> Result<()> {
        self.trailer.lock().set(metadata, MetadataKind::Trailer)
    }
}

/// Forward client frames to the reader. Cancels the call when the client goes away.
///
/// `peer` is the server's own outbound queue. It closes once the client stops
/// listening, which is noticed even while a request waits for buffer space.
async fn demux(
    mut frames: mpsc::Receiver<Frame>,
    peer: mpsc::Sender<Frame>,
    events: mpsc::Sender<Inbound>,
    cancellation: Cancellation,
) {
    let mut ended = false;

    let end = loop {
        let frame = tokio::select! {
            biased;
            () = events.closed() => return,
            () = peer.closed() => break Error::Cancelled,
            frame = frames.recv() => frame,
        };

        let event = match frame {
            Some(Frame::Message(message)) if !ended => Inbound::Message(message),
            Some(Frame::EndOfStream) if !ended => {
                ended = true;
                Inbound::End {
                    result: Ok(()),
                    trailer: Metadata::new(),
                }
            }
            Some(Frame::Cancel) => {
                debug!("Client cancelled stream");
                break Error::Cancelled;
            }
            Some(frame) => {
                warn!(?frame, "Unexpected frame from client");
                if ended {
                    continue;
                }
                ended = true;
                Inbound::failed(Error::Protocol(format!(
                    "unexpected {frame:?} frame from client"
                )))
            }
            None => break TransportError::ConnectionClosed.into(),
        };

        tokio::select! {
            biased;
            () = peer.closed() => break Error::Cancelled,
            sent = events.send(event) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    };

    cancellation.cancel();
    drop(peer);
    if !ended {
        // The reader checks the token first, so a full buffer loses nothing.
        let _ = events.try_send(Inbound::failed(end));
    }
}
