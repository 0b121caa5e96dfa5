//! Client end of a stream channel.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::call::{CallInfo, Cancellation};
use crate::error::{Direction, Error, Result, TransportError};
use crate::inbound::{Inbound, InboundState};
use crate::metadata::{Metadata, MetadataCell};
use crate::transport::{Frame, Transport};

/// Client view of a stream: the capability set interceptors can substitute.
///
/// `send` and `receive` may run concurrently from different tasks; each
/// direction has a single writer or reader at a time.
#[async_trait]
pub trait ClientStream: Send + Sync {
    /// Call this stream belongs to.
    fn info(&self) -> &CallInfo;

    /// Send one message.
    ///
    /// Fails with `ClosedDirection` after `close_send`, after a failed send, or
    /// after the single request of a unary or server-streaming call.
    async fn send(&self, message: Bytes) -> Result<()>;

    /// Next message, `Ok(None)` once the server ended the stream.
    async fn receive(&self) -> Result<Option<Bytes>>;

    /// Tell the server no further messages will be sent. Idempotent.
    async fn close_send(&self) -> Result<()>;

    /// Abandon the stream. Pending and later operations fail with `Cancelled`.
    fn close(&self);

    /// Header metadata, or `None` if not yet available.
    fn header(&self) -> Option<Metadata>;

    /// Wait for header metadata. Empty if the stream ended without any.
    async fn await_header(&self) -> Result<Metadata>;

    /// Trailer metadata, or `None` until `receive` has reported the end of the stream.
    fn trailer(&self) -> Option<Metadata>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SendState {
    Open,
    Closed,
    Failed,
}

#[derive(Debug)]
struct Outbound {
    frames: mpsc::Sender<Frame>,
    state: SendState,
}

/// `ClientStream` over a transport `Duplex`.
#[derive(Debug)]
pub struct TransportClientStream {
    info: CallInfo,
    outbound: Mutex<Outbound>,
    inbound: Mutex<InboundState>,
    header: Arc<MetadataCell>,
    trailer: MetadataCell,
}

impl TransportClientStream {
    /// Open a stream for `info` on `transport`.
    ///
    /// # Errors
    ///
    /// Returns an error if the call is already cancelled or the transport fails.
    pub async fn open(
        transport: &dyn Transport,
        info: CallInfo,
        inbound_capacity: usize,
    ) -> Result<Self> {
        let cancellation = info.cancellation().clone();
        let duplex = tokio::select! {
            biased;
            error = cancellation.cancelled() => return Err(error),
            duplex = transport.open_stream(info.head()) => duplex?,
        };

        let header = Arc::new(MetadataCell::new());
        let (events, events_rx) = mpsc::channel(inbound_capacity.max(1));
        tokio::spawn(demux(
            duplex.inbound,
            duplex.outbound.clone(),
            events,
            Arc::clone(&header),
            cancellation,
        ));

        debug!(
            stream_id = %info.id(),
            method = info.method(),
            shape = %info.shape(),
            "Opened client stream"
        );

        Ok(Self {
            info,
            outbound: Mutex::new(Outbound {
                frames: duplex.outbound,
                state: SendState::Open,
            }),
            inbound: Mutex::new(InboundState::new(events_rx)),
            header,
            trailer: MetadataCell::new(),
        })
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

    async fn half_close(&self, outbound: &mut Outbound) -> Result<()> {
        let result = self.write(outbound, Frame::EndOfStream).await;
        outbound.state = if result.is_ok() {
            SendState::Closed
        } else {
            SendState::Failed
        };
        debug!(stream_id = %self.info.id(), "Closed send direction");
        result
    }
}

#[async_trait]
impl ClientStream for TransportClientStream {
    fn info(&self) -> &CallInfo {
        &self.info
    }

    async fn send(&self, message: Bytes) -> Result<()> {
        let mut outbound = self.outbound.lock().await;
        if outbound.state != SendState::Open {
            return Err(Error::ClosedDirection(Direction::Send));
        }

        if let Err(error) = self.write(&outbound, Frame::Message(message)).await {
            outbound.state = SendState::Failed;
            return Err(error);
        }

        if self.info.shape().client_streams() {
            Ok(())
        } else {
            self.half_close(&mut outbound).await
        }
    }

    async fn receive(&self) -> Result<Option<Bytes>> {
        let mut inbound = self.inbound.lock().await;
        inbound
            .receive(self.info.cancellation(), |trailer| {
                self.trailer.set(trailer);
            })
            .await
    }

    async fn close_send(&self) -> Result<()> {
        let mut outbound = self.outbound.lock().await;
        match outbound.state {
            SendState::Open => self.half_close(&mut outbound).await,
            SendState::Closed | SendState::Failed => Ok(()),
        }
    }

    fn close(&self) {
        debug!(stream_id = %self.info.id(), "Closing client stream");
        self.info.cancellation().cancel();
    }

    fn header(&self) -> Option<Metadata> {
        self.header.get()
    }

    async fn await_header(&self) -> Result<Metadata> {
        if let Some(header) = self.header.get() {
            return Ok(header);
        }
        tokio::select! {
            biased;
            header = self.header.wait() => Ok(header),
            error = self.info.cancellation().cancelled() => Err(error),
        }
    }

    fn trailer(&self) -> Option<Metadata> {
        self.trailer.get()
    }
}

impl Drop for TransportClientStream {
    fn drop(&mut self) {
        // Stops the demultiplexer and tells the server if the call is unfinished.
        self.info.cancellation().cancel();
    }
}

/// Route server frames: headers into the cell, messages and the end to the reader.
///
/// Dropping `frames` on exit is what tells the server the client stopped
/// listening, so a `Cancel` frame that finds the queue full is not needed.
async fn demux(
    mut frames: mpsc::Receiver<Frame>,
    peer: mpsc::Sender<Frame>,
    events: mpsc::Sender<Inbound>,
    header: Arc<MetadataCell>,
    cancellation: Cancellation,
) {
    let cancelled = |error: Error| {
        let _ = peer.try_send(Frame::Cancel);
        Inbound::failed(error)
    };

    let end = loop {
        let frame = tokio::select! {
            biased;
            error = cancellation.cancelled() => break cancelled(error),
            () = events.closed() => return,
            frame = frames.recv() => frame,
        };

        match frame {
            Some(Frame::Header(metadata)) => {
                if !header.set(metadata) {
                    warn!("Ignoring duplicate header frame");
                }
            }
            Some(Frame::Message(message)) => {
                header.set(Metadata::new());
                tokio::select! {
                    biased;
                    error = cancellation.cancelled() => break cancelled(error),
                    sent = events.send(Inbound::Message(message)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Some(Frame::Trailer { metadata, status }) => {
                break Inbound::End {
                    result: status.map_or(Ok(()), |status| Err(Error::Handler(status))),
                    trailer: metadata,
                };
            }
            Some(frame @ (Frame::EndOfStream | Frame::Cancel)) => {
                break Inbound::failed(Error::Protocol(format!(
                    "unexpected {frame:?} frame from server"
                )));
            }
            None => break Inbound::failed(TransportError::ConnectionClosed.into()),
        }
    };

    header.set(Metadata::new());
    drop(frames);
    drop(peer);
    let _ = events.send(end).await;
}
