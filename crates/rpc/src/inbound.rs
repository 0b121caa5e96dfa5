//! Receive-direction state shared by client and server streams.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::call::Cancellation;
use crate::error::{Result, TransportError};
use crate::metadata::Metadata;

/// Event forwarded from a stream's frame demultiplexer to its reader.
#[derive(Debug)]
pub(crate) enum Inbound {
    Message(Bytes),
    End { result: Result<()>, trailer: Metadata },
}

impl Inbound {
    pub(crate) fn failed(error: crate::Error) -> Self {
        Self::End {
            result: Err(error),
            trailer: Metadata::new(),
        }
    }
}

/// Reader end of the receive direction. Caches the terminal result.
#[derive(Debug)]
pub(crate) struct InboundState {
    events: mpsc::Receiver<Inbound>,
    finished: Option<Result<()>>,
}

impl InboundState {
    pub(crate) const fn new(events: mpsc::Receiver<Inbound>) -> Self {
        Self {
            events,
            finished: None,
        }
    }

    /// Next message, `None` at end of stream. `on_end` runs once with the trailers.
    pub(crate) async fn receive<F>(
        &mut self,
        cancellation: &Cancellation,
        on_end: F,
    ) -> Result<Option<Bytes>>
    where
        F: FnOnce(Metadata),
    {
        if let Some(finished) = &self.finished {
            return finished.clone().map(|()| None);
        }

        let event = tokio::select! {
            biased;
            error = cancellation.cancelled() => Inbound::failed(error),
            event = self.events.recv() => {
                event.unwrap_or_else(|| Inbound::failed(TransportError::ConnectionClosed.into()))
            }
        };

        match event {
            Inbound::Message(message) => Ok(Some(message)),
            Inbound::End { result, trailer } => {
                on_end(trailer);
                self.finished = Some(result.clone());
                result.map(|()| None)
            }
        }
    }
}
