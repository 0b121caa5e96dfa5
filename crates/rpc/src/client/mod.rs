//! Client side of the engine: stream creation and the drivers for the four call shapes.

mod stream;

pub use stream::{ClientStream, TransportClientStream};

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::call::{CallInfo, CallOptions, Cancellation, Response, StreamShape};
use crate::codec::Message;
use crate::error::{Error, Result};
use crate::interceptor::{
    CallObserver, ClientInterceptor, ObserverInterceptor, StreamOpener, UnaryInvoker,
    client_stream_chain, client_unary_chain,
};
use crate::metadata::Metadata;
use crate::transport::Transport;

/// Configuration for the client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Deadline applied to calls that do not set their own.
    pub default_timeout: Option<Duration>,
    /// Buffered inbound messages per stream.
    pub inbound_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            inbound_capacity: 32,
        }
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    interceptors: Vec<Arc<dyn ClientInterceptor>>,
    config: ClientConfig,
}

impl ClientBuilder {
    /// Start building a client that opens streams on `transport`.
    pub fn new(transport: impl Transport) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    /// Like [`ClientBuilder::new`] for a transport shared with other clients.
    #[must_use]
    pub fn from_arc(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            interceptors: Vec::new(),
            config: ClientConfig::default(),
        }
    }

    /// Add an interceptor. The first one added is outermost.
    #[must_use]
    pub fn interceptor(mut self, interceptor: impl ClientInterceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Add an observer, wrapped in an [`ObserverInterceptor`].
    #[must_use]
    pub fn observer(self, observer: impl CallObserver) -> Self {
        self.interceptor(ObserverInterceptor::new(observer))
    }

    /// Replace the configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the client.
    #[must_use]
    pub fn build(self) -> Client {
        let transport = self.transport;
        let capacity = self.config.inbound_capacity;
        let open: StreamOpener = Arc::new(move |info: CallInfo| {
            let transport = Arc::clone(&transport);
            async move {
                let stream = TransportClientStream::open(transport.as_ref(), info, capacity).await?;
                Ok::<Box<dyn ClientStream>, Error>(Box::new(stream))
            }
            .boxed()
        });

        let unary: UnaryInvoker = {
            let open = Arc::clone(&open);
            Arc::new(move |info: CallInfo, request: Bytes| {
                let open = Arc::clone(&open);
                async move {
                    let stream = open(info).await?;
                    exchange_unary(stream.as_ref(), request).await
                }
                .boxed()
            })
        };

        Client {
            open: client_stream_chain(&self.interceptors, open),
            unary: client_unary_chain(&self.interceptors, unary),
            config: Arc::new(self.config),
        }
    }
}

/// RPC client. Cheap to clone; clones share the transport and interceptors.
#[derive(Clone)]
pub struct Client {
    open: StreamOpener,
    unary: UnaryInvoker,
    config: Arc<ClientConfig>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Client {
    /// Client with default configuration and no interceptors.
    pub fn new(transport: impl Transport) -> Self {
        ClientBuilder::new(transport).build()
    }

    /// Start building a client.
    pub fn builder(transport: impl Transport) -> ClientBuilder {
        ClientBuilder::new(transport)
    }

    fn call_info(&self, method: &str, shape: StreamShape, options: CallOptions) -> CallInfo {
        let timeout = options.timeout.or(self.config.default_timeout);
        let cancellation = Cancellation::new(options.cancel.child_token(), timeout);
        CallInfo::new(method, shape, options.metadata, cancellation)
    }

    /// Open a raw stream through the stream interceptor chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the call is cancelled or the transport cannot open the stream.
    pub async fn open(
        &self,
        method: &str,
        shape: StreamShape,
        options: CallOptions,
    ) -> Result<Box<dyn ClientStream>> {
        let info = self.call_info(method, shape, options);
        (self.open)(info).await
    }

    /// One request, one response.
    ///
    /// # Errors
    ///
    /// Returns the handler status as `Error::Handler`, or the stream failure.
    #[instrument(skip(self, request, options))]
    pub async fn unary<Req, Resp>(
        &self,
        method: &str,
        request: Req,
        options: CallOptions,
    ) -> Result<Response<Resp>>
    where
        Req: Message,
        Resp: Message,
    {
        let info = self.call_info(method, StreamShape::Unary, options);
        let response = (self.unary)(info, request.encode()?).await?;
        response.try_map(Resp::decode)
    }

    /// One request, a stream of responses pulled by the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be opened or the request cannot be sent.
    #[instrument(skip(self, request, options))]
    pub async fn server_streaming<Req, Resp>(
        &self,
        method: &str,
        request: Req,
        options: CallOptions,
    ) -> Result<Streaming<Resp>>
    where
        Req: Message,
        Resp: Message,
    {
        let stream = self.open(method, StreamShape::ServerStreaming, options).await?;
        stream.send(request.encode()?).await?;
        Ok(Streaming::new(stream))
    }

    /// A stream of requests, one response after the requests are exhausted.
    ///
    /// # Errors
    ///
    /// Returns the handler status as `Error::Handler`, or the stream failure.
    #[instrument(skip(self, requests, options))]
    pub async fn client_streaming<Req, Resp, S>(
        &self,
        method: &str,
        requests: S,
        options: CallOptions,
    ) -> Result<Response<Resp>>
    where
        Req: Message,
        Resp: Message,
        S: Stream<Item = Req> + Send,
    {
        let stream = self.open(method, StreamShape::ClientStreaming, options).await?;

        // The server may answer or fail before the requests run out.
        let receiving = receive_single(stream.as_ref());
        tokio::pin!(receiving);
        let mut sent = 0;
        let result = tokio::select! {
            biased;
            response = &mut receiving => return response?.try_map(Resp::decode),
            result = send_all(stream.as_ref(), requests, &mut sent) => result,
        };
        let result = match result {
            Ok(()) => stream.close_send().await,
            Err(error) => Err(error),
        };
        match result {
            Ok(()) | Err(Error::Transport(_)) => {}
            Err(error) => {
                stream.close();
                return Err(error);
            }
        }
        debug!(sent, "Requests sent, awaiting response");

        receiving.await?.try_map(Resp::decode)
    }

    /// Independent streams of requests and responses.
    ///
    /// Requests are pulled from `requests` and sent by one task while another task
    /// hands every response to `on_response`. The call returns once both tasks
    /// are done. A failed send lets already sent responses drain before the
    /// call ends; a failed receive aborts the send task. Once the server has
    /// ended the call no further requests are pulled.
    ///
    /// # Errors
    ///
    /// Returns the first failure recorded by either task.
    #[instrument(skip(self, requests, options, on_response))]
    pub async fn bidi_streaming<Req, Resp, S, F>(
        &self,
        method: &str,
        requests: S,
        options: CallOptions,
        mut on_response: F,
    ) -> Result<BidiSummary>
    where
        Req: Message,
        Resp: Message,
        S: Stream<Item = Req> + Send + 'static,
        F: FnMut(Resp) + Send + 'static,
    {
        let stream: Arc<dyn ClientStream> =
            Arc::from(self.open(method, StreamShape::Bidirectional, options).await?);
        let failure = Arc::new(FirstFailure::default());
        let inbound_done = CancellationToken::new();

        let send_unit = tokio::spawn({
            let stream = Arc::clone(&stream);
            let failure = Arc::clone(&failure);
            let inbound_done = inbound_done.clone();
            async move {
                let mut sent = 0;
                let result = tokio::select! {
                    biased;
                    () = inbound_done.cancelled() => Ok(()),
                    result = send_all(stream.as_ref(), requests, &mut sent) => result,
                };
                let result = match result {
                    Ok(()) => stream.close_send().await,
                    Err(error) => {
                        // Half-close so the server can finish what it already started.
                        let _ = stream.close_send().await;
                        Err(error)
                    }
                };
                match result {
                    Ok(()) | Err(Error::Transport(_)) => {}
                    Err(error) => failure.record(error),
                }
                sent
            }
        });

        let receive_unit = tokio::spawn({
            let stream = Arc::clone(&stream);
            let failure = Arc::clone(&failure);
            async move {
                let _done = inbound_done.drop_guard();
                let mut received = 0_u64;
                loop {
                    match stream.receive().await.and_then(|m| m.map(Resp::decode).transpose()) {
                        Ok(Some(response)) => {
                            received += 1;
                            on_response(response);
                        }
                        Ok(None) => break,
                        Err(error) => {
                            failure.record(error);
                            stream.close();
                            break;
                        }
                    }
                }
                received
            }
        });

        let (sent, received) = tokio::join!(send_unit, receive_unit);
        let (sent, received) = (joined(sent)?, joined(received)?);
        if let Some(error) = failure.take() {
            return Err(error);
        }

        Ok(BidiSummary {
            sent,
            received,
            header: stream.header().unwrap_or_default(),
            trailer: stream.trailer().unwrap_or_default(),
        })
    }
}

/// Final state of a successful bidirectional call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BidiSummary {
    /// Requests sent.
    pub sent: u64,
    /// Responses received.
    pub received: u64,
    /// Header metadata.
    pub header: Metadata,
    /// Trailer metadata.
    pub trailer: Metadata,
}

/// Responses of a server-streaming call.
pub struct Streaming<T> {
    stream: Box<dyn ClientStream>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Message> Streaming<T> {
    fn new(stream: Box<dyn ClientStream>) -> Self {
        Self {
            stream,
            _marker: PhantomData,
        }
    }

    /// Call description.
    #[must_use]
    pub fn info(&self) -> &CallInfo {
        self.stream.info()
    }

    /// Next response, `None` once the server finished.
    ///
    /// # Errors
    ///
    /// Returns the handler status as `Error::Handler`, or the stream failure.
    pub async fn message(&mut self) -> Result<Option<T>> {
        match self.stream.receive().await? {
            Some(bytes) => T::decode(bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Header metadata, `None` if not yet received.
    #[must_use]
    pub fn header(&self) -> Option<Metadata> {
        self.stream.header()
    }

    /// Wait for header metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the call is cancelled first.
    pub async fn await_header(&self) -> Result<Metadata> {
        self.stream.await_header().await
    }

    /// Trailer metadata, `None` until [`Streaming::message`] returned `None` or an error.
    #[must_use]
    pub fn trailer(&self) -> Option<Metadata> {
        self.stream.trailer()
    }

    /// Abandon the call.
    pub fn cancel(&self) {
        self.stream.close();
    }

    /// Adapt into a `Stream` of responses ending after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut streaming = state?;
            match streaming.message().await {
                Ok(Some(message)) => Some((Ok(message), Some(streaming))),
                Ok(None) => None,
                Err(error) => Some((Err(error), None)),
            }
        })
    }
}

impl<T> std::fmt::Debug for Streaming<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streaming")
            .field("info", self.stream.info())
            .finish_non_exhaustive()
    }
}

/// First hard failure reported by either unit of a bidirectional call.
#[derive(Debug, Default)]
struct FirstFailure(Mutex<Option<Error>>);

impl FirstFailure {
    fn record(&self, error: Error) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            debug!(%error, "Recording call failure");
            *slot = Some(error);
        }
    }

    fn take(&self) -> Option<Error> {
        self.0.lock().take()
    }
}

fn joined<T>(result: std::result::Result<T, JoinError>) -> Result<T> {
    result.map_err(|error| {
        if error.is_panic() {
            std::panic::resume_unwind(error.into_panic());
        }
        Error::Cancelled
    })
}

/// Send every request, stopping at the first failure. Counts them in `sent`.
async fn send_all<Req, S>(stream: &dyn ClientStream, requests: S, sent: &mut u64) -> Result<()>
where
    Req: Message,
    S: Stream<Item = Req> + Send,
{
    let cancellation = stream.info().cancellation().clone();
    let mut requests = std::pin::pin!(requests);

    loop {
        let next = tokio::select! {
            biased;
            error = cancellation.cancelled() => return Err(error),
            next = requests.next() => next,
        };
        let Some(request) = next else {
            return Ok(());
        };

        stream.send(request.encode()?).await?;
        *sent += 1;
    }
}

/// Send the request of a unary call and wait for its response.
async fn exchange_unary(stream: &dyn ClientStream, request: Bytes) -> Result<Response<Bytes>> {
    if let Err(error) = stream.send(request).await {
        if !matches!(error, Error::Transport(_)) {
            return Err(error);
        }
        // The server stopped reading; its trailer carries the real outcome.
        return match stream.receive().await {
            Err(status) => Err(status),
            Ok(_) => Err(error),
        };
    }
    receive_single(stream).await
}

/// Receive exactly one response followed by the end of the stream.
async fn receive_single(stream: &dyn ClientStream) -> Result<Response<Bytes>> {
    let message = stream
        .receive()
        .await?
        .ok_or_else(|| Error::Protocol("stream ended without a response".to_string()))?;
    if stream.receive().await?.is_some() {
        stream.close();
        return Err(Error::Protocol("more than one response".to_string()));
    }

    Ok(Response {
        message,
        header: stream.header().unwrap_or_default(),
        trailer: stream.trailer().unwrap_or_default(),
    })
}
