//! Interceptor chain shared by client and server.
//!
//! An interceptor receives the next step of a call and returns a substitute with
//! the same contract. Chains are built so that the first registered interceptor
//! is outermost: it sees every operation first on the way out and last on the
//! way back.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::debug;

use crate::call::{CallInfo, Response};
use crate::client::ClientStream;
use crate::error::{Error, Result, Status};
use crate::metadata::Metadata;
use crate::server::ServerStream;

/// Opens a client stream for a call.
pub type StreamOpener =
    Arc<dyn Fn(CallInfo) -> BoxFuture<'static, Result<Box<dyn ClientStream>>> + Send + Sync>;

/// Performs a complete unary call on the client.
pub type UnaryInvoker =
    Arc<dyn Fn(CallInfo, Bytes) -> BoxFuture<'static, Result<Response<Bytes>>> + Send + Sync>;

/// Serves a unary request on the server.
pub type UnaryService = Arc<
    dyn Fn(Arc<dyn ServerStream>, Bytes) -> BoxFuture<'static, std::result::Result<Bytes, Status>>
        + Send
        + Sync,
>;

/// Serves a streaming call on the server.
pub type StreamService = Arc<
    dyn Fn(Arc<dyn ServerStream>) -> BoxFuture<'static, std::result::Result<(), Status>>
        + Send
        + Sync,
>;

/// Client-side interceptor. Both methods default to pass-through.
pub trait ClientInterceptor: Send + Sync + 'static {
    /// Wrap a unary call.
    fn wrap_unary(&self, next: UnaryInvoker) -> UnaryInvoker {
        next
    }

    /// Wrap stream creation. The returned stream may substitute its own `send`/`receive`.
    fn wrap_stream(&self, next: StreamOpener) -> StreamOpener {
        next
    }
}

/// Server-side interceptor. Both methods default to pass-through.
pub trait ServerInterceptor: Send + Sync + 'static {
    /// Wrap a unary handler.
    fn wrap_unary(&self, next: UnaryService) -> UnaryService {
        next
    }

    /// Wrap a streaming handler.
    fn wrap_stream(&self, next: StreamService) -> StreamService {
        next
    }
}

pub(crate) fn client_unary_chain(
    interceptors: &[Arc<dyn ClientInterceptor>],
    base: UnaryInvoker,
) -> UnaryInvoker {
    interceptors
        .iter()
        .rev()
        .fold(base, |next, interceptor| interceptor.wrap_unary(next))
}

pub(crate) fn client_stream_chain(
    interceptors: &[Arc<dyn ClientInterceptor>],
    base: StreamOpener,
) -> StreamOpener {
    interceptors
        .iter()
        .rev()
        .fold(base, |next, interceptor| interceptor.wrap_stream(next))
}

pub(crate) fn server_unary_chain(
    interceptors: &[Arc<dyn ServerInterceptor>],
    base: UnaryService,
) -> UnaryService {
    interceptors
        .iter()
        .rev()
        .fold(base, |next, interceptor| interceptor.wrap_unary(next))
}

pub(crate) fn server_stream_chain(
    interceptors: &[Arc<dyn ServerInterceptor>],
    base: StreamService,
) -> StreamService {
    interceptors
        .iter()
        .rev()
        .fold(base, |next, interceptor| interceptor.wrap_stream(next))
}

/// Read-only hooks around every stream operation and unary call.
///
/// Hooks are synchronous and must not block.
#[allow(unused_variables)]
pub trait CallObserver: Send + Sync + 'static {
    /// A stream was opened (client) or accepted (server).
    fn on_open(&self, info: &CallInfo) {}

    /// A message is about to be sent.
    fn before_send(&self, info: &CallInfo, message: &Bytes) {}

    /// A send finished.
    fn after_send(&self, info: &CallInfo, result: &Result<()>) {}

    /// A receive is about to wait.
    fn before_receive(&self, info: &CallInfo) {}

    /// A receive finished. `Ok(None)` is the end of the stream.
    fn after_receive(&self, info: &CallInfo, result: &Result<Option<Bytes>>) {}

    /// A unary call is starting.
    fn before_unary(&self, info: &CallInfo, request: &Bytes) {}

    /// A unary call finished.
    fn after_unary(&self, info: &CallInfo, result: std::result::Result<&Bytes, &Error>) {}
}

/// Adapts a `CallObserver` into both interceptor kinds.
#[derive(Debug)]
pub struct ObserverInterceptor<O> {
    observer: Arc<O>,
}

impl<O: CallObserver> ObserverInterceptor<O> {
    /// Observe calls with `observer`.
    pub fn new(observer: O) -> Self {
        Self {
            observer: Arc::new(observer),
        }
    }

    /// Share an observer already held elsewhere.
    pub const fn from_arc(observer: Arc<O>) -> Self {
        Self { observer }
    }
}

impl<O: CallObserver> ClientInterceptor for ObserverInterceptor<O> {
    fn wrap_unary(&self, next: UnaryInvoker) -> UnaryInvoker {
        let observer = Arc::clone(&self.observer);
        Arc::new(move |info: CallInfo, request: Bytes| {
            let observer = Arc::clone(&observer);
            let next = Arc::clone(&next);
            async move {
                observer.before_unary(&info, &request);
                let result = next(info.clone(), request).await;
                observer.after_unary(&info, result.as_ref().map(|response| &response.message));
                result
            }
            .boxed()
        })
    }

    fn wrap_stream(&self, next: StreamOpener) -> StreamOpener {
        let observer = Arc::clone(&self.observer);
        Arc::new(move |info: CallInfo| {
            let observer = Arc::clone(&observer);
            let next = Arc::clone(&next);
            async move {
                let inner = next(info).await?;
                observer.on_open(inner.info());
                let stream: Box<dyn ClientStream> = Box::new(ObservedClientStream { inner, observer });
                Ok::<_, Error>(stream)
            }
            .boxed()
        })
    }
}

impl<O: CallObserver> ServerInterceptor for ObserverInterceptor<O> {
    fn wrap_unary(&self, next: UnaryService) -> UnaryService {
        let observer = Arc::clone(&self.observer);
        Arc::new(move |stream: Arc<dyn ServerStream>, request: Bytes| {
            let observer = Arc::clone(&observer);
            let next = Arc::clone(&next);
            async move {
                observer.before_unary(stream.info(), &request);
                let result = next(Arc::clone(&stream), request).await;
                match &result {
                    Ok(response) => observer.after_unary(stream.info(), Ok(response)),
                    Err(status) => {
                        let error = Error::Handler(status.clone());
                        observer.after_unary(stream.info(), Err(&error));
                    }
                }
                result
            }
            .boxed()
        })
    }

    fn wrap_stream(&self, next: StreamService) -> StreamService {
        let observer = Arc::clone(&self.observer);
        Arc::new(move |inner: Arc<dyn ServerStream>| {
            observer.on_open(inner.info());
            let stream: Arc<dyn ServerStream> = Arc::new(ObservedServerStream {
                inner,
                observer: Arc::clone(&observer),
            });
            next(stream)
        })
    }
}

struct ObservedClientStream<O> {
    inner: Box<dyn ClientStream>,
    observer: Arc<O>,
}

#[async_trait]
impl<O: CallObserver> ClientStream for ObservedClientStream<O> {
    fn info(&self) -> &CallInfo {
        self.inner.info()
    }

    async fn send(&self, message: Bytes) -> Result<()> {
        self.observer.before_send(self.info(), &message);
        let result = self.inner.send(message).await;
        self.observer.after_send(self.info(), &result);
        result
    }

    async fn receive(&self) -> Result<Option<Bytes>> {
        self.observer.before_receive(self.info());
        let result = self.inner.receive().await;
        self.observer.after_receive(self.info(), &result);
        result
    }

    async fn close_send(&self) -> Result<()> {
        self.inner.close_send().await
    }

    fn close(&self) {
        self.inner.close();
    }

    fn header(&self) -> Option<Metadata> {
        self.inner.header()
    }

    async fn await_header(&self) -> Result<Metadata> {
        self.inner.await_header().await
    }

    fn trailer(&self) -> Option<Metadata> {
        self.inner.trailer()
    }
}

struct ObservedServerStream<O> {
    inner: Arc<dyn ServerStream>,
    observer: Arc<O>,
}

#[async_trait]
impl<O: CallObserver> ServerStream for ObservedServerStream<O> {
    fn info(&self) -> &CallInfo {
        self.inner.info()
    }

    async fn receive(&self) -> Result<Option<Bytes>> {
        self.observer.before_receive(self.info());
        let result = self.inner.receive().await;
        self.observer.after_receive(self.info(), &result);
        result
    }

    async fn send(&self, message: Bytes) -> Result<()> {
        self.observer.before_send(self.info(), &message);
        let result = self.inner.send(message).await;
        self.observer.after_send(self.info(), &result);
        result
    }

    fn set_header(&self, metadata: Metadata) -> Result<()> {
        self.inner.set_header(metadata)
    }

    async fn send_header(&self, metadata: Metadata) -> Result<()> {
        self.inner.send_header(metadata).await
    }

    fn set_trailer(&self, metadata: Metadata) -> Result<()> {
        self.inner.set_trailer(metadata)
    }
}

/// Logs every observed operation at debug level.
#[derive(Clone, Copy, Debug)]
pub struct LoggingObserver {
    side: &'static str,
}

impl LoggingObserver {
    /// Observer for client calls.
    #[must_use]
    pub const fn client() -> Self {
        Self { side: "client" }
    }

    /// Observer for server calls.
    #[must_use]
    pub const fn server() -> Self {
        Self { side: "server" }
    }
}

impl CallObserver for LoggingObserver {
    fn on_open(&self, info: &CallInfo) {
        debug!(
            side = self.side,
            stream_id = %info.id(),
            method = info.method(),
            shape = %info.shape(),
            "Stream opened"
        );
    }

    fn before_send(&self, info: &CallInfo, message: &Bytes) {
        debug!(
            side = self.side,
            stream_id = %info.id(),
            method = info.method(),
            bytes = message.len(),
            "Sending message"
        );
    }

    fn after_send(&self, info: &CallInfo, result: &Result<()>) {
        match result {
            Ok(()) => debug!(side = self.side, stream_id = %info.id(), "Message sent"),
            Err(error) => debug!(side = self.side, stream_id = %info.id(), %error, "Send failed"),
        }
    }

    fn before_receive(&self, info: &CallInfo) {
        debug!(
            side = self.side,
            stream_id = %info.id(),
            method = info.method(),
            "Receiving message"
        );
    }

    fn after_receive(&self, info: &CallInfo, result: &Result<Option<Bytes>>) {
        match result {
            Ok(Some(message)) => debug!(
                side = self.side,
                stream_id = %info.id(),
                method = info.method(),
                bytes = message.len(),
                "Received message"
            ),
            Ok(None) => debug!(side = self.side, stream_id = %info.id(), "End of stream"),
            Err(error) => {
                debug!(side = self.side, stream_id = %info.id(), %error, "Receive failed");
            }
        }
    }

    fn before_unary(&self, info: &CallInfo, request: &Bytes) {
        debug!(
            side = self.side,
            stream_id = %info.id(),
            method = info.method(),
            bytes = request.len(),
            "Unary call started"
        );
    }

    fn after_unary(&self, info: &CallInfo, result: std::result::Result<&Bytes, &Error>) {
        match result {
            Ok(response) => debug!(
                side = self.side,
                stream_id = %info.id(),
                bytes = response.len(),
                "Unary call finished"
            ),
            Err(error) => {
                debug!(side = self.side, stream_id = %info.id(), %error, "Unary call failed");
            }
        }
    }
}
