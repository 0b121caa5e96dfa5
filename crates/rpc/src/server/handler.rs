//! Typed handlers and the adapters that turn them into byte-level services.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use uuid::Uuid;

use super::ServerStream;
use crate::call::CallInfo;
use crate::codec::Message;
use crate::error::{Error, Result, Status};
use crate::interceptor::{StreamService, UnaryService};
use crate::metadata::Metadata;

/// Handler result: a value or the status sent to the client.
pub type HandlerResult<T> = std::result::Result<T, Status>;

/// Per-call handle given to handlers: request metadata, response metadata and cancellation.
#[derive(Clone)]
pub struct Context {
    stream: Arc<dyn ServerStream>,
}

impl Context {
    pub(crate) fn new(stream: Arc<dyn ServerStream>) -> Self {
        Self { stream }
    }

    /// Call description.
    #[must_use]
    pub fn info(&self) -> &CallInfo {
        self.stream.info()
    }

    /// Request metadata sent by the client.
    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        self.stream.info().metadata()
    }

    /// Method being served.
    #[must_use]
    pub fn method(&self) -> &str {
        self.stream.info().method()
    }

    /// Stream id, as seen by the client.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.stream.info().id()
    }

    /// Set the header sent with the first response.
    ///
    /// # Errors
    ///
    /// Returns `MetadataAlreadySet` if a header was already set or sent.
    pub fn set_header(&self, metadata: Metadata) -> Result<()> {
        self.stream.set_header(metadata)
    }

    /// Send the header immediately.
    ///
    /// # Errors
    ///
    /// Returns `MetadataAlreadySet` if the header was already sent, or the send failure.
    pub async fn send_header(&self, metadata: Metadata) -> Result<()> {
        self.stream.send_header(metadata).await
    }

    /// Set the trailer sent when the call finishes.
    ///
    /// # Errors
    ///
    /// Returns `MetadataAlreadySet` if a trailer was already set.
    pub fn set_trailer(&self, metadata: Metadata) -> Result<()> {
        self.stream.set_trailer(metadata)
    }

    /// Whether the client abandoned the call.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.stream.info().cancellation().is_cancelled()
    }

    /// Resolve once the client abandons the call.
    pub async fn cancelled(&self) -> Error {
        self.stream.info().cancellation().cancelled().await
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("info", self.info()).finish()
    }
}

/// Incoming typed requests of a streaming call.
pub struct Requests<T> {
    stream: Arc<dyn ServerStream>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Message> Requests<T> {
    fn new(stream: Arc<dyn ServerStream>) -> Self {
        Self {
            stream,
            _marker: PhantomData,
        }
    }

    /// Next request, `None` once the client closed its send direction.
    ///
    /// # Errors
    ///
    /// Returns the stream failure, or `Error::Codec` if the request does not decode.
    pub async fn message(&mut self) -> Result<Option<T>> {
        match self.stream.receive().await? {
            Some(bytes) => T::decode(bytes).map(Some),
            None => Ok(None),
        }
    }
}

/// Outgoing typed responses of a streaming call.
pub struct Responses<T> {
    stream: Arc<dyn ServerStream>,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for Responses<T> {
    fn clone(&self) -> Self {
        Self {
            stream: Arc::clone(&self.stream),
            _marker: PhantomData,
        }
    }
}

impl<T: Message> Responses<T> {
    fn new(stream: Arc<dyn ServerStream>) -> Self {
        Self {
            stream,
            _marker: PhantomData,
        }
    }

    /// Send one response.
    ///
    /// # Errors
    ///
    /// Returns the encoding or stream failure.
    pub async fn send(&self, message: T) -> Result<()> {
        self.stream.send(message.encode()?).await
    }
}

/// One request, one response.
#[async_trait]
pub trait UnaryHandler<Req, Resp>: Send + Sync + 'static {
    /// Serve one call.
    async fn call(&self, ctx: Context, request: Req) -> HandlerResult<Resp>;
}

/// One request, a stream of responses.
#[async_trait]
pub trait ServerStreamingHandler<Req, Resp>: Send + Sync + 'static {
    /// Serve one call.
    async fn call(&self, ctx: Context, request: Req, responses: Responses<Resp>) -> HandlerResult<()>;
}

/// A stream of requests, one response.
#[async_trait]
pub trait ClientStreamingHandler<Req, Resp>: Send + Sync + 'static {
    /// Serve one call.
    async fn call(&self, ctx: Context, requests: Requests<Req>) -> HandlerResult<Resp>;
}

/// Independent streams of requests and responses.
#[async_trait]
pub trait BidiStreamingHandler<Req, Resp>: Send + Sync + 'static {
    /// Serve one call.
    async fn call(
        &self,
        ctx: Context,
        requests: Requests<Req>,
        responses: Responses<Resp>,
    ) -> HandlerResult<()>;
}

#[async_trait]
impl<F, Fut, Req, Resp> UnaryHandler<Req, Resp> for F
where
    F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<Resp>> + Send + 'static,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn call(&self, ctx: Context, request: Req) -> HandlerResult<Resp> {
        self(ctx, request).await
    }
}

#[async_trait]
impl<F, Fut, Req, Resp> ServerStreamingHandler<Req, Resp> for F
where
    F: Fn(Context, Req, Responses<Resp>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    Req: Send + 'static,
    Resp: 'static,
{
    async fn call(&self, ctx: Context, request: Req, responses: Responses<Resp>) -> HandlerResult<()> {
        self(ctx, request, responses).await
    }
}

#[async_trait]
impl<F, Fut, Req, Resp> ClientStreamingHandler<Req, Resp> for F
where
    F: Fn(Context, Requests<Req>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<Resp>> + Send + 'static,
    Req: 'static,
    Resp: Send + 'static,
{
    async fn call(&self, ctx: Context, requests: Requests<Req>) -> HandlerResult<Resp> {
        self(ctx, requests).await
    }
}

#[async_trait]
impl<F, Fut, Req, Resp> BidiStreamingHandler<Req, Resp> for F
where
    F: Fn(Context, Requests<Req>, Responses<Resp>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    Req: 'static,
    Resp: 'static,
{
    async fn call(
        &self,
        ctx: Context,
        requests: Requests<Req>,
        responses: Responses<Resp>,
    ) -> HandlerResult<()> {
        self(ctx, requests, responses).await
    }
}

/// Read the only request of a single-request call.
pub(crate) async fn single_request(stream: &dyn ServerStream) -> HandlerResult<Bytes> {
    let request = stream
        .receive()
        .await?
        .ok_or_else(|| Status::invalid_argument("missing request"))?;
    if stream.receive().await?.is_some() {
        return Err(Status::invalid_argument("expected a single request"));
    }
    Ok(request)
}

pub(crate) fn unary_service<H, Req, Resp>(handler: H) -> UnaryService
where
    H: UnaryHandler<Req, Resp>,
    Req: Message,
    Resp: Message,
{
    let handler = Arc::new(handler);
    Arc::new(move |stream: Arc<dyn ServerStream>, request: Bytes| {
        let handler = Arc::clone(&handler);
        async move {
            let request = Req::decode(request)?;
            let response = handler.call(Context::new(stream), request).await?;
            Ok::<_, Status>(response.encode()?)
        }
        .boxed()
    })
}

pub(crate) fn server_streaming_service<H, Req, Resp>(handler: H) -> StreamService
where
    H: ServerStreamingHandler<Req, Resp>,
    Req: Message,
    Resp: Message,
{
    let handler = Arc::new(handler);
    Arc::new(move |stream: Arc<dyn ServerStream>| {
        let handler = Arc::clone(&handler);
        async move {
            let request = Req::decode(single_request(stream.as_ref()).await?)?;
            let ctx = Context::new(Arc::clone(&stream));
            handler.call(ctx, request, Responses::new(stream)).await
        }
        .boxed()
    })
}

pub(crate) fn client_streaming_service<H, Req, Resp>(handler: H) -> StreamService
where
    H: ClientStreamingHandler<Req, Resp>,
    Req: Message,
    Resp: Message,
{
    let handler = Arc::new(handler);
    Arc::new(move |stream: Arc<dyn ServerStream>| {
        let handler = Arc::clone(&handler);
        async move {
            let ctx = Context::new(Arc::clone(&stream));
            let response = handler.call(ctx, Requests::new(Arc::clone(&stream))).await?;
            stream.send(response.encode()?).await?;
            Ok::<_, Status>(())
        }
        .boxed()
    })
}

pub(crate) fn bidi_streaming_service<H, Req, Resp>(handler: H) -> StreamService
where
    H: BidiStreamingHandler<Req, Resp>,
    Req: Message,
    Resp: Message,
{
    let handler = Arc::new(handler);
    Arc::new(move |stream: Arc<dyn ServerStream>| {
        let handler = Arc::clone(&handler);
        async move {
            let ctx = Context::new(Arc::clone(&stream));
            let requests = Requests::new(Arc::clone(&stream));
            handler.call(ctx, requests, Responses::new(stream)).await
        }
        .boxed()
    })
}
