//! Server side of the engine: handler registration and per-stream dispatch.

mod handler;
mod stream;

pub use handler::{
    BidiStreamingHandler, ClientStreamingHandler, Context, HandlerResult, Requests, Responses,
    ServerStreamingHandler, UnaryHandler,
};
pub use stream::{ServerStream, TransportServerStream};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::call::{CallInfo, Cancellation, StreamShape};
use crate::codec::Message;
use crate::error::{Result, Status, TransportError};
use crate::interceptor::{
    CallObserver, ObserverInterceptor, ServerInterceptor, StreamService, UnaryService,
    server_stream_chain, server_unary_chain,
};
use crate::transport::{IncomingStream, Listener};

/// Configuration for the server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Streams served at once. Further streams fail with `RESOURCE_EXHAUSTED`.
    pub max_concurrent_streams: usize,
    /// Buffered inbound messages per stream.
    pub inbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 100,
            inbound_capacity: 32,
        }
    }
}

#[derive(Clone)]
enum Route {
    Unary(UnaryService),
    Stream {
        shape: StreamShape,
        service: StreamService,
    },
}

impl Route {
    const fn shape(&self) -> StreamShape {
        match self {
            Self::Unary(_) => StreamShape::Unary,
            Self::Stream { shape, .. } => *shape,
        }
    }
}

/// Builder for [`Server`].
#[derive(Default)]
pub struct ServerBuilder {
    routes: HashMap<String, Route>,
    interceptors: Vec<Arc<dyn ServerInterceptor>>,
    config: ServerConfig,
}

impl ServerBuilder {
    /// Register a unary handler for `method`.
    #[must_use]
    pub fn unary<Req, Resp, H>(mut self, method: impl Into<String>, handler: H) -> Self
    where
        Req: Message,
        Resp: Message,
        H: UnaryHandler<Req, Resp>,
    {
        let service = handler::unary_service(handler);
        self.routes.insert(method.into(), Route::Unary(service));
        self
    }

    /// Register a server-streaming handler for `method`.
    #[must_use]
    pub fn server_streaming<Req, Resp, H>(mut self, method: impl Into<String>, handler: H) -> Self
    where
        Req: Message,
        Resp: Message,
        H: ServerStreamingHandler<Req, Resp>,
    {
        let service = handler::server_streaming_service(handler);
        self.insert_stream(method.into(), StreamShape::ServerStreaming, service);
        self
    }

    /// Register a client-streaming handler for `method`.
    #[must_use]
    pub fn client_streaming<Req, Resp, H>(mut self, method: impl Into<String>, handler: H) -> Self
    where
        Req: Message,
        Resp: Message,
        H: ClientStreamingHandler<Req, Resp>,
    {
        let service = handler::client_streaming_service(handler);
        self.insert_stream(method.into(), StreamShape::ClientStreaming, service);
        self
    }

    /// Register a bidirectional streaming handler for `method`.
    #[must_use]
    pub fn bidi_streaming<Req, Resp, H>(mut self, method: impl Into<String>, handler: H) -> Self
    where
        Req: Message,
        Resp: Message,
        H: BidiStreamingHandler<Req, Resp>,
    {
        let service = handler::bidi_streaming_service(handler);
        self.insert_stream(method.into(), StreamShape::Bidirectional, service);
        self
    }

    /// Add an interceptor. The first one added is outermost.
    #[must_use]
    pub fn interceptor(mut self, interceptor: impl ServerInterceptor) -> Self {
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
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the server, wrapping every handler in the interceptor chain.
    #[must_use]
    pub fn build(self) -> Server {
        let interceptors = self.interceptors;
        let routes = self
            .routes
            .into_iter()
            .map(|(method, route)| {
                let route = match route {
                    Route::Unary(service) => {
                        Route::Unary(server_unary_chain(&interceptors, service))
                    }
                    Route::Stream { shape, service } => Route::Stream {
                        shape,
                        service: server_stream_chain(&interceptors, service),
                    },
                };
                (method, route)
            })
            .collect();

        Server {
            inner: Arc::new(Inner {
                routes,
                config: self.config,
            }),
        }
    }

    fn insert_stream(&mut self, method: String, shape: StreamShape, service: StreamService) {
        self.routes.insert(method, Route::Stream { shape, service });
    }
}

struct Inner {
    routes: HashMap<String, Route>,
    config: ServerConfig,
}

/// Serves registered handlers on streams accepted from a [`Listener`].
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// Start building a server.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Serve until the listener closes.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting fails for a reason other than the listener closing.
    pub async fn serve<L: Listener>(&self, listener: L) -> Result<()> {
        self.serve_with_shutdown(listener, CancellationToken::new())
            .await
    }

    /// Serve until the listener closes or `shutdown` is cancelled.
    ///
    /// Stops accepting and drops the listener first, then waits for in-flight
    /// streams to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting fails for a reason other than the listener closing.
    #[instrument(skip_all)]
    pub async fn serve_with_shutdown<L: Listener>(
        &self,
        listener: L,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let tracker = TaskTracker::new();
        let permits = Arc::new(Semaphore::new(self.inner.config.max_concurrent_streams));
        info!(
            routes = self.inner.routes.len(),
            "Server accepting streams"
        );

        let result = loop {
            let accepted = tokio::select! {
                biased;
                () = shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(incoming) => {
                    let permit = Arc::clone(&permits).try_acquire_owned().ok();
                    let inner = Arc::clone(&self.inner);
                    tracker.spawn(async move { inner.handle(incoming, permit).await });
                }
                Err(TransportError::ConnectionClosed) => break Ok(()),
                Err(error) => {
                    warn!(%error, "Accept failed");
                    break Err(error.into());
                }
            }
        };

        // Refuse new streams while the in-flight ones drain.
        drop(listener);
        tracker.close();
        debug!(in_flight = tracker.len(), "Waiting for streams to finish");
        tracker.wait().await;
        info!("Server stopped");
        result
    }
}

impl Inner {
    async fn handle(&self, incoming: IncomingStream, permit: Option<OwnedSemaphorePermit>) {
        let IncomingStream { head, duplex } = incoming;
        let info = CallInfo::from_head(head, Cancellation::default());
        debug!(
            stream_id = %info.id(),
            method = info.method(),
            shape = %info.shape(),
            "Accepted stream"
        );

        let stream = Arc::new(TransportServerStream::new(
            info,
            duplex,
            self.config.inbound_capacity,
        ));
        let result = match permit {
            Some(_permit) => self.dispatch(Arc::clone(&stream)).await,
            None => Err(Status::resource_exhausted("too many concurrent streams")),
        };
        stream.finish(result).await;
    }

    async fn dispatch(&self, stream: Arc<TransportServerStream>) -> std::result::Result<(), Status> {
        let method = stream.info().method();
        let Some(route) = self.routes.get(method) else {
            return Err(Status::not_found(format!("unknown method {method}")));
        };

        let shape = stream.info().shape();
        if route.shape() != shape {
            return Err(Status::unimplemented(format!(
                "{method} is {}, not {shape}",
                route.shape()
            )));
        }

        match route {
            Route::Unary(service) => {
                let request = handler::single_request(stream.as_ref()).await?;
                let response = service(Arc::clone(&stream) as Arc<dyn ServerStream>, request).await?;
                stream.send(response).await?;
                Ok(())
            }
            Route::Stream { service, .. } => service(stream as Arc<dyn ServerStream>).await,
        }
    }
}
