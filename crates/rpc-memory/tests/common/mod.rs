//! Greeter service shared by the integration tests.
#![allow(dead_code)]

use bytes::Bytes;
use proven_rpc::server::HandlerResult;
use proven_rpc::{Client, Context, Metadata, Requests, Responses, Server, ServerBuilder, Status};
use proven_rpc_memory::{MemoryConnection, MemoryTransport};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

pub const HELLO: &str = "greeter.Greeter/Hello";
pub const HELLO_SERVER_STREAM: &str = "greeter.Greeter/HelloServerStream";
pub const HELLO_CLIENT_STREAM: &str = "greeter.Greeter/HelloClientStream";
pub const HELLO_BI_STREAMS: &str = "greeter.Greeter/HelloBiStreams";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub name: String,
    /// Responses wanted from the server-streaming method.
    pub count: u32,
}

impl HelloRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: 5,
        }
    }

    pub fn with_count(name: impl Into<String>, count: u32) -> Self {
        Self {
            name: name.into(),
            count,
        }
    }
}

impl TryFrom<HelloRequest> for Bytes {
    type Error = bincode::Error;

    fn try_from(value: HelloRequest) -> Result<Self, Self::Error> {
        bincode::serialize(&value).map(Bytes::from)
    }
}

impl TryFrom<Bytes> for HelloRequest {
    type Error = bincode::Error;

    fn try_from(value: Bytes) -> Result<Self, Self::Error> {
        bincode::deserialize(&value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloResponse {
    pub message: String,
}

impl HelloResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl TryFrom<HelloResponse> for Bytes {
    type Error = bincode::Error;

    fn try_from(value: HelloResponse) -> Result<Self, Self::Error> {
        bincode::serialize(&value).map(Bytes::from)
    }
}

impl TryFrom<Bytes> for HelloResponse {
    type Error = bincode::Error;

    fn try_from(value: Bytes) -> Result<Self, Self::Error> {
        bincode::deserialize(&value)
    }
}

pub fn server_metadata(kind: &str, placement: &str) -> Metadata {
    Metadata::from([("type", kind), ("from", "server"), ("in", placement)])
}

pub fn client_metadata(kind: &str) -> Metadata {
    Metadata::from([("type", kind), ("from", "client")])
}

pub async fn hello(ctx: Context, request: HelloRequest) -> HandlerResult<HelloResponse> {
    ctx.set_header(server_metadata("unary", "header"))?;
    ctx.set_trailer(server_metadata("unary", "trailer"))?;
    if request.name.is_empty() {
        return Err(Status::invalid_argument("name must not be empty"));
    }
    Ok(HelloResponse::new(format!("hello {}", request.name)))
}

pub async fn hello_server_stream(
    ctx: Context,
    request: HelloRequest,
    responses: Responses<HelloResponse>,
) -> HandlerResult<()> {
    ctx.set_header(server_metadata("server-stream", "header"))?;
    ctx.set_trailer(server_metadata("server-stream", "trailer"))?;
    for i in 0..request.count {
        responses
            .send(HelloResponse::new(format!("[{i}] Hello, {}!", request.name)))
            .await?;
    }
    Ok(())
}

pub async fn hello_client_stream(
    ctx: Context,
    mut requests: Requests<HelloRequest>,
) -> HandlerResult<HelloResponse> {
    let mut names = Vec::new();
    while let Some(request) = requests.message().await? {
        names.push(request.name);
    }
    ctx.set_trailer(server_metadata("client-stream", "trailer"))?;
    Ok(HelloResponse::new(format!("Hello ,[{}]!", names.join(" "))))
}

pub async fn hello_bi_streams(
    ctx: Context,
    mut requests: Requests<HelloRequest>,
    responses: Responses<HelloResponse>,
) -> HandlerResult<()> {
    debug!(metadata = ?ctx.metadata(), "Incoming metadata");
    ctx.send_header(server_metadata("stream", "header")).await?;
    ctx.set_trailer(server_metadata("stream", "trailer"))?;
    while let Some(request) = requests.message().await? {
        responses
            .send(HelloResponse::new(format!("Hello, {}!", request.name)))
            .await?;
    }
    Ok(())
}

pub fn greeter() -> ServerBuilder {
    Server::builder()
        .unary(HELLO, hello)
        .server_streaming(HELLO_SERVER_STREAM, hello_server_stream)
        .client_streaming(HELLO_CLIENT_STREAM, hello_client_stream)
        .bidi_streaming(HELLO_BI_STREAMS, hello_bi_streams)
}

pub fn endpoint() -> String {
    format!("greeter-{}:50051", Uuid::new_v4())
}

/// A server running in the background.
pub struct ServerHandle {
    pub endpoint: String,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<proven_rpc::Result<()>>,
}

impl ServerHandle {
    pub fn connect(&self) -> MemoryConnection {
        connect(&self.endpoint)
    }

    pub async fn stop(self) -> proven_rpc::Result<()> {
        self.shutdown.cancel();
        self.task.await.expect("server task panicked")
    }
}

pub fn spawn_server(server: Server) -> ServerHandle {
    let _ = tracing_subscriber::fmt::try_init();

    let endpoint = endpoint();
    let listener = MemoryTransport::new_default()
        .listen(&endpoint)
        .expect("listen on fresh endpoint");
    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { server.serve_with_shutdown(listener, shutdown).await }
    });

    ServerHandle {
        endpoint,
        shutdown,
        task,
    }
}

pub fn connect(endpoint: &str) -> MemoryConnection {
    MemoryTransport::new_default()
        .connect(endpoint)
        .expect("connect to running server")
}

/// Greeter server plus a client connected to it.
pub fn start_greeter() -> (Client, ServerHandle) {
    let server = spawn_server(greeter().build());
    (Client::new(server.connect()), server)
}
