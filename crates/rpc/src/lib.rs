//! Bidirectional RPC streaming engine.
//!
//! One logical stream carries every call shape: unary, server-streaming,
//! client-streaming and bidirectional calls are restrictions of the same
//! state machine. The crate provides:
//! - Stream channels with independent send and receive directions
//! - Coordinators driving each call shape on the client and the server
//! - Header and trailer metadata exchanged out of band
//! - Interceptor chains observing every call, send and receive
//!
//! Transports are pluggable through [`Transport`] and [`Listener`]; see
//! `proven-rpc-memory` for an in-process implementation.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod call;
mod codec;
mod error;
mod inbound;
mod metadata;

/// Client side: streams and call drivers.
pub mod client;

/// Interceptors and observers.
pub mod interceptor;

/// Server side: handler registration and dispatch.
pub mod server;

/// Transport abstraction.
pub mod transport;

pub use call::{CallInfo, CallOptions, Cancellation, Response, StreamShape};
pub use client::{BidiSummary, Client, ClientBuilder, ClientConfig, ClientStream, Streaming};
pub use codec::Message;
pub use error::{Code, Direction, Error, MetadataKind, Result, Status, TransportError};
pub use interceptor::{
    CallObserver, ClientInterceptor, LoggingObserver, ObserverInterceptor, ServerInterceptor,
};
pub use metadata::{Metadata, MetadataCell};
pub use server::{Context, Requests, Responses, Server, ServerBuilder, ServerConfig, ServerStream};
pub use transport::{Listener, Transport};
