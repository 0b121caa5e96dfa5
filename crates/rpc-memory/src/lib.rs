//! In-memory transport for the RPC engine.
//!
//! Listeners register under a `host:port` endpoint in a process-wide registry and
//! connections open streams by handing the server end of a duplex to the
//! listener. Useful for tests and for wiring client and server in one process.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use proven_rpc::TransportError;
use proven_rpc::transport::{Duplex, IncomingStream, Listener, StreamHead, Transport};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone, Debug)]
struct Registration {
    id: Uuid,
    incoming: flume::Sender<IncomingStream>,
}

/// Global registry of listening endpoints
static GLOBAL_REGISTRY: once_cell::sync::Lazy<Arc<DashMap<String, Registration>>> =
    once_cell::sync::Lazy::new(|| Arc::new(DashMap::new()));

/// Configuration for memory transport
#[derive(Clone, Debug)]
pub struct MemoryOptions {
    /// Frames buffered per stream direction
    pub channel_capacity: usize,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 32,
        }
    }
}

/// Memory transport: creates listeners and connections on named endpoints
#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    options: MemoryOptions,
}

impl MemoryTransport {
    /// Create a new memory transport with options
    #[must_use]
    pub const fn new(options: MemoryOptions) -> Self {
        Self { options }
    }

    /// Create a new memory transport with default options
    #[must_use]
    pub fn new_default() -> Self {
        Self::new(MemoryOptions::default())
    }

    /// Clear all global state (useful for tests)
    pub fn clear_global_state() {
        GLOBAL_REGISTRY.clear();
    }

    /// Start listening on `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is malformed or already has a listener.
    pub fn listen(&self, endpoint: &str) -> Result<MemoryListener, Error> {
        validate_endpoint(endpoint)?;
        debug!("Creating memory listener for {}", endpoint);

        let (incoming, incoming_rx) = flume::unbounded();
        let registration = Registration {
            id: Uuid::new_v4(),
            incoming,
        };
        let id = registration.id;

        match GLOBAL_REGISTRY.entry(endpoint.to_string()) {
            Entry::Occupied(_) => {
                return Err(Error::AlreadyListening(endpoint.to_string()));
            }
            Entry::Vacant(entry) => {
                entry.insert(registration);
            }
        }

        info!("Memory listener created for {}", endpoint);

        Ok(MemoryListener {
            id,
            endpoint: endpoint.to_string(),
            incoming_rx,
            closed: RwLock::new(false),
        })
    }

    /// Connect to the listener on `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is malformed or nothing listens on it.
    pub fn connect(&self, endpoint: &str) -> Result<MemoryConnection, Error> {
        validate_endpoint(endpoint)?;
        if !GLOBAL_REGISTRY.contains_key(endpoint) {
            return Err(Error::NoListener(endpoint.to_string()));
        }

        info!("Memory connection established to {}", endpoint);

        Ok(MemoryConnection {
            id: Uuid::new_v4(),
            endpoint: endpoint.to_string(),
            options: self.options.clone(),
            closed: RwLock::new(false),
        })
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), Error> {
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(Error::InvalidEndpoint(endpoint.to_string())),
    }
}

/// Client side connection to a memory endpoint
pub struct MemoryConnection {
    id: Uuid,
    endpoint: String,
    options: MemoryOptions,
    closed: RwLock<bool>,
}

impl Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("closed", &self.closed)
            .finish()
    }
}

impl MemoryConnection {
    /// Refuse new streams. Streams already open are unaffected.
    pub async fn close(&self) {
        debug!("Closing memory connection {}", self.id);
        *self.closed.write().await = true;
    }
}

#[async_trait]
impl Transport for MemoryConnection {
    async fn open_stream(&self, head: StreamHead) -> Result<Duplex, TransportError> {
        if *self.closed.read().await {
            return Err(Error::Closed.into());
        }

        // Clone the sender out so no registry guard is held across the await.
        let incoming = GLOBAL_REGISTRY
            .get(&self.endpoint)
            .map(|registration| registration.incoming.clone())
            .ok_or_else(|| Error::NoListener(self.endpoint.clone()))?;

        let stream_id = head.id;
        let (client, server) = Duplex::pair(self.options.channel_capacity);
        incoming
            .send_async(IncomingStream {
                head,
                duplex: server,
            })
            .await
            .map_err(|_| Error::NoListener(self.endpoint.clone()))?;

        debug!(
            "Memory connection {} opened stream {} to {}",
            self.id, stream_id, self.endpoint
        );

        Ok(client)
    }
}

/// Server side listener on a memory endpoint
pub struct MemoryListener {
    id: Uuid,
    endpoint: String,
    incoming_rx: flume::Receiver<IncomingStream>,
    closed: RwLock<bool>,
}

impl Debug for MemoryListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryListener")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.closed)
            .finish()
    }
}

impl MemoryListener {
    /// Endpoint this listener is registered under
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stop accepting. Streams queued but not yet accepted are refused.
    pub async fn close(&self) {
        debug!("Closing memory listener for {}", self.endpoint);
        *self.closed.write().await = true;
        self.unregister();
    }

    fn unregister(&self) {
        GLOBAL_REGISTRY.remove_if(&self.endpoint, |_, registration| registration.id == self.id);
        // Dropping the server end lets the client see the connection close.
        for incoming in self.incoming_rx.drain() {
            debug!(
                "Memory listener on {} refused stream {}",
                self.endpoint, incoming.head.id
            );
        }
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<IncomingStream, TransportError> {
        if *self.closed.read().await {
            return Err(TransportError::ConnectionClosed);
        }

        match self.incoming_rx.recv_async().await {
            Ok(incoming) => {
                debug!(
                    "Memory listener on {} accepted stream {} for {}",
                    self.endpoint, incoming.head.id, incoming.head.method
                );
                Ok(incoming)
            }
            Err(_) => Err(TransportError::ConnectionClosed),
        }
    }
}
