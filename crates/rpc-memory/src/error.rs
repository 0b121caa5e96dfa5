use proven_rpc::TransportError;
use thiserror::Error;

/// Errors of the memory transport.
#[derive(Debug, Error)]
pub enum Error {
    /// Another listener owns the endpoint.
    #[error("Endpoint {0} already has a listener")]
    AlreadyListening(String),

    /// The connection was closed locally.
    #[error("Connection closed")]
    Closed,

    /// The endpoint is not of the form `host:port`.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Nothing listens on the endpoint.
    #[error("No listener for endpoint {0}")]
    NoListener(String),
}

impl From<Error> for TransportError {
    fn from(error: Error) -> Self {
        match error {
            Error::AlreadyListening(_) => Self::Other(error.to_string()),
            Error::Closed => Self::ConnectionClosed,
            Error::InvalidEndpoint(endpoint) => Self::InvalidAddress(endpoint),
            Error::NoListener(_) => Self::ConnectionFailed(error.to_string()),
        }
    }
}
