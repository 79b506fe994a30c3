use std::time::Duration;
use thiserror::Error;

/// Categorizes errors for caller decision-making.
///
/// A lightweight, copyable view of [`Error`] that UI code can match on
/// without caring about the underlying transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol error
    WebSocket,
    /// Opening the connection failed (refused, DNS, TLS, handshake)
    ConnectionFailed,
    /// Opening the connection did not finish in time
    Timeout,
    /// Endpoint name or URL was unusable
    InvalidEndpoint,
    /// Manager has been shut down
    ShuttingDown,
    /// Envelope could not be encoded or decoded
    Serialization,
}

/// Errors that can occur in verihome-realtime
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Opening an endpoint failed before the socket reported open
    #[error("Connection to '{endpoint}' failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// Opening an endpoint did not complete within the connect timeout
    #[error("Connection to '{endpoint}' timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    /// Endpoint name could not be turned into a URL
    #[error("Invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// Manager is shutting down
    #[error("Connection manager is shut down")]
    ShuttingDown,

    /// Envelope encoding/decoding error
    #[error("Envelope serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Error::ConnectTimeout { .. } => ErrorKind::Timeout,
            Error::InvalidEndpoint { .. } => ErrorKind::InvalidEndpoint,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::Serialization(_) => ErrorKind::Serialization,
        }
    }

    pub(crate) fn connection_failed(endpoint: &str, reason: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }
}
