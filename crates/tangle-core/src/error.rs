//! Error types for the mesh network core

use thiserror::Error;

/// Main error type for mesh network operations
#[derive(Error, Debug)]
pub enum NetError {
    /// An instance type or flavor was the reserved Unrecognized sentinel
    #[error("Invalid instance identity: {0}")]
    InvalidInstance(String),

    /// The session identity handshake did not complete
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// No server relay is present in the topology graph
    #[error("No server relay available")]
    NoRelay,

    /// A reply did not arrive within the configured timeout
    #[error("Timed out waiting for response")]
    Timeout,

    /// The underlying transport link was closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// No connection exists to the given session id
    #[error("No connection to instance {0}")]
    ConnectionNotFound(i32),

    /// A peer rejected a request
    #[error("Request rejected by peer: {0}")]
    Rejected(String),

    /// Programming error: an operation was invoked in a state that forbids it
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A state-tree path did not resolve to a node
    #[error("State path not found: {0}")]
    NotFound(String),

    /// Error during wire serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error reported by the transport collaborator
    #[error("Transport error: {0}")]
    Transport(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<postcard::Error> for NetError {
    fn from(err: postcard::Error) -> Self {
        NetError::Serialization(err.to_string())
    }
}

/// Result type alias using NetError
pub type NetResult<T> = Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", NetError::NoRelay), "No server relay available");
        assert_eq!(
            format!("{}", NetError::ConnectionNotFound(42)),
            "No connection to instance 42"
        );
    }

    #[test]
    fn test_error_from_postcard() {
        let err: NetError = postcard::Error::DeserializeUnexpectedEnd.into();
        assert!(matches!(err, NetError::Serialization(_)));
    }
}
