//! Error types shared across the synchronization engine layers.

use thiserror::Error;

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Error raised by channel transports regardless of the underlying protocol.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport could not reach the remote side.
    #[error("transport unavailable: {message}")]
    Unavailable {
        /// Human-readable description of the failure.
        message: String,
        /// Underlying cause reported by the transport implementation.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The channel was closed by the remote side or torn down locally.
    #[error("channel closed")]
    Closed,
}

impl TransportError {
    /// Construct an unavailable error from any transport failure.
    pub fn unavailable(
        message: String,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        TransportError::Unavailable {
            message,
            source: Box::new(source),
        }
    }
}
