//! Errors returned by connection operations.

use thiserror::Error;

use crate::transport::TransportError;

/// A boxed error, for collaborators which report arbitrary failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors from driving a connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection could not be established, or was never established.
    #[error("connect: {0}")]
    Connect(#[source] TransportError),

    /// The request head or body could not be sent.
    #[error("send: {0}")]
    Send(#[source] TransportError),

    /// Ownership of the connection could not be handed over.
    #[error("transfer: {0}")]
    Transfer(#[source] TransportError),

    /// No response activity within the receive timeout.
    #[error("timeout")]
    Timeout,

    /// The response could not be received.
    #[error("protocol: {0}")]
    Protocol(#[source] TransportError),

    /// The connection is closed.
    #[error("connection closed")]
    Closed,
}

impl Error {
    /// Classify a failure reported while receiving a response.
    pub(crate) fn receive(error: TransportError) -> Self {
        match error {
            TransportError::Timeout => Error::Timeout,
            error => Error::Protocol(error),
        }
    }

    /// The transport error behind this error, if any.
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            Error::Connect(error)
            | Error::Send(error)
            | Error::Transfer(error)
            | Error::Protocol(error) => Some(error),
            Error::Timeout | Error::Closed => None,
        }
    }
}
