//! Errors surfaced by connections and the pool.

use thiserror::Error;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
///
/// Every variant is recoverable from the caller's point of view: operations
/// report failure, they never abort the process.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while connecting, reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// RESP2 framing or parse error.
    #[error("protocol error")]
    Protocol,
    /// Store returned an error reply.
    #[error("server error: {}", String::from_utf8_lossy(.message))]
    Server { message: Vec<u8> },
    /// Reply type did not match the shape the command expects.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// Store answered nil where a value was required.
    #[error("no such key or field")]
    Missing,
    /// No live session; the call was not sent.
    #[error("not connected")]
    NotConnected,
    /// Credential rejected during connect.
    #[error("authentication failed: {message}")]
    Auth { message: String },
    /// Host and port could not be resolved into a socket address.
    #[error("invalid address")]
    InvalidAddress,
    /// The previous subscription on this channel has not finished closing.
    #[error("subscription is still closing")]
    SubscriptionClosing,
    /// Dispatcher has been shut down and no longer accepts work.
    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

impl ClientError {
    /// Builds a `Server` error from an error reply payload.
    pub(crate) fn server(message: Vec<u8>) -> Self {
        ClientError::Server { message }
    }

    /// Returns true when the error poisons the session.
    ///
    /// After an IO or framing failure the byte stream position is unknown,
    /// so the session must be dropped rather than reused.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::Io(_) | ClientError::Protocol)
    }
}
