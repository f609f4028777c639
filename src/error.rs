//! Error types for the chat client.
//!
//! Only transport-level failures and a stream that closes without a terminal
//! event are surfaced to the user. Malformed `data:` lines and section parse
//! failures are recovered locally (skipped or kept raw) and never reach this
//! type.

use thiserror::Error;

/// Errors surfaced by [`ChatClient`](crate::client::ChatClient) and the
/// exchange controller.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The HTTP request could not be performed (connection failure,
    /// missing body on a stream response, client build failure).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream returned a non-2xx status.
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The initiating request returned a JSON envelope the client cannot
    /// use (no stream, no task id, no direct answer).
    #[error("Invalid response envelope: {0}")]
    Envelope(String),

    /// Upstream reported an error event in the stream.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The connection ended without a terminal event.
    #[error("stream closed unexpectedly")]
    StreamClosed,
}

impl ChatError {
    /// Whether this error came from the upstream service rather than the
    /// local transport.
    pub fn is_upstream(&self) -> bool {
        matches!(self, ChatError::Server { .. } | ChatError::Upstream(_))
    }
}
