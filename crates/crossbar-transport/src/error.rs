//! Transport error type.

use thiserror::Error;

/// A problem in a transport operation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport is not currently connected.
    ///
    /// The engine treats this as transient: id-bearing envelopes go to the
    /// reconnect queue, send-and-forget envelopes are dropped.
    #[error("transport is not connected")]
    NotConnected,

    /// The transport shut down underneath the caller.
    #[error("transport is closed")]
    Closed,

    /// The transport's event stream was already claimed.
    ///
    /// Each transport hands out its receiver once; attaching the same
    /// instance to a second connection is a wiring bug.
    #[error("transport event stream already claimed")]
    EventsClaimed,

    /// WebSocket-level failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// HTTP-level failure (long-poll).
    #[error("http error: {0}")]
    Http(String),

    /// The envelope could not be encoded as JSON.
    #[error("failed to encode envelope")]
    Encode(#[from] serde_json::Error),
}

impl TransportError {
    /// Whether the engine should treat the failure as a transient
    /// disconnection rather than a hard fault.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Closed)
    }
}
