//! The transport capability set.

use std::fmt;

use async_trait::async_trait;
use crossbar_core::Envelope;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Buffered events per transport before backpressure kicks in.
pub(crate) const EVENT_BUFFER: usize = 256;

/// Classification of a transport implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Persistent full-duplex framed socket.
    WebSocket,
    /// HTTP long-poll.
    LongPoll,
    /// In-memory pair, used by tests.
    Pair,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::LongPoll => "longpoll",
            TransportKind::Pair => "pair",
        };
        f.write_str(s)
    }
}

/// Something that happened on a transport.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// The transport became ready to carry frames.
    Opened,
    /// One inbound envelope arrived.
    Frame(Envelope),
    /// The transport stopped carrying frames.
    Closed,
}

/// A duplex channel moving one framed [`Envelope`] per delivered unit.
///
/// Open/close transitions and inbound frames are surfaced through an event
/// receiver claimed once via [`take_events`](Transport::take_events) — the
/// connection engine owns the pump that drains it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the transport; resolves once it is ready to carry frames.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the transport.
    async fn disconnect(&self);

    /// Send one envelope. Fails with a transient error while closed.
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Whether the transport is currently open.
    fn is_connected(&self) -> bool;

    /// Which kind of transport this is.
    fn kind(&self) -> TransportKind;

    /// Claim the event stream. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;
}
