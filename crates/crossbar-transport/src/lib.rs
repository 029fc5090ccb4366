//! # crossbar-transport
//!
//! Byte-framing channels that move one JSON [`Envelope`] per delivered unit.
//! A transport never interprets payloads; it only knows how to connect,
//! disconnect, send one envelope, and surface inbound frames plus open/close
//! transitions as [`TransportEvent`]s.
//!
//! Implementations:
//! - [`WebSocketClient`]: dials a URL over tokio-tungstenite
//! - [`ServerWebSocket`]: wraps an already-upgraded Axum socket
//! - [`LongPollClient`]: 1 Hz GET poll + POST send over reqwest
//! - [`LongPollServerTransport`]: queue-backed server side of the poll pair
//! - [`PairTransport`]: in-memory duplex endpoints for tests
//!
//! [`Envelope`]: crossbar_core::Envelope

#![deny(unsafe_code)]

pub mod error;
pub mod longpoll;
pub mod pair;
pub mod transport;
pub mod websocket;

pub use error::TransportError;
pub use longpoll::{LongPollClient, LongPollServerTransport};
pub use pair::PairTransport;
pub use transport::{Transport, TransportEvent, TransportKind};
pub use websocket::{ServerWebSocket, WebSocketClient};
