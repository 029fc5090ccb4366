//! # crossbar-runtime
//!
//! The per-peer protocol engine. A [`Connection`] owns one transport at a
//! time and runs the full message state machine over it:
//!
//! - monotonic id allocation and the send-and-forget path
//! - retry of unacknowledged envelopes on a fixed scan tick
//! - inbound deduplication with "still processing" and cached-response replay
//! - advisory rate limiting of route sends
//! - protocol-level ping/pong liveness
//! - client reconnect and server close-grace handling
//! - mid-life transport swap with FIFO drain of the reconnect buffer
//!
//! Application integration happens through the [`ConnectionEvents`] hook
//! trait; the router crate implements it.

#![deny(unsafe_code)]

pub mod connection;
pub mod error;
pub mod events;
pub mod reply;

pub use connection::{Connection, SentEntry};
pub use error::ConnectionError;
pub use events::{ConnectionEvents, NoopEvents, RouteFailure, RouteMessage, RouteResult};
pub use reply::ReplyHandle;
