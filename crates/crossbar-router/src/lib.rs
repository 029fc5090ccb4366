//! # crossbar-router
//!
//! The multi-connection router. Demultiplexes inbound route messages to
//! handlers by path + verb, keeps per-route subscription lists, fans out
//! broadcasts through per-recipient validators, and preserves connection
//! identity across transport reconnects via the connection secret.
//!
//! The router holds no transport of its own — it composes over
//! [`Connection`](crossbar_runtime::Connection) engines only. The Axum
//! endpoints that feed it live in [`serve`].

#![deny(unsafe_code)]

pub mod handler;
pub mod layer;
pub mod router;
pub mod serve;

pub use handler::{AllowAll, BroadcastValidator, RouteHandler, RouteRequest};
pub use router::Router;
