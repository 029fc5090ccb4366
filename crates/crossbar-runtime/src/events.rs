//! Connection event hooks.
//!
//! The engine reports protocol events through a [`ConnectionEvents`]
//! implementation passed in by value at construction. The router implements
//! this trait with a weak back-reference, which is what breaks the
//! router ↔ connection cycle.

use std::collections::HashMap;

use async_trait::async_trait;
use crossbar_core::{status, MsgId, Verb};
use serde_json::Value;
use thiserror::Error;

use crate::connection::Connection;

/// An inbound application request targeting a route.
#[derive(Clone, Debug)]
pub struct RouteMessage {
    /// Request verb.
    pub verb: Verb,
    /// Concrete route path.
    pub route: String,
    /// Request payload.
    pub data: Value,
    /// Per-request headers.
    pub headers: HashMap<String, String>,
}

/// A route-level failure surfaced to the requester through the `res` path.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct RouteFailure {
    /// Wire status to report.
    pub status: u16,
    /// Error text sent as the response data.
    pub message: String,
}

impl RouteFailure {
    /// An application error (status 400).
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: status::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// A failure with an explicit wire status.
    #[must_use]
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Outcome of handling a routed request.
pub type RouteResult = Result<Value, RouteFailure>;

/// Hooks the engine fires as the protocol advances.
///
/// All methods default to no-ops. `on_route_message` runs in its own task so
/// a slow handler never stalls the inbound pump; returning `None` makes the
/// engine reply with a plain 200 `"OK"`.
#[async_trait]
pub trait ConnectionEvents: Send + Sync {
    /// The transport reported open (first connect or reconnect).
    async fn on_open(&self, _conn: &Connection) {}

    /// The connection is logically gone (explicit close, pong silence, or a
    /// server-side grace window that elapsed).
    async fn on_close(&self, _conn: &Connection) {}

    /// The peer installed a header entry via `set`.
    async fn on_data_set(&self, _conn: &Connection, _key: &str, _value: &Value) {}

    /// A routed request arrived; `id` is the inbound envelope id.
    async fn on_route_message(
        &self,
        _sender: Connection,
        _id: MsgId,
        _message: RouteMessage,
    ) -> Option<RouteResult> {
        None
    }

    /// The peer subscribed to a route via `on`.
    async fn on_subscribe(&self, _conn: &Connection, _route: &str) {}

    /// The peer unsubscribed from a route via `off`.
    async fn on_unsubscribe(&self, _conn: &Connection, _route: &str) {}
}

/// Hook set that ignores everything; the default for plain clients.
pub struct NoopEvents;

#[async_trait]
impl ConnectionEvents for NoopEvents {}
