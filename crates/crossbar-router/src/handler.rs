//! Route handler and broadcast validator traits.

use std::collections::HashMap;

use async_trait::async_trait;
use crossbar_core::Verb;
use crossbar_runtime::{Connection, RouteFailure};
use serde_json::Value;

/// A routed request as a handler sees it.
#[derive(Clone, Debug)]
pub struct RouteRequest {
    /// Captures from the route pattern, keyed by parameter name.
    pub params: HashMap<String, String>,
    /// Request payload.
    pub data: Value,
    /// Per-request headers.
    pub headers: HashMap<String, String>,
    /// The concrete path that was requested.
    pub route: String,
    /// Request verb.
    pub verb: Verb,
    /// The connection the request came in on.
    pub sender: Connection,
}

impl RouteRequest {
    /// A named capture from the route pattern.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// Handles requests for one (pattern, verb) registration.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    /// Produce the response payload, or a failure that becomes the error
    /// reply.
    async fn handle(&self, request: RouteRequest) -> Result<Value, RouteFailure>;
}

/// Decides, per recipient, whether a broadcast may be delivered.
#[async_trait]
pub trait BroadcastValidator: Send + Sync {
    /// `true` allows delivery of the broadcast to `conn`.
    async fn validate(&self, conn: &Connection, params: &HashMap<String, String>) -> bool;
}

/// A validator that lets every broadcast through.
pub struct AllowAll;

#[async_trait]
impl BroadcastValidator for AllowAll {
    async fn validate(&self, _conn: &Connection, _params: &HashMap<String, String>) -> bool {
        true
    }
}
