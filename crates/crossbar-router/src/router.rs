//! The multi-connection router.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use crossbar_core::secret::SECRET_HEADER_KEY;
use crossbar_core::{
    status, ConnectionSecret, MsgId, PatternError, ProtocolConfig, RoutePattern, Verb,
};
use crossbar_runtime::{Connection, ConnectionEvents, RouteFailure, RouteMessage, RouteResult};
use crossbar_transport::{Transport, TransportError};
use metrics::counter;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::handler::{BroadcastValidator, RouteHandler};
use crate::layer::{InboundLayer, Listener, OutboundLayer};

type ClientConnectHook = Box<dyn Fn(&Connection) + Send + Sync>;

pub(crate) struct RouterInner {
    config: ProtocolConfig,
    /// Connection directory, keyed by secret.
    connections: RwLock<HashMap<String, Connection>>,
    inbound: RwLock<Vec<InboundLayer>>,
    outbound: RwLock<Vec<OutboundLayer>>,
    next_layer_id: AtomicU64,
    client_connect_hooks: parking_lot::RwLock<Vec<ClientConnectHook>>,
}

/// Routes inbound requests, keeps subscription lists, and fans out
/// broadcasts. Cloning shares the router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new(ProtocolConfig::default())
    }
}

impl Router {
    /// Create a router whose connections use `config`.
    #[must_use]
    pub fn new(config: ProtocolConfig) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                config,
                connections: RwLock::new(HashMap::new()),
                inbound: RwLock::new(Vec::new()),
                outbound: RwLock::new(Vec::new()),
                next_layer_id: AtomicU64::new(0),
                client_connect_hooks: parking_lot::RwLock::new(Vec::new()),
            }),
        }
    }

    // ── Sockets & directory ─────────────────────────────────────────

    /// Attach a freshly opened transport.
    ///
    /// When `reconnect_secret` names a directory entry the existing
    /// connection is rebound to the new transport (reconnect); otherwise a
    /// new server connection is created, which registers itself in the
    /// directory once the peer's `set secret` handshake lands.
    ///
    /// # Errors
    ///
    /// Transport wiring or connect failures.
    pub async fn add_socket(
        &self,
        transport: Arc<dyn Transport>,
        reconnect_secret: Option<ConnectionSecret>,
    ) -> Result<Connection, TransportError> {
        if let Some(secret) = &reconnect_secret {
            let existing = self
                .inner
                .connections
                .read()
                .await
                .get(secret.as_str())
                .cloned();
            if let Some(existing) = existing {
                info!(secret = ?secret, "rebinding reconnecting client");
                existing.set_transport(transport).await?;
                return Ok(existing);
            }
        }

        let events = Arc::new(RouterEvents {
            router: Arc::downgrade(&self.inner),
        });
        let conn = Connection::server(self.inner.config.clone(), events);
        conn.set_transport(transport).await?;
        Ok(conn)
    }

    /// Run `hook` every time a new client registers its secret.
    pub fn on_client_connect(&self, hook: impl Fn(&Connection) + Send + Sync + 'static) {
        self.inner.client_connect_hooks.write().push(Box::new(hook));
    }

    /// Look up a connection by secret.
    pub async fn connection(&self, secret: &ConnectionSecret) -> Option<Connection> {
        self.inner
            .connections
            .read()
            .await
            .get(secret.as_str())
            .cloned()
    }

    /// Number of identified connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    // ── Inbound registration ────────────────────────────────────────

    /// Register a GET handler for a route pattern.
    ///
    /// # Errors
    ///
    /// [`PatternError`] when the pattern does not compile.
    pub async fn on_get(
        &self,
        pattern: &str,
        handler: impl RouteHandler + 'static,
    ) -> Result<(), PatternError> {
        self.register(pattern, Verb::Get, Arc::new(handler)).await
    }

    /// Register a POST handler for a route pattern.
    ///
    /// # Errors
    ///
    /// [`PatternError`] when the pattern does not compile.
    pub async fn on_post(
        &self,
        pattern: &str,
        handler: impl RouteHandler + 'static,
    ) -> Result<(), PatternError> {
        self.register(pattern, Verb::Post, Arc::new(handler)).await
    }

    /// Register a DELETE handler for a route pattern.
    ///
    /// # Errors
    ///
    /// [`PatternError`] when the pattern does not compile.
    pub async fn on_delete(
        &self,
        pattern: &str,
        handler: impl RouteHandler + 'static,
    ) -> Result<(), PatternError> {
        self.register(pattern, Verb::Delete, Arc::new(handler))
            .await
    }

    async fn register(
        &self,
        pattern: &str,
        verb: Verb,
        handler: Arc<dyn RouteHandler>,
    ) -> Result<(), PatternError> {
        let mut layers = self.inner.inbound.write().await;
        if let Some(layer) = layers.iter_mut().find(|l| l.pattern.raw() == pattern) {
            debug!(pattern, %verb, layer = layer.id, "replacing handler on existing layer");
            layer.set_handler(verb, handler);
            return Ok(());
        }
        let compiled = RoutePattern::compile(pattern)?;
        let id = self.inner.next_layer_id.fetch_add(1, Ordering::Relaxed);
        debug!(pattern, %verb, layer = id, "registering inbound layer");
        let mut layer = InboundLayer::new(id, compiled);
        layer.set_handler(verb, handler);
        layers.push(layer);
        Ok(())
    }

    // ── Outbound registration & subscriptions ───────────────────────

    /// Declare a broadcastable route with a per-recipient validator.
    ///
    /// # Errors
    ///
    /// [`PatternError`] when the pattern does not compile.
    pub async fn on_validate_broadcast(
        &self,
        pattern: &str,
        validator: impl BroadcastValidator + 'static,
    ) -> Result<(), PatternError> {
        let compiled = RoutePattern::compile(pattern)?;
        let id = self.inner.next_layer_id.fetch_add(1, Ordering::Relaxed);
        debug!(pattern, layer = id, "registering outbound layer");
        self.inner
            .outbound
            .write()
            .await
            .push(OutboundLayer::new(id, compiled, Arc::new(validator)));
        Ok(())
    }

    /// Subscribe a connection (by secret) to every outbound layer matching
    /// `path`. The wire-level handler behind the peer's `on` message.
    pub async fn subscribe_connection_to_route(&self, path: &str, secret: &ConnectionSecret) {
        self.inner.subscribe(path, secret).await;
    }

    /// Remove a connection's subscription to `path`. The wire-level handler
    /// behind the peer's `off` message.
    pub async fn unsubscribe_connection_from_route(&self, path: &str, secret: &ConnectionSecret) {
        self.inner.unsubscribe(path, secret).await;
    }

    /// Listeners currently subscribed to paths matching `path`.
    pub async fn subscriber_count(&self, path: &str) -> usize {
        let layers = self.inner.outbound.read().await;
        layers
            .iter()
            .filter_map(|layer| {
                let matched = layer.pattern.match_path(path)?;
                Some(
                    layer
                        .listeners
                        .iter()
                        .filter(|l| l.values == matched.values)
                        .count(),
                )
            })
            .sum()
    }

    // ── Broadcasts ──────────────────────────────────────────────────

    /// Broadcast a POST to every validated subscriber of `path`.
    pub async fn broadcast_post(&self, path: &str, payload: Value, except: Option<&Connection>) {
        self.inner
            .broadcast(path, Verb::Post, payload, except)
            .await;
    }

    /// Broadcast a deletion to every validated subscriber of `path`.
    pub async fn broadcast_deletion(
        &self,
        path: &str,
        payload: Value,
        except: Option<&Connection>,
    ) {
        self.inner
            .broadcast(path, Verb::Delete, payload, except)
            .await;
    }

    /// Broadcast a generic update to every validated subscriber of `path`.
    pub async fn broadcast_update(&self, path: &str, payload: Value, except: Option<&Connection>) {
        self.inner.broadcast(path, Verb::Any, payload, except).await;
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<RouterInner> {
        &self.inner
    }
}

impl RouterInner {
    pub(crate) async fn dispatch(&self, sender: Connection, message: RouteMessage) -> RouteResult {
        counter!("crossbar_route_messages_total", "verb" => message.verb.to_string()).increment(1);

        let (handler, params) = {
            let layers = self.inbound.read().await;
            let mut matched = None;
            // insertion order, first match wins
            for layer in layers.iter() {
                if let Some(m) = layer.pattern.match_path(&message.route) {
                    matched = Some((layer.handler_for(message.verb), m.params));
                    break;
                }
            }
            match matched {
                Some((Some(handler), params)) => (handler, params),
                Some((None, _)) => {
                    counter!("crossbar_route_errors_total", "kind" => "verb_mismatch")
                        .increment(1);
                    return Err(RouteFailure::new(format!(
                        "Route \"{}\" does not support verb \"{}\"",
                        message.route, message.verb
                    )));
                }
                None => {
                    counter!("crossbar_route_errors_total", "kind" => "not_found").increment(1);
                    return Err(RouteFailure::with_status(
                        status::NOT_FOUND,
                        format!("Route \"{}\" not found", message.route),
                    ));
                }
            }
        };

        let request = crate::handler::RouteRequest {
            params,
            data: message.data,
            headers: message.headers,
            route: message.route,
            verb: message.verb,
            sender,
        };
        handler.handle(request).await
    }

    async fn register_connection(&self, secret: ConnectionSecret, conn: Connection) {
        let fresh = {
            let mut directory = self.connections.write().await;
            directory
                .insert(secret.as_str().to_owned(), conn.clone())
                .is_none()
        };
        if fresh {
            info!(secret = ?secret, "client identified");
            counter!("crossbar_clients_connected_total").increment(1);
            for hook in self.client_connect_hooks.read().iter() {
                hook(&conn);
            }
        }
    }

    async fn remove_connection(&self, conn: &Connection) {
        let Some(secret) = conn.secret() else { return };
        info!(secret = ?secret, "removing connection");
        self.connections.write().await.remove(secret.as_str());
        let mut layers = self.outbound.write().await;
        for layer in layers.iter_mut() {
            layer.listeners.retain(|l| l.secret != secret);
        }
    }

    async fn subscribe(&self, path: &str, secret: &ConnectionSecret) {
        let mut layers = self.outbound.write().await;
        for layer in layers.iter_mut() {
            if let Some(matched) = layer.pattern.match_path(path) {
                debug!(path, layer = layer.id, secret = ?secret, "adding listener");
                layer.listeners.push(Listener {
                    secret: secret.clone(),
                    values: matched.values,
                });
            }
        }
    }

    async fn unsubscribe(&self, path: &str, secret: &ConnectionSecret) {
        let mut layers = self.outbound.write().await;
        for layer in layers.iter_mut() {
            if let Some(matched) = layer.pattern.match_path(path) {
                layer
                    .listeners
                    .retain(|l| !(l.secret == *secret && l.values == matched.values));
            }
        }
    }

    async fn broadcast(
        &self,
        path: &str,
        verb: Verb,
        payload: Value,
        except: Option<&Connection>,
    ) {
        counter!("crossbar_broadcasts_total", "verb" => verb.to_string()).increment(1);
        let except_secret = except.and_then(Connection::secret);

        // snapshot the matching layers so validators never run under the
        // layer lock
        type Matched = (
            Arc<dyn BroadcastValidator>,
            Vec<ConnectionSecret>,
            HashMap<String, String>,
        );
        let matched: Vec<Matched> = {
            let layers = self.outbound.read().await;
            layers
                .iter()
                .filter_map(|layer| {
                    let m = layer.pattern.match_path(path)?;
                    let recipients: Vec<ConnectionSecret> = layer
                        .listeners
                        .iter()
                        .filter(|l| l.values == m.values)
                        .map(|l| l.secret.clone())
                        .collect();
                    Some((layer.validator.clone(), recipients, m.params))
                })
                .collect()
        };
        if matched.is_empty() {
            return;
        }

        let directory = self.connections.read().await.clone();
        for (validator, recipients, params) in matched {
            for secret in recipients {
                if except_secret.as_ref() == Some(&secret) {
                    continue;
                }
                let Some(conn) = directory.get(secret.as_str()) else {
                    continue;
                };
                if validator.validate(conn, &params).await {
                    debug!(path, %verb, secret = ?secret, "delivering broadcast");
                    if let Err(e) = conn.send_to_route(path, verb, payload.clone(), None).await {
                        warn!(error = %e, path, "broadcast send failed");
                    }
                }
            }
        }
    }
}

/// The hook set a server connection is born with: every protocol event
/// lands back in the router through a weak reference, which breaks the
/// router ↔ connection cycle.
struct RouterEvents {
    router: Weak<RouterInner>,
}

#[async_trait]
impl ConnectionEvents for RouterEvents {
    async fn on_data_set(&self, conn: &Connection, key: &str, value: &Value) {
        if key != SECRET_HEADER_KEY {
            return;
        }
        let Some(router) = self.router.upgrade() else {
            return;
        };
        match value.as_str().filter(|s| !s.is_empty()) {
            Some(secret) => {
                router
                    .register_connection(ConnectionSecret::from_hex(secret), conn.clone())
                    .await;
            }
            None => warn!("peer sent an empty secret"),
        }
    }

    async fn on_route_message(
        &self,
        sender: Connection,
        _id: MsgId,
        message: RouteMessage,
    ) -> Option<RouteResult> {
        let router = self.router.upgrade()?;
        Some(router.dispatch(sender, message).await)
    }

    async fn on_subscribe(&self, conn: &Connection, route: &str) {
        let Some(router) = self.router.upgrade() else {
            return;
        };
        let Some(secret) = conn.secret() else {
            warn!(route, "subscribe from unidentified connection ignored");
            return;
        };
        router.subscribe(route, &secret).await;
    }

    async fn on_unsubscribe(&self, conn: &Connection, route: &str) {
        let Some(router) = self.router.upgrade() else {
            return;
        };
        let Some(secret) = conn.secret() else {
            return;
        };
        router.unsubscribe(route, &secret).await;
    }

    async fn on_close(&self, conn: &Connection) {
        if let Some(router) = self.router.upgrade() {
            router.remove_connection(conn).await;
        }
    }
}
