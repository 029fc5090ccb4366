//! The per-peer protocol engine.
//!
//! A [`Connection`] is created detached, gains a transport via
//! [`set_transport`](Connection::set_transport), and runs until a terminal
//! close. The client variant generates its reconnect secret at construction
//! and can be rebound to a fresh transport without losing buffered sends.
//!
//! Locking: all protocol state sits behind one short-lived `parking_lot`
//! mutex that is never held across an await; the transport handle sits
//! behind an async `RwLock` so it can be swapped mid-life.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use crossbar_core::secret::SECRET_HEADER_KEY;
use crossbar_core::{
    pattern, status, ConnectionSecret, Envelope, Message, MsgId, ProtocolConfig, RouteReply,
    Tracked, Verb,
};
use crossbar_transport::{Transport, TransportError, TransportEvent, TransportKind};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConnectionError;
use crate::events::{ConnectionEvents, RouteMessage};
use crate::reply::ReplyHandle;

/// One outstanding unacknowledged envelope.
#[derive(Clone, Debug)]
pub struct SentEntry {
    /// The envelope as it went out (retries reuse it verbatim).
    pub envelope: Envelope,
    /// When it was last handed to the transport.
    pub sent_at: Instant,
    /// How many times it has been handed to the transport.
    pub sent_amount: u32,
}

/// Cached response body for an inbound envelope, replayed on duplicates.
#[derive(Clone, Debug)]
struct ResBody {
    status: u16,
    data: Value,
}

struct State {
    next_msg_id: i64,
    messages_to_ack: Vec<SentEntry>,
    received: Vec<(Envelope, Tracked<ResBody>)>,
    reconnect_queue: VecDeque<Envelope>,
    callbacks: HashMap<MsgId, oneshot::Sender<RouteReply>>,
    sent_in_window: u32,
    headers: HashMap<String, Value>,
    closed: bool,
    grace: Option<CancellationToken>,
}

struct Inner {
    config: ProtocolConfig,
    is_client: bool,
    events: Arc<dyn ConnectionEvents>,
    state: Mutex<State>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    tasks: Mutex<Option<CancellationToken>>,
}

/// A handle to one logical peer connection. Cloning shares the engine.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("is_client", &self.inner.is_client)
            .field("secret", &self.secret())
            .finish()
    }
}

impl Connection {
    fn new(config: ProtocolConfig, events: Arc<dyn ConnectionEvents>, is_client: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                is_client,
                events,
                state: Mutex::new(State {
                    next_msg_id: 0,
                    messages_to_ack: Vec::new(),
                    received: Vec::new(),
                    reconnect_queue: VecDeque::new(),
                    callbacks: HashMap::new(),
                    sent_in_window: 0,
                    headers: HashMap::new(),
                    closed: false,
                    grace: None,
                }),
                transport: RwLock::new(None),
                tasks: Mutex::new(None),
            }),
        }
    }

    /// A server-side connection; its identity arrives via the peer's `set
    /// secret` handshake.
    #[must_use]
    pub fn server(config: ProtocolConfig, events: Arc<dyn ConnectionEvents>) -> Self {
        Self::new(config, events, false)
    }

    /// A client-side connection with a freshly generated reconnect secret.
    #[must_use]
    pub fn client(config: ProtocolConfig, events: Arc<dyn ConnectionEvents>) -> Self {
        let conn = Self::new(config, events, true);
        let secret = ConnectionSecret::generate();
        conn.inner.state.lock().headers.insert(
            SECRET_HEADER_KEY.to_owned(),
            Value::String(secret.as_str().to_owned()),
        );
        conn
    }

    /// The connection secret, once known (client: always; server: after the
    /// `set secret` handshake landed).
    #[must_use]
    pub fn secret(&self) -> Option<ConnectionSecret> {
        let state = self.inner.state.lock();
        state
            .headers
            .get(SECRET_HEADER_KEY)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ConnectionSecret::from_hex)
    }

    /// A header value installed by the peer.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<Value> {
        self.inner.state.lock().headers.get(key).cloned()
    }

    /// Whether this is the client side of the link.
    #[must_use]
    pub fn is_client(&self) -> bool {
        self.inner.is_client
    }

    /// Whether the connection has been explicitly or terminally closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Whether the current transport is open.
    pub async fn is_connected(&self) -> bool {
        let transport = self.inner.transport.read().await;
        transport.as_ref().is_some_and(|t| t.is_connected())
    }

    /// Which kind of transport is currently attached.
    pub async fn transport_kind(&self) -> Option<TransportKind> {
        let transport = self.inner.transport.read().await;
        transport.as_ref().map(|t| t.kind())
    }

    /// Outstanding unacknowledged envelopes.
    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.inner.state.lock().messages_to_ack.len()
    }

    /// How many times the envelope with `id` has been handed to the
    /// transport, if it is still awaiting acknowledgement.
    #[must_use]
    pub fn sent_amount(&self, id: MsgId) -> Option<u32> {
        self.inner
            .state
            .lock()
            .messages_to_ack
            .iter()
            .find(|entry| entry.envelope.id == id)
            .map(|entry| entry.sent_amount)
    }

    /// Envelopes buffered for the next transport.
    #[must_use]
    pub fn queued_for_reconnect(&self) -> usize {
        self.inner.state.lock().reconnect_queue.len()
    }

    // ── Public send surface ─────────────────────────────────────────

    /// Allocate an id, register the completion handle, and send (or buffer)
    /// the envelope.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::ResNotPostable`] when `msg` is a `res` body.
    pub async fn post(&self, msg: Message) -> Result<ReplyHandle, ConnectionError> {
        if matches!(msg, Message::Res { .. }) {
            return Err(ConnectionError::ResNotPostable);
        }
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner.state.lock().callbacks.insert(id, tx);
        self.dispatch_envelope(Envelope::new(id, msg)).await;
        Ok(ReplyHandle::new(id, rx))
    }

    /// Send a tracked request to a route, subject to the advisory rate
    /// limit.
    ///
    /// When the per-window budget is exceeded the returned handle resolves
    /// immediately with a 429 reply — but the send still proceeds.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::InvalidRoute`] when the route fails validation.
    pub async fn send_to_route(
        &self,
        route: &str,
        verb: Verb,
        data: Value,
        headers: Option<HashMap<String, String>>,
    ) -> Result<ReplyHandle, ConnectionError> {
        pattern::validate_client_route(route).map_err(|source| ConnectionError::InvalidRoute {
            route: route.to_owned(),
            source,
        })?;

        let limited = {
            let mut state = self.inner.state.lock();
            state.sent_in_window += 1;
            state.sent_in_window > self.inner.config.rate_limit_max
        };

        let id = self.next_id();
        let msg = Message::Route {
            verb,
            route: route.to_owned(),
            data,
            headers,
        };
        let handle = if limited {
            warn!(route, "rate limit exceeded; notifying caller, sending anyway");
            ReplyHandle::settled(
                id,
                RouteReply::err(format!(
                    "Rate limit of {} messages per second exceeded",
                    self.inner.config.rate_limit_max
                )),
            )
        } else {
            let (tx, rx) = oneshot::channel();
            self.inner.state.lock().callbacks.insert(id, tx);
            ReplyHandle::new(id, rx)
        };

        self.dispatch_envelope(Envelope::new(id, msg)).await;
        Ok(handle)
    }

    /// Send an untracked request to a route. Dropped if disconnected, never
    /// retried, never deduplicated by the peer.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::InvalidRoute`] when the route fails validation.
    pub async fn send_to_route_and_forget(
        &self,
        route: &str,
        verb: Verb,
        data: Value,
        headers: Option<HashMap<String, String>>,
    ) -> Result<(), ConnectionError> {
        pattern::validate_client_route(route).map_err(|source| ConnectionError::InvalidRoute {
            route: route.to_owned(),
            source,
        })?;
        let msg = Message::Route {
            verb,
            route: route.to_owned(),
            data,
            headers,
        };
        self.dispatch_envelope(Envelope::forget(msg)).await;
        Ok(())
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Install a transport (closing any previous one), wire its events, and
    /// connect. Buffered envelopes are flushed FIFO once the transport
    /// reports open.
    ///
    /// # Errors
    ///
    /// Connect failures from the new transport; the transport stays
    /// installed, so a later [`connect`](Connection::connect) can retry.
    pub async fn set_transport(
        &self,
        transport: Arc<dyn Transport>,
    ) -> Result<(), TransportError> {
        if let Some(token) = self.inner.tasks.lock().take() {
            token.cancel();
        }
        let old = self.inner.transport.write().await.take();
        if let Some(old) = old {
            old.disconnect().await;
        }
        {
            let mut state = self.inner.state.lock();
            state.closed = false;
            if let Some(grace) = state.grace.take() {
                grace.cancel();
            }
        }

        let Some(events) = transport.take_events() else {
            return Err(TransportError::EventsClaimed);
        };
        *self.inner.transport.write().await = Some(transport.clone());

        let token = CancellationToken::new();
        *self.inner.tasks.lock() = Some(token.clone());
        self.spawn_event_pump(events, token.clone());
        self.spawn_retry_timer(token.clone());
        self.spawn_rate_reset(token.clone());
        self.spawn_ping_loop(token);

        transport.connect().await
    }

    /// Re-open the current transport after a [`close`](Connection::close).
    ///
    /// # Errors
    ///
    /// [`TransportError::NotConnected`] when no transport is attached, or
    /// the transport's own connect failure.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.inner.state.lock().closed = false;
        let transport = self.inner.transport.read().await.clone();
        let transport = transport.ok_or(TransportError::NotConnected)?;
        transport.connect().await
    }

    /// Close the connection: cancel the grace timer, drop all completion
    /// handles and the dedup log, and disconnect the transport.
    pub async fn close(&self) {
        info!(client = self.inner.is_client, "closing connection");
        let grace = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.callbacks.clear();
            state.received.clear();
            state.grace.take()
        };
        if let Some(grace) = grace {
            grace.cancel();
        }
        let transport = self.inner.transport.read().await.clone();
        if let Some(transport) = transport {
            transport.disconnect().await;
        }
    }

    // ── Send path ───────────────────────────────────────────────────

    fn next_id(&self) -> MsgId {
        let mut state = self.inner.state.lock();
        let id = state.next_msg_id;
        state.next_msg_id += 1;
        MsgId::new(id)
    }

    async fn dispatch_envelope(&self, envelope: Envelope) {
        let transport = self.inner.transport.read().await.clone();
        let open = transport.as_ref().is_some_and(|t| t.is_connected());
        if !open {
            if envelope.id.is_forget() {
                debug!(
                    kind = envelope.msg.kind(),
                    "dropping send-and-forget while disconnected"
                );
            } else {
                debug!(id = %envelope.id, "buffering envelope for reconnect");
                self.inner.state.lock().reconnect_queue.push_back(envelope);
            }
            return;
        }
        let Some(transport) = transport else { return };
        match transport.send(&envelope).await {
            Ok(()) => {
                if envelope.requires_response() {
                    self.upsert_ack(envelope);
                }
            }
            Err(e) => {
                debug!(error = %e, id = %envelope.id, "send failed, treating as transient");
                if !envelope.id.is_forget() {
                    self.inner.state.lock().reconnect_queue.push_back(envelope);
                }
            }
        }
    }

    fn upsert_ack(&self, envelope: Envelope) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state
            .messages_to_ack
            .iter_mut()
            .find(|entry| entry.envelope.id == envelope.id)
        {
            entry.sent_amount += 1;
            entry.sent_at = Instant::now();
        } else {
            state.messages_to_ack.push(SentEntry {
                envelope,
                sent_at: Instant::now(),
                sent_amount: 1,
            });
        }
    }

    // ── Event pump ──────────────────────────────────────────────────

    fn spawn_event_pump(
        &self,
        mut events: mpsc::Receiver<TransportEvent>,
        token: CancellationToken,
    ) {
        let conn = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(TransportEvent::Opened) => conn.handle_open().await,
                        Some(TransportEvent::Frame(envelope)) => conn.handle_frame(envelope).await,
                        Some(TransportEvent::Closed) => conn.handle_closed().await,
                        None => break,
                    },
                }
            }
        });
    }

    async fn handle_open(&self) {
        debug!(client = self.inner.is_client, "transport open");
        let grace = self.inner.state.lock().grace.take();
        if let Some(grace) = grace {
            grace.cancel();
        }

        // identity first: the peer must know who this is before any
        // buffered traffic lands
        if self.inner.is_client {
            if let Some(secret) = self.secret() {
                let _ = self
                    .post(Message::Set {
                        key: SECRET_HEADER_KEY.to_owned(),
                        value: Value::String(secret.as_str().to_owned()),
                    })
                    .await;
            }
        }

        // drain once: a failed dispatch re-queues at the back, so iterating
        // the live queue would never terminate on a flapping transport
        let queued: Vec<Envelope> = {
            let mut state = self.inner.state.lock();
            state.reconnect_queue.drain(..).collect()
        };
        for envelope in queued {
            self.dispatch_envelope(envelope).await;
        }

        self.inner.events.on_open(self).await;
    }

    async fn handle_closed(&self) {
        let explicit = self.inner.state.lock().closed;
        debug!(client = self.inner.is_client, explicit, "transport closed");
        if self.inner.is_client {
            self.inner.events.on_close(self).await;
            if !explicit {
                self.spawn_reconnect();
            }
        } else if explicit {
            self.inner.events.on_close(self).await;
        } else {
            self.start_close_grace();
        }
    }

    fn spawn_reconnect(&self) {
        let Some(token) = self.inner.tasks.lock().clone() else {
            return;
        };
        let conn = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(conn.inner.config.reconnect_delay()) => {}
                }
                if conn.inner.state.lock().closed {
                    return;
                }
                let transport = conn.inner.transport.read().await.clone();
                let Some(transport) = transport else { return };
                match transport.connect().await {
                    Ok(()) => return,
                    Err(e) => debug!(error = %e, "reconnect attempt failed"),
                }
            }
        });
    }

    fn start_close_grace(&self) {
        let grace = CancellationToken::new();
        {
            let mut state = self.inner.state.lock();
            if let Some(old) = state.grace.take() {
                old.cancel();
            }
            state.grace = Some(grace.clone());
        }
        let conn = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = grace.cancelled() => {}
                () = tokio::time::sleep(conn.inner.config.close_grace()) => {
                    info!("close grace elapsed without re-open");
                    conn.inner.state.lock().closed = true;
                    conn.inner.events.on_close(&conn).await;
                }
            }
        });
    }

    // ── Inbound dispatch ────────────────────────────────────────────

    async fn handle_frame(&self, envelope: Envelope) {
        debug!(id = %envelope.id, kind = envelope.msg.kind(), "inbound envelope");
        let needs_response = envelope.requires_response();

        if needs_response {
            // Some(None): duplicate, handler still running
            // Some(Some(body)): duplicate, response cached
            // None: first delivery (entry inserted pending)
            let duplicate: Option<Option<ResBody>> = {
                let mut state = self.inner.state.lock();
                match state
                    .received
                    .iter()
                    .find(|(seen, _)| seen.id == envelope.id)
                {
                    Some((_, outcome)) => Some(outcome.get()),
                    None => {
                        state.received.push((envelope.clone(), Tracked::pending()));
                        None
                    }
                }
            };
            match duplicate {
                Some(None) => {
                    debug!(id = %envelope.id, "duplicate delivery while pending");
                    self.respond(
                        envelope.id,
                        status::PROCESSING,
                        json!("Message is being processed"),
                    )
                    .await;
                    return;
                }
                Some(Some(cached)) => {
                    debug!(id = %envelope.id, "duplicate delivery, replaying cached response");
                    self.respond(envelope.id, cached.status, cached.data).await;
                    return;
                }
                None => {}
            }
        }

        match envelope.msg.clone() {
            Message::Set { key, value } => {
                self.inner
                    .state
                    .lock()
                    .headers
                    .insert(key.clone(), value.clone());
                self.inner.events.on_data_set(self, &key, &value).await;
                self.finish(envelope.id, needs_response, status::OK, json!([key, value]))
                    .await;
            }
            Message::Ping => {
                self.finish(envelope.id, needs_response, status::OK, json!("pong"))
                    .await;
            }
            Message::On { route } => {
                self.inner.events.on_subscribe(self, &route).await;
                self.finish(envelope.id, needs_response, status::OK, json!("OK"))
                    .await;
            }
            Message::Off { route } => {
                self.inner.events.on_unsubscribe(self, &route).await;
                self.finish(envelope.id, needs_response, status::OK, json!("OK"))
                    .await;
            }
            Message::Res {
                target,
                status: code,
                data,
            } => {
                self.handle_ack(target, code, data);
            }
            Message::Route {
                verb,
                route,
                data,
                headers,
            } => {
                // run the handler off the pump so a slow one cannot stall
                // inbound processing (duplicate deliveries must still be
                // answered while it runs)
                let conn = self.clone();
                let id = envelope.id;
                tokio::spawn(async move {
                    let events = conn.inner.events.clone();
                    let sender = conn.clone();
                    let message = RouteMessage {
                        verb,
                        route,
                        data,
                        headers: headers.unwrap_or_default(),
                    };
                    let outcome = tokio::spawn(async move {
                        events.on_route_message(sender, id, message).await
                    })
                    .await;
                    let (code, data) = match outcome {
                        Ok(None) => (status::OK, json!("OK")),
                        Ok(Some(Ok(value))) => (status::OK, value),
                        Ok(Some(Err(failure))) => (failure.status, json!(failure.message)),
                        Err(e) => {
                            warn!(error = %e, "route handler failed");
                            (status::INTERNAL_ERROR, json!("Error handling message"))
                        }
                    };
                    conn.finish(id, needs_response, code, data).await;
                });
            }
            Message::Unknown => {
                warn!(id = %envelope.id, "unrecognized message body");
                self.finish(
                    envelope.id,
                    needs_response,
                    status::INTERNAL_ERROR,
                    json!("Error handling message"),
                )
                .await;
            }
        }
    }

    /// Settle the dedup entry and send the response for an inbound envelope.
    async fn finish(&self, target: MsgId, needs_response: bool, code: u16, data: Value) {
        if !needs_response {
            return;
        }
        {
            let state = self.inner.state.lock();
            if let Some((_, outcome)) = state.received.iter().find(|(seen, _)| seen.id == target) {
                outcome.settle(ResBody {
                    status: code,
                    data: data.clone(),
                });
            }
        }
        self.respond(target, code, data).await;
    }

    /// Responses always leave as send-and-forget: acknowledging an
    /// acknowledgement would recurse.
    async fn respond(&self, target: MsgId, code: u16, data: Value) {
        self.dispatch_envelope(Envelope::forget(Message::Res {
            target,
            status: code,
            data,
        }))
        .await;
    }

    fn handle_ack(&self, target: MsgId, code: u16, data: Value) {
        if !status::is_terminal(code) {
            // the peer acknowledged receipt but is still processing
            debug!(%target, "peer still processing");
            return;
        }
        let reply = RouteReply::from_res(code, data);
        let callback = {
            let mut state = self.inner.state.lock();
            state
                .messages_to_ack
                .retain(|entry| entry.envelope.id != target);
            state.callbacks.remove(&target)
        };
        if let Some(callback) = callback {
            let _ = callback.send(reply);
        }
    }

    // ── Timers ──────────────────────────────────────────────────────

    fn spawn_retry_timer(&self, token: CancellationToken) {
        let conn = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(conn.inner.config.retry_tick());
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let open = {
                    let transport = conn.inner.transport.read().await;
                    transport.as_ref().is_some_and(|t| t.is_connected())
                };
                if !open {
                    continue;
                }
                let deadline = conn.inner.config.ack_timeout();
                let stale: Vec<Envelope> = {
                    let state = conn.inner.state.lock();
                    state
                        .messages_to_ack
                        .iter()
                        .filter(|entry| entry.sent_at.elapsed() > deadline)
                        .map(|entry| entry.envelope.clone())
                        .collect()
                };
                for envelope in stale {
                    debug!(id = %envelope.id, "resending unacknowledged envelope");
                    conn.dispatch_envelope(envelope).await;
                }
            }
        });
    }

    fn spawn_rate_reset(&self, token: CancellationToken) {
        let conn = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(conn.inner.config.rate_window());
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = tick.tick() => {}
                }
                conn.inner.state.lock().sent_in_window = 0;
            }
        });
    }

    fn spawn_ping_loop(&self, token: CancellationToken) {
        let conn = self.clone();
        tokio::spawn(async move {
            loop {
                if token.is_cancelled() {
                    break;
                }
                let open = {
                    let transport = conn.inner.transport.read().await;
                    transport.as_ref().is_some_and(|t| t.is_connected())
                };
                if !open {
                    tokio::select! {
                        () = token.cancelled() => break,
                        () = tokio::time::sleep(conn.inner.config.disconnected_backoff()) => {}
                    }
                    continue;
                }
                let Ok(mut handle) = conn.post(Message::Ping).await else {
                    break;
                };
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(conn.inner.config.ping_timeout()) => {}
                }
                let alive = matches!(handle.try_reply(), Some(reply) if !reply.is_err());
                if !alive {
                    warn!("no pong within timeout, closing connection");
                    conn.close().await;
                }
            }
        });
    }
}
