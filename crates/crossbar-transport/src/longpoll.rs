//! HTTP long-poll transports.
//!
//! The client marks itself connected immediately and runs a fixed-interval
//! GET loop against the endpoint; each successful response yields at most
//! one envelope. Sends are single-envelope POSTs to the same URL. Any poll
//! failure disconnects the transport.
//!
//! The server side is a queue: GETs drain one outbound envelope, POSTs
//! inject one inbound. The serving glue owns the session map keyed by
//! `connsecret`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crossbar_core::{ConnectionSecret, Envelope};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::transport::{Transport, TransportEvent, TransportKind, EVENT_BUFFER};

// ── Client ──────────────────────────────────────────────────────────

/// A polling client transport.
pub struct LongPollClient {
    url: String,
    secret: Option<ConnectionSecret>,
    http: reqwest::Client,
    poll_interval: Duration,
    connected: Arc<AtomicBool>,
    events_tx: mpsc::Sender<TransportEvent>,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    tasks: Mutex<Option<CancellationToken>>,
}

impl LongPollClient {
    /// Create a polling client for `url` ticking every `poll_interval`.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        secret: Option<ConnectionSecret>,
        poll_interval: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            url: url.into(),
            secret,
            http: reqwest::Client::new(),
            poll_interval,
            connected: Arc::new(AtomicBool::new(false)),
            events_tx,
            events: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(None),
        }
    }

    fn endpoint(&self) -> String {
        match &self.secret {
            Some(secret) => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}connsecret={}", self.url, sep, secret.as_str())
            }
            None => self.url.clone(),
        }
    }
}

#[async_trait]
impl Transport for LongPollClient {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.events_tx.send(TransportEvent::Opened).await;

        let token = CancellationToken::new();
        if let Some(old) = self.tasks.lock().replace(token.clone()) {
            old.cancel();
        }

        let url = self.endpoint();
        let http = self.http.clone();
        let connected = self.connected.clone();
        let events_tx = self.events_tx.clone();
        let mut tick = tokio::time::interval(self.poll_interval);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    _ = tick.tick() => {}
                }
                match http.get(&url).send().await {
                    Ok(response) if response.status().is_success() => {
                        if response.status() == reqwest::StatusCode::NO_CONTENT {
                            continue;
                        }
                        match response.text().await {
                            Ok(body) if !body.trim().is_empty() => {
                                match serde_json::from_str::<Envelope>(&body) {
                                    Ok(envelope) => {
                                        let _ =
                                            events_tx.send(TransportEvent::Frame(envelope)).await;
                                    }
                                    Err(e) => {
                                        warn!(error = %e, "dropping undecodable poll body");
                                    }
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(error = %e, "poll body read failed");
                                break;
                            }
                        }
                    }
                    Ok(response) => {
                        warn!(status = %response.status(), "poll failed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "poll request failed");
                        break;
                    }
                }
            }
            if connected.swap(false, Ordering::SeqCst) {
                let _ = events_tx.send(TransportEvent::Closed).await;
            }
        });

        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(token) = self.tasks.lock().take() {
            token.cancel();
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events_tx.send(TransportEvent::Closed).await;
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let response = self
            .http
            .post(self.endpoint())
            .json(envelope)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Http(format!(
                "send rejected with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::LongPoll
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.lock().take()
    }
}

// ── Server ──────────────────────────────────────────────────────────

/// The queue-backed server side of a long-poll session.
pub struct LongPollServerTransport {
    connected: AtomicBool,
    outbound: Mutex<VecDeque<Envelope>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl LongPollServerTransport {
    /// Create a session transport; it is born open.
    #[must_use]
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let _ = events_tx.try_send(TransportEvent::Opened);
        Self {
            connected: AtomicBool::new(true),
            outbound: Mutex::new(VecDeque::new()),
            events_tx,
            events: Mutex::new(Some(events_rx)),
        }
    }

    /// Inject one inbound envelope (the POST handler).
    pub async fn push_inbound(&self, envelope: Envelope) {
        debug!(id = %envelope.id, kind = envelope.msg.kind(), "poll inbound");
        let _ = self.events_tx.send(TransportEvent::Frame(envelope)).await;
    }

    /// Drain at most one outbound envelope (the GET handler).
    #[must_use]
    pub fn pop_outbound(&self) -> Option<Envelope> {
        self.outbound.lock().pop_front()
    }

    /// How many envelopes are waiting to be polled.
    #[must_use]
    pub fn outbound_len(&self) -> usize {
        self.outbound.lock().len()
    }
}

impl Default for LongPollServerTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LongPollServerTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events_tx.send(TransportEvent::Closed).await;
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.outbound.lock().push_back(envelope.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::LongPoll
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.lock().take()
    }
}
