//! WebSocket transports.
//!
//! [`WebSocketClient`] dials a URL (appending the `connsecret` query param
//! when a secret is present) and can be re-dialed after a drop without
//! recreating the transport. [`ServerWebSocket`] wraps a socket that Axum
//! already upgraded; it is born open.
//!
//! Frames are JSON text, one envelope per frame. Binary frames carrying
//! UTF-8 are accepted too.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crossbar_core::{ConnectionSecret, Envelope};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::transport::{Transport, TransportEvent, TransportKind, EVENT_BUFFER};

fn decode_frame(text: &str) -> Option<Envelope> {
    match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            warn!(error = %e, "dropping undecodable frame");
            None
        }
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// A WebSocket transport that dials out to a URL.
pub struct WebSocketClient {
    url: String,
    secret: Option<ConnectionSecret>,
    connected: Arc<AtomicBool>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    tasks: Mutex<Option<CancellationToken>>,
}

impl WebSocketClient {
    /// Create a client transport for `url`.
    ///
    /// When `secret` is present every dial carries it as the `connsecret`
    /// query param so the server can resume the connection's identity.
    #[must_use]
    pub fn new(url: impl Into<String>, secret: Option<ConnectionSecret>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            url: url.into(),
            secret,
            connected: Arc::new(AtomicBool::new(false)),
            outbound: Mutex::new(None),
            events_tx,
            events: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(None),
        }
    }

    fn connect_url(&self) -> String {
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
impl Transport for WebSocketClient {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let url = self.connect_url();
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        debug!(url = %self.url, "websocket connected");
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(EVENT_BUFFER);
        *self.outbound.lock() = Some(out_tx);

        let token = CancellationToken::new();
        if let Some(old) = self.tasks.lock().replace(token.clone()) {
            old.cancel();
        }

        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events_tx.send(TransportEvent::Opened).await;

        let writer_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_token.cancelled() => break,
                    frame = out_rx.recv() => match frame {
                        Some(text) => {
                            if sink.send(tungstenite::Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = sink.close().await;
        });

        let connected = self.connected.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    frame = source.next() => match frame {
                        Some(Ok(tungstenite::Message::Text(text))) => {
                            if let Some(envelope) = decode_frame(text.as_str()) {
                                let _ = events_tx.send(TransportEvent::Frame(envelope)).await;
                            }
                        }
                        Some(Ok(tungstenite::Message::Binary(bytes))) => {
                            if let Ok(text) = std::str::from_utf8(&bytes) {
                                if let Some(envelope) = decode_frame(text) {
                                    let _ = events_tx.send(TransportEvent::Frame(envelope)).await;
                                }
                            }
                        }
                        Some(Ok(tungstenite::Message::Close(_))) | None => break,
                        // ping/pong handled by tungstenite itself
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "websocket read failed");
                            break;
                        }
                    },
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
        *self.outbound.lock() = None;
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events_tx.send(TransportEvent::Closed).await;
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let text = serde_json::to_string(envelope)?;
        let tx = self.outbound.lock().clone();
        match tx {
            Some(tx) => tx.send(text).await.map_err(|_| TransportError::Closed),
            None => Err(TransportError::NotConnected),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.lock().take()
    }
}

// ── Server ──────────────────────────────────────────────────────────

/// A transport wrapping a socket Axum already upgraded.
///
/// The socket is open from the start; an `Opened` event is queued at
/// construction so the engine observes the transition once it attaches.
pub struct ServerWebSocket {
    connected: Arc<AtomicBool>,
    outbound: mpsc::Sender<String>,
    events_tx: mpsc::Sender<TransportEvent>,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    token: CancellationToken,
}

impl ServerWebSocket {
    /// Wrap an upgraded socket and start its IO tasks.
    #[must_use]
    pub fn spawn(socket: axum::extract::ws::WebSocket) -> Self {
        use axum::extract::ws::Message as WsMessage;

        let (mut sink, mut source) = socket.split();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (out_tx, mut out_rx) = mpsc::channel::<String>(EVENT_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));
        let token = CancellationToken::new();

        // the socket is already open; make the transition observable
        let _ = events_tx.try_send(TransportEvent::Opened);

        let writer_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_token.cancelled() => break,
                    frame = out_rx.recv() => match frame {
                        Some(text) => {
                            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let reader_connected = connected.clone();
        let reader_events = events_tx.clone();
        let reader_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = reader_token.cancelled() => break,
                    frame = source.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Some(envelope) = decode_frame(text.as_str()) {
                                let _ = reader_events.send(TransportEvent::Frame(envelope)).await;
                            }
                        }
                        Some(Ok(WsMessage::Binary(bytes))) => {
                            if let Ok(text) = std::str::from_utf8(&bytes) {
                                if let Some(envelope) = decode_frame(text) {
                                    let _ = reader_events.send(TransportEvent::Frame(envelope)).await;
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "server websocket read failed");
                            break;
                        }
                    },
                }
            }
            if reader_connected.swap(false, Ordering::SeqCst) {
                let _ = reader_events.send(TransportEvent::Closed).await;
            }
        });

        Self {
            connected,
            outbound: out_tx,
            events_tx,
            events: Mutex::new(Some(events_rx)),
            token,
        }
    }
}

#[async_trait]
impl Transport for ServerWebSocket {
    async fn connect(&self) -> Result<(), TransportError> {
        // born open; a dropped server socket cannot be re-dialed from here
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    async fn disconnect(&self) {
        self.token.cancel();
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events_tx.send(TransportEvent::Closed).await;
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let text = serde_json::to_string(envelope)?;
        self.outbound
            .send(text)
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.lock().take()
    }
}
