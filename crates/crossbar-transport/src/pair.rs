//! In-memory transport pairs.
//!
//! Two [`PairTransport`] endpoints form a duplex link: whatever one side
//! sends arrives as a [`TransportEvent::Frame`] on the other. Tests attach
//! one end to a connection engine and hold the raw peer end themselves, which
//! lets them drop, duplicate, or reorder envelopes at will.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crossbar_core::Envelope;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{Transport, TransportEvent, TransportKind, EVENT_BUFFER};

/// One end of an in-memory duplex link.
pub struct PairTransport {
    connected: Arc<AtomicBool>,
    peer_connected: Arc<AtomicBool>,
    to_peer: mpsc::Sender<TransportEvent>,
    own_tx: mpsc::Sender<TransportEvent>,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl PairTransport {
    /// Create two linked endpoints.
    #[must_use]
    pub fn pair() -> (PairTransport, PairTransport) {
        let (tx_a, rx_a) = mpsc::channel(EVENT_BUFFER);
        let (tx_b, rx_b) = mpsc::channel(EVENT_BUFFER);
        let a_open = Arc::new(AtomicBool::new(false));
        let b_open = Arc::new(AtomicBool::new(false));

        let a = PairTransport {
            connected: a_open.clone(),
            peer_connected: b_open.clone(),
            to_peer: tx_b.clone(),
            own_tx: tx_a.clone(),
            events: Mutex::new(Some(rx_a)),
        };
        let b = PairTransport {
            connected: b_open,
            peer_connected: a_open,
            to_peer: tx_a,
            own_tx: tx_b,
            events: Mutex::new(Some(rx_b)),
        };
        (a, b)
    }
}

#[async_trait]
impl Transport for PairTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            let _ = self.own_tx.send(TransportEvent::Opened).await;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.own_tx.send(TransportEvent::Closed).await;
            // an in-memory link has no half-open state
            if self.peer_connected.swap(false, Ordering::SeqCst) {
                let _ = self.to_peer.send(TransportEvent::Closed).await;
            }
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.to_peer
            .send(TransportEvent::Frame(envelope.clone()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Pair
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbar_core::{Message, MsgId};

    #[tokio::test]
    async fn send_before_connect_fails() {
        let (a, _b) = PairTransport::pair();
        let env = Envelope::new(MsgId::new(0), Message::Ping);
        assert!(matches!(
            a.send(&env).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn frames_cross_the_link() {
        let (a, b) = PairTransport::pair();
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let mut b_events = b.take_events().unwrap();
        // Drain b's own Opened first
        assert_eq!(b_events.recv().await, Some(TransportEvent::Opened));

        let env = Envelope::new(MsgId::new(1), Message::Ping);
        a.send(&env).await.unwrap();
        assert_eq!(b_events.recv().await, Some(TransportEvent::Frame(env)));
    }

    #[tokio::test]
    async fn connect_emits_opened_once() {
        let (a, _b) = PairTransport::pair();
        let mut events = a.take_events().unwrap();
        a.connect().await.unwrap();
        a.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Opened));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_closes_both_ends() {
        let (a, b) = PairTransport::pair();
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let mut b_events = b.take_events().unwrap();
        assert_eq!(b_events.recv().await, Some(TransportEvent::Opened));

        a.disconnect().await;
        assert!(!a.is_connected());
        assert!(!b.is_connected());
        assert_eq!(b_events.recv().await, Some(TransportEvent::Closed));
    }

    #[test]
    fn events_claimed_once() {
        let (a, _b) = PairTransport::pair();
        assert!(a.take_events().is_some());
        assert!(a.take_events().is_none());
    }
}
