//! Completion handles for tracked sends.

use crossbar_core::{MsgId, RouteReply};
use tokio::sync::oneshot;

/// The one-shot completion of a tracked send.
///
/// Resolves on the first terminal response for the envelope's id (a wire 202
/// keeps it pending). Dropping the handle is fine — the send still happens
/// and retries still run; only the notification is discarded.
#[derive(Debug)]
pub struct ReplyHandle {
    id: MsgId,
    rx: oneshot::Receiver<RouteReply>,
}

impl ReplyHandle {
    pub(crate) fn new(id: MsgId, rx: oneshot::Receiver<RouteReply>) -> Self {
        Self { id, rx }
    }

    /// A handle that is already resolved (used for the advisory 429).
    pub(crate) fn settled(id: MsgId, reply: RouteReply) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(reply);
        Self { id, rx }
    }

    /// The id allocated for the send.
    #[must_use]
    pub fn id(&self) -> MsgId {
        self.id
    }

    /// Wait for the terminal reply. `None` means the connection was closed
    /// before one arrived.
    pub async fn wait(self) -> Option<RouteReply> {
        self.rx.await.ok()
    }

    /// Check for a reply without waiting.
    pub fn try_reply(&mut self) -> Option<RouteReply> {
        self.rx.try_recv().ok()
    }
}
