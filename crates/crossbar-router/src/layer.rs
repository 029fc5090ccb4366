//! Route layers.
//!
//! An inbound layer maps one route pattern to per-verb handlers. An
//! outbound layer declares a broadcastable route and carries its listener
//! list; each listener remembers the positional captures of the concrete
//! path it subscribed with, and a broadcast only reaches listeners whose
//! captures equal the broadcast path's.

use std::sync::Arc;

use crossbar_core::{ConnectionSecret, RoutePattern, Verb};

use crate::handler::{BroadcastValidator, RouteHandler};

/// A server-side handler registration for one route pattern.
pub(crate) struct InboundLayer {
    pub(crate) id: u64,
    pub(crate) pattern: RoutePattern,
    verbs: Vec<(Verb, Arc<dyn RouteHandler>)>,
}

impl InboundLayer {
    pub(crate) fn new(id: u64, pattern: RoutePattern) -> Self {
        Self {
            id,
            pattern,
            verbs: Vec::new(),
        }
    }

    /// Install a handler; a second registration for the same verb replaces
    /// the first, different verbs coexist.
    pub(crate) fn set_handler(&mut self, verb: Verb, handler: Arc<dyn RouteHandler>) {
        if let Some(entry) = self.verbs.iter_mut().find(|(v, _)| *v == verb) {
            entry.1 = handler;
        } else {
            self.verbs.push((verb, handler));
        }
    }

    pub(crate) fn handler_for(&self, verb: Verb) -> Option<Arc<dyn RouteHandler>> {
        self.verbs
            .iter()
            .find(|(v, _)| *v == verb)
            .map(|(_, h)| h.clone())
    }
}

/// One subscriber entry inside an outbound layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Listener {
    pub(crate) secret: ConnectionSecret,
    /// Positional captures of the concrete path at subscribe time.
    pub(crate) values: Vec<String>,
}

/// A server-side broadcastable-route declaration.
pub(crate) struct OutboundLayer {
    pub(crate) id: u64,
    pub(crate) pattern: RoutePattern,
    pub(crate) listeners: Vec<Listener>,
    pub(crate) validator: Arc<dyn BroadcastValidator>,
}

impl OutboundLayer {
    pub(crate) fn new(id: u64, pattern: RoutePattern, validator: Arc<dyn BroadcastValidator>) -> Self {
        Self {
            id,
            pattern,
            listeners: Vec::new(),
            validator,
        }
    }
}
