//! In-process fan-out of metadata-change notifications.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::MetaError;
use crate::topology::{DefnId, IndexDefn};

/// Named event kinds listeners can register for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    IndexCreated,
    IndexDropped,
    TopologyUpdated,
}

/// Payload delivered to listeners when the metadata layer applies a change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetaEvent {
    IndexCreated(IndexDefn),
    IndexDropped {
        bucket: String,
        name: String,
        defn_id: Option<DefnId>,
    },
    TopologyUpdated {
        bucket: String,
    },
}

impl MetaEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MetaEvent::IndexCreated(_) => EventKind::IndexCreated,
            MetaEvent::IndexDropped { .. } => EventKind::IndexDropped,
            MetaEvent::TopologyUpdated { .. } => EventKind::TopologyUpdated,
        }
    }
}

struct Inner {
    closed: bool,
    listeners: HashMap<EventKind, HashMap<String, mpsc::Sender<MetaEvent>>>,
}

/// Registry of local listeners keyed by `(listener id, event kind)`.
///
/// Delivery is non-blocking: a full listener channel causes that listener's
/// notification to be dropped, never blocking the committing path.
pub struct EventManager {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                closed: false,
                listeners: HashMap::new(),
            }),
        }
    }

    /// Register a listener for one event kind and return its delivery
    /// channel. Re-registering the same `(listener, kind)` replaces the old
    /// channel with a fresh one.
    pub fn register(
        &self,
        listener_id: &str,
        kind: EventKind,
    ) -> Result<mpsc::Receiver<MetaEvent>, MetaError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(MetaError::Closed);
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        inner
            .listeners
            .entry(kind)
            .or_default()
            .insert(listener_id.to_string(), tx);
        Ok(rx)
    }

    /// Remove a registration. Notifications already queued to the listener's
    /// channel are not retracted.
    pub fn unregister(&self, listener_id: &str, kind: EventKind) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(by_id) = inner.listeners.get_mut(&kind) {
            by_id.remove(listener_id);
        }
    }

    /// Deliver an event to every currently-registered listener of its kind.
    pub fn notify(&self, event: MetaEvent) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        let kind = event.kind();
        let Some(by_id) = inner.listeners.get_mut(&kind) else {
            return;
        };
        by_id.retain(|listener_id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(listener_id, ?kind, "listener channel full, dropping notification");
                true
            }
            // Receiver gone: forget the registration.
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.listeners.clear();
    }
}
