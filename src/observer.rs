//! Observer interface for connection outcomes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::debug;

use crate::error::XmppError;

/// What the negotiated stream offers, delivered with `connected`.
///
/// `can_login` and `can_register` stay `false` until SASL and in-band
/// registration negotiators exist on top of this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// The domain runs an XMPP service we finished negotiating with.
    pub service_available: bool,
    /// The stream runs over TLS.
    pub secure: bool,
    pub can_login: bool,
    pub can_register: bool,
}

/// Receives the terminal outcome of each connect cycle.
///
/// Callbacks run synchronously on the connection worker task, in
/// registration order. Implementations must not block; hand the event off to
/// a channel if there is real work to do.
pub trait ConnectionObserver: Send + Sync {
    /// A stream reached the negotiated state.
    fn connected(&self, status: ConnectionStatus);

    /// The cycle ended without a negotiated stream.
    fn cannot_connect(&self, error: &XmppError);
}

/// Token for removing a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverHandle(u64);

/// Observer set shared between the connection handle and its worker.
pub(crate) struct ObserverRegistry {
    next_handle: AtomicU64,
    observers: Mutex<Vec<(u64, Arc<dyn ConnectionObserver>)>>,
}

impl ObserverRegistry {
    pub(crate) fn new() -> Self {
        ObserverRegistry {
            next_handle: AtomicU64::new(1),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, observer: Arc<dyn ConnectionObserver>) -> ObserverHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().unwrap().push((handle, observer));
        ObserverHandle(handle)
    }

    pub(crate) fn remove(&self, handle: ObserverHandle) {
        self.observers
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != handle.0);
    }

    /// Snapshot under the lock, dispatch outside it.
    fn snapshot(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        self.observers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }

    pub(crate) fn dispatch_connected(&self, status: ConnectionStatus) {
        debug!(?status, "Dispatching connected");
        for observer in self.snapshot() {
            observer.connected(status);
        }
    }

    pub(crate) fn dispatch_cannot_connect(&self, error: &XmppError) {
        debug!(error = %error, "Dispatching cannot_connect");
        for observer in self.snapshot() {
            observer.cannot_connect(error);
        }
    }
}
