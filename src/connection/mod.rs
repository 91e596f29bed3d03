//! Connection lifecycle: SRV discovery, candidate traversal, and the stream
//! negotiation worker.

mod parsing;
mod stanzas;
mod stream;
mod tls;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::dns::{self, CandidateResolver, DnsResolver, SRV_LOOKUP_TIMEOUT};
use crate::error::XmppError;
use crate::observer::{ConnectionObserver, ObserverHandle, ObserverRegistry};

/// Handle to one logical client connection for a domain.
///
/// [`XmppConnection::connect`] spawns a worker task that runs a full connect
/// cycle: SRV discovery, candidate traversal, stream negotiation including
/// STARTTLS, and teardown. Registered observers receive at most one terminal
/// event per cycle; a cycle stopped by [`XmppConnection::disconnect`]
/// reports nothing.
#[derive(Clone)]
pub struct XmppConnection {
    shared: Arc<ConnectionShared>,
}

pub(crate) struct ConnectionShared {
    pub(crate) domain: String,
    pub(crate) allow_insecure: bool,
    pub(crate) observers: ObserverRegistry,
    connecting: AtomicBool,
    stop_tx: watch::Sender<bool>,
    resolver: Arc<dyn CandidateResolver>,
}

impl XmppConnection {
    /// New connection for `domain`. `allow_insecure` disables certificate
    /// verification for the STARTTLS upgrade.
    pub fn new(domain: impl Into<String>, allow_insecure: bool) -> Self {
        Self::with_resolver(domain, allow_insecure, Arc::new(DnsResolver))
    }

    /// Same, with a custom SRV source instead of the system resolver.
    pub fn with_resolver(
        domain: impl Into<String>,
        allow_insecure: bool,
        resolver: Arc<dyn CandidateResolver>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        XmppConnection {
            shared: Arc::new(ConnectionShared {
                domain: domain.into(),
                allow_insecure,
                observers: ObserverRegistry::new(),
                connecting: AtomicBool::new(false),
                stop_tx,
                resolver,
            }),
        }
    }

    pub fn domain(&self) -> &str {
        &self.shared.domain
    }

    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) -> ObserverHandle {
        self.shared.observers.add(observer)
    }

    pub fn remove_observer(&self, handle: ObserverHandle) {
        self.shared.observers.remove(handle)
    }

    /// Start a connect cycle on a spawned worker task. Must be called from
    /// within a tokio runtime. A no-op while a cycle is already running.
    pub fn connect(&self) {
        if self
            .shared
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(domain = %self.shared.domain, "Connect requested while a cycle is already running");
            return;
        }
        self.shared.stop_tx.send_replace(false);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            run_worker(&shared).await;
            shared.connecting.store(false, Ordering::SeqCst);
        });
    }

    /// Ask the running cycle to stop. With a stream open this closes it
    /// gracefully, waiting up to the close grace period for the peer. Safe
    /// to call from anywhere; a no-op when idle.
    pub fn disconnect(&self) {
        self.shared.stop_tx.send_replace(true);
    }
}

async fn run_worker(shared: &ConnectionShared) {
    let domain = shared.domain.clone();
    info!(domain = %domain, "Starting connect cycle");

    let records = match timeout(SRV_LOOKUP_TIMEOUT, shared.resolver.resolve_srv(&domain)).await {
        Ok(records) => records,
        Err(_) => {
            warn!(
                domain = %domain,
                timeout_secs = SRV_LOOKUP_TIMEOUT.as_secs(),
                "SRV lookup timed out, using the domain fallback"
            );
            Vec::new()
        }
    };

    if dns::service_refused(&records) {
        info!(domain = %domain, "Domain declines XMPP service");
        shared
            .observers
            .dispatch_cannot_connect(&XmppError::ServiceNotSupported);
        return;
    }

    let mut addresses = AddressList::new(dns::build_candidates(&domain, records));
    let mut stop_rx = shared.stop_tx.subscribe();
    let mut keep_retrying = true;
    let mut attempt_errors: Vec<String> = Vec::new();

    while keep_retrying {
        if *stop_rx.borrow() {
            info!(domain = %domain, "Connect cycle stopped on request");
            return;
        }

        let Some((host, port)) = addresses.next() else {
            warn!(
                domain = %domain,
                attempts = attempt_errors.len(),
                errors = ?attempt_errors,
                "All candidate addresses exhausted"
            );
            shared
                .observers
                .dispatch_cannot_connect(&XmppError::UnableToConnect);
            return;
        };

        info!(domain = %domain, host = %host, port, "Trying candidate");
        let note = stream::run_attempt(
            shared,
            &host,
            port,
            &mut addresses,
            &mut keep_retrying,
            &mut stop_rx,
        )
        .await;
        if let Some(note) = note {
            attempt_errors.push(note);
        }
    }

    info!(domain = %domain, "Connect cycle finished");
}

/// Ordered connect candidates with a cursor over the next one to try.
#[derive(Debug)]
pub(crate) struct AddressList {
    entries: Vec<(String, u16)>,
    cursor: usize,
}

impl AddressList {
    fn new(entries: Vec<(String, u16)>) -> Self {
        AddressList { entries, cursor: 0 }
    }

    fn next(&mut self) -> Option<(String, u16)> {
        let entry = self.entries.get(self.cursor).cloned();
        if entry.is_some() {
            self.cursor += 1;
        }
        entry
    }

    /// Queue a `see-other-host` target to be tried next. Pairs already in
    /// the list are dropped, so referral loops cannot extend the cycle.
    pub(crate) fn insert_referral(&mut self, host: String, port: u16) {
        let pair = (host, port);
        if self.entries.contains(&pair) {
            debug!(host = %pair.0, port = pair.1, "Referral target already on the list");
            return;
        }
        let at = self.cursor.min(self.entries.len());
        self.entries.insert(at, pair);
    }

    /// Start over from the best candidate, for the cycle after this one.
    pub(crate) fn reset(&mut self) {
        self.cursor = 0;
    }
}
