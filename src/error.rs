//! Connection-level error type reported to observers.

use thiserror::Error;

/// Terminal failure of a connect cycle.
///
/// At most one of these is delivered to [`ConnectionObserver::cannot_connect`]
/// per cycle; the worker logs everything softer than this (per-candidate
/// socket errors, DNS misses) and keeps going.
///
/// [`ConnectionObserver::cannot_connect`]: crate::observer::ConnectionObserver::cannot_connect
#[derive(Debug, Error)]
pub enum XmppError {
    /// The domain publishes a single `.` SRV record, declining XMPP service.
    #[error("the domain explicitly does not offer XMPP")]
    ServiceNotSupported,

    /// The domain itself does not resolve. Reserved: lookup failures are
    /// currently indistinguishable from empty answers and fall back to the
    /// bare domain instead.
    #[error("no such domain")]
    NoSuchDomain,

    /// Every candidate address was tried and none produced a usable stream.
    #[error("unable to connect to any server for this domain")]
    UnableToConnect,

    /// The server requires a stream feature this engine cannot negotiate.
    #[error("server requires an unsupported mandatory feature")]
    Incompatible,

    /// Reserved for security policy violations that must never be retried.
    #[error("connection aborted for security reasons")]
    CriticalSecurity,

    /// Transport-level failure outside the candidate retry loop.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
