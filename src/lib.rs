//! Client-side XMPP stream engine (RFC 6120).
//!
//! Discovers servers through DNS SRV, opens the XML stream over TCP,
//! upgrades it with STARTTLS, enforces stream-level XML rules, and reports
//! one terminal outcome per connect cycle to registered observers. SASL,
//! resource binding, and stanza semantics sit above this layer and are the
//! caller's business.
//!
//! ```no_run
//! use std::sync::Arc;
//! use xmpp_conn::{ConnectionObserver, ConnectionStatus, XmppConnection, XmppError};
//!
//! struct Printer;
//!
//! impl ConnectionObserver for Printer {
//!     fn connected(&self, status: ConnectionStatus) {
//!         println!("connected, secure = {}", status.secure);
//!     }
//!
//!     fn cannot_connect(&self, error: &XmppError) {
//!         println!("failed: {error}");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let conn = XmppConnection::new("example.net", false);
//!     conn.add_observer(Arc::new(Printer));
//!     conn.connect();
//!     // ... later, to stop the cycle:
//!     conn.disconnect();
//! }
//! ```

pub mod connection;
pub mod dns;
pub mod element;
pub mod error;
pub mod ns;
pub mod observer;
pub mod parser;
pub mod session;

pub use connection::XmppConnection;
pub use dns::{CandidateResolver, DnsResolver, SrvRecord, StaticResolver};
pub use element::Element;
pub use error::XmppError;
pub use observer::{ConnectionObserver, ConnectionStatus, ObserverHandle};
