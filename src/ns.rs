//! Stream-layer XML namespace URIs (RFC 6120).

/// Namespace of the `<stream:stream>` wrapper and its direct children.
pub const STREAMS: &str = "http://etherx.jabber.org/streams";

/// Default content namespace for client-to-server streams.
pub const JABBER_CLIENT: &str = "jabber:client";

/// STARTTLS negotiation elements: `<starttls/>`, `<proceed/>`, `<failure/>`.
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// Defined condition elements inside `<stream:error>`.
pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
