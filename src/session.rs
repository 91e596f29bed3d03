//! Per-stream negotiation state.
//!
//! A [`Session`] lives exactly as long as one XML stream: it is created when
//! the stream opener goes out and replaced wholesale when STARTTLS forces the
//! stream to restart.

use std::collections::HashMap;

use crate::element::Element;

/// One feature the server advertised in `<stream:features>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// Resolved namespace of the feature element, `""` if it had none.
    pub namespace: String,
    /// Local tag of the feature element.
    pub name: String,
    /// Whether the server marked it `<required/>`.
    pub required: bool,
    /// The advertisement itself, for negotiators that need its contents.
    pub source: Element,
}

/// Requests this side has sent and not yet seen answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestsMade {
    /// `<starttls/>` is in flight; gates `<proceed/>` and `<failure/>`.
    pub start_tls: bool,
    /// We sent `</stream:stream>`; the peer's close is now an answer, not a
    /// goodbye of its own.
    pub end_stream: bool,
}

/// Mutable state of the stream currently on the wire.
#[derive(Debug, Default)]
pub struct Session {
    /// Whether the transport under this stream is TLS.
    pub secure: bool,
    pub requests: RequestsMade,
    /// Features collected from the most recent `<stream:features>`.
    pub features: Vec<Feature>,
    /// Qualified name the peer opened its stream with, verbatim. The stream
    /// close must match it exactly.
    pub opening_stream_qname: Option<String>,
    /// Namespace scopes: prefix (or `""` for the default) to a stack of URIs,
    /// innermost last.
    pub namespace_prefixes: HashMap<String, Vec<String>>,
    /// Prefixed declarations seen but not yet attached to their element.
    pub pending_prefixed_decls: Vec<(String, String)>,
    /// Ancestors of the element under assembly, root first. Empty between
    /// stanzas.
    pub open_elements: Vec<Element>,
    /// For each open element, the prefixes it declared, so its scopes can be
    /// unwound when it closes.
    pub open_decls: Vec<Vec<String>>,
}

impl Session {
    pub fn new() -> Self {
        Session::default()
    }

    /// Fresh session for the restarted stream after a TLS upgrade.
    pub fn secured() -> Self {
        Session {
            secure: true,
            ..Session::default()
        }
    }

    /// Innermost namespace bound to `prefix`, `""` meaning the default.
    pub fn namespace_for(&self, prefix: &str) -> Option<&str> {
        self.namespace_prefixes
            .get(prefix)
            .and_then(|scopes| scopes.last())
            .map(String::as_str)
    }

    pub fn push_namespace(&mut self, prefix: &str, uri: String) {
        self.namespace_prefixes
            .entry(prefix.to_string())
            .or_default()
            .push(uri);
    }

    pub fn pop_namespace(&mut self, prefix: &str) {
        if let Some(scopes) = self.namespace_prefixes.get_mut(prefix) {
            scopes.pop();
            if scopes.is_empty() {
                self.namespace_prefixes.remove(prefix);
            }
        }
    }
}
