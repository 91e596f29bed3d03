//! Applies parsed XML events to the session: namespace scoping, element
//! assembly, and the well-formedness rules RFC 6120 layers on top of XML.

use tracing::warn;

use super::stream::{StreamDirective, StreamRunner};
use crate::element::Element;
use crate::ns;
use crate::parser::XmlEvent;

impl StreamRunner<'_> {
    /// Apply one event, returning what the read loop should do next.
    pub(crate) async fn handle_event(
        &mut self,
        event: XmlEvent,
    ) -> std::io::Result<StreamDirective> {
        match event {
            XmlEvent::ElementStart {
                qname,
                declarations,
                attributes,
            } => self.handle_element_start(qname, declarations, attributes).await,
            XmlEvent::ElementEnd { qname } => self.handle_element_end(qname).await,
            XmlEvent::Text(text) => self.handle_text(text).await,
            XmlEvent::CData(data) => self.handle_cdata(data).await,
            // Comments, processing instructions, and DOCTYPE are all
            // forbidden on XMPP streams (RFC 6120 §11.1).
            XmlEvent::Comment => {
                warn!(host = %self.host, "Peer sent an XML comment");
                Ok(self.fail_stream("restricted-xml").await)
            }
            XmlEvent::ProcessingInstruction => {
                warn!(host = %self.host, "Peer sent a processing instruction");
                Ok(self.fail_stream("restricted-xml").await)
            }
            XmlEvent::DocType => {
                warn!(host = %self.host, "Peer sent a DOCTYPE declaration");
                Ok(self.fail_stream("restricted-xml").await)
            }
        }
    }

    async fn handle_element_start(
        &mut self,
        qname: String,
        declarations: Vec<(String, String)>,
        attributes: Vec<(String, String)>,
    ) -> std::io::Result<StreamDirective> {
        // Declarations come into scope before the tag's own name resolves.
        let mut declared = Vec::with_capacity(declarations.len());
        for (prefix, uri) in declarations {
            if !prefix.is_empty() {
                self.session
                    .pending_prefixed_decls
                    .push((prefix.clone(), uri.clone()));
            }
            self.session.push_namespace(&prefix, uri);
            declared.push(prefix);
        }

        let Some((prefix, tag, resolved)) = self.resolve_qname(&qname) else {
            return Ok(self.fail_stream("bad-format").await);
        };

        let mut element = Element::new(tag);
        element.prefix = prefix;
        element.resolved_namespace = resolved;
        element.default_namespace = self.session.namespace_for("").map(str::to_string);
        for (decl_prefix, uri) in self.session.pending_prefixed_decls.drain(..) {
            element.prefixed_namespaces.insert(decl_prefix, uri);
        }
        for (name, value) in attributes {
            element.attributes.insert(name, value);
        }

        // The stream wrapper is handled out of band and never joins the
        // element stack; its end tag is matched by qualified name instead.
        if element.resolved_namespace.as_deref() == Some(ns::STREAMS)
            && element.tag == "stream"
            && self.session.open_elements.is_empty()
        {
            if self.session.opening_stream_qname.is_some() {
                warn!(host = %self.host, "Peer opened a second stream");
                return Ok(self.fail_stream("invalid-xml").await);
            }
            self.session.opening_stream_qname = Some(qname);
            return self.handle_stream_start(element).await;
        }

        self.session.open_elements.push(element);
        self.session.open_decls.push(declared);
        Ok(StreamDirective::Continue)
    }

    async fn handle_element_end(&mut self, qname: String) -> std::io::Result<StreamDirective> {
        let stream_close = self.session.opening_stream_qname.as_deref() == Some(qname.as_str());
        let local = qname.rsplit(':').next().unwrap_or(qname.as_str());

        match self.session.open_elements.pop() {
            Some(element) if element.tag == local => {
                for prefix in self.session.open_decls.pop().unwrap_or_default() {
                    self.session.pop_namespace(&prefix);
                }
                match self.session.open_elements.last_mut() {
                    Some(parent) => {
                        parent.children.push(element);
                        Ok(StreamDirective::Continue)
                    }
                    None => self.handle_stanza(element).await,
                }
            }
            Some(element) => {
                warn!(host = %self.host, qname = %qname, open = %element.tag, "Mismatched closing tag");
                Ok(self.fail_stream("bad-format").await)
            }
            None if stream_close => self.handle_stream_end().await,
            None => {
                warn!(host = %self.host, qname = %qname, "Closing tag without an open element");
                Ok(self.fail_stream("bad-format").await)
            }
        }
    }

    async fn handle_text(&mut self, text: String) -> std::io::Result<StreamDirective> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            // Whitespace between stanzas is keepalive traffic.
            return Ok(StreamDirective::Continue);
        }
        match self.session.open_elements.last_mut() {
            Some(element) => {
                element.append_text(trimmed);
                Ok(StreamDirective::Continue)
            }
            None => {
                warn!(host = %self.host, "Character data outside any element");
                Ok(self.fail_stream("bad-format").await)
            }
        }
    }

    async fn handle_cdata(&mut self, data: String) -> std::io::Result<StreamDirective> {
        match self.session.open_elements.last_mut() {
            Some(element) => {
                element.append_text(&data);
                Ok(StreamDirective::Continue)
            }
            None => {
                warn!(host = %self.host, "CDATA outside any element");
                Ok(self.fail_stream("bad-format").await)
            }
        }
    }

    /// Split a qualified name and resolve it against the session's scopes.
    /// `None` means it cannot resolve: an undefined prefix or too many
    /// colons.
    fn resolve_qname(&self, qname: &str) -> Option<(String, String, Option<String>)> {
        let mut parts = qname.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(tag), None, _) => {
                let resolved = self.session.namespace_for("").unwrap_or("").to_string();
                Some((String::new(), tag.to_string(), Some(resolved)))
            }
            (Some(prefix), Some(tag), None) => match self.session.namespace_for(prefix) {
                Some(uri) => Some((prefix.to_string(), tag.to_string(), Some(uri.to_string()))),
                None => {
                    warn!(host = %self.host, qname = %qname, "Undefined namespace prefix");
                    None
                }
            },
            _ => {
                warn!(host = %self.host, qname = %qname, "Malformed qualified name");
                None
            }
        }
    }
}
