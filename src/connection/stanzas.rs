//! Stream-level stanza semantics: header validation, feature negotiation,
//! STARTTLS answers, and stream errors.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::stream::{StreamDirective, StreamRunner};
use crate::dns;
use crate::element::Element;
use crate::error::XmppError;
use crate::ns;
use crate::observer::ConnectionStatus;
use crate::session::Feature;

impl StreamRunner<'_> {
    /// Validate the peer's response stream header (RFC 6120 §4.7).
    pub(crate) async fn handle_stream_start(
        &mut self,
        header: Element,
    ) -> std::io::Result<StreamDirective> {
        debug!(domain = %self.shared.domain, host = %self.host, "Received stream header");

        let version = match header.attr("version").and_then(parse_version) {
            Some(version) => version,
            None => {
                warn!(
                    host = %self.host,
                    version = ?header.attr("version"),
                    "Stream version missing or unreadable"
                );
                return Ok(self.fail_stream("invalid-xml").await);
            }
        };
        if version != (1, 0) {
            warn!(
                host = %self.host,
                major = version.0,
                minor = version.1,
                "Unsupported stream version"
            );
            return Ok(self.fail_stream("unsupported-version").await);
        }

        if let Some(content_ns) = header.default_namespace.as_deref() {
            if content_ns != ns::JABBER_CLIENT {
                warn!(host = %self.host, namespace = %content_ns, "Unexpected content namespace");
                return Ok(self.fail_stream("invalid-namespace").await);
            }
        }
        Ok(StreamDirective::Continue)
    }

    /// The peer closed the stream at stream depth.
    pub(crate) async fn handle_stream_end(&mut self) -> std::io::Result<StreamDirective> {
        info!(domain = %self.shared.domain, host = %self.host, "Peer closed the stream");
        if self.session.requests.end_stream {
            return Ok(StreamDirective::Close { retry: true });
        }
        // Unsolicited close: answer with ours and end the cycle for good.
        let _ = self.write_raw("</stream:stream>").await;
        Ok(StreamDirective::Close { retry: false })
    }

    /// Route a complete top-level stanza by its resolved namespace.
    pub(crate) async fn handle_stanza(
        &mut self,
        stanza: Element,
    ) -> std::io::Result<StreamDirective> {
        debug!(domain = %self.shared.domain, data = %stanza.serialize(), "Stanza in");
        match stanza.resolved_namespace.as_deref() {
            Some(ns::STREAMS) => self.handle_streams_stanza(stanza).await,
            Some(ns::TLS) => self.handle_tls_stanza(stanza).await,
            _ => {
                warn!(
                    tag = %stanza.tag,
                    namespace = ?stanza.resolved_namespace,
                    "Stanza in a namespace we cannot handle yet"
                );
                Ok(self.fail_stream("unsupported-stanza-type").await)
            }
        }
    }

    async fn handle_streams_stanza(
        &mut self,
        stanza: Element,
    ) -> std::io::Result<StreamDirective> {
        match stanza.tag.as_str() {
            "features" => self.handle_features(stanza).await,
            "error" => self.handle_stream_error_stanza(stanza).await,
            _ => {
                warn!(tag = %stanza.tag, "Unexpected streams-namespace stanza");
                Ok(self.fail_stream("unsupported-stanza-type").await)
            }
        }
    }

    async fn handle_features(&mut self, stanza: Element) -> std::io::Result<StreamDirective> {
        for child in &stanza.children {
            let required = child.child("required").is_some();
            self.session.features.push(Feature {
                namespace: child.resolved_namespace.clone().unwrap_or_default(),
                name: child.tag.clone(),
                required,
                source: child.clone(),
            });
        }
        self.negotiate_next_feature().await
    }

    /// Drive the next negotiable feature. STARTTLS wins whenever the session
    /// is still plaintext; any other mandatory feature is a dead end.
    async fn negotiate_next_feature(&mut self) -> std::io::Result<StreamDirective> {
        let mut chose_starttls = false;
        let mut unsupported_required = false;

        for feature in &self.session.features {
            if feature.namespace == ns::TLS && feature.name == "starttls" {
                if self.session.secure {
                    debug!(host = %self.host, "STARTTLS offered on a secure stream, ignoring");
                } else {
                    chose_starttls = true;
                }
            } else if feature.required {
                info!(
                    host = %self.host,
                    feature = %feature.name,
                    namespace = %feature.namespace,
                    "Server requires a feature we cannot negotiate"
                );
                unsupported_required = true;
            }
        }

        if chose_starttls {
            return self.request_starttls().await;
        }
        if unsupported_required {
            let _ = self.send_stream_error("unsupported-feature").await;
            self.shared
                .observers
                .dispatch_cannot_connect(&XmppError::Incompatible);
            return Ok(StreamDirective::Close { retry: false });
        }

        // Nothing left to negotiate: the stream is as good as it gets.
        // Future cycles should start from the best candidate again.
        self.addresses.reset();
        let status = ConnectionStatus {
            service_available: true,
            secure: self.session.secure,
            can_login: false,
            can_register: false,
        };
        info!(
            domain = %self.shared.domain,
            host = %self.host,
            secure = status.secure,
            "Stream negotiated"
        );
        self.shared.observers.dispatch_connected(status);
        *self.keep_retrying = false;
        Ok(StreamDirective::CloseGracefully)
    }

    async fn request_starttls(&mut self) -> std::io::Result<StreamDirective> {
        debug!(domain = %self.shared.domain, host = %self.host, "Requesting STARTTLS");
        self.session.requests.start_tls = true;
        let mut starttls = Element::new("starttls");
        starttls.default_namespace = Some(ns::TLS.to_string());
        self.write_element(&starttls).await?;
        Ok(StreamDirective::Continue)
    }

    async fn handle_tls_stanza(&mut self, stanza: Element) -> std::io::Result<StreamDirective> {
        match stanza.tag.as_str() {
            "proceed" => {
                if !self.session.requests.start_tls {
                    warn!(host = %self.host, "TLS proceed without a pending request");
                    return Ok(self.fail_stream("invalid-xml").await);
                }
                info!(domain = %self.shared.domain, host = %self.host, "Server accepted STARTTLS");
                Ok(StreamDirective::UpgradeTls)
            }
            "failure" => {
                if !self.session.requests.start_tls {
                    warn!(host = %self.host, "TLS failure without a pending request");
                    return Ok(self.fail_stream("invalid-xml").await);
                }
                warn!(host = %self.host, "Server refused STARTTLS");
                self.note_failure("starttls refused".to_string());
                Ok(StreamDirective::Close { retry: true })
            }
            other => {
                warn!(host = %self.host, tag = %other, "Unexpected TLS-namespace stanza");
                Ok(self.fail_stream("unsupported-stanza-type").await)
            }
        }
    }

    /// A `<stream:error>` from the peer. `see-other-host` redirects the
    /// cycle; every other condition just ends this attempt.
    async fn handle_stream_error_stanza(
        &mut self,
        stanza: Element,
    ) -> std::io::Result<StreamDirective> {
        let (condition, texts) = split_error_stanza(&stanza);

        let Some(condition) = condition else {
            warn!(host = %self.host, "Stream error without a recognizable condition");
            self.note_failure("stream error without a condition".to_string());
            return Ok(StreamDirective::Close { retry: true });
        };

        warn!(
            host = %self.host,
            condition = %condition.tag,
            texts = ?texts,
            "Stream error from server"
        );

        if condition.tag == "see-other-host" {
            let Some(referral) = condition.contents.as_deref() else {
                debug!(host = %self.host, "see-other-host without a target");
                self.note_failure("see-other-host without a target".to_string());
                return Ok(StreamDirective::Close { retry: true });
            };
            let (other_host, other_port) = dns::parse_referral(referral);
            info!(
                host = %self.host,
                other_host = %other_host,
                other_port,
                "Server referred us to another host"
            );
            self.addresses.insert_referral(other_host, other_port);
            return Ok(StreamDirective::Close { retry: true });
        }

        self.note_failure(format!("stream error: {}", condition.tag));
        Ok(StreamDirective::Close { retry: true })
    }
}

/// Splits a stream `version` attribute into its integral major and minor
/// parts. Anything that is not exactly `<major>.<minor>` is rejected.
fn parse_version(value: &str) -> Option<(u32, u32)> {
    let (major, minor) = value.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Pull the defined condition and the `<text>` children out of a stream
/// error. Only children in the stream-error namespace count; the last
/// condition wins, and so does the last text per language.
fn split_error_stanza(stanza: &Element) -> (Option<&Element>, BTreeMap<String, String>) {
    let mut condition = None;
    let mut texts = BTreeMap::new();
    for child in &stanza.children {
        if child.resolved_namespace.as_deref() != Some(ns::STREAM_ERRORS) {
            continue;
        }
        if child.tag == "text" {
            let lang = child.attr("xml:lang").unwrap_or("").to_string();
            texts.insert(lang, child.contents.clone().unwrap_or_default());
        } else {
            condition = Some(child);
        }
    }
    (condition, texts)
}
