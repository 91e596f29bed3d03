//! The per-candidate stream attempt: socket ownership, read loop, writers.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, warn};

use super::tls;
use super::{AddressList, ConnectionShared};
use crate::element::{escape_attribute, Element};
use crate::ns;
use crate::parser::XmlParser;
use crate::session::Session;

/// TCP connection timeout. Unresponsive candidates should fail fast so the
/// cycle can move on to the next address.
pub(crate) const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// How long we wait for the peer's `</stream:stream>` after sending ours.
pub(crate) const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Socket read chunk size.
const READ_CHUNK_SIZE: usize = 8192;

/// The attempt's socket, plaintext before STARTTLS and encrypted after.
/// `Closed` stands in while the upgrade owns the stream and after teardown.
pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Closed,
}

impl Transport {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf).await,
            Transport::Tls(stream) => stream.read(buf).await,
            Transport::Closed => Ok(0),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Transport::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await
            }
            Transport::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await
            }
            Transport::Closed => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "stream closed",
            )),
        }
    }

    async fn shutdown(&mut self) {
        match self {
            Transport::Plain(stream) => {
                let _ = stream.shutdown().await;
            }
            Transport::Tls(stream) => {
                let _ = stream.shutdown().await;
            }
            Transport::Closed => {}
        }
    }
}

/// What the read loop does after an event handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamDirective {
    Continue,
    /// STARTTLS was accepted: run the handshake, then restart the stream
    /// with a fresh parser and session.
    UpgradeTls,
    /// Send our `</stream:stream>` and wait out the grace period.
    CloseGracefully,
    /// Tear the attempt down. `retry: false` ends the whole cycle.
    Close { retry: bool },
}

/// One candidate's stream lifetime. Owns the socket, the parser, and the
/// session; the surrounding cycle state is borrowed from the worker.
pub(crate) struct StreamRunner<'a> {
    pub(crate) shared: &'a ConnectionShared,
    pub(crate) addresses: &'a mut AddressList,
    pub(crate) keep_retrying: &'a mut bool,
    pub(crate) host: &'a str,
    pub(crate) transport: Transport,
    pub(crate) parser: XmlParser,
    pub(crate) session: Session,
    pub(crate) close_deadline: Option<Instant>,
    pub(crate) failure: Option<String>,
}

/// Run one candidate attempt to completion. Returns a failure note for the
/// exhaustion log when the attempt ended badly.
pub(crate) async fn run_attempt(
    shared: &ConnectionShared,
    host: &str,
    port: u16,
    addresses: &mut AddressList,
    keep_retrying: &mut bool,
    stop_rx: &mut watch::Receiver<bool>,
) -> Option<String> {
    let address = format!("{}:{}", host, port);
    let tcp = match timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(host = %host, port, error = %e, "TCP connect failed");
            return Some(format!("{}: connect: {}", address, e));
        }
        Err(_) => {
            warn!(
                host = %host,
                port,
                timeout_secs = TCP_CONNECT_TIMEOUT.as_secs(),
                "TCP connect timed out"
            );
            return Some(format!("{}: connect timed out", address));
        }
    };
    info!(domain = %shared.domain, host = %host, port, "Connected, opening stream");

    let mut runner = StreamRunner {
        shared,
        addresses,
        keep_retrying,
        host,
        transport: Transport::Plain(tcp),
        parser: XmlParser::new(),
        session: Session::new(),
        close_deadline: None,
        failure: None,
    };
    runner.run(stop_rx).await;
    runner.failure.map(|note| format!("{}: {}", address, note))
}

impl StreamRunner<'_> {
    async fn run(&mut self, stop_rx: &mut watch::Receiver<bool>) {
        if let Err(e) = self.send_stream_opener().await {
            warn!(host = %self.host, error = %e, "Failed to open stream");
            self.failure = Some(format!("stream open: {}", e));
            return;
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            let read_result = if let Some(deadline) = self.close_deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match timeout(remaining, self.transport.read(&mut chunk)).await {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(host = %self.host, "Close grace period elapsed, dropping the connection");
                        *self.keep_retrying = false;
                        break;
                    }
                }
            } else {
                tokio::select! {
                    result = self.transport.read(&mut chunk) => result,
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            info!(domain = %self.shared.domain, host = %self.host, "Disconnect requested");
                            if self.begin_graceful_close().await.is_err() {
                                break;
                            }
                        }
                        continue;
                    }
                }
            };

            let n = match read_result {
                Ok(0) => {
                    if self.close_deadline.is_some() || self.session.requests.end_stream {
                        debug!(host = %self.host, "Peer finished closing");
                    } else {
                        warn!(host = %self.host, "Connection closed by peer");
                        self.note_failure("connection closed by peer".to_string());
                    }
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(host = %self.host, error = %e, "Read failed");
                    self.note_failure(format!("read: {}", e));
                    break;
                }
            };

            let events = match self.parser.feed(&chunk[..n]) {
                Ok(events) => events,
                Err(e) => {
                    warn!(host = %self.host, error = %e, "Inbound XML is unusable");
                    let _ = self.send_stream_error("bad-format").await;
                    self.note_failure(format!("parse: {}", e));
                    break;
                }
            };

            let mut directive = StreamDirective::Continue;
            for event in events {
                directive = match self.handle_event(event).await {
                    Ok(directive) => directive,
                    Err(e) => {
                        warn!(host = %self.host, error = %e, "Write failed");
                        self.note_failure(format!("write: {}", e));
                        StreamDirective::Close { retry: true }
                    }
                };
                // Anything but Continue invalidates the rest of the batch:
                // either the stream restarts under TLS or it is going down.
                if directive != StreamDirective::Continue {
                    break;
                }
            }

            match directive {
                StreamDirective::Continue => {}
                StreamDirective::UpgradeTls => {
                    if let Err(note) = self.upgrade_tls().await {
                        self.note_failure(note);
                        break;
                    }
                }
                StreamDirective::CloseGracefully => {
                    if self.begin_graceful_close().await.is_err() {
                        break;
                    }
                }
                StreamDirective::Close { retry } => {
                    if !retry {
                        *self.keep_retrying = false;
                    }
                    break;
                }
            }
        }

        self.transport.shutdown().await;
        self.transport = Transport::Closed;
    }

    /// Send our `</stream:stream>` and arm the grace deadline. Idempotent.
    async fn begin_graceful_close(&mut self) -> std::io::Result<()> {
        if self.close_deadline.is_some() {
            return Ok(());
        }
        self.session.requests.end_stream = true;
        self.close_deadline = Some(Instant::now() + GRACEFUL_CLOSE_TIMEOUT);
        debug!(domain = %self.shared.domain, host = %self.host, "Closing stream");
        self.write_raw("</stream:stream>").await
    }

    /// Swap the plaintext socket for an encrypted one and restart the
    /// stream: fresh parser, fresh session marked secure, new opener.
    async fn upgrade_tls(&mut self) -> Result<(), String> {
        let tcp = match std::mem::replace(&mut self.transport, Transport::Closed) {
            Transport::Plain(stream) => stream,
            // PROCEED on an already-encrypted stream is rejected before it
            // can produce this directive.
            _ => unreachable!("TLS upgrade on a non-plaintext transport"),
        };

        let tls_stream =
            match tls::upgrade(tcp, &self.shared.domain, self.shared.allow_insecure).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(domain = %self.shared.domain, host = %self.host, error = %e, "TLS upgrade failed");
                    return Err(format!("tls: {}", e));
                }
            };
        info!(domain = %self.shared.domain, host = %self.host, "TLS established, restarting stream");

        self.transport = Transport::Tls(Box::new(tls_stream));
        self.parser = XmlParser::new();
        self.session = Session::secured();
        self.send_stream_opener()
            .await
            .map_err(|e| format!("stream reopen: {}", e))
    }

    async fn send_stream_opener(&mut self) -> std::io::Result<()> {
        let opener = stream_opener(&self.shared.domain, None);
        self.write_raw(&opener).await
    }

    pub(crate) async fn write_raw(&mut self, data: &str) -> std::io::Result<()> {
        debug!(domain = %self.shared.domain, data = %data, "Stream out");
        self.transport.write_all(data.as_bytes()).await
    }

    pub(crate) async fn write_element(&mut self, element: &Element) -> std::io::Result<()> {
        self.write_raw(&element.serialize()).await
    }

    /// Emit `<stream:error>` with the given defined condition. Teardown is
    /// expected to follow immediately.
    pub(crate) async fn send_stream_error(&mut self, condition: &str) -> std::io::Result<()> {
        warn!(domain = %self.shared.domain, host = %self.host, condition, "Sending stream error");
        let mut error = Element::new("error");
        error.prefix = "stream".to_string();
        error
            .attributes
            .insert("to".to_string(), self.shared.domain.clone());
        let mut child = Element::new(condition);
        child.default_namespace = Some(ns::STREAM_ERRORS.to_string());
        error.children.push(child);
        self.write_element(&error).await
    }

    /// Send a stream error and end the attempt over a protocol violation.
    pub(crate) async fn fail_stream(&mut self, condition: &str) -> StreamDirective {
        if let Err(e) = self.send_stream_error(condition).await {
            debug!(host = %self.host, error = %e, "Stream error write failed");
        }
        self.note_failure(format!("protocol violation: {}", condition));
        StreamDirective::Close { retry: true }
    }

    /// Record what went wrong for the cycle's exhaustion log. First cause
    /// wins.
    pub(crate) fn note_failure(&mut self, note: String) {
        if self.failure.is_none() {
            self.failure = Some(note);
        }
    }
}

/// Build the stream opener. `from` is optional before authentication
/// (RFC 6120 §4.7.1).
fn stream_opener(to: &str, from: Option<&str>) -> String {
    let mut opener = String::from("<?xml version='1.0' encoding='UTF-8'?><stream:stream");
    if let Some(from) = from {
        opener.push_str(&format!(" from='{}'", escape_attribute(from)));
    }
    opener.push_str(&format!(" to='{}'", escape_attribute(to)));
    opener.push_str(&format!(
        " version='1.0' xmlns='{}' xmlns:stream='{}'>",
        ns::JABBER_CLIENT,
        ns::STREAMS
    ));
    opener
}
