//! SRV-based server discovery (RFC 6120 §3.2).

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info, warn};

use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// How long the connect cycle waits for the SRV answer before falling back
/// to the bare domain.
pub const SRV_LOOKUP_TIMEOUT: Duration = Duration::from_secs(1);

/// Standard client-to-server port, used whenever SRV gives no port.
pub const FALLBACK_PORT: u16 = 5222;

/// One SRV answer, with the target's trailing root dot already trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub target: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

/// Source of SRV candidates for a domain.
///
/// Implementations return records as resolved, unordered, and log their own
/// failures; an empty answer stands in for every kind of miss and the engine
/// decides what it means.
#[async_trait]
pub trait CandidateResolver: Send + Sync {
    async fn resolve_srv(&self, domain: &str) -> Vec<SrvRecord>;
}

/// Looks up `_xmpp-client._tcp.<domain>` through the system resolver.
pub struct DnsResolver;

#[async_trait]
impl CandidateResolver for DnsResolver {
    async fn resolve_srv(&self, domain: &str) -> Vec<SrvRecord> {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                warn!(error = %e, "System resolver config unusable, using defaults");
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }
        };

        let service = format!("_xmpp-client._tcp.{}", domain);
        match resolver.srv_lookup(service.as_str()).await {
            Ok(lookup) => {
                let records: Vec<SrvRecord> = lookup
                    .iter()
                    .map(|srv| SrvRecord {
                        target: srv.target().to_string().trim_end_matches('.').to_string(),
                        port: srv.port(),
                        priority: srv.priority(),
                        weight: srv.weight(),
                    })
                    .collect();
                debug!(service = %service, count = records.len(), "SRV lookup finished");
                records
            }
            Err(e) => {
                info!(service = %service, error = %e, "SRV lookup failed, treating as no records");
                Vec::new()
            }
        }
    }
}

/// Fixed SRV answer, for tests and deployments with pinned servers.
pub struct StaticResolver {
    records: Vec<SrvRecord>,
}

impl StaticResolver {
    pub fn new(records: Vec<SrvRecord>) -> Self {
        StaticResolver { records }
    }
}

#[async_trait]
impl CandidateResolver for StaticResolver {
    async fn resolve_srv(&self, _domain: &str) -> Vec<SrvRecord> {
        self.records.clone()
    }
}

/// Order records for connection attempts: ascending priority, and within a
/// priority a weighted shuffle (RFC 2782). Every record draws a uniform
/// sample scaled by `1/weight` and the batch is sorted ascending on the
/// sample, so heavier records tend to sort earlier. Zero weights substitute
/// the smallest positive float, keeping the record eligible while any
/// weighted sibling almost surely beats it.
pub fn order_records(records: Vec<SrvRecord>) -> Vec<SrvRecord> {
    let mut rng = rand::thread_rng();
    let mut keyed: Vec<(f32, SrvRecord)> = records
        .into_iter()
        .map(|record| {
            let weight = if record.weight == 0 {
                f32::MIN_POSITIVE
            } else {
                f32::from(record.weight)
            };
            (rng.gen::<f32>() * (1.0 / weight), record)
        })
        .collect();

    keyed.sort_by(|a, b| a.1.priority.cmp(&b.1.priority).then(a.0.total_cmp(&b.0)));
    keyed.into_iter().map(|(_, record)| record).collect()
}

/// A single record whose target is `.` (or empty once the root dot is
/// trimmed) is the RFC 2782 way of saying the service is decidedly not
/// offered at this domain.
pub fn service_refused(records: &[SrvRecord]) -> bool {
    match records {
        [only] => only.target == "." || only.target.is_empty(),
        _ => false,
    }
}

/// Expand SRV records into ordered `(host, port)` connect candidates. No
/// records at all falls back to the domain itself on the standard port.
pub fn build_candidates(domain: &str, records: Vec<SrvRecord>) -> Vec<(String, u16)> {
    if records.is_empty() {
        info!(domain, port = FALLBACK_PORT, "No SRV records, trying the domain directly");
        return vec![(domain.to_string(), FALLBACK_PORT)];
    }
    order_records(records)
        .into_iter()
        .map(|record| (record.target, record.port))
        .collect()
}

/// Split a `see-other-host` referral into host and port. Only a trailing
/// `:<u16>` counts as a port; anything else, including a bare IPv6 literal,
/// keeps the whole string and the standard port.
pub fn parse_referral(referral: &str) -> (String, u16) {
    if let Some((host, port)) = referral.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            return (host.to_string(), port);
        }
    }
    (referral.to_string(), FALLBACK_PORT)
}
