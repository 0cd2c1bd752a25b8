//! Server resolution: `--server` input parsing and SRV record lookup.
//!
//! Turns the configured server (or the address domain) into an ordered list
//! of candidate endpoints. SRV candidates are sorted by priority (RFC 2782)
//! so the caller can fall through to the next one when a connect fails.

use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use super::ConnectionConfig;

pub const DEFAULT_TCP_PORT: u16 = 5222;
pub const DEFAULT_TLS_PORT: u16 = 5223;

fn elapsed_ms(start: std::time::Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// A concrete host/port to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmppEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// XMPP domain the endpoint was resolved for. When connecting via SRV the
    /// host is the SRV target, but the certificate must match the domain
    /// (RFC 6120 §13.7.2).
    pub domain: Option<String>,
}

impl XmppEndpoint {
    pub fn new(host: impl Into<String>, port: u16, use_tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls,
            domain: None,
        }
    }

    /// Name used for TLS SNI and certificate verification.
    pub fn tls_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }
}

/// Result of parsing a server input string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedServer {
    /// Explicit endpoint: host, port, TLS flag. Skips SRV.
    Direct(String, u16, bool),
    /// Domain only: resolve through SRV.
    Domain(String),
}

/// Split `host:port`. IPv6 literals need brackets (`[::1]:5222`); the
/// brackets are stripped from the host. A bare IPv6 literal has no port.
fn split_port(host_port: &str) -> Option<(&str, u16)> {
    if let Some(rest) = host_port.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        return port.parse().ok().map(|port| (host, port));
    }
    let (host, port) = host_port.rsplit_once(':')?;
    if host.contains(':') {
        return None;
    }
    port.parse().ok().map(|port| (host, port))
}

/// Host without the brackets of an IPv6 literal.
fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Parse a server input string.
///
/// - `tls://host[:port]`: direct TLS, port 5223 by default
/// - `tcp://host[:port]`: plain TCP, port 5222 by default
/// - `host:port`: direct, TLS when the port is 5223
/// - `domain`: SRV resolution
pub fn parse_server_input(server: &str) -> ParsedServer {
    let trimmed = server.trim();

    if let Some(rest) = trimmed.strip_prefix("tls://") {
        let (host, port) = split_port(rest).unwrap_or((strip_brackets(rest), DEFAULT_TLS_PORT));
        return ParsedServer::Direct(host.to_string(), port, true);
    }

    if let Some(rest) = trimmed.strip_prefix("tcp://") {
        let (host, port) = split_port(rest).unwrap_or((strip_brackets(rest), DEFAULT_TCP_PORT));
        return ParsedServer::Direct(host.to_string(), port, false);
    }

    if let Some((host, port)) = split_port(trimmed) {
        return ParsedServer::Direct(host.to_string(), port, port == DEFAULT_TLS_PORT);
    }

    ParsedServer::Domain(strip_brackets(trimmed).to_string())
}

/// Candidate endpoints for `config`, in connection-attempt order.
///
/// An explicit port disables SRV: the configured server (or the address
/// domain) is used as is.
pub async fn resolve_endpoints(config: &ConnectionConfig) -> Vec<XmppEndpoint> {
    let host = config.server_host();
    match config.port {
        Some(port) => vec![XmppEndpoint::new(host, port, config.use_tls)],
        None => resolve_xmpp_server(host, config.use_tls).await,
    }
}

/// Resolve `domain` through `_xmpps-client._tcp` (TLS) or `_xmpp-client._tcp`
/// (plain). Falls back to `domain:5223` / `domain:5222` when no usable record
/// exists, so the result is never empty.
pub async fn resolve_xmpp_server(domain: &str, use_tls: bool) -> Vec<XmppEndpoint> {
    let resolve_started = std::time::Instant::now();
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!(
                "Failed to load system DNS config: {}, falling back to default resolver",
                e
            );
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let service = if use_tls { "_xmpps-client" } else { "_xmpp-client" };
    let srv_name = format!("{}._tcp.{}", service, domain);
    let mut endpoints = lookup_srv(&resolver, &srv_name, domain, use_tls).await;

    if endpoints.is_empty() {
        let port = if use_tls { DEFAULT_TLS_PORT } else { DEFAULT_TCP_PORT };
        warn!(
            domain,
            resolve_total_ms = elapsed_ms(resolve_started),
            "No SRV records found, using fallback: {}:{}",
            domain,
            port
        );
        endpoints.push(XmppEndpoint::new(domain, port, use_tls));
    } else {
        info!(
            domain,
            total = endpoints.len(),
            resolve_total_ms = elapsed_ms(resolve_started),
            "SRV resolution complete"
        );
    }

    endpoints
}

async fn lookup_srv(
    resolver: &TokioAsyncResolver,
    srv_name: &str,
    domain: &str,
    use_tls: bool,
) -> Vec<XmppEndpoint> {
    let lookup_started = std::time::Instant::now();
    let lookup = match resolver.srv_lookup(srv_name).await {
        Ok(lookup) => lookup,
        Err(e) => {
            info!(
                domain,
                srv = %srv_name,
                lookup_ms = elapsed_ms(lookup_started),
                error = %e,
                "SRV lookup failed"
            );
            return Vec::new();
        }
    };

    let mut records: Vec<_> = lookup.iter().collect();
    // Priority ascending, then weight descending
    records.sort_by(|a, b| {
        a.priority()
            .cmp(&b.priority())
            .then(b.weight().cmp(&a.weight()))
    });

    let mut endpoints = Vec::with_capacity(records.len());
    for r in records {
        let target = r.target().to_string().trim_end_matches('.').to_string();
        // RFC 2782: target "." means the service is explicitly unavailable
        if target.is_empty() {
            info!(domain, "SRV record with '.' target, skipping");
            continue;
        }
        info!(domain, host = %target, port = r.port(),
            priority = r.priority(), weight = r.weight(),
            "SRV record");
        endpoints.push(XmppEndpoint {
            host: target,
            port: r.port(),
            use_tls,
            domain: Some(domain.to_string()),
        });
    }
    info!(
        domain,
        srv = %srv_name,
        count = endpoints.len(),
        lookup_ms = elapsed_ms(lookup_started),
        "SRV resolved"
    );
    endpoints
}
