use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use http::HeaderMap;
use regex::Regex;

/// Metadata key holding the transport-layer peer address.
pub const REMOTE_ADDR: &str = "REMOTE_ADDR";

const DEFAULT_PROXY_HEADER: &str = "HTTP_X_FORWARDED_FOR";

const LOOPBACK: &str = "127.0.0.1";

/// Shortest plausible IP literal, e.g. `1.2.3.4`.
const MIN_IP_LEN: usize = 7;

/// A read-only snapshot of the request values address resolution looks at:
/// the transport-layer peer address plus any request headers, keyed in
/// CGI-style normalized form (see [`normalize_header`]).
///
/// Empty values are treated as absent.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    vars: HashMap<String, String>,
}

impl RequestMetadata {
    pub fn new() -> RequestMetadata {
        RequestMetadata::default()
    }

    /// Builds metadata from a connection's peer address and its request headers.
    ///
    /// Header values that are not valid UTF-8 are skipped.
    pub fn from_http(addr: SocketAddr, headers: &HeaderMap) -> RequestMetadata {
        let mut meta = RequestMetadata::new();

        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                meta.insert_header(name.as_str(), value);
            }
        }

        meta.set_remote_addr(addr.ip().to_string());
        meta
    }

    /// Inserts a header value under its normalized name.
    pub fn insert_header(&mut self, name: &str, value: impl Into<String>) {
        self.vars.insert(normalize_header(name), value.into());
    }

    pub fn set_remote_addr(&mut self, addr: impl Into<String>) {
        self.vars.insert(REMOTE_ADDR.to_owned(), addr.into());
    }

    /// Looks up a raw metadata entry, treating empty values as missing.
    pub fn get(&self, key: &str) -> Option<&str> {
        match self.vars.get(key) {
            Some(value) if !value.is_empty() => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn remote_addr(&self) -> Option<&str> {
        self.get(REMOTE_ADDR)
    }
}

/// Which sources of client-address information to believe.
///
/// Proxy trust is disabled by default: forwarding headers are trivially
/// spoofed by anyone, so the peer address is the only value worth believing
/// unless the peer itself is a proxy this deployment operates or trusts.
#[derive(Debug, Clone)]
pub struct TrustConfig {
    use_proxy: bool,
    trusted_proxies: HashSet<String>,
    proxy_header: String,
}

impl Default for TrustConfig {
    fn default() -> TrustConfig {
        TrustConfig {
            use_proxy: false,
            trusted_proxies: HashSet::new(),
            proxy_header: DEFAULT_PROXY_HEADER.to_owned(),
        }
    }
}

impl TrustConfig {
    pub fn new() -> TrustConfig {
        TrustConfig::default()
    }

    /// Enables or disables forwarding-header introspection.
    pub fn use_proxy(mut self, use_proxy: bool) -> TrustConfig {
        self.use_proxy = use_proxy;
        self
    }

    /// Replaces the set of trusted proxy IP literals.
    pub fn trusted_proxies<I>(mut self, proxies: I) -> TrustConfig
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.trusted_proxies = proxies.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the forwarding header to introspect, stored normalized
    /// (`"X-Forwarded-For"` and `"HTTP_X_FORWARDED_FOR"` are equivalent).
    pub fn proxy_header(mut self, header: &str) -> TrustConfig {
        self.proxy_header = normalize_header(header);
        self
    }
}

/// Normalizes a header name to its CGI-style metadata key:
/// uppercased, dashes replaced with underscores, `HTTP_`-prefixed.
///
/// Idempotent, accepts any string.
pub fn normalize_header(header: &str) -> String {
    let mut header = header.to_uppercase().replace('-', "_");

    if !header.starts_with("HTTP_") {
        header.insert_str(0, "HTTP_");
    }

    header
}

/// Attempts to extract the client address from the configured forwarding header.
///
/// Refuses outright unless proxy trust is enabled and the connecting peer is
/// either unknown or itself a trusted proxy; an untrusted peer never gets to
/// assert a forwarded address for someone else.
fn from_proxy(meta: &RequestMetadata, config: &TrustConfig) -> Option<String> {
    if !config.use_proxy {
        return None;
    }

    if let Some(peer) = meta.remote_addr() {
        if !config.trusted_proxies.contains(peer) {
            return None;
        }
    }

    let header = meta.get(&config.proxy_header)?;

    // Having removed every known, trusted proxy from the chain, the
    // right-most survivor is the first hop we cannot vouch for, so it is
    // treated as the originating client.
    header
        .split(',')
        .map(str::trim)
        .filter(|ip| !config.trusted_proxies.contains(*ip))
        .last()
        .map(str::to_owned)
}

/// Returns the most credible client IP literal for the request.
///
/// Tries the forwarding header under the rules of [`TrustConfig`], then the
/// peer address, degrading to `127.0.0.1` when neither yields a plausible
/// value. Never fails.
///
/// NOTE: This is a best-effort heuristic, not a guarantee. If a trusted proxy
/// fails to overwrite the forwarding header, a client can still forge entries
/// in it.
pub fn resolve(meta: &RequestMetadata, config: &TrustConfig) -> String {
    if let Some(ip) = from_proxy(meta, config) {
        if ip != LOOPBACK && ip.len() >= MIN_IP_LEN {
            return ip;
        }
    }

    match meta.remote_addr() {
        Some(addr) if addr.len() >= MIN_IP_LEN => addr.to_owned(),
        _ => LOOPBACK.to_owned(),
    }
}

/// Headers whose presence suggests the request passed through a proxy,
/// including a few non-standard agent markers. Advisory only; this list has
/// no bearing on [`resolve`]'s trust decisions.
static PROXY_HEADERS: [&str; 22] = [
    "HTTP_VIA",
    "VIA",
    "Proxy-Connection",
    "HTTP_X_FORWARDED_FOR",
    "HTTP_FORWARDED_FOR",
    "HTTP_X_FORWARDED",
    "HTTP_FORWARDED",
    "HTTP_CLIENT_IP",
    "HTTP_FORWARDED_FOR_IP",
    "X-PROXY-ID",
    "MT-PROXY-ID",
    "X-TINYPROXY",
    "X_FORWARDED_FOR",
    "FORWARDED_FOR",
    "X_FORWARDED",
    "FORWARDED",
    "CLIENT-IP",
    "CLIENT_IP",
    "PROXY-AGENT",
    "HTTP_X_CLUSTER_CLIENT_IP",
    "FORWARDED_FOR_IP",
    "HTTP_PROXY_CONNECTION",
];

/// Checks whether the request carries any evidence of having passed through
/// a proxy, trusted or not.
pub fn is_proxy(meta: &RequestMetadata) -> bool {
    PROXY_HEADERS.iter().any(|header| meta.get(header).is_some())
}

lazy_static::lazy_static! {
    static ref CRAWLER_SIGNATURE: Regex =
        Regex::new(r"(?i)bot|crawl|slurp|spider|mediapartners|bing").unwrap();
}

/// Checks a user-agent string against well-known crawler signatures.
pub fn is_crawler(user_agent: &str) -> bool {
    CRAWLER_SIGNATURE.is_match(user_agent)
}
