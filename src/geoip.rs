use std::time::Duration;

use scc::HashMap;

use crate::error::Error;
use crate::remote_addr::{self, RequestMetadata, TrustConfig};

pub const DEFAULT_ENDPOINT: &str = "https://www.gogeoip.com";

/// Only the JSON form of the lookup endpoint can be deserialized.
const RESPONSE_FORMAT: &str = "json";

const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A geolocation record for a single IP address.
///
/// Every field is optional; the lookup service omits whatever it cannot
/// determine. Fields this crate does not model are retained in `extra`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GeoInfo {
    pub ip: Option<String>,
    pub country_code: Option<String>,
    pub country_name: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub zip_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub time_zone: Option<String>,
    pub isp: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Client for a remote `{endpoint}/json/{ip}` geolocation service.
///
/// Lookups are memoized per distinct IP for the lifetime of the client,
/// including lookups that ultimately failed. The client is cheap to share
/// across tasks behind an `Arc`.
pub struct GeoIpClient {
    endpoint: String,
    retries: u32,
    retry_delay: Duration,
    client: reqwest::Client,
    cache: HashMap<String, Option<GeoInfo>>,
}

impl GeoIpClient {
    pub fn new() -> Result<GeoIpClient, Error> {
        GeoIpClient::with_endpoint(DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<GeoIpClient, Error> {
        Ok(GeoIpClient {
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            client: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            cache: HashMap::new(),
        })
    }

    /// Sets how many times a failed lookup is retried before giving up.
    pub fn retries(mut self, retries: u32) -> GeoIpClient {
        self.retries = retries;
        self
    }

    /// Sets the fixed delay between retry attempts.
    pub fn retry_delay(mut self, delay: Duration) -> GeoIpClient {
        self.retry_delay = delay;
        self
    }

    /// Looks up geolocation data for the given IP, consulting the cache first.
    ///
    /// `None` is a normal outcome: it means the service had no data or every
    /// attempt failed, and the same answer will be returned for this IP
    /// without further network traffic.
    pub async fn get(&self, ip: &str) -> Option<GeoInfo> {
        if let Some(cached) = self.cache.read_async(ip, |_, info| info.clone()).await {
            return cached;
        }

        let info = match self.call(ip).await {
            Ok(info) => Some(info),
            Err(e) => {
                log::warn!("geolocation lookup for {ip} failed: {e}");
                None
            }
        };

        let _ = self.cache.insert_async(ip.to_owned(), info.clone()).await;

        info
    }

    /// Resolves the client address for the given request and looks it up.
    pub async fn current(&self, meta: &RequestMetadata, config: &TrustConfig) -> Option<GeoInfo> {
        self.get(&remote_addr::resolve(meta, config)).await
    }

    async fn call(&self, ip: &str) -> Result<GeoInfo, Error> {
        let url = format!("{}/{RESPONSE_FORMAT}/{ip}", self.endpoint);

        let mut attempt = 0;
        loop {
            match self.try_call(&url).await {
                Ok(info) => return Ok(info),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    log::debug!("geolocation attempt {attempt} for {ip} failed, retrying: {e}");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_call(&self, url: &str) -> Result<GeoInfo, Error> {
        let body = self.client.get(url).send().await?.error_for_status()?.text().await?;

        Ok(serde_json::from_str(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    const BODY: &str = r#"{
        "ip": "203.0.113.5",
        "country_code": "DE",
        "country_name": "Germany",
        "city": "Berlin",
        "latitude": 52.52,
        "longitude": 13.405,
        "network": "203.0.113.0/24"
    }"#;

    #[test]
    fn test_deserialize_geo_info() {
        let info: GeoInfo = serde_json::from_str(BODY).unwrap();

        assert_eq!(info.ip.as_deref(), Some("203.0.113.5"));
        assert_eq!(info.country_code.as_deref(), Some("DE"));
        assert_eq!(info.city.as_deref(), Some("Berlin"));
        assert_eq!(info.latitude, Some(52.52));
        assert_eq!(info.region, None);
        assert_eq!(info.extra["network"], "203.0.113.0/24");
    }

    /// Serves one canned HTTP/1.1 JSON response, then shuts down.
    async fn serve_once(body: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;

            let res = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len(),
            );

            stream.write_all(res.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
        });

        addr
    }

    fn client(addr: SocketAddr) -> GeoIpClient {
        GeoIpClient::with_endpoint(format!("http://{addr}"))
            .unwrap()
            .retries(0)
            .retry_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_lookup() {
        let addr = serve_once(BODY).await;

        let info = client(addr).get("203.0.113.5").await.unwrap();

        assert_eq!(info.ip.as_deref(), Some("203.0.113.5"));
        assert_eq!(info.country_name.as_deref(), Some("Germany"));
    }

    #[tokio::test]
    async fn test_lookup_is_memoized() {
        // the server goes away after one response, so the second `get`
        // can only succeed from the cache
        let addr = serve_once(BODY).await;
        let client = client(addr);

        let first = client.get("203.0.113.5").await;
        assert!(first.is_some());

        let second = client.get("203.0.113.5").await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_bounded_retries_then_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        tokio::spawn(async move {
            // accept and hang up without responding
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });

        let client = GeoIpClient::with_endpoint(format!("http://{addr}"))
            .unwrap()
            .retries(2)
            .retry_delay(Duration::ZERO);

        assert_eq!(client.get("203.0.113.5").await, None);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        // the failure is memoized; no further connection attempts
        assert_eq!(client.get("203.0.113.5").await, None);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_malformed_response_yields_none() {
        let addr = serve_once("not json").await;

        assert_eq!(client(addr).get("203.0.113.5").await, None);
    }

    #[tokio::test]
    async fn test_current_resolves_then_looks_up() {
        let addr = serve_once(BODY).await;

        let mut meta = RequestMetadata::new();
        meta.set_remote_addr("203.0.113.5");

        let info = client(addr).current(&meta, &TrustConfig::new()).await.unwrap();
        assert_eq!(info.ip.as_deref(), Some("203.0.113.5"));
    }
}
