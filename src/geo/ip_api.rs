//! Remote geo lookups against an ip-api.com compatible JSON endpoint.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use super::provider::{GeoProvider, GeoResult, PRIVATE_COUNTRY_CODE};
use crate::error::{QuotaGuardError, Result};

/// Public ip-api.com endpoint.
pub const DEFAULT_ENDPOINT: &str = "http://ip-api.com/json";
/// How long a lookup stays cached.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);
/// Upper bound on one remote lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Inserts between full sweeps of stale cache entries.
const PURGE_EVERY: usize = 256;

const FIELDS: &str = "status,message,country,countryCode,region,city,lat,lon,timezone";

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(flatten)]
    result: GeoResult,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: Option<GeoResult>,
    stored_at: Instant,
}

/// Whether `ip` is loopback or in a private range.
pub fn is_private_ip(ip: &str) -> bool {
    match ip.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_private() || v4.is_loopback(),
        Ok(IpAddr::V6(v6)) => v6.is_loopback(),
        Err(_) => false,
    }
}

/// Caching client for a remote geo-IP service.
///
/// Private and loopback addresses are answered locally. Answers from the
/// service, including "fail" answers, are cached per address for the TTL.
/// Transport and decode errors are not cached and resolve to nothing.
/// Stale entries are dropped when read and swept every few inserts, so the
/// cache only holds addresses seen within the last TTL.
pub struct IpApiProvider {
    client: reqwest::Client,
    endpoint: String,
    cache: DashMap<String, CacheEntry>,
    cache_ttl: Duration,
    inserts: AtomicUsize,
}

impl IpApiProvider {
    /// Provider against the public endpoint with default timeout and TTL.
    pub fn new() -> Result<Self> {
        Self::with_settings(DEFAULT_ENDPOINT, DEFAULT_LOOKUP_TIMEOUT, DEFAULT_CACHE_TTL)
    }

    pub fn with_settings(endpoint: &str, timeout: Duration, cache_ttl: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QuotaGuardError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            cache: DashMap::new(),
            cache_ttl,
            inserts: AtomicUsize::new(0),
        })
    }

    /// Drop every cached lookup.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Number of cached lookups, fresh or stale.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Remove every entry older than the TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.cache.len();
        self.cache
            .retain(|_, entry| entry.stored_at.elapsed() < self.cache_ttl);
        let removed = before.saturating_sub(self.cache.len());
        if removed > 0 {
            debug!(removed, remaining = self.cache.len(), "Purged stale geo cache entries");
        }
        removed
    }

    fn cached(&self, ip: &str) -> Option<Option<GeoResult>> {
        if let Some(entry) = self.cache.get(ip) {
            if entry.stored_at.elapsed() < self.cache_ttl {
                return Some(entry.result.clone());
            }
        }
        self.cache
            .remove_if(ip, |_, entry| entry.stored_at.elapsed() >= self.cache_ttl);
        None
    }

    fn store(&self, ip: &str, result: Option<GeoResult>) {
        self.cache.insert(
            ip.to_string(),
            CacheEntry {
                result,
                stored_at: Instant::now(),
            },
        );
        if self.inserts.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge_expired();
        }
    }

    async fn fetch(&self, ip: &str) -> std::result::Result<IpApiResponse, reqwest::Error> {
        let url = format!("{}/{}?fields={}", self.endpoint, ip, FIELDS);
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<IpApiResponse>()
            .await
    }
}

#[async_trait]
impl GeoProvider for IpApiProvider {
    async fn lookup(&self, ip: &str) -> Result<Option<GeoResult>> {
        if is_private_ip(ip) {
            return Ok(Some(GeoResult::country(PRIVATE_COUNTRY_CODE, "Private/Local")));
        }

        if ip.trim().parse::<IpAddr>().is_err() {
            trace!(ip = %ip, "Not an IP address, skipping remote lookup");
            return Ok(None);
        }

        if let Some(hit) = self.cached(ip) {
            trace!(ip = %ip, "Geo cache hit");
            return Ok(hit);
        }

        let result = match self.fetch(ip).await {
            Ok(response) if response.status == "success" => Some(response.result),
            Ok(response) => {
                debug!(
                    ip = %ip,
                    message = response.message.as_deref().unwrap_or(""),
                    "Geo service could not resolve address"
                );
                None
            }
            Err(e) => {
                warn!(ip = %ip, error = %e, "Geo lookup failed");
                return Ok(None);
            }
        };

        self.store(ip, result.clone());

        Ok(result)
    }

    fn name(&self) -> &str {
        "ip-api"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `body` with `status` to every connection, counting requests.
    async fn stub_server(status: &'static str, body: &'static str) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (addr, hits)
    }

    fn provider_for(addr: SocketAddr) -> IpApiProvider {
        IpApiProvider::with_settings(
            &format!("http://{}/json", addr),
            Duration::from_secs(2),
            DEFAULT_CACHE_TTL,
        )
        .unwrap()
    }

    #[test]
    fn test_is_private_ip() {
        assert!(is_private_ip("10.1.2.3"));
        assert!(is_private_ip("172.16.0.1"));
        assert!(is_private_ip("172.31.255.255"));
        assert!(is_private_ip("192.168.0.10"));
        assert!(is_private_ip("127.0.0.1"));
        assert!(is_private_ip("::1"));
        assert!(!is_private_ip("172.32.0.1"));
        assert!(!is_private_ip("8.8.8.8"));
        assert!(!is_private_ip("garbage"));
    }

    #[tokio::test]
    async fn test_private_ip_skips_network() {
        let (addr, hits) = stub_server("200 OK", r#"{"status":"success","countryCode":"US"}"#).await;
        let provider = provider_for(addr);

        let result = provider.lookup("192.168.1.1").await.unwrap().unwrap();

        assert_eq!(result.country_code.as_deref(), Some("XX"));
        assert_eq!(result.country.as_deref(), Some("Private/Local"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lookup_parses_and_caches() {
        let body = r#"{"status":"success","country":"Germany","countryCode":"DE","region":"BE","city":"Berlin","lat":52.52,"lon":13.405,"timezone":"Europe/Berlin"}"#;
        let (addr, hits) = stub_server("200 OK", body).await;
        let provider = provider_for(addr);

        let first = provider.lookup("85.214.132.117").await.unwrap().unwrap();
        assert_eq!(first.country_code.as_deref(), Some("DE"));
        assert_eq!(first.city.as_deref(), Some("Berlin"));
        assert_eq!(first.timezone.as_deref(), Some("Europe/Berlin"));
        assert_eq!(first.lat, Some(52.52));

        let second = provider.lookup("85.214.132.117").await.unwrap().unwrap();
        assert_eq!(second, first);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        provider.clear_cache();
        assert_eq!(provider.cached_len(), 0);
        provider.lookup("85.214.132.117").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_service_failure_is_cached_as_unknown() {
        let (addr, hits) =
            stub_server("200 OK", r#"{"status":"fail","message":"reserved range"}"#).await;
        let provider = provider_for(addr);

        assert!(provider.lookup("203.0.113.5").await.unwrap().is_none());
        assert!(provider.lookup("203.0.113.5").await.unwrap().is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_http_error_is_unknown_and_not_cached() {
        let (addr, hits) = stub_server("503 Service Unavailable", "{}").await;
        let provider = provider_for(addr);

        assert!(provider.lookup("203.0.113.5").await.unwrap().is_none());
        assert_eq!(provider.cached_len(), 0);
        provider.lookup("203.0.113.5").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_malformed_body_is_unknown() {
        let (addr, _hits) = stub_server("200 OK", "not json").await;
        let provider = provider_for(addr);

        assert!(provider.lookup("203.0.113.5").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unknown() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = provider_for(addr);
        assert!(provider.lookup("203.0.113.5").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_entries_are_dropped() {
        let (addr, _hits) = stub_server("200 OK", r#"{"status":"success","countryCode":"FR"}"#).await;
        let provider = IpApiProvider::with_settings(
            &format!("http://{}/json", addr),
            Duration::from_secs(2),
            Duration::from_millis(20),
        )
        .unwrap();

        provider.lookup("51.15.0.1").await.unwrap();
        provider.lookup("51.15.0.2").await.unwrap();
        provider.lookup("51.15.0.3").await.unwrap();
        assert_eq!(provider.cached_len(), 3);
        assert_eq!(provider.purge_expired(), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;

        // A read of a stale entry removes it.
        assert!(provider.cached("51.15.0.1").is_none());
        assert_eq!(provider.cached_len(), 2);

        assert_eq!(provider.purge_expired(), 2);
        assert_eq!(provider.cached_len(), 0);
    }

    #[tokio::test]
    async fn test_inserts_trigger_periodic_purge() {
        let provider = IpApiProvider::with_settings(
            "http://127.0.0.1:9/json",
            Duration::from_secs(2),
            Duration::from_millis(10),
        )
        .unwrap();

        for i in 0..PURGE_EVERY - 1 {
            provider.store(&format!("198.51.100.{}", i % 250), None);
            provider.store(&format!("203.0.{}.1", i), None);
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        let before = provider.cached_len();
        assert!(before > 1);

        // Enough inserts to cross the next sweep boundary.
        for i in 0..PURGE_EVERY {
            provider.store(&format!("192.0.2.{}", i % 250), None);
        }

        assert!(provider.cached_len() <= 250);
        assert!(provider.cache.iter().all(|e| e.key().starts_with("192.0.2.")));
    }

    #[tokio::test]
    async fn test_expired_cache_entry_refetches() {
        let (addr, hits) = stub_server("200 OK", r#"{"status":"success","countryCode":"FR"}"#).await;
        let provider = IpApiProvider::with_settings(
            &format!("http://{}/json", addr),
            Duration::from_secs(2),
            Duration::from_millis(20),
        )
        .unwrap();

        provider.lookup("51.15.0.1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        provider.lookup("51.15.0.1").await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
