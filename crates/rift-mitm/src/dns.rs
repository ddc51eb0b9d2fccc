//! TTL cache in front of the system resolver.
//!
//! The cache is shared by the outbound transport (as the `HttpConnector`
//! resolver) and by the tunnel dialer. A lookup resolves the host part of a
//! `host:port` address, picks one address and dials that literal address.

use crate::error::ProxyError;
use crate::transport::ClientTrace;
use futures::future::BoxFuture;
use hyper_util::client::legacy::connect::dns::Name;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

pub const DEFAULT_DNS_TTL: Duration = Duration::from_secs(300);

struct CachedLookup {
    addrs: Arc<[IpAddr]>,
    expires_at: Instant,
}

struct Inner {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedLookup>>,
    trace: Option<Arc<dyn ClientTrace>>,
}

#[derive(Clone)]
pub struct DnsCache {
    inner: Arc<Inner>,
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(DEFAULT_DNS_TTL)
    }
}

impl std::fmt::Debug for DnsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsCache")
            .field("ttl", &self.inner.ttl)
            .field("entries", &self.inner.entries.read().len())
            .finish()
    }
}

impl DnsCache {
    pub fn new(ttl: Duration) -> Self {
        Self::build(ttl, None)
    }

    pub fn with_trace(ttl: Duration, trace: Arc<dyn ClientTrace>) -> Self {
        Self::build(ttl, Some(trace))
    }

    fn build(ttl: Duration, trace: Option<Arc<dyn ClientTrace>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ttl,
                entries: RwLock::new(HashMap::new()),
                trace,
            }),
        }
    }

    /// Returns every address known for `host`, resolving on a miss or after
    /// the entry expired.
    pub async fn fetch(&self, host: &str) -> io::Result<Arc<[IpAddr]>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Arc::from([ip]));
        }

        if let Some(entry) = self.inner.entries.read().get(host) {
            if entry.expires_at > Instant::now() {
                return Ok(Arc::clone(&entry.addrs));
            }
        }

        if let Some(trace) = &self.inner.trace {
            trace.dns_start(host);
        }
        let result = lookup(host).await;
        if let Some(trace) = &self.inner.trace {
            trace.dns_done(host, result.as_deref());
        }
        let addrs = result?;

        debug!(host, addrs = ?addrs, "resolved");
        let now = Instant::now();
        let mut entries = self.inner.entries.write();
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(
            host.to_string(),
            CachedLookup {
                addrs: Arc::clone(&addrs),
                expires_at: now + self.inner.ttl,
            },
        );
        drop(entries);
        Ok(addrs)
    }

    /// Resolves `host` and applies the address selection policy.
    pub async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        let addrs = self.fetch(host).await?;
        select_address(&addrs).ok_or_else(|| no_addresses(host))
    }

    /// Resolves a `host:port` address (`[v6]:port` accepted) to a socket address.
    pub async fn resolve_addr(&self, addr: &str) -> io::Result<SocketAddr> {
        let (host, port) = split_host_port(addr).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("missing port in address {addr}"),
            )
        })?;
        let ip = self.resolve(host).await?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Dials `addr` through the cache, bounded by `timeout`.
    pub async fn dial(&self, addr: &str, timeout: Duration) -> Result<TcpStream, ProxyError> {
        let connect = async {
            let target = self.resolve_addr(addr).await?;
            TcpStream::connect(target).await
        };
        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(source)) => Err(ProxyError::Connect {
                target: addr.to_string(),
                source,
            }),
            Err(_) => Err(ProxyError::ConnectTimeout {
                target: addr.to_string(),
                timeout,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn lookup(host: &str) -> io::Result<Arc<[IpAddr]>> {
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
        .await?
        .map(|addr| addr.ip())
        .collect();
    if addrs.is_empty() {
        return Err(no_addresses(host));
    }
    Ok(Arc::from(addrs))
}

fn no_addresses(host: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no addresses found for {host}"),
    )
}

/// The first address that is not IPv6, otherwise the last address.
pub fn select_address(addrs: &[IpAddr]) -> Option<IpAddr> {
    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.last())
        .copied()
}

/// Splits `host:port`, unwrapping a bracketed IPv6 host.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']')?,
        None if host.contains(':') => return None,
        None => host,
    };
    Some((host, port))
}

type ResolveFuture = BoxFuture<'static, io::Result<std::vec::IntoIter<SocketAddr>>>;

/// Lets the cache stand in for the `HttpConnector` resolver. The connector
/// fills in the port itself.
impl tower::Service<Name> for DnsCache {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = io::Error;
    type Future = ResolveFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let cache = self.clone();
        Box::pin(async move {
            let ip = cache.resolve(name.as_str()).await?;
            Ok(vec![SocketAddr::new(ip, 0)].into_iter())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_select_prefers_first_ipv4() {
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(select_address(&[v6, a, b]), Some(a));
    }

    #[test]
    fn test_select_falls_back_to_last() {
        let first = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let last = IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1));
        assert_eq!(select_address(&[first, last]), Some(last));
        assert_eq!(select_address(&[]), None);
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com:443"), Some(("example.com", 443)));
        assert_eq!(split_host_port("[::1]:8080"), Some(("::1", 8080)));
        assert_eq!(split_host_port("example.com"), None);
        assert_eq!(split_host_port("::1"), None);
        assert_eq!(split_host_port("example.com:https"), None);
    }

    #[tokio::test]
    async fn test_ip_literal_bypasses_cache() {
        let cache = DnsCache::default();
        let ip = cache.resolve("127.0.0.1").await.unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_is_cached() {
        let cache = DnsCache::default();
        let addr = cache.resolve_addr("localhost:80").await.unwrap();
        assert_eq!(addr.port(), 80);
        assert!(addr.ip().is_loopback());
        assert_eq!(cache.len(), 1);

        cache.resolve("localhost").await.unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_pruned_on_insert() {
        let cache = DnsCache::default();
        cache.inner.entries.write().insert(
            "gone.test".to_string(),
            CachedLookup {
                addrs: Arc::from([IpAddr::V4(Ipv4Addr::LOCALHOST)]),
                expires_at: Instant::now(),
            },
        );

        cache.resolve("localhost").await.unwrap();
        assert_eq!(cache.len(), 1);
        assert!(!cache.inner.entries.read().contains_key("gone.test"));
    }

    #[tokio::test]
    async fn test_dial_reports_refused_target() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = DnsCache::default()
            .dial(&addr, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Connect { .. }));
    }
}
