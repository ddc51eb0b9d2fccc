//! Request entry point, routing and the plain HTTP relay.

use super::exchange::Exchange;
use super::headers::strip_hop_headers;
use crate::body::{status_response, ProxyBody};
use crate::ca::CertificateAuthority;
use crate::config::TransportConfig;
use crate::context::{RequestContext, RequestHead};
use crate::delegate::{DefaultDelegate, Delegate};
use crate::dns::{DnsCache, DEFAULT_DNS_TTL};
use crate::error::ProxyError;
use crate::pool::{buffer_pool, BufferPool, Pool, DEFAULT_POOL_CAPACITY};
use crate::transport::{ClientTrace, HttpTransport, ParentProxy, Transport};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::HOST;
use hyper::http::uri::{PathAndQuery, Scheme};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode, Uri};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How an inbound request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Relay as a plain HTTP request.
    Http,
    /// Take over the connection: raw tunnel or TLS interception.
    Tunnel,
}

/// Tunnel for `https` targets and for `CONNECT` to port 443; everything
/// else is relayed as HTTP.
pub fn route<B>(req: &Request<B>) -> Route {
    let uri = req.uri();
    if uri.scheme() == Some(&Scheme::HTTPS)
        || (req.method() == Method::CONNECT && uri.port_u16() == Some(443))
    {
        Route::Tunnel
    } else {
        Route::Http
    }
}

pub(crate) struct Pools {
    pub(crate) contexts: Pool<Box<RequestContext>>,
    pub(crate) requests: Pool<RequestHead>,
    pub(crate) buffers: BufferPool,
}

impl Pools {
    fn new(capacity: usize) -> Self {
        Self {
            contexts: Pool::new(capacity, Box::default),
            requests: Pool::new(capacity, RequestHead::default),
            buffers: buffer_pool(capacity),
        }
    }
}

pub(crate) struct ProxyInner {
    pub(crate) delegate: Arc<dyn Delegate>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) authority: Option<Arc<CertificateAuthority>>,
    pub(crate) dns: DnsCache,
    pub(crate) pools: Pools,
    pub(crate) client_conn_num: AtomicUsize,
    pub(crate) connect_timeout: Duration,
    pub(crate) handshake_timeout: Duration,
}

/// Intercepting forward proxy. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder::default()
    }

    /// Handles one inbound request. The request must still carry hyper's
    /// upgrade handle for tunnels to work.
    pub async fn serve<B>(&self, req: Request<B>, remote_addr: Option<SocketAddr>) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let mut req = req.map(|b| b.boxed());
        fill_authority(&mut req);
        let upgrade = req.extensions_mut().remove::<OnUpgrade>();

        let mut exchange = Exchange::begin(Arc::clone(&self.inner), req, remote_addr, upgrade);
        let delegate = &self.inner.delegate;

        delegate.connect(&mut exchange);
        if exchange.is_aborted() {
            return exchange.aborted();
        }
        delegate.auth(&mut exchange);
        if exchange.is_aborted() {
            return exchange.aborted();
        }

        match route(exchange.request()) {
            Route::Tunnel => Arc::clone(&self.inner).tunnel_proxy(exchange).await,
            Route::Http => self.inner.http_proxy(exchange).await,
        }
    }

    /// Runs `before_request`, the network exchange (unless a hook supplied a
    /// response) and `before_response`, then hands the outcome to `respond`.
    /// Returns `None` when a hook aborted.
    pub async fn do_request<F, R>(&self, ctx: &mut RequestContext, respond: F) -> Option<R>
    where
        F: FnOnce(&mut RequestContext, Result<Response<ProxyBody>, ProxyError>) -> R + Send,
    {
        self.inner.do_request(ctx, respond).await
    }

    /// Relays bytes both ways until either side finishes, then closes both.
    pub async fn transfer<A, B>(&self, client: A, server: B, target: &str)
    where
        A: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
        B: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
    {
        self.inner.transfer(client, server, target).await
    }

    /// Exchanges (requests or tunnels) currently in flight.
    pub fn client_conn_num(&self) -> usize {
        self.inner.client_conn_num.load(Ordering::SeqCst)
    }

    pub fn dns(&self) -> &DnsCache {
        &self.inner.dns
    }

    pub fn authority(&self) -> Option<&CertificateAuthority> {
        self.inner.authority.as_deref()
    }
}

impl ProxyInner {
    async fn http_proxy(&self, mut exchange: Exchange) -> Response<ProxyBody> {
        if let Err(err) = set_scheme(exchange.request_mut(), Scheme::HTTP) {
            self.delegate.error_log(&err);
            return exchange.attach(status_response(StatusCode::BAD_GATEWAY));
        }
        debug!(uri = %exchange.request().uri(), "relaying");

        let relayed = self.do_request(&mut exchange, self.relay_or_bad_gateway()).await;
        match relayed {
            Some(resp) => exchange.attach(resp),
            None => exchange.aborted(),
        }
    }

    /// Response callback shared by the HTTP relay and decrypted requests.
    pub(crate) fn relay_or_bad_gateway(
        &self,
    ) -> impl FnOnce(&mut RequestContext, Result<Response<ProxyBody>, ProxyError>) -> Response<ProxyBody>
           + Send
           + '_ {
        move |_, result| match result {
            Ok(resp) => resp,
            Err(err) => {
                self.delegate.error_log(&err);
                status_response(StatusCode::BAD_GATEWAY)
            }
        }
    }

    pub(crate) async fn do_request<F, R>(&self, ctx: &mut RequestContext, respond: F) -> Option<R>
    where
        F: FnOnce(&mut RequestContext, Result<Response<ProxyBody>, ProxyError>) -> R + Send,
    {
        self.delegate.before_request(ctx);
        if ctx.is_aborted() {
            return None;
        }

        if ctx.is_fail_fast() || ctx.is_need_mock() {
            let result = ctx
                .take_response()
                .ok_or_else(|| ProxyError::MissingMockResponse {
                    target: ctx.request().uri().to_string(),
                });
            return Some(respond(ctx, result));
        }

        let mut head = self.pools.requests.get();
        head.copy_from(ctx.request(), ctx.remote_addr());
        head.strip_hop_headers();
        let mut outbound = head.build_request(ctx.take_body());

        let mut result = match self.delegate.parent_proxy(&outbound) {
            Ok(parent) => {
                if let Some(parent) = parent {
                    outbound.extensions_mut().insert(ParentProxy(parent));
                }
                self.transport.round_trip(outbound).await
            }
            Err(source) => Err(ProxyError::ParentProxy {
                target: outbound.uri().to_string(),
                source,
            }),
        };
        self.pools.requests.put(head);

        self.delegate.before_response(ctx, &mut result);
        if ctx.is_aborted() {
            return None;
        }
        if let Ok(resp) = result.as_mut() {
            strip_hop_headers(resp.headers_mut());
        }
        Some(respond(ctx, result))
    }
}

/// Fills a missing URI authority from the `Host` header.
fn fill_authority<B>(req: &mut Request<B>) {
    if req.uri().authority().is_some() {
        return;
    }
    let Some(host) = req.headers().get(HOST).and_then(|h| h.to_str().ok()) else {
        return;
    };
    let path = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    if let Ok(uri) = Uri::builder()
        .scheme(Scheme::HTTP)
        .authority(host)
        .path_and_query(path)
        .build()
    {
        *req.uri_mut() = uri;
    }
}

/// Replaces the URI scheme, keeping authority and path.
fn set_scheme<B>(req: &mut Request<B>, scheme: Scheme) -> Result<(), ProxyError> {
    let mut parts = req.uri().clone().into_parts();
    if parts.authority.is_none() {
        return Err(ProxyError::InvalidTarget(req.uri().to_string()));
    }
    parts.scheme = Some(scheme);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    *req.uri_mut() =
        Uri::from_parts(parts).map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;
    Ok(())
}

/// Builder for [`Proxy`].
pub struct ProxyBuilder {
    delegate: Arc<dyn Delegate>,
    transport: Option<Arc<dyn Transport>>,
    authority: Option<Arc<CertificateAuthority>>,
    trace: Option<Arc<dyn ClientTrace>>,
    transport_config: TransportConfig,
    dns_ttl: Duration,
    handshake_timeout: Duration,
    pool_capacity: usize,
}

impl Default for ProxyBuilder {
    fn default() -> Self {
        Self {
            delegate: Arc::new(DefaultDelegate),
            transport: None,
            authority: None,
            trace: None,
            transport_config: TransportConfig::default(),
            dns_ttl: DEFAULT_DNS_TTL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl ProxyBuilder {
    pub fn delegate(mut self, delegate: Arc<dyn Delegate>) -> Self {
        self.delegate = delegate;
        self
    }

    /// Replaces the default pooled HTTP transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Decrypts CONNECT tunnels with certificates from `authority`.
    pub fn decrypt_https(mut self, authority: CertificateAuthority) -> Self {
        self.authority = Some(Arc::new(authority));
        self
    }

    pub fn client_trace(mut self, trace: Arc<dyn ClientTrace>) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    pub fn disable_keep_alive(mut self, disable: bool) -> Self {
        self.transport_config.keepalive = !disable;
        self
    }

    pub fn dns_ttl(mut self, ttl: Duration) -> Self {
        self.dns_ttl = ttl;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<Proxy, ProxyError> {
        let dns = match &self.trace {
            Some(trace) => DnsCache::with_trace(self.dns_ttl, Arc::clone(trace)),
            None => DnsCache::new(self.dns_ttl),
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(
                &self.transport_config,
                dns.clone(),
                self.trace,
            )?),
        };

        Ok(Proxy {
            inner: Arc::new(ProxyInner {
                delegate: self.delegate,
                transport,
                authority: self.authority,
                dns,
                pools: Pools::new(self.pool_capacity),
                client_conn_num: AtomicUsize::new(0),
                connect_timeout: self.transport_config.connect_timeout(),
                handshake_timeout: self.handshake_timeout,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body;

    fn request(method: Method, uri: &str) -> Request<()> {
        Request::builder().method(method).uri(uri).body(()).unwrap()
    }

    #[test]
    fn test_route() {
        assert_eq!(route(&request(Method::CONNECT, "example.com:443")), Route::Tunnel);
        assert_eq!(route(&request(Method::GET, "https://example.com/")), Route::Tunnel);
        assert_eq!(route(&request(Method::GET, "http://example.com/")), Route::Http);
        assert_eq!(route(&request(Method::CONNECT, "example.com:8443")), Route::Http);
    }

    #[test]
    fn test_fill_authority_from_host() {
        let mut req = Request::builder()
            .uri("/path?q=1")
            .header(HOST, "example.com:8080")
            .body(())
            .unwrap();
        fill_authority(&mut req);
        assert_eq!(req.uri(), "http://example.com:8080/path?q=1");
    }

    #[test]
    fn test_fill_authority_keeps_absolute_uri() {
        let mut req = Request::builder()
            .uri("http://origin.test/a")
            .header(HOST, "other.test")
            .body(())
            .unwrap();
        fill_authority(&mut req);
        assert_eq!(req.uri(), "http://origin.test/a");
    }

    #[test]
    fn test_set_scheme() {
        let mut req = request(Method::GET, "https://example.com/a?b");
        set_scheme(&mut req, Scheme::HTTP).unwrap();
        assert_eq!(req.uri(), "http://example.com/a?b");

        let mut req = request(Method::CONNECT, "example.com:8443");
        set_scheme(&mut req, Scheme::HTTP).unwrap();
        assert_eq!(req.uri(), "http://example.com:8443/");

        let mut req = request(Method::GET, "/no-host");
        assert!(set_scheme(&mut req, Scheme::HTTP).is_err());
    }

    #[tokio::test]
    async fn test_builder_defaults() {
        let proxy = Proxy::builder().build().unwrap();
        assert_eq!(proxy.client_conn_num(), 0);
        assert!(proxy.authority().is_none());
        assert!(proxy.dns().is_empty());

        let resp = proxy
            .serve(
                Request::builder()
                    .uri("/relative-without-host")
                    .body(body::empty())
                    .unwrap(),
                None,
            )
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        drop(resp);
        assert_eq!(proxy.client_conn_num(), 0);
    }
}
