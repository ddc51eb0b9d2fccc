//! Pooled HTTP client used for relayed requests.

use super::parent::{authority_with_port, connect_tunnel, send_once};
use super::tls::client_config;
use super::{ClientTrace, ParentProxy, Transport};
use crate::body::ProxyBody;
use crate::config::TransportConfig;
use crate::dns::DnsCache;
use crate::error::ProxyError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use hyper::header::{HeaderValue, HOST};
use hyper::http::uri::{PathAndQuery, Scheme};
use hyper::{Request, Response, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::info;

/// Type alias for the HTTP client used by the transport.
pub type HttpClient =
    Client<HttpsConnector<TracedConnector<HttpConnector<DnsCache>>>, ProxyBody>;

/// Connector wrapper reporting connect start/done to a [`ClientTrace`].
#[derive(Clone)]
pub struct TracedConnector<C> {
    inner: C,
    trace: Option<Arc<dyn ClientTrace>>,
}

impl<C> TracedConnector<C> {
    pub fn new(inner: C, trace: Option<Arc<dyn ClientTrace>>) -> Self {
        Self { inner, trace }
    }
}

impl<C> tower::Service<Uri> for TracedConnector<C>
where
    C: tower::Service<Uri>,
    C::Future: Send + 'static,
    C::Error: std::fmt::Display,
{
    type Response = C::Response;
    type Error = C::Error;
    type Future = BoxFuture<'static, Result<C::Response, C::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let trace = self.trace.clone();
        if let Some(trace) = &trace {
            trace.connect_start(&dst);
        }
        let connecting = self.inner.call(dst.clone());
        Box::pin(async move {
            let result = connecting.await;
            if let Some(trace) = trace {
                let error = result.as_ref().err().map(|e| e.to_string());
                trace.connect_done(&dst, error.as_deref());
            }
            result
        })
    }
}

/// Default [`Transport`]: a pooled HTTP/1.1 client for direct requests and
/// dedicated connections for requests chained through a parent proxy.
pub struct HttpTransport {
    client: HttpClient,
    tls: Arc<ClientConfig>,
    dns: DnsCache,
    connect_timeout: Duration,
    tls_handshake_timeout: Duration,
}

impl HttpTransport {
    pub fn new(
        config: &TransportConfig,
        dns: DnsCache,
        trace: Option<Arc<dyn ClientTrace>>,
    ) -> Result<Self, ProxyError> {
        let connect_timeout = config.connect_timeout();

        let mut http_connector = HttpConnector::new_with_resolver(dns.clone());
        http_connector.set_keepalive(Some(Duration::from_secs(config.keepalive_timeout_secs)));
        http_connector.set_connect_timeout(Some(connect_timeout));
        http_connector.set_nodelay(true);
        http_connector.enforce_http(false); // Allow both HTTP and HTTPS

        let tls = client_config(config.tls_skip_verify)?;
        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls.clone())
            .https_or_http()
            .enable_http1()
            .wrap_connector(TracedConnector::new(http_connector, trace));

        let max_idle_per_host = if config.keepalive {
            config.max_idle_per_host
        } else {
            0
        };
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .pool_max_idle_per_host(max_idle_per_host)
            .build(https_connector);

        info!(
            "Connection pool configured (HTTP/1.1): max_idle_per_host={}, idle_timeout={}s, connect_timeout={}s",
            max_idle_per_host, config.idle_timeout_secs, config.connect_timeout_secs
        );

        Ok(Self {
            client,
            tls: Arc::new(tls),
            dns,
            connect_timeout,
            tls_handshake_timeout: config.tls_handshake_timeout(),
        })
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    async fn via_parent(
        &self,
        mut req: Request<ProxyBody>,
        parent: &Uri,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let parent_addr = authority_with_port(parent, 80)?;
        let stream = self.dns.dial(&parent_addr, self.connect_timeout).await?;

        if req.uri().scheme() != Some(&Scheme::HTTPS) {
            // Plain HTTP goes to the parent in absolute form.
            return send_once(TokioIo::new(stream), req).await;
        }

        let target = authority_with_port(req.uri(), 443)?;
        let tunnel = connect_tunnel(TokioIo::new(stream), &target).await?;

        let host = req
            .uri()
            .host()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or_else(|| ProxyError::InvalidTarget(req.uri().to_string()))?;
        let server_name =
            ServerName::try_from(host).map_err(|e| ProxyError::upstream(target.as_str(), e))?;
        let connecting = TlsConnector::from(Arc::clone(&self.tls))
            .connect(server_name, TokioIo::new(tunnel));
        let tls = tokio::time::timeout(self.tls_handshake_timeout, connecting)
            .await
            .map_err(|_| ProxyError::HandshakeTimeout {
                target: target.clone(),
                timeout: self.tls_handshake_timeout,
            })?
            .map_err(|source| ProxyError::Handshake {
                target: target.clone(),
                source,
            })?;

        into_origin_form(&mut req)?;
        send_once(TokioIo::new(tls), req).await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn round_trip(
        &self,
        mut req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        if let Some(ParentProxy(parent)) = req.extensions_mut().remove::<ParentProxy>() {
            return self.via_parent(req, &parent).await;
        }

        let target = req.uri().to_string();
        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| ProxyError::upstream(target, e))?;
        Ok(resp.map(|b| b.boxed()))
    }
}

/// Rewrites an absolute URI to origin form, keeping the authority in `Host`.
fn into_origin_form(req: &mut Request<ProxyBody>) -> Result<(), ProxyError> {
    if !req.headers().contains_key(HOST) {
        if let Some(authority) = req.uri().authority() {
            let value = HeaderValue::from_str(authority.as_str())
                .map_err(|_| ProxyError::InvalidTarget(req.uri().to_string()))?;
            req.headers_mut().insert(HOST, value);
        }
    }
    // An empty path reads back as "/".
    let path = req.uri().path_and_query().map_or("/", PathAndQuery::as_str);
    let uri: Uri = path
        .parse()
        .map_err(|_| ProxyError::InvalidTarget(req.uri().to_string()))?;
    *req.uri_mut() = uri;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body;

    #[test]
    fn test_into_origin_form_keeps_host() {
        let mut req = Request::builder()
            .uri("https://example.com:8443/api?q=1")
            .body(body::empty())
            .unwrap();
        into_origin_form(&mut req).unwrap();
        assert_eq!(req.uri(), "/api?q=1");
        assert_eq!(req.headers()[HOST], "example.com:8443");
    }

    #[test]
    fn test_into_origin_form_defaults_path() {
        let mut req = Request::builder()
            .uri("https://example.com")
            .header(HOST, "example.com")
            .body(body::empty())
            .unwrap();
        into_origin_form(&mut req).unwrap();
        assert_eq!(req.uri(), "/");
        assert_eq!(req.headers()[HOST], "example.com");
    }
}
