//! CONNECT handling: raw tunnels and TLS interception.

use super::engine::ProxyInner;
use super::exchange::Exchange;
use crate::body::{self, status_response, ProxyBody};
use crate::ca::CertificateAuthority;
use crate::error::ProxyError;
use crate::transport::parent::{authority_with_port, connect_tunnel};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::HOST;
use hyper::http::uri::{Authority, PathAndQuery, Scheme};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// Where a raw tunnel's bytes go.
enum Upstream {
    /// Dial this `host:port` once the client's stream is ready.
    Direct(String),
    /// Already-established tunnel through the parent proxy.
    Parent(Upgraded),
}

/// `200 Connection established`.
fn connection_established() -> Response<ProxyBody> {
    let mut resp = Response::new(body::empty());
    resp.extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection established"));
    resp
}

impl ProxyInner {
    pub(crate) async fn tunnel_proxy(self: Arc<Self>, mut exchange: Exchange) -> Response<ProxyBody> {
        let target = exchange
            .request()
            .uri()
            .authority()
            .map(Authority::to_string)
            .unwrap_or_else(|| exchange.request().uri().to_string());

        let Some(upgrade) = exchange.take_upgrade() else {
            self.delegate
                .error_log(&ProxyError::HijackUnsupported(target));
            return exchange.attach(status_response(StatusCode::BAD_GATEWAY));
        };

        let parent = match self.delegate.parent_proxy(exchange.request()) {
            Ok(parent) => parent,
            Err(source) => {
                self.delegate
                    .error_log(&ProxyError::ParentProxy { target, source });
                return exchange.attach(status_response(StatusCode::BAD_GATEWAY));
            }
        };

        if let Some(authority) = self.authority.clone() {
            // The decrypted request reaches the parent through the transport.
            tokio::spawn(self.decrypt(exchange, upgrade, authority, target));
            return connection_established();
        }

        let dial_addr = match authority_with_port(exchange.request().uri(), 443) {
            Ok(addr) => addr,
            Err(err) => {
                self.delegate.error_log(&err);
                return exchange.attach(status_response(StatusCode::BAD_GATEWAY));
            }
        };

        let upstream = match parent {
            None => Upstream::Direct(dial_addr),
            Some(parent) => match self.dial_parent(&parent, &dial_addr).await {
                Ok(tunnel) => Upstream::Parent(tunnel),
                Err(err) => {
                    let status = match &err {
                        ProxyError::ParentRefused { status, .. } => *status,
                        _ => StatusCode::BAD_GATEWAY,
                    };
                    self.delegate.error_log(&err);
                    return exchange.attach(status_response(status));
                }
            },
        };

        tokio::spawn(self.relay(exchange, upgrade, upstream, target));
        connection_established()
    }

    async fn dial_parent(&self, parent: &Uri, target: &str) -> Result<Upgraded, ProxyError> {
        let parent_addr = authority_with_port(parent, 80)?;
        let stream = self.dns.dial(&parent_addr, self.connect_timeout).await?;
        debug!(parent = %parent_addr, target, "opening tunnel through parent proxy");
        connect_tunnel(TokioIo::new(stream), target).await
    }

    /// Raw tunnel: hooks see the exchange once, then bytes flow untouched.
    async fn relay(
        self: Arc<Self>,
        mut exchange: Exchange,
        upgrade: OnUpgrade,
        upstream: Upstream,
        target: String,
    ) {
        let client = match upgrade.await {
            Ok(upgraded) => TokioIo::new(upgraded),
            Err(source) => {
                self.delegate
                    .error_log(&ProxyError::Upgrade { target, source });
                return;
            }
        };

        match upstream {
            Upstream::Direct(addr) => {
                let server = match self.dns.dial(&addr, self.connect_timeout).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        self.delegate.error_log(&err);
                        return;
                    }
                };
                self.tunnel_connected(&mut exchange);
                self.transfer(client, server, &target).await;
            }
            Upstream::Parent(tunnel) => {
                self.tunnel_connected(&mut exchange);
                self.transfer(client, TokioIo::new(tunnel), &target).await;
            }
        }
    }

    /// Observability hooks for a raw tunnel. Hooks cannot stop the relay
    /// from here; the result they see is a synthetic `200 OK` unless they
    /// supplied their own response.
    fn tunnel_connected(&self, exchange: &mut Exchange) {
        exchange.set_tunnel_proxy();
        self.delegate.before_request(exchange);

        let mut result = if exchange.is_fail_fast() || exchange.is_need_mock() {
            exchange
                .take_response()
                .ok_or_else(|| ProxyError::MissingMockResponse {
                    target: exchange.request().uri().to_string(),
                })
        } else {
            Ok(Response::new(body::empty()))
        };
        self.delegate.before_response(exchange, &mut result);
    }

    /// TLS interception: terminate the client's TLS with a certificate for
    /// the CONNECT host and relay the one request read off the stream.
    async fn decrypt(
        self: Arc<Self>,
        exchange: Exchange,
        upgrade: OnUpgrade,
        authority: Arc<CertificateAuthority>,
        target: String,
    ) {
        let config = match authority.generate_tls_config(&target) {
            Ok(config) => config,
            Err(source) => {
                self.delegate
                    .error_log(&ProxyError::Certificate { target, source });
                return;
            }
        };

        let client = match upgrade.await {
            Ok(upgraded) => TokioIo::new(upgraded),
            Err(source) => {
                self.delegate
                    .error_log(&ProxyError::Upgrade { target, source });
                return;
            }
        };

        let accepting = TlsAcceptor::from(config).accept(client);
        let tls = match tokio::time::timeout(self.handshake_timeout, accepting).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(source)) => {
                self.delegate
                    .error_log(&ProxyError::Handshake { target, source });
                return;
            }
            Err(_) => {
                self.delegate.error_log(&ProxyError::HandshakeTimeout {
                    target,
                    timeout: self.handshake_timeout,
                });
                return;
            }
        };

        // One request per tunnel; the exchange is handed to it.
        let slot = Mutex::new(Some(exchange));
        let proxy = Arc::clone(&self);
        let connect_target = target.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let proxy = Arc::clone(&proxy);
            let exchange = slot.lock().take();
            let connect_target = connect_target.clone();
            async move {
                Ok::<_, Infallible>(
                    proxy
                        .decrypted_request(exchange, req, &connect_target)
                        .await,
                )
            }
        });

        let served = http1::Builder::new()
            .keep_alive(false)
            .serve_connection(TokioIo::new(tls), service)
            .await;
        if let Err(source) = served {
            if !source.is_incomplete_message() {
                self.delegate
                    .error_log(&ProxyError::Serve { target, source });
            }
        }
    }

    async fn decrypted_request(
        &self,
        exchange: Option<Exchange>,
        req: Request<Incoming>,
        connect_target: &str,
    ) -> Response<ProxyBody> {
        let Some(mut exchange) = exchange else {
            return status_response(StatusCode::BAD_GATEWAY);
        };

        let mut req = req.map(|b| b.boxed());
        if let Err(err) = rewrite_decrypted_uri(&mut req, connect_target) {
            self.delegate.error_log(&err);
            return exchange.attach(status_response(StatusCode::BAD_GATEWAY));
        }
        debug!(uri = %req.uri(), "decrypted request");
        exchange.replace_request(req);

        let relayed = self
            .do_request(&mut exchange, self.relay_or_bad_gateway())
            .await;
        match relayed {
            Some(resp) => exchange.attach(resp),
            None => exchange.aborted(),
        }
    }

    /// Copies both directions through pooled buffers. When either direction
    /// ends, both streams are dropped, which closes them.
    pub(crate) async fn transfer<A, B>(&self, client: A, server: B, target: &str)
    where
        A: AsyncRead + AsyncWrite + Send + Unpin,
        B: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);
        let mut upstream_buf = self.pools.buffers.get();
        let mut downstream_buf = self.pools.buffers.get();

        let result = tokio::select! {
            r = copy_buffer(&mut client_read, &mut server_write, &mut upstream_buf) => r,
            r = copy_buffer(&mut server_read, &mut client_write, &mut downstream_buf) => r,
        };
        match result {
            Ok(bytes) => debug!(target, bytes, "tunnel closed"),
            Err(source) => self.delegate.error_log(&ProxyError::Transfer {
                target: target.to_string(),
                source,
            }),
        }

        self.pools.buffers.put(upstream_buf);
        self.pools.buffers.put(downstream_buf);
    }
}

/// `https://<Host><path>` for a request read off a decrypted stream. The
/// CONNECT target stands in for a missing `Host`.
fn rewrite_decrypted_uri<B>(req: &mut Request<B>, connect_target: &str) -> Result<(), ProxyError> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or(connect_target)
        .to_string();
    let authority: Authority = host
        .parse()
        .map_err(|_| ProxyError::InvalidTarget(host.clone()))?;

    let mut parts = req.uri().clone().into_parts();
    parts.scheme = Some(Scheme::HTTPS);
    parts.authority = Some(authority);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    *req.uri_mut() =
        Uri::from_parts(parts).map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;
    Ok(())
}

async fn copy_buffer<R, W>(reader: &mut R, writer: &mut W, buf: &mut [u8]) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            writer.flush().await?;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Proxy;
    use std::time::Duration;

    #[test]
    fn test_rewrite_uses_host_header() {
        let mut req = Request::builder()
            .uri("/api?x=1")
            .header(HOST, "api.example.com")
            .body(())
            .unwrap();
        rewrite_decrypted_uri(&mut req, "example.com:443").unwrap();
        assert_eq!(req.uri(), "https://api.example.com/api?x=1");
    }

    #[test]
    fn test_rewrite_falls_back_to_connect_target() {
        let mut req = Request::builder().uri("/").body(()).unwrap();
        rewrite_decrypted_uri(&mut req, "example.com:443").unwrap();
        assert_eq!(req.uri(), "https://example.com:443/");
    }

    #[test]
    fn test_connection_established_reason() {
        let resp = connection_established();
        assert_eq!(resp.status(), StatusCode::OK);
        let reason = resp.extensions().get::<ReasonPhrase>().unwrap();
        assert_eq!(reason.as_bytes(), b"Connection established");
    }

    #[tokio::test]
    async fn test_copy_buffer_counts_bytes() {
        let mut reader: &[u8] = b"hello tunnel";
        let mut writer = Vec::new();
        let mut buf = vec![0u8; 4];
        let n = copy_buffer(&mut reader, &mut writer, &mut buf).await.unwrap();
        assert_eq!(n, 12);
        assert_eq!(writer, b"hello tunnel");
    }

    #[tokio::test]
    async fn test_transfer_ends_when_client_closes() {
        let proxy = Proxy::builder().build().unwrap();
        let (client, proxy_client_side) = tokio::io::duplex(1024);
        let (proxy_server_side, mut server) = tokio::io::duplex(1024);

        let relay = tokio::spawn({
            let proxy = proxy.clone();
            async move {
                proxy
                    .transfer(proxy_client_side, proxy_server_side, "example.com:443")
                    .await
            }
        });

        let mut client = client;
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .expect("transfer did not terminate")
            .unwrap();

        // Both sides of the relay are closed: the server reads EOF.
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
