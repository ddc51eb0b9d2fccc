//! Talking through a parent proxy.

use crate::body::{self, ProxyBody};
use crate::error::ProxyError;
use http_body_util::BodyExt;
use hyper::client::conn::http1;
use hyper::header::HOST;
use hyper::rt::{Read, Write};
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, Uri};
use tracing::debug;

/// `host:port` of `uri`, filling in `default_port` when the URI has none.
pub fn authority_with_port(uri: &Uri, default_port: u16) -> Result<String, ProxyError> {
    let host = uri
        .host()
        .ok_or_else(|| ProxyError::InvalidTarget(uri.to_string()))?;
    let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
        Some("https") => 443,
        Some("http") => 80,
        _ => default_port,
    });
    Ok(format!("{host}:{port}"))
}

/// Sends `CONNECT target` over `io` and returns the raw tunnel once the
/// parent answers 2xx.
pub async fn connect_tunnel<T>(io: T, target: &str) -> Result<Upgraded, ProxyError>
where
    T: Read + Write + Unpin + Send + 'static,
{
    let upstream = |e: hyper::Error| ProxyError::upstream(target, e);

    let (mut sender, conn) = http1::handshake(io).await.map_err(upstream)?;
    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            debug!("parent proxy connection closed: {err}");
        }
    });

    let req = Request::builder()
        .method(Method::CONNECT)
        .uri(target)
        .header(HOST, target)
        .body(body::empty())
        .map_err(|e| ProxyError::upstream(target, e))?;
    let resp = sender.send_request(req).await.map_err(upstream)?;

    if !resp.status().is_success() {
        return Err(ProxyError::ParentRefused {
            target: target.to_string(),
            status: resp.status(),
        });
    }
    hyper::upgrade::on(resp).await.map_err(upstream)
}

/// Sends one request over a dedicated connection.
pub async fn send_once<T>(io: T, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, ProxyError>
where
    T: Read + Write + Unpin + Send + 'static,
{
    let target = req.uri().to_string();
    let upstream = |e: hyper::Error| ProxyError::upstream(target.as_str(), e);

    let (mut sender, conn) = http1::handshake(io).await.map_err(upstream)?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!("parent proxy connection closed: {err}");
        }
    });

    let resp = sender.send_request(req).await.map_err(upstream)?;
    Ok(resp.map(|b| b.boxed()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority_with_port() {
        let uri: Uri = "http://proxy.local".parse().unwrap();
        assert_eq!(authority_with_port(&uri, 3128).unwrap(), "proxy.local:80");

        let uri: Uri = "example.com:8443".parse().unwrap();
        assert_eq!(authority_with_port(&uri, 443).unwrap(), "example.com:8443");

        let uri: Uri = "https://example.com/path".parse().unwrap();
        assert_eq!(authority_with_port(&uri, 80).unwrap(), "example.com:443");

        let uri: Uri = "/path".parse().unwrap();
        assert!(authority_with_port(&uri, 80).is_err());
    }
}
