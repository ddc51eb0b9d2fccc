//! Outbound transport.
//!
//! The engine hands every relayed request to a [`Transport`]. The default
//! [`HttpTransport`] pools HTTP/1.1 connections, resolves through the shared
//! [`DnsCache`](crate::dns::DnsCache) and chains through a parent proxy when
//! the request carries a [`ParentProxy`] extension.
//!
//! # Module Structure
//!
//! - `client` - pooled client and its connector
//! - `parent` - requests and tunnels through a parent proxy
//! - `tls` - rustls provider, client config and the no-op verifier

mod client;
pub(crate) mod parent;
pub mod tls;

pub use client::{HttpClient, HttpTransport, TracedConnector};

use crate::body::ProxyBody;
use crate::error::ProxyError;
use async_trait::async_trait;
use hyper::{Request, Response, Uri};
use std::io;
use std::net::IpAddr;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn round_trip(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, ProxyError>;
}

/// Request extension naming the parent proxy the request must go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentProxy(pub Uri);

/// Connection-level events of the outbound transport. Informational only.
pub trait ClientTrace: Send + Sync + 'static {
    fn dns_start(&self, _host: &str) {}
    fn dns_done(&self, _host: &str, _result: Result<&[IpAddr], &io::Error>) {}
    fn connect_start(&self, _target: &Uri) {}
    fn connect_done(&self, _target: &Uri, _error: Option<&str>) {}
}
