//! Per-exchange state handed to every hook.

use crate::body::{self, ProxyBody};
use crate::pool::Reset;
use crate::proxy::headers::{clone_headers, strip_hop_headers};
use hyper::http::uri::Scheme;
use hyper::http::Extensions;
use hyper::upgrade::OnUpgrade;
use hyper::{HeaderMap, Method, Request, Response, Uri, Version};
use std::mem;
use std::net::SocketAddr;

/// State for one inbound request, or one tunnel.
///
/// Contexts are pooled: the engine resets a context before each use and
/// returns it to the pool after `Delegate::finish`, so hooks must not keep
/// references to anything inside it past `finish`.
pub struct RequestContext {
    request: Request<ProxyBody>,
    data: Extensions,
    remote_addr: Option<SocketAddr>,
    upgrade: Option<OnUpgrade>,
    abort: bool,
    tunnel_proxy: bool,
    fail_fast: bool,
    need_mock: bool,
    response: Option<Response<ProxyBody>>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            request: Request::new(body::empty()),
            data: Extensions::new(),
            remote_addr: None,
            upgrade: None,
            abort: false,
            tunnel_proxy: false,
            fail_fast: false,
            need_mock: false,
            response: None,
        }
    }
}

impl Reset for RequestContext {
    fn reset(&mut self) {
        self.request = Request::new(body::empty());
        self.data.clear();
        self.remote_addr = None;
        self.upgrade = None;
        self.abort = false;
        self.tunnel_proxy = false;
        self.fail_fast = false;
        self.need_mock = false;
        self.response = None;
    }
}

impl RequestContext {
    pub(crate) fn begin(
        &mut self,
        request: Request<ProxyBody>,
        remote_addr: Option<SocketAddr>,
        upgrade: Option<OnUpgrade>,
    ) {
        self.request = request;
        self.remote_addr = remote_addr;
        self.upgrade = upgrade;
    }

    pub fn request(&self) -> &Request<ProxyBody> {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request<ProxyBody> {
        &mut self.request
    }

    /// Swaps in a new request, returning the previous one.
    pub fn replace_request(&mut self, request: Request<ProxyBody>) -> Request<ProxyBody> {
        mem::replace(&mut self.request, request)
    }

    /// Takes the request body, leaving an empty one behind.
    pub fn take_body(&mut self) -> ProxyBody {
        mem::replace(self.request.body_mut(), body::empty())
    }

    /// Side channel for hooks. Values are keyed by type.
    pub fn data(&self) -> &Extensions {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Extensions {
        &mut self.data
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub(crate) fn take_upgrade(&mut self) -> Option<OnUpgrade> {
        self.upgrade.take()
    }

    /// Stops the exchange after the current hook returns.
    pub fn abort(&mut self) {
        self.abort = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.abort
    }

    /// True once the exchange is a raw (undecrypted) tunnel.
    pub fn is_tunnel_proxy(&self) -> bool {
        self.tunnel_proxy
    }

    pub(crate) fn set_tunnel_proxy(&mut self) {
        self.tunnel_proxy = true;
    }

    pub fn set_fail_fast(&mut self, fail_fast: bool) {
        self.fail_fast = fail_fast;
    }

    pub fn is_fail_fast(&self) -> bool {
        self.fail_fast
    }

    pub fn set_need_mock(&mut self, need_mock: bool) {
        self.need_mock = need_mock;
    }

    pub fn is_need_mock(&self) -> bool {
        self.need_mock
    }

    /// Skip the network and answer with `response`.
    pub fn mock(&mut self, response: Response<ProxyBody>) {
        self.need_mock = true;
        self.response = Some(response);
    }

    pub fn set_response(&mut self, response: Response<ProxyBody>) {
        self.response = Some(response);
    }

    pub fn response(&self) -> Option<&Response<ProxyBody>> {
        self.response.as_ref()
    }

    pub fn take_response(&mut self) -> Option<Response<ProxyBody>> {
        self.response.take()
    }

    /// Whether the request travels over TLS.
    pub fn is_https(&self) -> bool {
        self.request.uri().scheme() == Some(&Scheme::HTTPS)
    }

    /// `host:port` of the request target with the scheme's default port filled in.
    pub fn addr(&self) -> String {
        let uri = self.request.uri();
        let host = uri.host().unwrap_or_default();
        let port = uri.port_u16().unwrap_or(if self.is_https() { 443 } else { 80 });
        format!("{host}:{port}")
    }
}

/// Pooled copy of an outbound request line and headers.
#[derive(Debug, Default)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
}

impl Reset for RequestHead {
    fn reset(&mut self) {
        self.method = Method::GET;
        self.uri = Uri::default();
        self.version = Version::default();
        self.headers.clear();
        self.remote_addr = None;
    }
}

impl RequestHead {
    /// Copies the head of `req`, deep-copying its headers.
    pub fn copy_from<B>(&mut self, req: &Request<B>, remote_addr: Option<SocketAddr>) {
        self.method = req.method().clone();
        self.uri = req.uri().clone();
        self.version = req.version();
        clone_headers(req.headers(), &mut self.headers);
        self.remote_addr = remote_addr;
    }

    pub fn strip_hop_headers(&mut self) {
        strip_hop_headers(&mut self.headers);
    }

    /// Builds the outbound request from a copy of the head. The head keeps its
    /// header storage for the next checkout.
    pub fn build_request(&self, body: ProxyBody) -> Request<ProxyBody> {
        let mut req = Request::new(body);
        *req.method_mut() = self.method.clone();
        *req.uri_mut() = self.uri.clone();
        *req.version_mut() = self.version;
        *req.headers_mut() = self.headers.clone();
        req
    }
}
