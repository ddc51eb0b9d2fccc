//! Hook contract through which callers inject behaviour into the proxy.
//!
//! Hooks run synchronously on the task serving the exchange, in the order
//! `connect`, `auth`, `before_request`, `before_response`, `finish`. Any of
//! the first four may call [`RequestContext::abort`].

use crate::body::ProxyBody;
use crate::context::RequestContext;
use crate::error::{BoxError, ProxyError};
use hyper::{Request, Response, Uri};
use std::time::Instant;
use tracing::{debug, info, warn};

pub trait Delegate: Send + Sync + 'static {
    /// First hook for every inbound request.
    fn connect(&self, _ctx: &mut RequestContext) {}

    fn auth(&self, _ctx: &mut RequestContext) {}

    /// Runs before the request leaves the proxy. Setting a mock or fail-fast
    /// response here skips the network entirely.
    fn before_request(&self, _ctx: &mut RequestContext) {}

    /// Sees the upstream outcome and may replace it.
    fn before_response(
        &self,
        _ctx: &mut RequestContext,
        _result: &mut Result<Response<ProxyBody>, ProxyError>,
    ) {
    }

    /// Parent proxy to chain `req` through, if any.
    fn parent_proxy(&self, _req: &Request<ProxyBody>) -> Result<Option<Uri>, BoxError> {
        Ok(None)
    }

    /// Runs exactly once per exchange, after the response body has been
    /// streamed or the tunnel closed.
    fn finish(&self, _ctx: &mut RequestContext) {}

    fn error_log(&self, _err: &ProxyError) {}
}

/// Delegate that changes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDelegate;

impl Delegate for DefaultDelegate {}

/// Side-channel entry recording when an exchange started.
#[derive(Debug, Clone, Copy)]
struct StartedAt(Instant);

/// Pass-through delegate that records every exchange through `tracing` and
/// optionally chains everything through one parent proxy.
#[derive(Debug, Default, Clone)]
pub struct LoggingDelegate {
    parent: Option<Uri>,
}

impl LoggingDelegate {
    pub fn new(parent: Option<Uri>) -> Self {
        Self { parent }
    }
}

impl Delegate for LoggingDelegate {
    fn connect(&self, ctx: &mut RequestContext) {
        ctx.data_mut().insert(StartedAt(Instant::now()));
        debug!(
            method = %ctx.request().method(),
            uri = %ctx.request().uri(),
            remote = ?ctx.remote_addr(),
            "accepted"
        );
    }

    fn before_response(
        &self,
        ctx: &mut RequestContext,
        result: &mut Result<Response<ProxyBody>, ProxyError>,
    ) {
        if let Ok(resp) = result {
            info!(
                method = %ctx.request().method(),
                uri = %ctx.request().uri(),
                status = resp.status().as_u16(),
                tunnel = ctx.is_tunnel_proxy(),
                "relayed"
            );
        }
    }

    fn parent_proxy(&self, _req: &Request<ProxyBody>) -> Result<Option<Uri>, BoxError> {
        Ok(self.parent.clone())
    }

    fn finish(&self, ctx: &mut RequestContext) {
        if let Some(StartedAt(started)) = ctx.data().get::<StartedAt>() {
            debug!(
                uri = %ctx.request().uri(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "finished"
            );
        }
    }

    fn error_log(&self, err: &ProxyError) {
        warn!("{err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body;

    #[test]
    fn test_default_delegate_is_inert() {
        let delegate = DefaultDelegate;
        let mut ctx = RequestContext::default();
        delegate.connect(&mut ctx);
        delegate.auth(&mut ctx);
        delegate.before_request(&mut ctx);
        assert!(!ctx.is_aborted());

        let req = Request::new(body::empty());
        assert!(delegate.parent_proxy(&req).unwrap().is_none());
    }

    #[test]
    fn test_logging_delegate_chains_parent() {
        let parent: Uri = "http://proxy.internal:3128".parse().unwrap();
        let delegate = LoggingDelegate::new(Some(parent.clone()));
        let req = Request::new(body::empty());
        assert_eq!(delegate.parent_proxy(&req).unwrap(), Some(parent));
    }

    #[test]
    fn test_logging_delegate_records_start() {
        let delegate = LoggingDelegate::default();
        let mut ctx = RequestContext::default();
        delegate.connect(&mut ctx);
        assert!(ctx.data().get::<StartedAt>().is_some());
        delegate.finish(&mut ctx);
    }
}
