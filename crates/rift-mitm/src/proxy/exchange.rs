//! Lifetime of one exchange.
//!
//! An [`Exchange`] owns the pooled context from `connect` until it is
//! dropped. Dropping it runs `Delegate::finish`, returns the context to the
//! pool and decrements the live-exchange counter. Responses that stream a
//! body carry the exchange inside the body, so `finish` runs only after the
//! last byte has been written or the body has been abandoned.

use super::engine::ProxyInner;
use crate::body::{self, ProxyBody};
use crate::context::RequestContext;
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};

pub(crate) struct Exchange {
    proxy: Arc<ProxyInner>,
    ctx: Option<Box<RequestContext>>,
}

impl Exchange {
    pub(crate) fn begin(
        proxy: Arc<ProxyInner>,
        request: Request<ProxyBody>,
        remote_addr: Option<SocketAddr>,
        upgrade: Option<OnUpgrade>,
    ) -> Self {
        proxy.client_conn_num.fetch_add(1, Ordering::SeqCst);
        let mut ctx = proxy.pools.contexts.get();
        ctx.begin(request, remote_addr, upgrade);
        Self {
            proxy,
            ctx: Some(ctx),
        }
    }

    /// Ties the end of the exchange to the end of `resp`'s body.
    pub(crate) fn attach(self, resp: Response<ProxyBody>) -> Response<ProxyBody> {
        resp.map(|inner| {
            GuardedBody {
                inner,
                _exchange: self,
            }
            .boxed()
        })
    }

    /// Response for an exchange a hook aborted: whatever the hook put on the
    /// context, otherwise an empty 200.
    pub(crate) fn aborted(mut self) -> Response<ProxyBody> {
        let resp = self
            .take_response()
            .unwrap_or_else(|| Response::new(body::empty()));
        self.attach(resp)
    }
}

impl Deref for Exchange {
    type Target = RequestContext;

    fn deref(&self) -> &RequestContext {
        self.ctx.as_deref().expect("context is held until drop")
    }
}

impl DerefMut for Exchange {
    fn deref_mut(&mut self) -> &mut RequestContext {
        self.ctx.as_deref_mut().expect("context is held until drop")
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            self.proxy.delegate.finish(&mut ctx);
            self.proxy.pools.contexts.put(ctx);
            self.proxy.client_conn_num.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct GuardedBody {
    inner: ProxyBody,
    _exchange: Exchange,
}

impl Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
