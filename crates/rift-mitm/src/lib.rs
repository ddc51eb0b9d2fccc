//! Intercepting HTTP/HTTPS forward proxy.
//!
//! The proxy relays plain HTTP requests through a pooled transport, relays
//! CONNECT tunnels byte for byte, and can instead terminate CONNECT tunnels
//! with certificates minted on the fly by [`ca::CertificateAuthority`] so
//! that HTTPS exchanges are visible to a [`delegate::Delegate`].
//!
//! ```ignore
//! use rift_mitm::ca::{CertificateAuthority, MemoryCertCache, RootCa};
//! use rift_mitm::proxy::Proxy;
//! use rift_mitm::server::ProxyServer;
//! use std::sync::Arc;
//!
//! let authority = CertificateAuthority::new(
//!     RootCa::from_files("root.pem", "root.key")?,
//!     Some(Arc::new(MemoryCertCache::new())),
//! );
//! let proxy = Proxy::builder().decrypt_https(authority).build()?;
//! ProxyServer::bind("127.0.0.1:8888".parse()?, proxy)?.run().await;
//! ```

pub mod body;
pub mod ca;
pub mod config;
pub mod context;
pub mod delegate;
pub mod dns;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod server;
pub mod transport;

pub use body::ProxyBody;
pub use context::RequestContext;
pub use delegate::{DefaultDelegate, Delegate, LoggingDelegate};
pub use error::ProxyError;
pub use proxy::{Proxy, ProxyBuilder};
