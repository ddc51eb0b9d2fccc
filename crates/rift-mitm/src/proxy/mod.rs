//! Proxy engine.
//!
//! # Module Structure
//!
//! - `engine` - entry point, routing, `do_request` and the HTTP relay
//! - `tunnel` - CONNECT tunnels, TLS interception and byte transfer
//! - `exchange` - drop guard running `finish` and releasing pooled state
//! - `headers` - hop-by-hop header handling

mod engine;
mod exchange;
pub mod headers;
mod tunnel;

pub use engine::{route, Proxy, ProxyBuilder, Route, DEFAULT_HANDSHAKE_TIMEOUT};
