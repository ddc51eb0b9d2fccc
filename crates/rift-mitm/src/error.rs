//! Error types for the proxy engine and its transport.
//!
//! Every variant that concerns a single exchange carries the target it was
//! working on, so the text handed to `Delegate::error_log` reads like
//! `example.com:443 - TLS handshake failed: ...`.

use crate::ca::CaError;
use hyper::StatusCode;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by hooks and foreign transports.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{target} - HTTP request error: {source}")]
    Upstream {
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("{0} - connection does not support hijacking")]
    HijackUnsupported(String),

    #[error("{target} - connection upgrade failed: {source}")]
    Upgrade {
        target: String,
        #[source]
        source: hyper::Error,
    },

    #[error("{target} - failed to resolve parent proxy: {source}")]
    ParentProxy {
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("{target} - parent proxy refused tunnel with status {status}")]
    ParentRefused { target: String, status: StatusCode },

    #[error("{target} - failed to generate certificate: {source}")]
    Certificate {
        target: String,
        #[source]
        source: CaError,
    },

    #[error("{target} - TLS handshake failed: {source}")]
    Handshake {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("{target} - TLS handshake timed out after {timeout:?}")]
    HandshakeTimeout { target: String, timeout: Duration },

    #[error("{target} - dial failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("{target} - dial timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },

    #[error("{target} - tunnel transfer failed: {source}")]
    Transfer {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("{target} - failed to serve decrypted connection: {source}")]
    Serve {
        target: String,
        #[source]
        source: hyper::Error,
    },

    #[error("{target} - hook requested a mock response but set none")]
    MissingMockResponse { target: String },

    #[error("invalid request target: {0}")]
    InvalidTarget(String),
}

impl ProxyError {
    pub(crate) fn upstream(target: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Upstream {
            target: target.into(),
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_leads_with_target() {
        let err = ProxyError::Handshake {
            target: "example.com:443".to_string(),
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "eof"),
        };
        assert_eq!(
            err.to_string(),
            "example.com:443 - TLS handshake failed: eof"
        );
    }
}
