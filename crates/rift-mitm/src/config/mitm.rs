//! HTTPS decryption configuration.

use crate::ca::{CaError, CertificateAuthority, MemoryCertCache, RootCa, DEFAULT_VALIDITY_YEARS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MitmConfig {
    /// Decrypt CONNECT tunnels instead of relaying them.
    #[serde(default)]
    pub enabled: bool,
    /// Root certificate (PEM). Falls back to the bundled development root
    /// when neither path is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<String>,
    /// Root private key (PEM, ECDSA P-256).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_key_path: Option<String>,
    /// Sign every leaf over one shared key.
    #[serde(default = "default_reuse_key")]
    pub reuse_key: bool,
    #[serde(default = "default_cert_validity_years")]
    pub cert_validity_years: u32,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for MitmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ca_cert_path: None,
            ca_key_path: None,
            reuse_key: default_reuse_key(),
            cert_validity_years: default_cert_validity_years(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl MitmConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn load_root(&self) -> Result<RootCa, CaError> {
        match (&self.ca_cert_path, &self.ca_key_path) {
            (Some(cert), Some(key)) => RootCa::from_files(cert, key),
            _ => RootCa::development(),
        }
    }

    /// Authority backed by an in-memory certificate cache.
    pub fn build_authority(&self) -> Result<CertificateAuthority, CaError> {
        let authority = CertificateAuthority::new(
            self.load_root()?,
            Some(Arc::new(MemoryCertCache::new())),
        )
        .with_validity_years(self.cert_validity_years);
        if self.reuse_key {
            authority.with_reused_key()
        } else {
            Ok(authority)
        }
    }
}

fn default_reuse_key() -> bool {
    true
}

fn default_cert_validity_years() -> u32 {
    DEFAULT_VALIDITY_YEARS
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}
