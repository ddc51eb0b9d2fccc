//! Outbound transport and resolver configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    #[serde(default = "default_pool_max_idle_per_host")]
    pub max_idle_per_host: usize,

    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,

    /// Bounds both pooled-client dials and tunnel dials.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Bounds the TLS handshake with an origin reached through a parent proxy.
    #[serde(default = "default_tls_handshake_timeout")]
    pub tls_handshake_timeout_ms: u64,

    /// Reuse upstream connections between requests.
    #[serde(default = "default_true")]
    pub keepalive: bool,

    /// Accept any upstream certificate.
    #[serde(default = "default_true")]
    pub tls_skip_verify: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_pool_max_idle_per_host(),
            idle_timeout_secs: default_pool_idle_timeout(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            tls_handshake_timeout_ms: default_tls_handshake_timeout(),
            keepalive: true,
            tls_skip_verify: true,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    #[serde(default = "default_dns_ttl")]
    pub ttl_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_dns_ttl(),
        }
    }
}

impl DnsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    10
}

fn default_tls_handshake_timeout() -> u64 {
    5000
}

fn default_keepalive_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_dns_ttl() -> u64 {
    300
}
