//! Configuration types for the proxy binary.

mod listen;
mod mitm;
mod transport;

use std::path::Path;

use hyper::Uri;
use serde::{Deserialize, Serialize};

pub use listen::ListenConfig;
pub use mitm::MitmConfig;
pub use transport::{DnsConfig, TransportConfig};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub mitm: MitmConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    /// Parent proxy every request is chained through, e.g. `http://proxy:3128`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_proxy: Option<String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.listen.socket_addr()?;

        if self.mitm.ca_cert_path.is_some() != self.mitm.ca_key_path.is_some() {
            anyhow::bail!(
                "'mitm.ca_cert_path' and 'mitm.ca_key_path' must be provided together"
            );
        }
        if self.mitm.cert_validity_years == 0 {
            anyhow::bail!("'mitm.cert_validity_years' must be at least 1");
        }
        if self.mitm.handshake_timeout_ms == 0 {
            anyhow::bail!("'mitm.handshake_timeout_ms' must be greater than 0");
        }
        if self.transport.connect_timeout_secs == 0 {
            anyhow::bail!("'transport.connect_timeout_secs' must be greater than 0");
        }
        if self.transport.tls_handshake_timeout_ms == 0 {
            anyhow::bail!("'transport.tls_handshake_timeout_ms' must be greater than 0");
        }

        self.parent_proxy()?;
        Ok(())
    }

    /// Parsed `upstream_proxy`.
    pub fn parent_proxy(&self) -> Result<Option<Uri>, anyhow::Error> {
        let Some(raw) = &self.upstream_proxy else {
            return Ok(None);
        };
        let uri: Uri = raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid upstream_proxy '{raw}': {e}"))?;
        if uri.host().is_none() {
            anyhow::bail!("upstream_proxy '{raw}' has no host");
        }
        match uri.scheme_str() {
            None | Some("http") => Ok(Some(uri)),
            Some(other) => anyhow::bail!(
                "Unsupported upstream_proxy scheme '{other}'. Currently supported: http"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen.port, 8888);
        assert!(!config.mitm.enabled);
        assert!(config.mitm.reuse_key);
        assert_eq!(config.mitm.handshake_timeout_ms, 5000);
        assert_eq!(config.transport.connect_timeout_secs, 5);
        assert_eq!(
            config.transport.tls_handshake_timeout(),
            std::time::Duration::from_secs(5)
        );
        assert!(config.transport.tls_skip_verify);
        assert_eq!(config.dns.ttl_secs, 300);
        assert!(config.parent_proxy().unwrap().is_none());
    }

    #[test]
    fn test_parse_config() {
        let yaml = r#"
listen:
  host: 0.0.0.0
  port: 9000
mitm:
  enabled: true
  reuse_key: false
  cert_validity_years: 2
transport:
  max_idle_per_host: 32
  keepalive: false
dns:
  ttl_secs: 60
upstream_proxy: http://proxy.internal:3128
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen.socket_addr().unwrap().to_string(), "0.0.0.0:9000");
        assert!(config.mitm.enabled);
        assert!(!config.mitm.reuse_key);
        assert_eq!(config.mitm.cert_validity_years, 2);
        assert_eq!(config.transport.max_idle_per_host, 32);
        assert!(!config.transport.keepalive);
        assert_eq!(config.dns.ttl_secs, 60);
        assert_eq!(
            config.parent_proxy().unwrap().unwrap(),
            "http://proxy.internal:3128"
        );
    }

    #[test]
    fn test_rejects_half_configured_root() {
        let yaml = r#"
mitm:
  ca_cert_path: /tmp/root.pem
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must be provided together"));
    }

    #[test]
    fn test_rejects_https_parent_proxy() {
        let config = Config {
            upstream_proxy: Some("https://proxy.internal:3128".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen:\n  port: 7070").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.listen.port, 7070);
    }

    #[test]
    fn test_mitm_builds_development_authority() {
        let config = MitmConfig::default();
        let authority = config.build_authority().unwrap();
        authority.generate_tls_config("example.com:443").unwrap();
        authority.generate_tls_config("example.com:443").unwrap();
        assert_eq!(authority.issued_count(), 1);
    }
}
