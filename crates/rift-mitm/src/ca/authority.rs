//! Root material and per-host leaf issuance.

use super::cache::CertificateCache;
use super::names::{lookup_candidates, serial_number, strip_port, SubjectNames};
use super::CaError;
use crate::transport::tls::crypto_provider;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::debug;

/// Development root shipped with the crate. Anyone can read its key, so it
/// must only ever be trusted on throwaway machines.
pub const DEV_ROOT_CERT_PEM: &str = include_str!("../../certs/dev-root-ca.pem");
pub const DEV_ROOT_KEY_PEM: &str = include_str!("../../certs/dev-root-ca.key");

pub const DEFAULT_VALIDITY_YEARS: u32 = 1;

const ORGANIZATION: &str = "Rift";

/// The root certificate and ECDSA P-256 key every leaf is signed with.
pub struct RootCa {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
}

impl RootCa {
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CaError> {
        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or(CaError::MissingCertificate)??;
        let key = KeyPair::from_pem(key_pem)?;
        if key.algorithm() != &PKCS_ECDSA_P256_SHA256 {
            return Err(CaError::UnsupportedRootKey);
        }
        let issuer = Issuer::from_ca_cert_der(&cert_der, key)?;

        Ok(Self {
            issuer,
            cert_der,
            cert_pem: cert_pem.to_string(),
        })
    }

    pub fn from_files(cert_path: &str, key_path: &str) -> Result<Self, CaError> {
        let read = |path: &str| {
            std::fs::read_to_string(path).map_err(|source| CaError::Read {
                path: path.to_string(),
                source,
            })
        };
        Self::from_pem(&read(cert_path)?, &read(key_path)?)
    }

    /// The compiled-in development root.
    pub fn development() -> Result<Self, CaError> {
        Self::from_pem(DEV_ROOT_CERT_PEM, DEV_ROOT_KEY_PEM)
    }

    /// PEM to install into client trust stores.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }
}

/// An issued certificate and its private key.
#[derive(Debug)]
pub struct CertificatePair {
    pub host: String,
    pub names: SubjectNames,
    pub serial: u32,
    pub cert_der: CertificateDer<'static>,
    pub cert_pem: String,
    pub key_der: PrivatePkcs8KeyDer<'static>,
    pub key_pem: String,
}

impl CertificatePair {
    /// Leaf plus signing key in the form rustls serves.
    pub fn certified_key(&self) -> Result<CertifiedKey, CaError> {
        let key_der = PrivateKeyDer::Pkcs8(self.key_der.clone_key());
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)?;
        Ok(CertifiedKey::new(vec![self.cert_der.clone()], signing_key))
    }
}

/// Issues per-host leaf certificates and assembles server configs for them.
pub struct CertificateAuthority {
    root: RootCa,
    cache: Option<Arc<dyn CertificateCache>>,
    shared_key: Option<KeyPair>,
    validity_years: u32,
    issued: AtomicU64,
}

impl CertificateAuthority {
    pub fn new(root: RootCa, cache: Option<Arc<dyn CertificateCache>>) -> Self {
        Self {
            root,
            cache,
            shared_key: None,
            validity_years: DEFAULT_VALIDITY_YEARS,
            issued: AtomicU64::new(0),
        }
    }

    /// Signs every leaf over one key generated here instead of a fresh key
    /// per host. Issuance becomes a signature only.
    pub fn with_reused_key(mut self) -> Result<Self, CaError> {
        self.shared_key = Some(KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?);
        Ok(self)
    }

    pub fn with_validity_years(mut self, years: u32) -> Self {
        self.validity_years = years.max(1);
        self
    }

    pub fn root(&self) -> &RootCa {
        &self.root
    }

    /// Leaves issued since construction. Cache hits do not count.
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Server config presenting a certificate for `host` (a trailing port is
    /// ignored). Served from the cache when a matching entry exists,
    /// otherwise a new leaf is issued and cached.
    pub fn generate_tls_config(&self, host: &str) -> Result<Arc<ServerConfig>, CaError> {
        let host = strip_port(host);

        if let Some(cache) = &self.cache {
            if let Some(cert) = lookup_candidates(host).find_map(|key| cache.get(key)) {
                debug!(host, "certificate cache hit");
                return server_config(cert);
            }
        }

        let pair = self.issue(host)?;
        let cert = Arc::new(pair.certified_key()?);
        if let Some(cache) = &self.cache {
            for key in pair.names.cache_keys(host) {
                cache.set(key, Arc::clone(&cert));
            }
        }
        server_config(cert)
    }

    /// Issues a leaf for `host` without consulting or filling the cache.
    pub fn issue(&self, host: &str) -> Result<CertificatePair, CaError> {
        let host = strip_port(host);
        let names = SubjectNames::for_host(host);
        let params = self.leaf_params(host, &names)?;

        let fresh;
        let key = match &self.shared_key {
            Some(key) => key,
            None => {
                fresh = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
                &fresh
            }
        };
        let cert = params.signed_by(key, &self.root.issuer)?;
        self.issued.fetch_add(1, Ordering::Relaxed);
        debug!(host, "issued leaf certificate");

        Ok(CertificatePair {
            host: host.to_string(),
            names,
            serial: super::serial_for(host),
            cert_pem: cert.pem(),
            cert_der: cert.der().clone(),
            key_der: PrivatePkcs8KeyDer::from(key.serialize_der()),
            key_pem: key.serialize_pem(),
        })
    }

    fn leaf_params(
        &self,
        host: &str,
        names: &SubjectNames,
    ) -> Result<CertificateParams, CaError> {
        let mut params = CertificateParams::default();
        params.serial_number = Some(serial_number(host));

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, ORGANIZATION);
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(365);
        params.not_after = now + Duration::days(365 * i64::from(self.validity_years));

        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DataEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        params.subject_alt_names = names.to_san_types()?;
        Ok(params)
    }
}

/// Mints a new self-signed root. Returns the certificate and PKCS#8 key PEM.
pub fn generate_ca(common_name: &str, validity_years: u32) -> Result<(String, String), CaError> {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(2));
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(30);
    params.not_after = now + Duration::days(365 * i64::from(validity_years.max(1)));

    let cert = params.self_signed(&key)?;
    Ok((cert.pem(), key.serialize_pem()))
}

/// Always answers with the same certificate, whatever the client's SNI.
#[derive(Debug)]
struct FixedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

fn server_config(cert: Arc<CertifiedKey>) -> Result<Arc<ServerConfig>, CaError> {
    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCert(cert)));
    // The decrypted side is served as HTTP/1.1 only.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{serial_for, MemoryCertCache};
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, RootCertStore};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::{TlsAcceptor, TlsConnector};
    use x509_parser::extensions::GeneralName;
    use x509_parser::prelude::{parse_x509_certificate, X509Certificate};

    fn authority(cache: Option<Arc<dyn CertificateCache>>) -> CertificateAuthority {
        CertificateAuthority::new(RootCa::development().unwrap(), cache)
    }

    fn parse(pair: &CertificatePair) -> X509Certificate<'_> {
        let (_, cert) = parse_x509_certificate(pair.cert_der.as_ref()).unwrap();
        cert
    }

    fn common_name(cert: &X509Certificate<'_>) -> String {
        let cn = cert.subject().iter_common_name().next().unwrap();
        cn.as_str().unwrap().to_string()
    }

    fn dns_names(cert: &X509Certificate<'_>) -> Vec<String> {
        let san = cert.subject_alternative_name().unwrap().unwrap();
        san.value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect()
    }

    fn serial(cert: &X509Certificate<'_>) -> u64 {
        cert.raw_serial()
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
    }

    fn client_config() -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots
            .add(RootCa::development().unwrap().cert_der().clone())
            .unwrap();
        Arc::new(
            ClientConfig::builder_with_provider(crypto_provider())
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }

    /// Runs a full handshake over an in-memory pipe with a client that only
    /// trusts the development root.
    async fn handshake(config: Arc<ServerConfig>, server_name: &str) -> std::io::Result<()> {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move {
            let mut tls = TlsAcceptor::from(config).accept(server_io).await?;
            tls.write_all(b"pong").await?;
            tls.shutdown().await
        });

        let name = ServerName::try_from(server_name.to_string()).unwrap();
        let mut tls = TlsConnector::from(client_config())
            .connect(name, client_io)
            .await?;
        let mut buf = Vec::new();
        tls.read_to_end(&mut buf).await?;
        assert_eq!(buf, b"pong");
        server.await.unwrap()
    }

    #[test]
    fn test_development_root_loads() {
        let root = RootCa::development().unwrap();
        assert!(root.cert_pem().starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn test_rejects_pem_without_certificate() {
        let result = RootCa::from_pem("", DEV_ROOT_KEY_PEM);
        assert!(matches!(result, Err(CaError::MissingCertificate)));
    }

    #[test]
    fn test_distinct_hosts_get_distinct_subjects() {
        let ca = authority(None);
        let a = ca.issue("example.com:443").unwrap();
        let b = ca.issue("example.org").unwrap();
        let (cert_a, cert_b) = (parse(&a), parse(&b));

        assert_eq!(a.host, "example.com");
        assert_eq!(common_name(&cert_a), "example.com");
        assert_eq!(common_name(&cert_b), "example.org");
        assert_eq!(serial(&cert_a), u64::from(serial_for("example.com")));
        assert_eq!(serial(&cert_b), u64::from(serial_for("example.org")));
        assert_ne!(serial(&cert_a), serial(&cert_b));
        assert_eq!(ca.issued_count(), 2);
    }

    #[test]
    fn test_leaf_carries_wildcard_sans() {
        let ca = authority(None);
        let deep = ca.issue("api.example.com").unwrap();
        assert_eq!(dns_names(&parse(&deep)), vec!["*.api.example.com", "*.example.com"]);

        let apex = ca.issue("example.com").unwrap();
        assert_eq!(dns_names(&parse(&apex)), vec!["*.example.com", "example.com"]);
    }

    #[test]
    fn test_leaf_is_signed_by_root() {
        let ca = authority(None);
        let pair = ca.issue("example.com").unwrap();
        let (_, root) = parse_x509_certificate(ca.root().cert_der().as_ref()).unwrap();
        assert!(parse(&pair).verify_signature(Some(root.public_key())).is_ok());
    }

    #[test]
    fn test_cache_issues_once() {
        let cache = Arc::new(MemoryCertCache::new());
        let ca = authority(Some(cache.clone()));

        ca.generate_tls_config("example.com").unwrap();
        ca.generate_tls_config("example.com:443").unwrap();
        assert_eq!(ca.issued_count(), 1);
        assert_eq!(cache.hosts(), vec!["example.com"]);
    }

    #[test]
    fn test_sibling_served_from_parent_entry() {
        let cache = Arc::new(MemoryCertCache::new());
        let ca = authority(Some(cache.clone()));

        ca.generate_tls_config("api.example.com").unwrap();
        ca.generate_tls_config("www.example.com").unwrap();
        assert_eq!(ca.issued_count(), 1);
    }

    /// The apex looks up its own name first, which is where a subdomain's
    /// leaf was cached, so it is served a certificate that omits the apex.
    #[tokio::test]
    async fn test_apex_after_subdomain_hits_parent_entry() {
        let cache = Arc::new(MemoryCertCache::new());
        let ca = authority(Some(cache.clone()));

        ca.generate_tls_config("api.example.com").unwrap();
        let config = ca.generate_tls_config("example.com").unwrap();
        assert_eq!(ca.issued_count(), 1);
        assert!(handshake(config, "example.com").await.is_err());
    }

    #[test]
    fn test_ip_host_is_cached_under_literal() {
        let cache = Arc::new(MemoryCertCache::new());
        let ca = authority(Some(cache.clone()));

        ca.generate_tls_config("127.0.0.1:8443").unwrap();
        assert_eq!(cache.hosts(), vec!["127.0.0.1"]);
    }

    #[test]
    fn test_reused_key_signs_every_leaf() {
        let ca = authority(None).with_reused_key().unwrap();
        let a = ca.issue("example.com").unwrap();
        let b = ca.issue("example.org").unwrap();
        assert_eq!(a.key_pem, b.key_pem);
        assert_ne!(a.cert_pem, b.cert_pem);
    }

    #[test]
    fn test_generate_ca_round_trips_through_root() {
        let (cert_pem, key_pem) = generate_ca("Rift Test Root", 5).unwrap();
        let root = RootCa::from_pem(&cert_pem, &key_pem).unwrap();
        let ca = CertificateAuthority::new(root, None);
        ca.issue("example.com").unwrap();
    }

    #[tokio::test]
    async fn test_leaves_chain_to_root() {
        let ca = authority(None);
        handshake(ca.generate_tls_config("example.com").unwrap(), "example.com")
            .await
            .unwrap();
        handshake(
            ca.generate_tls_config("api.example.org").unwrap(),
            "api.example.org",
        )
        .await
        .unwrap();
        handshake(ca.generate_tls_config("localhost").unwrap(), "localhost")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wrong_name_fails_verification() {
        let ca = authority(None);
        let result = handshake(ca.generate_tls_config("example.com").unwrap(), "example.org").await;
        assert!(result.is_err());
    }
}
