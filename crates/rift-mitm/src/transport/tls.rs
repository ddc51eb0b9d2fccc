//! TLS plumbing shared by the transport and the certificate authority.
//!
//! Everything here builds on the ring provider explicitly so that the
//! configs never depend on a process-wide default provider being installed.

use crate::error::ProxyError;
use hyper_rustls::ConfigBuilderExt;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct};
use std::sync::Arc;
use tracing::warn;

pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// No-op certificate verifier for upstreams with self-signed certificates.
///
/// # Warning
/// This disables all upstream TLS security checks.
#[derive(Debug)]
pub struct NoVerifier {
    schemes: Vec<rustls::SignatureScheme>,
}

impl NoVerifier {
    pub fn new(provider: &CryptoProvider) -> Self {
        Self {
            schemes: provider
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}

/// Client config used for upstream HTTPS, either verifying against the
/// platform roots or accepting any certificate.
pub fn client_config(skip_verify: bool) -> Result<ClientConfig, ProxyError> {
    let provider = crypto_provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::upstream("tls", e))?;

    if skip_verify {
        warn!("Upstream TLS certificate verification DISABLED (development/testing only)");
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier::new(&provider)))
            .with_no_client_auth());
    }

    Ok(builder
        .with_native_roots()
        .map_err(|e| ProxyError::upstream("tls", e))?
        .with_no_client_auth())
}
