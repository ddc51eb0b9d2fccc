//! On-the-fly certificate authority for decrypting CONNECT tunnels.
//!
//! # Module Structure
//!
//! - `authority` - root material, leaf issuance and rustls server configs
//! - `cache` - host to certified key store
//! - `names` - host parsing, subject alternative names, serial numbers

mod authority;
mod cache;
mod names;

pub use authority::{
    generate_ca, CertificateAuthority, CertificatePair, RootCa, DEFAULT_VALIDITY_YEARS,
    DEV_ROOT_CERT_PEM, DEV_ROOT_KEY_PEM,
};
pub use cache::{CertificateCache, MemoryCertCache};
pub use names::{lookup_candidates, serial_for, strip_port, SubjectNames};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("no certificate found in root PEM")]
    MissingCertificate,

    #[error("root key must be ECDSA P-256")]
    UnsupportedRootKey,

    #[error("invalid PEM: {0}")]
    Pem(#[from] std::io::Error),

    #[error("certificate generation failed: {0}")]
    Rcgen(#[from] rcgen::Error),

    #[error("TLS configuration failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
