use parking_lot::RwLock;
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::sync::Arc;

/// Storage for issued certificates, keyed by host.
///
/// Implementations must be safe for concurrent `get`/`set` and must return
/// a value from `get` once `set` for the same host has returned.
pub trait CertificateCache: Send + Sync {
    fn get(&self, host: &str) -> Option<Arc<CertifiedKey>>;
    fn set(&self, host: &str, cert: Arc<CertifiedKey>);
}

/// Process-local cache that never evicts.
#[derive(Default)]
pub struct MemoryCertCache {
    entries: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl MemoryCertCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.entries.read().keys().cloned().collect();
        hosts.sort();
        hosts
    }
}

impl CertificateCache for MemoryCertCache {
    fn get(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        self.entries.read().get(host).cloned()
    }

    fn set(&self, host: &str, cert: Arc<CertifiedKey>) {
        self.entries.write().insert(host.to_string(), cert);
    }
}
