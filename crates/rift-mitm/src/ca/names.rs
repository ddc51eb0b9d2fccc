//! Host name handling for leaf certificates.

use rcgen::{SanType, SerialNumber};
use std::net::IpAddr;

/// Removes a trailing `:port`, unwrapping `[v6]:port`. Hosts without a port
/// (including bare IPv6 literals) are returned unchanged.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((inner, _)) => inner,
            None => host,
        };
    }
    match host.split_once(':') {
        Some((name, port)) if !port.contains(':') => name,
        _ => host,
    }
}

/// Cache keys tried before issuing: the host itself, then the host with its
/// leftmost label removed (where a wildcard issued for a sibling is stored).
pub fn lookup_candidates(host: &str) -> impl Iterator<Item = &str> {
    let parent = host
        .split_once('.')
        .map(|(_, rest)| rest)
        .filter(|rest| !rest.is_empty());
    std::iter::once(host).chain(parent)
}

/// 32-bit FNV-1a of the host name.
///
/// Deterministic per host, which is acceptable for a local interception CA
/// and nothing more.
pub fn serial_for(host: &str) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    host.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(PRIME)
    })
}

pub(crate) fn serial_number(host: &str) -> SerialNumber {
    SerialNumber::from(u64::from(serial_for(host)))
}

/// Subject alternative names for one leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectNames {
    pub ip: Option<IpAddr>,
    pub dns: Vec<String>,
}

impl SubjectNames {
    /// A literal IP gets an IP SAN only. A name gets a `*.` wildcard for every
    /// suffix of at least two labels, plus the exact name when it has exactly
    /// two labels (a wildcard does not cover its own apex) or just one.
    pub fn for_host(host: &str) -> Self {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Self {
                ip: Some(ip),
                dns: Vec::new(),
            };
        }

        let labels: Vec<&str> = host.split('.').collect();
        let mut dns = Vec::with_capacity(labels.len());
        for start in 0..labels.len().saturating_sub(1) {
            dns.push(format!("*.{}", labels[start..].join(".")));
        }
        if labels.len() <= 2 {
            dns.push(host.to_string());
        }
        Self { ip: None, dns }
    }

    /// Keys under which the issued certificate is cached.
    pub fn cache_keys<'a>(&'a self, host: &'a str) -> impl Iterator<Item = &'a str> {
        let literal = self.ip.map(|_| host);
        literal.into_iter().chain(
            self.dns
                .iter()
                .map(|name| name.strip_prefix("*.").unwrap_or(name)),
        )
    }

    pub(crate) fn to_san_types(&self) -> Result<Vec<SanType>, rcgen::Error> {
        let mut sans = Vec::with_capacity(self.dns.len() + 1);
        if let Some(ip) = self.ip {
            sans.push(SanType::IpAddress(ip));
        }
        for name in &self.dns {
            sans.push(SanType::DnsName(name.clone().try_into()?));
        }
        Ok(sans)
    }
}
