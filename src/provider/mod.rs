//! Collaborator interfaces: certificates, access control, statistics and
//! persisted endpoint records
//!
//! The gateway only consumes these narrow traits; the defaults here are
//! enough to run standalone.

pub mod store;

pub use store::{ConfigStore, JsonDirStore, MemoryStore};

use crate::config::{AccessControlConfig, CertificatePair};
use crate::error::{GatewayError, Result};
use http::StatusCode;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Supplies a certificate/key pair for a TLS server name
pub trait CertificateResolver: Send + Sync {
    /// Return `(certificate PEM path, private key PEM path)`
    fn certificate_for(&self, hostname: &str) -> Result<(PathBuf, PathBuf)>;
}

/// Allow/deny decision for a client address
pub trait AccessControl: Send + Sync {
    fn is_allowed(&self, ip: IpAddr, country_code: Option<&str>) -> bool;
}

/// Fire-and-forget request statistics sink
pub trait StatsRecorder: Send + Sync {
    fn record_request(&self, endpoint: &str, status: StatusCode, latency: Duration);
}

/// Certificates configured statically in the gateway file
#[derive(Debug, Clone, Default)]
pub struct StaticCertificates {
    pairs: HashMap<String, CertificatePair>,
}

impl StaticCertificates {
    pub fn new(pairs: &HashMap<String, CertificatePair>) -> Self {
        Self {
            pairs: pairs
                .iter()
                .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.clone()))
                .collect(),
        }
    }
}

impl CertificateResolver for StaticCertificates {
    fn certificate_for(&self, hostname: &str) -> Result<(PathBuf, PathBuf)> {
        let host = hostname.to_ascii_lowercase();
        let pair = self.pairs.get(&host).or_else(|| {
            host.split_once('.')
                .and_then(|(_, parent)| self.pairs.get(&format!("*.{}", parent)))
        });
        pair.map(|p| (PathBuf::from(&p.cert_file), PathBuf::from(&p.key_file)))
            .ok_or_else(|| GatewayError::Tls(format!("No certificate for '{}'", hostname)))
    }
}

/// Permit every client
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn is_allowed(&self, _ip: IpAddr, _country_code: Option<&str>) -> bool {
        true
    }
}

/// Deny listed addresses and CIDR ranges
#[derive(Debug, Clone, Default)]
pub struct IpDenyList {
    entries: Vec<(IpAddr, u8)>,
}

impl IpDenyList {
    pub fn from_config(config: &AccessControlConfig) -> Result<Self> {
        let mut entries = Vec::with_capacity(config.deny.len());
        for raw in &config.deny {
            entries.push(parse_cidr(raw)?);
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AccessControl for IpDenyList {
    fn is_allowed(&self, ip: IpAddr, _country_code: Option<&str>) -> bool {
        !self
            .entries
            .iter()
            .any(|(net, bits)| cidr_contains(*net, *bits, ip))
    }
}

fn parse_cidr(raw: &str) -> Result<(IpAddr, u8)> {
    let raw = raw.trim();
    let invalid = || GatewayError::Config(format!("Invalid address or CIDR '{}'", raw));
    match raw.split_once('/') {
        Some((addr, bits)) => {
            let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
            let bits: u8 = bits.parse().map_err(|_| invalid())?;
            let max = if addr.is_ipv4() { 32 } else { 128 };
            if bits > max {
                return Err(invalid());
            }
            Ok((addr, bits))
        }
        None => {
            let addr: IpAddr = raw.parse().map_err(|_| invalid())?;
            let bits = if addr.is_ipv4() { 32 } else { 128 };
            Ok((addr, bits))
        }
    }
}

fn cidr_contains(net: IpAddr, bits: u8, ip: IpAddr) -> bool {
    match (net, ip) {
        (IpAddr::V4(n), IpAddr::V4(i)) => {
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits as u32) };
            (u32::from(n) & mask) == (u32::from(i) & mask)
        }
        (IpAddr::V6(n), IpAddr::V6(i)) => {
            let mask = if bits == 0 { 0 } else { u128::MAX << (128 - bits as u32) };
            (u128::from(n) & mask) == (u128::from(i) & mask)
        }
        _ => false,
    }
}

/// Statistics recorder that emits a trace event per request
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStats;

impl StatsRecorder for TracingStats {
    fn record_request(&self, endpoint: &str, status: StatusCode, latency: Duration) {
        tracing::trace!(
            target: "stats",
            endpoint,
            status = status.as_u16(),
            latency_ms = latency.as_millis() as u64,
            "request recorded"
        );
    }
}
