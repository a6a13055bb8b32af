//! Upstream configuration: backend origins, transport tuning and liveness

use serde::{Deserialize, Serialize};

/// What the load balancer does when every upstream of an endpoint is offline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[derive(Default)]
pub enum OutagePolicy {
    /// Ignore liveness and pick from the full set
    #[default]
    BestEffort,
    /// Refuse the request with a gateway error
    FailClosed,
}

impl std::str::FromStr for OutagePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "best-effort" => Ok(Self::BestEffort),
            "fail-closed" => Ok(Self::FailClosed),
            other => Err(format!("unknown outage policy: {}", other)),
        }
    }
}

/// One backend origin
///
/// # Example
///
/// ```hcl
/// upstreams = [
///   { origin = "127.0.0.1:8080", weight = 2 },
///   { origin = "backup.internal:443", require_tls = true, weight = 0 },
/// ]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// `host:port`, optionally followed by a base path and query
    pub origin: String,

    /// Dial the origin over TLS
    #[serde(default)]
    pub require_tls: bool,

    /// Accept any certificate presented by the origin
    #[serde(default)]
    pub skip_cert_validation: bool,

    /// Accept WebSocket upgrades whose Origin does not match the host
    #[serde(default)]
    pub skip_ws_origin_check: bool,

    /// Selection weight (0 = fallback only)
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Advisory connection cap for this origin (0 = transport default)
    #[serde(default)]
    pub max_conn: usize,
}

fn default_weight() -> u32 {
    1
}

impl UpstreamConfig {
    /// Plain-HTTP upstream with default weight
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            require_tls: false,
            skip_cert_validation: false,
            skip_ws_origin_check: false,
            weight: default_weight(),
            max_conn: 0,
        }
    }

    /// Same upstream with a different weight
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// Outbound transport tuning shared by every upstream client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Idle pooled connections are closed after this many seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Idle connections kept per host
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,

    /// Concurrent connections allowed per host
    #[serde(default = "default_max_conns_per_host")]
    pub max_conns_per_host: usize,

    /// Response-header deadline for one upstream round trip
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// Dial deadline
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_max_idle_per_host() -> usize {
    512
}

fn default_max_conns_per_host() -> usize {
    256
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            max_idle_per_host: default_max_idle_per_host(),
            max_conns_per_host: default_max_conns_per_host(),
            upstream_timeout_secs: default_upstream_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Optional active uptime probe
///
/// ```hcl
/// uptime_probe {
///   interval_secs = 30
///   timeout_secs  = 5
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UptimeProbeConfig {
    /// Seconds between probe rounds
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,

    /// Per-probe timeout
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

fn default_probe_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

impl Default for UptimeProbeConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_probe_interval(),
            timeout_secs: default_probe_timeout(),
        }
    }
}
