//! Structured access log: one JSON entry per handled request
//!
//! Entries go out through `tracing` under the `access_log` target, so
//! writing never blocks the request path.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// How a request was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardKind {
    Proxy,
    Websocket,
    Tunnel,
    Special,
    Redirect,
    /// Answered by the gateway itself (gate, error, default site)
    Local,
}

impl std::fmt::Display for ForwardKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Proxy => "proxy",
            Self::Websocket => "websocket",
            Self::Tunnel => "tunnel",
            Self::Special => "special",
            Self::Redirect => "redirect",
            Self::Local => "local",
        };
        f.write_str(name)
    }
}

/// A single access log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub client_ip: String,
    pub method: String,
    pub host: String,
    pub path: String,
    /// 0 when the connection was closed without a response
    pub status: u16,
    pub duration_ms: u64,
    /// Matched endpoint label
    pub endpoint: Option<String>,
    /// Upstream origin the request went to
    pub upstream: Option<String>,
    pub kind: ForwardKind,
}

/// Access log emitter
#[derive(Debug, Default)]
pub struct AccessLog {
    total_entries: AtomicU64,
}

impl AccessLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing a request
    pub fn start_request(&self, client_ip: IpAddr, method: &str, host: &str, path: &str) -> RequestTracker {
        RequestTracker {
            start: Instant::now(),
            client_ip: client_ip.to_string(),
            method: method.to_string(),
            host: host.to_string(),
            path: path.to_string(),
            endpoint: None,
            upstream: None,
            kind: ForwardKind::Local,
        }
    }

    /// Emit an entry
    pub fn record(&self, entry: &AccessLogEntry) {
        self.total_entries.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: "access_log",
            client_ip = entry.client_ip,
            method = entry.method,
            host = entry.host,
            path = entry.path,
            status = entry.status,
            duration_ms = entry.duration_ms,
            endpoint = entry.endpoint.as_deref().unwrap_or("-"),
            upstream = entry.upstream.as_deref().unwrap_or("-"),
            kind = %entry.kind,
            "{}",
            serde_json::to_string(entry).unwrap_or_default()
        );
    }

    pub fn total_entries(&self) -> u64 {
        self.total_entries.load(Ordering::Relaxed)
    }
}

/// Per-request facts collected while the request is handled
#[derive(Debug, Clone)]
pub struct RequestTracker {
    start: Instant,
    client_ip: String,
    method: String,
    host: String,
    path: String,
    endpoint: Option<String>,
    upstream: Option<String>,
    kind: ForwardKind,
}

impl RequestTracker {
    pub fn set_endpoint(&mut self, endpoint: impl Into<String>) {
        self.endpoint = Some(endpoint.into());
    }

    pub fn set_upstream(&mut self, upstream: impl Into<String>) {
        self.upstream = Some(upstream.into());
    }

    pub fn set_kind(&mut self, kind: ForwardKind) {
        self.kind = kind;
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn upstream(&self) -> Option<&str> {
        self.upstream.as_deref()
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    /// Finish the request with its final status
    pub fn finish(self, status: u16) -> AccessLogEntry {
        AccessLogEntry {
            timestamp: chrono::Utc::now(),
            duration_ms: self.start.elapsed().as_millis() as u64,
            client_ip: self.client_ip,
            method: self.method,
            host: self.host,
            path: self.path,
            status,
            endpoint: self.endpoint,
            upstream: self.upstream,
            kind: self.kind,
        }
    }
}
