//! Endpoint configuration: one persisted record per routing rule

use super::middleware::{BasicAuthConfig, HeaderRuleConfig};
use super::service::UpstreamConfig;
use serde::{Deserialize, Serialize};

/// Discriminant of a routing rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[derive(Default)]
pub enum EndpointKind {
    /// Catch-all endpoint
    Root,
    /// Matched by hostname
    #[default]
    Host,
    /// Matched by path prefix beneath a host or the root
    PathPrefix,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Root => write!(f, "root"),
            Self::Host => write!(f, "host"),
            Self::PathPrefix => write!(f, "path-prefix"),
        }
    }
}

/// Behavior of the root endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[derive(Default)]
pub enum DefaultSite {
    /// Forward to the root upstreams
    #[default]
    ReverseProxy,
    /// Redirect to `default_site_target`
    Redirect,
    /// Answer 404
    NotFound,
    /// Close the connection without answering
    NoResponse,
}

/// A routing rule
///
/// # HCL Example
///
/// ```hcl
/// endpoints "app.example.com" {
///   aliases        = ["www.example.com", "*.app.example.com"]
///   upstreams      = [{ origin = "127.0.0.1:8080" }]
///   sticky_session = true
///   rate_limit     = 100
///
///   virtual_directories = [
///     { path_prefix = "/api/", upstreams = [{ origin = "127.0.0.1:9000" }] },
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Root or host
    #[serde(default)]
    pub kind: EndpointKind,

    /// Matching key for host endpoints (filled from the block label when empty)
    #[serde(default)]
    pub hostname: String,

    /// Additional hostnames served by this endpoint; may use `*.` wildcards
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Active upstreams
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    /// Upstreams kept in the record but never selected
    #[serde(default)]
    pub inactive_upstreams: Vec<UpstreamConfig>,

    /// Path-prefix sub-routes
    #[serde(default)]
    pub virtual_directories: Vec<VirtualDirectoryConfig>,

    /// Plain-HTTP requests are redirected to HTTPS or rejected
    #[serde(default)]
    pub require_tls: bool,

    /// Serve this endpoint over plain HTTP on the redirect listener
    #[serde(default)]
    pub bypass_global_tls: bool,

    /// Default for upstreams that do not set it themselves
    #[serde(default)]
    pub skip_cert_validation: bool,

    #[serde(default)]
    pub header_rules: Vec<HeaderRuleConfig>,

    /// Strict-Transport-Security max-age (0 = off)
    #[serde(default)]
    pub hsts_max_age: u64,

    /// Permissions-Policy header value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_policy: Option<String>,

    /// Force the outbound Host header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_header_override: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuthConfig>,

    /// Requests per second per client IP (0 = unlimited)
    #[serde(default)]
    pub rate_limit: u32,

    #[serde(default)]
    pub sticky_session: bool,

    /// Force `Cache-Control: no-store` on requests and responses
    #[serde(default)]
    pub no_cache: bool,

    /// Copy every inbound header to the WebSocket dial
    #[serde(default)]
    pub ws_copy_all_headers: bool,

    #[serde(default)]
    pub disabled: bool,

    /// Root only
    #[serde(default)]
    pub default_site: DefaultSite,

    /// Root only, used with `default_site = "redirect"`
    #[serde(default)]
    pub default_site_target: String,
}

impl EndpointConfig {
    /// Host endpoint with one plain-HTTP upstream
    pub fn host(hostname: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            kind: EndpointKind::Host,
            hostname: hostname.into(),
            upstreams: vec![UpstreamConfig::new(origin)],
            ..Self::blank()
        }
    }

    /// Root endpoint with one plain-HTTP upstream
    pub fn root(origin: impl Into<String>) -> Self {
        Self {
            kind: EndpointKind::Root,
            upstreams: vec![UpstreamConfig::new(origin)],
            ..Self::blank()
        }
    }

    fn blank() -> Self {
        Self {
            kind: EndpointKind::Host,
            hostname: String::new(),
            aliases: Vec::new(),
            upstreams: Vec::new(),
            inactive_upstreams: Vec::new(),
            virtual_directories: Vec::new(),
            require_tls: false,
            bypass_global_tls: false,
            skip_cert_validation: false,
            header_rules: Vec::new(),
            hsts_max_age: 0,
            permission_policy: None,
            host_header_override: None,
            basic_auth: None,
            rate_limit: 0,
            sticky_session: false,
            no_cache: false,
            ws_copy_all_headers: false,
            disabled: false,
            default_site: DefaultSite::ReverseProxy,
            default_site_target: String::new(),
        }
    }

    /// Store key: `"/"` for the root, the lowercase hostname otherwise
    pub fn key(&self) -> String {
        match self.kind {
            EndpointKind::Root => "/".to_string(),
            _ => self.hostname.trim().to_ascii_lowercase(),
        }
    }
}

/// A path-prefix sub-route beneath a host or the root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDirectoryConfig {
    /// Matched against the start of the request path
    pub path_prefix: String,

    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    /// Appended after the parent endpoint's rules
    #[serde(default)]
    pub header_rules: Vec<HeaderRuleConfig>,

    #[serde(default)]
    pub skip_cert_validation: bool,

    #[serde(default)]
    pub disabled: bool,
}

impl VirtualDirectoryConfig {
    pub fn new(path_prefix: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            upstreams: vec![UpstreamConfig::new(origin)],
            header_rules: Vec::new(),
            skip_cert_validation: false,
            disabled: false,
        }
    }
}

/// URL redirection rule checked before endpoint routing
///
/// `source` is matched as a prefix of `host + path`; the longest match wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRuleConfig {
    /// `host[/path]` prefix, e.g. `old.example.com/blog`
    pub source: String,

    /// Destination URL; `http://` is assumed when no scheme is given
    pub target: String,

    /// Append the request path and query to `target`
    #[serde(default)]
    pub forward_path: bool,

    /// 301, 302, 307 or 308 (default: 307)
    #[serde(default = "default_redirect_status")]
    pub status: u16,
}

fn default_redirect_status() -> u16 {
    307
}

impl RedirectRuleConfig {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            forward_path: false,
            status: default_redirect_status(),
        }
    }

    /// Source without scheme, with a lowercase host part
    pub fn source_key(&self) -> String {
        let source = self.source.trim();
        let source = source
            .strip_prefix("https://")
            .or_else(|| source.strip_prefix("http://"))
            .unwrap_or(source);
        match source.find('/') {
            Some(i) => format!("{}{}", source[..i].to_ascii_lowercase(), &source[i..]),
            None => source.to_ascii_lowercase(),
        }
    }
}
