//! Configuration types for the proxy gateway
//!
//! Gateway settings and the initial endpoint set are read from HCL
//! (HashiCorp Configuration Language). Endpoints added at runtime are
//! persisted through a [`crate::provider::ConfigStore`].

mod entrypoint;
mod middleware;
mod router;
mod service;

pub use entrypoint::{CertificatePair, HttpRedirectConfig, TlsConfig};
pub use middleware::{
    AccessControlConfig, BasicAuthConfig, CredentialConfig, HeaderAction, HeaderDirection,
    HeaderRuleConfig,
};
pub use router::{
    DefaultSite, EndpointConfig, EndpointKind, RedirectRuleConfig, VirtualDirectoryConfig,
};
pub use service::{OutagePolicy, TransportConfig, UpstreamConfig, UptimeProbeConfig};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{GatewayError, Result};

/// Top-level gateway configuration
///
/// # HCL Example
///
/// ```hcl
/// listen = "0.0.0.0:443"
///
/// tls {
///   cert_file = "/etc/certs/fallback.pem"
///   key_file  = "/etc/certs/fallback.key"
/// }
///
/// http_redirect {
///   address = "0.0.0.0:80"
/// }
///
/// root {
///   kind      = "root"
///   upstreams = [{ origin = "127.0.0.1:8000" }]
/// }
///
/// endpoints "app.example.com" {
///   upstreams = [
///     { origin = "10.0.0.5:8080", weight = 2 },
///     { origin = "10.0.0.6:8080", weight = 1 },
///   ]
/// }
///
/// redirect_rules = [
///   { source = "old.example.com", target = "https://app.example.com", forward_path = true, status = 301 },
/// ]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Main listener address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// HTTPS on the main listener
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Plain-HTTP redirect listener, only started when TLS is enabled
    #[serde(default)]
    pub http_redirect: Option<HttpRedirectConfig>,

    /// Graceful shutdown window in seconds (default: 5)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Deadline applied to both sides of a CONNECT tunnel (default: 300)
    #[serde(default = "default_tunnel_timeout")]
    pub tunnel_timeout_secs: u64,

    /// Accept CONNECT requests
    #[serde(default)]
    pub allow_connect: bool,

    /// Behavior when every upstream of an endpoint is offline
    #[serde(default)]
    pub outage_policy: OutagePolicy,

    /// HMAC key for sticky-session cookies; random per process when absent
    #[serde(default)]
    pub sticky_secret: Option<String>,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Directory holding one JSON record per endpoint
    #[serde(default)]
    pub store_dir: Option<String>,

    #[serde(default)]
    pub access_control: AccessControlConfig,

    #[serde(default)]
    pub uptime_probe: Option<UptimeProbeConfig>,

    /// Catch-all endpoint
    #[serde(default)]
    pub root: Option<EndpointConfig>,

    /// Host endpoints keyed by hostname
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,

    /// URL redirection rules checked before endpoint routing
    #[serde(default)]
    pub redirect_rules: Vec<RedirectRuleConfig>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_tunnel_timeout() -> u64 {
    300
}

impl GatewayConfig {
    /// Load configuration from an HCL file.
    ///
    /// The file must contain valid HCL content regardless of extension.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_hcl(&content)
    }

    /// Parse configuration from an HCL string
    pub fn from_hcl(content: &str) -> Result<Self> {
        hcl::from_str(content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse HCL config: {}", e)))
    }

    /// Parsed main listener address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen.parse().map_err(|e| {
            GatewayError::Config(format!("Invalid listen address '{}': {}", self.listen, e))
        })
    }

    /// True when the main listener serves HTTPS
    pub fn tls_enabled(&self) -> bool {
        self.tls.as_ref().map(|t| t.enabled).unwrap_or(false)
    }

    /// Root plus host endpoints, with kinds and hostnames normalized
    pub fn all_endpoints(&self) -> Vec<EndpointConfig> {
        let mut out = Vec::with_capacity(self.endpoints.len() + 1);
        if let Some(root) = &self.root {
            let mut root = root.clone();
            root.kind = EndpointKind::Root;
            out.push(root);
        }
        let mut names: Vec<&String> = self.endpoints.keys().collect();
        names.sort();
        for name in names {
            let mut ep = self.endpoints[name].clone();
            if ep.hostname.trim().is_empty() {
                ep.hostname = name.clone();
            }
            if ep.kind == EndpointKind::Root {
                ep.kind = EndpointKind::Host;
            }
            out.push(ep);
        }
        out
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        if let Some(redirect) = &self.http_redirect {
            redirect.address.parse::<SocketAddr>().map_err(|e| {
                GatewayError::Config(format!(
                    "Invalid http_redirect address '{}': {}",
                    redirect.address, e
                ))
            })?;
        }

        if let Some(tls) = &self.tls {
            if tls.enabled && (tls.cert_file.is_empty() || tls.key_file.is_empty()) {
                return Err(GatewayError::Config(
                    "TLS is enabled but cert_file/key_file are not set".to_string(),
                ));
            }
        }

        for rule in &self.redirect_rules {
            validate_redirect_rule(rule)?;
        }

        let mut seen = HashSet::new();
        for ep in self.all_endpoints() {
            validate_endpoint(&ep)?;
            for name in matching_names(&ep) {
                if !seen.insert(name.clone()) {
                    return Err(GatewayError::Config(format!(
                        "Duplicate matching key '{}'",
                        name
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Hostnames an endpoint answers to (key and aliases, lowercase)
pub fn matching_names(ep: &EndpointConfig) -> Vec<String> {
    let mut names = vec![ep.key()];
    if ep.kind != EndpointKind::Root {
        names.extend(ep.aliases.iter().map(|a| a.trim().to_ascii_lowercase()));
    }
    names
}

/// Validate one redirection rule
pub fn validate_redirect_rule(rule: &RedirectRuleConfig) -> Result<()> {
    let source = rule.source_key();
    if source.is_empty() || source.starts_with('/') {
        return Err(GatewayError::Config(format!(
            "Redirect rule '{}': source must start with a host",
            rule.source
        )));
    }
    if rule.target.trim().is_empty() {
        return Err(GatewayError::Config(format!(
            "Redirect rule '{}': target is empty",
            rule.source
        )));
    }
    if !matches!(rule.status, 301 | 302 | 307 | 308) {
        return Err(GatewayError::Config(format!(
            "Redirect rule '{}': status {} is not a redirect (use 301, 302, 307 or 308)",
            rule.source, rule.status
        )));
    }
    Ok(())
}

/// Validate a single endpoint record
pub fn validate_endpoint(ep: &EndpointConfig) -> Result<()> {
    let key = ep.key();
    match ep.kind {
        EndpointKind::Root => {
            if ep.default_site == DefaultSite::Redirect && ep.default_site_target.is_empty() {
                return Err(GatewayError::Config(
                    "Root endpoint redirects but default_site_target is empty".to_string(),
                ));
            }
        }
        EndpointKind::Host => {
            if key.is_empty() {
                return Err(GatewayError::Config(
                    "Host endpoint has an empty hostname".to_string(),
                ));
            }
            if key.contains('/') || key.contains(' ') {
                return Err(GatewayError::Config(format!(
                    "Invalid hostname '{}'",
                    key
                )));
            }
        }
        EndpointKind::PathPrefix => {
            return Err(GatewayError::Config(format!(
                "Endpoint '{}': path-prefix routes must be declared as virtual directories",
                key
            )));
        }
    }

    for alias in &ep.aliases {
        if alias.trim().is_empty() {
            return Err(GatewayError::Config(format!(
                "Endpoint '{}' has an empty alias",
                key
            )));
        }
    }

    for upstream in ep.upstreams.iter().chain(ep.inactive_upstreams.iter()) {
        validate_upstream(&key, upstream)?;
    }

    let mut prefixes = HashSet::new();
    for vdir in &ep.virtual_directories {
        if !vdir.path_prefix.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "Endpoint '{}': virtual directory '{}' must start with '/'",
                key, vdir.path_prefix
            )));
        }
        if !prefixes.insert(vdir.path_prefix.trim_end_matches('/').to_string()) {
            return Err(GatewayError::Config(format!(
                "Endpoint '{}': duplicate virtual directory '{}'",
                key, vdir.path_prefix
            )));
        }
        for upstream in &vdir.upstreams {
            validate_upstream(&key, upstream)?;
        }
    }

    Ok(())
}

fn validate_upstream(endpoint: &str, upstream: &UpstreamConfig) -> Result<()> {
    let origin = upstream.origin.trim();
    if origin.is_empty() {
        return Err(GatewayError::Config(format!(
            "Endpoint '{}' has an upstream with an empty origin",
            endpoint
        )));
    }
    if origin.contains("://") {
        return Err(GatewayError::Config(format!(
            "Endpoint '{}': origin '{}' must not carry a scheme; use require_tls",
            endpoint, origin
        )));
    }
    let authority = origin.split(['/', '?']).next().unwrap_or_default();
    authority.parse::<http::uri::Authority>().map_err(|e| {
        GatewayError::Config(format!(
            "Endpoint '{}': invalid origin '{}': {}",
            endpoint, origin, e
        ))
    })?;
    Ok(())
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tls: None,
            http_redirect: None,
            shutdown_timeout_secs: default_shutdown_timeout(),
            tunnel_timeout_secs: default_tunnel_timeout(),
            allow_connect: false,
            outage_policy: OutagePolicy::default(),
            sticky_secret: None,
            transport: TransportConfig::default(),
            store_dir: None,
            access_control: AccessControlConfig::default(),
            uptime_probe: None,
            root: None,
            endpoints: HashMap::new(),
            redirect_rules: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.shutdown_timeout_secs, 5);
        assert_eq!(config.tunnel_timeout_secs, 300);
        assert!(!config.allow_connect);
        assert!(!config.tls_enabled());
        assert!(config.root.is_none());
        assert!(config.endpoints.is_empty());
    }

    #[test]
    fn test_parse_minimal_config() {
        let hcl = r#"
            listen = "127.0.0.1:9000"
        "#;
        let config = GatewayConfig::from_hcl(hcl).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let hcl = r#"
            listen         = "0.0.0.0:443"
            allow_connect  = true
            outage_policy  = "fail-closed"
            sticky_secret  = "s3cret"

            tls {
                cert_file = "/etc/certs/cert.pem"
                key_file  = "/etc/certs/key.pem"
            }

            http_redirect {
                address = "0.0.0.0:80"
            }

            root {
                kind         = "root"
                default_site = "redirect"
                default_site_target = "https://example.com"
            }

            endpoints "App.Example.com" {
                aliases   = ["www.example.com"]
                upstreams = [
                    { origin = "10.0.0.5:8080", weight = 2 },
                    { origin = "10.0.0.6:8080", weight = 0 },
                ]
                virtual_directories = [
                    { path_prefix = "/api/", upstreams = [{ origin = "10.0.0.7:9000" }] },
                ]
            }
        "#;
        let config = GatewayConfig::from_hcl(hcl).unwrap();
        assert!(config.tls_enabled());
        assert!(config.allow_connect);
        assert_eq!(config.outage_policy, OutagePolicy::FailClosed);
        assert_eq!(config.endpoints.len(), 1);
        config.validate().unwrap();

        let all = config.all_endpoints();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, EndpointKind::Root);
        assert_eq!(all[1].key(), "app.example.com");
        assert_eq!(all[1].upstreams[1].weight, 0);
    }

    #[test]
    fn test_validate_duplicate_alias() {
        let hcl = r#"
            endpoints "a.example.com" {
                upstreams = [{ origin = "127.0.0.1:1" }]
            }
            endpoints "b.example.com" {
                aliases   = ["a.example.com"]
                upstreams = [{ origin = "127.0.0.1:2" }]
            }
        "#;
        let config = GatewayConfig::from_hcl(hcl).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate matching key"));
    }

    #[test]
    fn test_parse_redirect_rules() {
        let hcl = r#"
            redirect_rules = [
              { source = "old.example.com", target = "https://new.example.com", forward_path = true, status = 301 },
              { source = "old.example.com/docs", target = "docs.example.com" },
            ]
        "#;
        let config = GatewayConfig::from_hcl(hcl).unwrap();
        assert_eq!(config.redirect_rules.len(), 2);
        assert!(config.redirect_rules[0].forward_path);
        assert_eq!(config.redirect_rules[0].status, 301);
        assert_eq!(config.redirect_rules[1].status, 307);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_duplicate_virtual_directory() {
        let mut ep = EndpointConfig::host("a.example.com", "127.0.0.1:80");
        ep.virtual_directories
            .push(VirtualDirectoryConfig::new("/api", "127.0.0.1:81"));
        ep.virtual_directories
            .push(VirtualDirectoryConfig::new("/api/", "127.0.0.1:82"));
        let err = validate_endpoint(&ep).unwrap_err();
        assert!(err.to_string().contains("duplicate virtual directory"));
    }

    #[test]
    fn test_validate_rejects_scheme_in_origin() {
        let ep = EndpointConfig::host("a.example.com", "http://127.0.0.1:80");
        assert!(validate_endpoint(&ep).is_err());
    }

    #[test]
    fn test_validate_accepts_origin_with_base_path() {
        let ep = EndpointConfig::host("a.example.com", "backend.internal:8080/blog?x=1");
        assert!(validate_endpoint(&ep).is_ok());
    }

    #[test]
    fn test_validate_tls_without_files() {
        let config = GatewayConfig {
            tls: Some(TlsConfig {
                enabled: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_redirect_rules() {
        let mut rule = RedirectRuleConfig::new("old.example.com", "https://new.example.com");
        assert!(validate_redirect_rule(&rule).is_ok());
        rule.status = 200;
        assert!(validate_redirect_rule(&rule).is_err());
        rule.status = 308;
        rule.target = "  ".into();
        assert!(validate_redirect_rule(&rule).is_err());
        assert!(validate_redirect_rule(&RedirectRuleConfig::new("/blog", "x")).is_err());

        let config = GatewayConfig {
            redirect_rules: vec![RedirectRuleConfig {
                status: 404,
                ..RedirectRuleConfig::new("old.example.com", "new.example.com")
            }],
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("404"));
    }

    #[test]
    fn test_validate_bad_listen() {
        let config = GatewayConfig {
            listen: "not-an-address".into(),
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("listen"));
    }

    #[test]
    fn test_root_redirect_needs_target() {
        let mut root = EndpointConfig::root("127.0.0.1:80");
        root.default_site = DefaultSite::Redirect;
        assert!(validate_endpoint(&root).is_err());
        root.default_site_target = "https://example.com".into();
        assert!(validate_endpoint(&root).is_ok());
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.hcl");
        tokio::fs::write(&path, "listen = \"127.0.0.1:7000\"\n")
            .await
            .unwrap();
        let config = GatewayConfig::from_file(&path).await.unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000");
    }

    #[tokio::test]
    async fn test_from_missing_file() {
        let err = GatewayConfig::from_file("/nonexistent/gateway.hcl")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
