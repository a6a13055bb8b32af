//! Compiled endpoint: the immutable form of an `EndpointConfig`
//!
//! Edits never mutate a `ProxyEndpoint`; they compile a new one and swap it
//! into the table, so a request holding an `Arc` keeps a consistent view.

use crate::config::{
    DefaultSite, EndpointConfig, EndpointKind, TransportConfig, UpstreamConfig,
    VirtualDirectoryConfig,
};
use crate::error::Result;
use crate::middleware::{HeaderRewriteRules, Pipeline};
use crate::proxy::streaming::{HOST_FLUSH_INTERVAL, VDIR_FLUSH_INTERVAL};
use crate::service::Upstream;
use std::sync::Arc;
use std::time::Duration;

/// A compiled routing rule
pub struct ProxyEndpoint {
    pub kind: EndpointKind,
    /// `/` for root, the lowercase hostname for hosts, the prefix for
    /// virtual directories
    pub key: String,
    pub aliases: Vec<String>,
    pub upstreams: Vec<Arc<Upstream>>,
    pub inactive_upstreams: Vec<Arc<Upstream>>,
    /// Sorted longest prefix first
    pub virtual_directories: Vec<Arc<ProxyEndpoint>>,
    pub require_tls: bool,
    pub bypass_global_tls: bool,
    pub sticky_session: bool,
    pub no_cache: bool,
    pub ws_copy_all_headers: bool,
    pub disabled: bool,
    pub host_header_override: Option<String>,
    pub default_site: DefaultSite,
    pub default_site_target: String,
    pub pipeline: Pipeline,
    pub rules: HeaderRewriteRules,
    pub flush_interval: Duration,
    config: EndpointConfig,
}

impl std::fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("upstreams", &self.upstreams)
            .field("virtual_directories", &self.virtual_directories.len())
            .finish()
    }
}

impl ProxyEndpoint {
    /// Compile an endpoint and start its upstream clients.
    ///
    /// Upstreams of `previous` with identical settings are reused so their
    /// connection pools survive an edit.
    pub fn compile(
        config: &EndpointConfig,
        transport: &TransportConfig,
        previous: Option<&ProxyEndpoint>,
    ) -> Result<Self> {
        let reuse: Vec<Arc<Upstream>> = previous.map(|p| p.all_upstreams()).unwrap_or_default();

        let upstreams = build_upstreams(
            &config.upstreams,
            config.skip_cert_validation,
            transport,
            &reuse,
            true,
        )?;
        let inactive_upstreams = build_upstreams(
            &config.inactive_upstreams,
            config.skip_cert_validation,
            transport,
            &reuse,
            false,
        )?;

        let include_subdomains = config.hostname.starts_with("*.")
            || config.aliases.iter().any(|a| a.starts_with("*."));
        let rules = HeaderRewriteRules::compile(
            &config.header_rules,
            config.hsts_max_age,
            include_subdomains,
            config.permission_policy.as_deref(),
        )?;
        let pipeline = Pipeline::for_endpoint(config)?;

        let mut vdirs = Vec::with_capacity(config.virtual_directories.len());
        for vdir in &config.virtual_directories {
            let old = previous.and_then(|p| p.find_virtual_directory(&vdir.path_prefix));
            vdirs.push(Arc::new(Self::compile_virtual_directory(
                vdir,
                config,
                &rules,
                &pipeline,
                transport,
                old.map(|v| v.as_ref()),
            )?));
        }
        // Stable sort keeps registration order among equal lengths
        vdirs.sort_by(|a, b| b.prefix_len().cmp(&a.prefix_len()));

        Ok(Self {
            kind: config.kind,
            key: config.key(),
            aliases: config
                .aliases
                .iter()
                .map(|a| a.trim().to_ascii_lowercase())
                .collect(),
            upstreams,
            inactive_upstreams,
            virtual_directories: vdirs,
            require_tls: config.require_tls,
            bypass_global_tls: config.bypass_global_tls,
            sticky_session: config.sticky_session,
            no_cache: config.no_cache,
            ws_copy_all_headers: config.ws_copy_all_headers,
            disabled: config.disabled,
            host_header_override: config.host_header_override.clone(),
            default_site: config.default_site,
            default_site_target: config.default_site_target.clone(),
            pipeline,
            rules,
            flush_interval: HOST_FLUSH_INTERVAL,
            config: config.clone(),
        })
    }

    fn compile_virtual_directory(
        vdir: &VirtualDirectoryConfig,
        parent: &EndpointConfig,
        parent_rules: &HeaderRewriteRules,
        parent_pipeline: &Pipeline,
        transport: &TransportConfig,
        previous: Option<&ProxyEndpoint>,
    ) -> Result<Self> {
        let reuse = previous.map(|p| p.all_upstreams()).unwrap_or_default();
        let skip = vdir.skip_cert_validation || parent.skip_cert_validation;
        let upstreams = build_upstreams(&vdir.upstreams, skip, transport, &reuse, true)?;

        let mut rules = parent_rules.clone();
        rules.extend(&HeaderRewriteRules::compile(&vdir.header_rules, 0, false, None)?);

        Ok(Self {
            kind: EndpointKind::PathPrefix,
            key: vdir.path_prefix.trim().to_string(),
            aliases: Vec::new(),
            upstreams,
            inactive_upstreams: Vec::new(),
            virtual_directories: Vec::new(),
            require_tls: parent.require_tls,
            bypass_global_tls: parent.bypass_global_tls,
            sticky_session: parent.sticky_session,
            no_cache: parent.no_cache,
            ws_copy_all_headers: parent.ws_copy_all_headers,
            disabled: vdir.disabled,
            host_header_override: parent.host_header_override.clone(),
            default_site: DefaultSite::ReverseProxy,
            default_site_target: String::new(),
            pipeline: parent_pipeline.clone(),
            rules,
            flush_interval: VDIR_FLUSH_INTERVAL,
            config: parent.clone(),
        })
    }

    /// Source configuration (for a virtual directory, its parent's)
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Active and inactive upstreams
    pub fn all_upstreams(&self) -> Vec<Arc<Upstream>> {
        self.upstreams
            .iter()
            .chain(self.inactive_upstreams.iter())
            .cloned()
            .collect()
    }

    /// Prefix without its trailing slash; `/` stays `/`
    pub fn prefix(&self) -> &str {
        let trimmed = self.key.trim_end_matches('/');
        if trimmed.is_empty() {
            "/"
        } else {
            trimmed
        }
    }

    fn prefix_len(&self) -> usize {
        self.prefix().len()
    }

    fn find_virtual_directory(&self, prefix: &str) -> Option<&Arc<ProxyEndpoint>> {
        let wanted = prefix.trim().trim_end_matches('/');
        self.virtual_directories
            .iter()
            .find(|v| v.key.trim_end_matches('/') == wanted)
    }

    /// Whether `path` falls under this virtual directory
    pub fn matches_path(&self, path: &str) -> bool {
        let prefix = self.prefix();
        if prefix == "/" {
            return true;
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Longest enabled virtual directory covering `path`
    pub fn match_virtual_directory(&self, path: &str) -> Option<&Arc<ProxyEndpoint>> {
        self.virtual_directories
            .iter()
            .filter(|v| !v.disabled)
            .find(|v| v.matches_path(path))
    }

    /// Path to request from the upstream with the prefix removed
    pub fn strip_prefix<'a>(&self, path: &'a str) -> &'a str {
        let prefix = self.prefix();
        if prefix == "/" {
            return path;
        }
        match path.strip_prefix(prefix) {
            Some("") => "/",
            Some(rest) => rest,
            None => path,
        }
    }

    /// A request for `/app` where `/app/` is registered gets redirected
    pub fn needs_trailing_slash(&self, path: &str) -> bool {
        self.key.ends_with('/') && self.key.len() > 1 && path == self.prefix()
    }

    /// Whether `host` (lowercase, no port) matches a wildcard key or alias
    pub fn matches_wildcard(&self, host: &str) -> bool {
        std::iter::once(&self.key)
            .chain(self.aliases.iter())
            .filter_map(|name| name.strip_prefix("*."))
            .any(|suffix| {
                host.len() > suffix.len() + 1
                    && host.ends_with(suffix)
                    && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
            })
    }
}

fn build_upstreams(
    configs: &[UpstreamConfig],
    inherit_skip: bool,
    transport: &TransportConfig,
    reuse: &[Arc<Upstream>],
    start: bool,
) -> Result<Vec<Arc<Upstream>>> {
    let mut out = Vec::with_capacity(configs.len());
    for cfg in configs {
        let effective_skip = cfg.skip_cert_validation || inherit_skip;
        let existing = reuse
            .iter()
            .find(|u| u.config() == cfg && u.skip_cert_validation == effective_skip);
        let upstream = match existing {
            Some(u) => u.clone(),
            None => Arc::new(Upstream::from_config(cfg, inherit_skip)?),
        };
        if start {
            upstream.start_proxy(transport)?;
        }
        out.push(upstream);
    }
    Ok(out)
}
