//! Router: the endpoint table and request-to-endpoint matching
//!
//! Matching order for a request:
//! 1. host endpoint by exact key, then alias, then wildcard
//! 2. the longest virtual directory prefix under that host
//! 3. otherwise the root endpoint and its virtual directories
//!
//! Special rules and redirect rules are checked before any of this by the
//! caller.

mod endpoint;
pub mod redirect;
pub mod special;

pub use endpoint::ProxyEndpoint;
pub use redirect::RedirectRules;
pub use special::{static_responder, AcmeChallengeResponder, SpecialRule, SpecialRules};

use crate::config::EndpointKind;
use crate::proxy::headers::strip_port;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A matched request target
#[derive(Debug, Clone)]
pub struct RouteMatch {
    /// The host or root endpoint
    pub endpoint: Arc<ProxyEndpoint>,
    /// The virtual directory beneath it, when one matched
    pub virtual_directory: Option<Arc<ProxyEndpoint>>,
}

impl RouteMatch {
    /// The record that actually serves the request
    pub fn target(&self) -> &Arc<ProxyEndpoint> {
        self.virtual_directory.as_ref().unwrap_or(&self.endpoint)
    }

    /// Key for logs and statistics, `host` or `host/prefix`
    pub fn label(&self) -> String {
        match &self.virtual_directory {
            Some(v) => format!("{}{}", self.endpoint.key.trim_end_matches('/'), v.prefix()),
            None => self.endpoint.key.clone(),
        }
    }
}

#[derive(Default)]
struct Table {
    hosts: HashMap<String, Arc<ProxyEndpoint>>,
    /// alias → endpoint key
    aliases: HashMap<String, String>,
    /// Wildcard-bearing endpoint keys, sorted
    wildcards: Vec<String>,
    root: Option<Arc<ProxyEndpoint>>,
}

impl Table {
    fn reindex(&mut self) {
        self.aliases.clear();
        self.wildcards.clear();
        for (key, ep) in &self.hosts {
            for alias in &ep.aliases {
                self.aliases.insert(alias.clone(), key.clone());
            }
            if key.starts_with("*.") || ep.aliases.iter().any(|a| a.starts_with("*.")) {
                self.wildcards.push(key.clone());
            }
        }
        self.wildcards.sort();
    }
}

/// Concurrency-safe endpoint table
///
/// Readers clone an `Arc<ProxyEndpoint>` under a short read lock; writers
/// replace whole endpoints, never fields.
#[derive(Default)]
pub struct RouterTable {
    table: RwLock<Table>,
}

impl std::fmt::Debug for RouterTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.read().unwrap();
        f.debug_struct("RouterTable")
            .field("hosts", &table.hosts.len())
            .field("root", &table.root.is_some())
            .finish()
    }
}

impl RouterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an endpoint; returns the one it replaced
    pub fn insert(&self, endpoint: Arc<ProxyEndpoint>) -> Option<Arc<ProxyEndpoint>> {
        let mut table = self.table.write().unwrap();
        match endpoint.kind {
            EndpointKind::Root => table.root.replace(endpoint),
            _ => {
                let previous = table.hosts.insert(endpoint.key.clone(), endpoint);
                table.reindex();
                previous
            }
        }
    }

    /// Remove an endpoint by key (`/` for root)
    pub fn remove(&self, key: &str) -> Option<Arc<ProxyEndpoint>> {
        let mut table = self.table.write().unwrap();
        if key == "/" {
            return table.root.take();
        }
        let removed = table.hosts.remove(&key.to_ascii_lowercase());
        if removed.is_some() {
            table.reindex();
        }
        removed
    }

    /// Endpoint by key (`/` for root)
    pub fn get(&self, key: &str) -> Option<Arc<ProxyEndpoint>> {
        let table = self.table.read().unwrap();
        if key == "/" {
            return table.root.clone();
        }
        table.hosts.get(&key.to_ascii_lowercase()).cloned()
    }

    pub fn root(&self) -> Option<Arc<ProxyEndpoint>> {
        self.table.read().unwrap().root.clone()
    }

    /// Root first, then hosts in key order
    pub fn endpoints(&self) -> Vec<Arc<ProxyEndpoint>> {
        let table = self.table.read().unwrap();
        let mut hosts: Vec<_> = table.hosts.values().cloned().collect();
        hosts.sort_by(|a, b| a.key.cmp(&b.key));
        table.root.iter().cloned().chain(hosts).collect()
    }

    /// Whether any endpoint other than `except` claims `name` as key or alias
    pub fn name_taken(&self, name: &str, except: &str) -> bool {
        let table = self.table.read().unwrap();
        let name = name.to_ascii_lowercase();
        let key_hit = table.hosts.contains_key(&name) && name != except;
        let alias_hit = table
            .aliases
            .get(&name)
            .map(|owner| owner != except)
            .unwrap_or(false);
        key_hit || alias_hit
    }

    pub fn len(&self) -> usize {
        let table = self.table.read().unwrap();
        table.hosts.len() + usize::from(table.root.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host endpoint for a `Host` header value; disabled endpoints never match
    pub fn resolve_host(&self, host: &str) -> Option<Arc<ProxyEndpoint>> {
        let host = strip_port(host.trim()).to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }
        let table = self.table.read().unwrap();

        let enabled = |ep: &Arc<ProxyEndpoint>| (!ep.disabled).then(|| ep.clone());

        if let Some(ep) = table.hosts.get(&host).and_then(enabled) {
            return Some(ep);
        }
        if let Some(ep) = table
            .aliases
            .get(&host)
            .and_then(|key| table.hosts.get(key))
            .and_then(enabled)
        {
            return Some(ep);
        }
        table
            .wildcards
            .iter()
            .filter_map(|key| table.hosts.get(key))
            .filter(|ep| !ep.disabled)
            .find(|ep| ep.matches_wildcard(&host))
            .cloned()
    }

    /// Match a request by host and path
    pub fn route(&self, host: &str, path: &str) -> Option<RouteMatch> {
        let endpoint = self
            .resolve_host(host)
            .or_else(|| self.root().filter(|r| !r.disabled))?;
        let virtual_directory = endpoint.match_virtual_directory(path).cloned();
        Some(RouteMatch {
            endpoint,
            virtual_directory,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, TransportConfig, VirtualDirectoryConfig};

    fn compiled(config: &EndpointConfig) -> Arc<ProxyEndpoint> {
        Arc::new(ProxyEndpoint::compile(config, &TransportConfig::default(), None).unwrap())
    }

    fn table() -> RouterTable {
        let table = RouterTable::new();
        table.insert(compiled(&EndpointConfig::root("127.0.0.1:8000")));
        let mut app = EndpointConfig::host("app.example.com", "127.0.0.1:8001");
        app.aliases = vec!["www.example.com".into()];
        app.virtual_directories = vec![
            VirtualDirectoryConfig::new("/api", "127.0.0.1:9001"),
            VirtualDirectoryConfig::new("/api/v2", "127.0.0.1:9002"),
        ];
        table.insert(compiled(&app));
        table.insert(compiled(&EndpointConfig::host("*.example.org", "127.0.0.1:8002")));
        table.insert(compiled(&EndpointConfig::host("*.shop.example.org", "127.0.0.1:8003")));
        table
    }

    #[tokio::test]
    async fn test_exact_host_wins_over_root() {
        let t = table();
        let m = t.route("APP.example.com:8443", "/").unwrap();
        assert_eq!(m.endpoint.key, "app.example.com");
        assert!(m.virtual_directory.is_none());
        assert_eq!(m.label(), "app.example.com");
    }

    #[tokio::test]
    async fn test_alias_and_wildcard() {
        let t = table();
        assert_eq!(t.route("www.example.com", "/").unwrap().endpoint.key, "app.example.com");
        // Sorted key order: "*.example.org" < "*.shop.example.org"
        assert_eq!(t.route("x.shop.example.org", "/").unwrap().endpoint.key, "*.example.org");
        assert_eq!(t.route("blog.example.org", "/").unwrap().endpoint.key, "*.example.org");
    }

    #[tokio::test]
    async fn test_unknown_host_falls_to_root() {
        let t = table();
        let m = t.route("unknown.net", "/x").unwrap();
        assert_eq!(m.endpoint.key, "/");
        assert_eq!(t.route("", "/").unwrap().endpoint.key, "/");
    }

    #[tokio::test]
    async fn test_longest_prefix() {
        let t = table();
        let m = t.route("app.example.com", "/api/v2/users").unwrap();
        assert_eq!(m.target().key, "/api/v2");
        assert_eq!(m.label(), "app.example.com/api/v2");
        let m = t.route("app.example.com", "/api/users").unwrap();
        assert_eq!(m.target().key, "/api");
    }

    #[tokio::test]
    async fn test_no_root_and_no_match() {
        let t = RouterTable::new();
        t.insert(compiled(&EndpointConfig::host("a.example.com", "127.0.0.1:8001")));
        assert!(t.route("b.example.com", "/").is_none());
    }

    #[tokio::test]
    async fn test_disabled_host_falls_through() {
        let t = table();
        let mut cfg = EndpointConfig::host("app.example.com", "127.0.0.1:8001");
        cfg.disabled = true;
        t.insert(compiled(&cfg));
        assert_eq!(t.route("app.example.com", "/").unwrap().endpoint.key, "/");
    }

    #[tokio::test]
    async fn test_insert_replace_remove() {
        let t = table();
        assert_eq!(t.len(), 4);
        let old = t.insert(compiled(&EndpointConfig::host("app.example.com", "127.0.0.1:9999")));
        assert!(old.is_some());
        assert_eq!(t.len(), 4);
        // Replacement dropped the alias
        assert_eq!(t.route("www.example.com", "/").unwrap().endpoint.key, "/");

        assert!(t.remove("APP.example.com").is_some());
        assert!(t.get("app.example.com").is_none());
        assert!(t.remove("/").is_some());
        assert!(t.root().is_none());
        assert_eq!(t.endpoints().len(), 2);
    }

    #[tokio::test]
    async fn test_name_taken() {
        let t = table();
        assert!(t.name_taken("www.example.com", "other.example.com"));
        assert!(!t.name_taken("www.example.com", "app.example.com"));
        assert!(t.name_taken("app.example.com", "new.example.com"));
        assert!(!t.name_taken("free.example.com", ""));
    }
}
