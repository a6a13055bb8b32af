//! Gateway orchestrator: owns the router, load balancer and collaborators
//!
//! Administrative calls validate a new endpoint record, compile it into an
//! immutable [`ProxyEndpoint`], persist it and swap it into the router in
//! one step. Requests in flight keep the `Arc` they already hold.

use crate::config::{
    matching_names, validate_endpoint, EndpointConfig, EndpointKind, GatewayConfig,
    RedirectRuleConfig, UpstreamConfig, VirtualDirectoryConfig,
};
use crate::entrypoint::{self, Listeners, SharedState};
use crate::error::{GatewayError, Result};
use crate::observability::AccessLog;
use crate::provider::{
    AccessControl, AllowAll, CertificateResolver, ConfigStore, IpDenyList, JsonDirStore,
    MemoryStore, StaticCertificates, StatsRecorder, TracingStats,
};
use crate::router::{
    AcmeChallengeResponder, ProxyEndpoint, RedirectRules, RouterTable, SpecialRules,
};
use crate::service::health_check::ProbeTargets;
use crate::service::{LoadBalancer, StickySessions, Upstream, UptimeProbe};
use crate::{RouterState, RouterStatus};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// One row of [`Gateway::list_endpoints`]
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSummary {
    pub key: String,
    pub kind: EndpointKind,
    pub aliases: Vec<String>,
    pub upstreams: usize,
    pub inactive_upstreams: usize,
    pub virtual_directories: usize,
    pub require_tls: bool,
    pub disabled: bool,
}

impl EndpointSummary {
    fn of(endpoint: &ProxyEndpoint) -> Self {
        Self {
            key: endpoint.key.clone(),
            kind: endpoint.kind,
            aliases: endpoint.aliases.clone(),
            upstreams: endpoint.upstreams.len(),
            inactive_upstreams: endpoint.inactive_upstreams.len(),
            virtual_directories: endpoint.virtual_directories.len(),
            require_tls: endpoint.require_tls,
            disabled: endpoint.disabled,
        }
    }
}

/// Live view of one upstream
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    pub origin: String,
    pub active: bool,
    pub weight: u32,
    pub require_tls: bool,
    /// Forwarding client started
    pub ready: bool,
    /// Last reported liveness
    pub online: bool,
}

/// Virtual directory with live upstream state
#[derive(Debug, Clone, Serialize)]
pub struct VirtualDirectoryDetail {
    pub path_prefix: String,
    pub disabled: bool,
    pub upstreams: Vec<UpstreamStatus>,
}

/// Result of [`Gateway::endpoint_detail`]
#[derive(Debug, Clone, Serialize)]
pub struct EndpointDetail {
    pub summary: EndpointSummary,
    pub upstreams: Vec<UpstreamStatus>,
    pub virtual_directories: Vec<VirtualDirectoryDetail>,
    /// Stored record
    pub config: EndpointConfig,
}

struct Running {
    listeners: Listeners,
    probe: Option<(watch::Sender<bool>, JoinHandle<()>)>,
    started_at: Instant,
}

/// The gateway: router, load balancer, collaborators and listeners
pub struct Gateway {
    config: RwLock<GatewayConfig>,
    state: RwLock<RouterState>,
    router: Arc<RouterTable>,
    lb: Arc<LoadBalancer>,
    special: Arc<SpecialRules>,
    redirects: Arc<RedirectRules>,
    acme: AcmeChallengeResponder,
    access_log: Arc<AccessLog>,
    access: Arc<dyn AccessControl>,
    stats: Arc<dyn StatsRecorder>,
    certificates: Arc<dyn CertificateResolver>,
    store: Arc<dyn ConfigStore>,
    /// Serializes administrative mutations
    admin: Mutex<()>,
    running: Mutex<Option<Running>>,
    bound: RwLock<Option<SocketAddr>>,
}

impl Gateway {
    /// Build a gateway and compile the endpoints declared in `config`.
    ///
    /// Collaborators default to what the configuration describes and can be
    /// replaced with the `with_*` methods before [`Gateway::start`].
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let lb = Arc::new(LoadBalancer::new(
            StickySessions::new(config.sticky_secret.as_deref()),
            config.outage_policy,
        ));

        let access: Arc<dyn AccessControl> = if config.access_control.deny.is_empty() {
            Arc::new(AllowAll)
        } else {
            Arc::new(IpDenyList::from_config(&config.access_control)?)
        };
        let certificates: Arc<dyn CertificateResolver> = match &config.tls {
            Some(tls) => Arc::new(StaticCertificates::new(&tls.certificates)),
            None => Arc::new(StaticCertificates::default()),
        };
        let store: Arc<dyn ConfigStore> = match &config.store_dir {
            Some(dir) => Arc::new(JsonDirStore::new(dir)),
            None => Arc::new(MemoryStore::new()),
        };

        let router = Arc::new(RouterTable::new());
        for endpoint in config.all_endpoints() {
            let compiled = ProxyEndpoint::compile(&endpoint, &config.transport, None)?;
            router.insert(Arc::new(compiled));
        }
        tracing::info!(endpoints = router.len(), "Router table compiled");

        let special = Arc::new(SpecialRules::new());
        let acme = AcmeChallengeResponder::new();
        special.add_rule(acme.rule());
        let redirects = Arc::new(RedirectRules::from_configs(&config.redirect_rules)?);

        Ok(Self {
            config: RwLock::new(config),
            state: RwLock::new(RouterState::Stopped),
            router,
            lb,
            special,
            redirects,
            acme,
            access_log: Arc::new(AccessLog::new()),
            access,
            stats: Arc::new(TracingStats),
            certificates,
            store,
            admin: Mutex::new(()),
            running: Mutex::new(None),
            bound: RwLock::new(None),
        })
    }

    pub fn with_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_access_control(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = access;
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsRecorder>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_certificates(mut self, certificates: Arc<dyn CertificateResolver>) -> Self {
        self.certificates = certificates;
        self
    }

    /// Merge the records held by the config store over the configured
    /// endpoints. Returns how many were loaded.
    pub async fn load_persisted(&self) -> Result<usize> {
        let _guard = self.admin.lock().await;
        let records = self.store.load().await?;
        let transport = self.config.read().unwrap().transport.clone();
        for record in &records {
            validate_endpoint(record)?;
            let previous = self.router.get(&record.key());
            let compiled = ProxyEndpoint::compile(record, &transport, previous.as_deref())?;
            self.router.insert(Arc::new(compiled));
        }
        tracing::info!(records = records.len(), "Persisted endpoints loaded");
        Ok(records.len())
    }

    // --- Endpoint administration ---

    /// Add a new endpoint; its key and aliases must be unused
    pub async fn add_endpoint(&self, config: EndpointConfig) -> Result<()> {
        let _guard = self.admin.lock().await;
        let key = config.key();
        if self.router.get(&key).is_some() {
            let what = if config.kind == EndpointKind::Root {
                "Root endpoint".to_string()
            } else {
                format!("Endpoint '{}'", key)
            };
            return Err(GatewayError::Config(format!("{} already exists", what)));
        }
        self.commit(config, None).await
    }

    /// Replace an existing endpoint record
    pub async fn edit_endpoint(&self, config: EndpointConfig) -> Result<()> {
        let _guard = self.admin.lock().await;
        let previous = self.existing(&config.key())?;
        self.commit(config, Some(previous)).await
    }

    pub async fn remove_endpoint(&self, key: &str) -> Result<()> {
        let _guard = self.admin.lock().await;
        let key = normalize_key(key);
        self.existing(&key)?;
        self.store.remove(&key).await?;
        self.router.remove(&key);
        tracing::info!(endpoint = key, "Endpoint removed");
        Ok(())
    }

    // --- Upstream administration ---

    /// Add an upstream to the active (or inactive) set
    pub async fn add_upstream(&self, key: &str, upstream: UpstreamConfig, active: bool) -> Result<()> {
        self.modify(key, |config| {
            let origin = upstream.origin.trim();
            if find_upstream(config, origin).is_some() {
                return Err(GatewayError::Config(format!(
                    "Upstream '{}' already exists on '{}'",
                    origin,
                    config.key()
                )));
            }
            if active {
                config.upstreams.push(upstream);
            } else {
                config.inactive_upstreams.push(upstream);
            }
            Ok(())
        })
        .await
    }

    pub async fn remove_upstream(&self, key: &str, origin: &str) -> Result<()> {
        self.modify(key, |config| {
            let before = config.upstreams.len() + config.inactive_upstreams.len();
            config.upstreams.retain(|u| u.origin != origin);
            config.inactive_upstreams.retain(|u| u.origin != origin);
            if config.upstreams.len() + config.inactive_upstreams.len() == before {
                return Err(GatewayError::NotFound(format!("upstream '{}'", origin)));
            }
            Ok(())
        })
        .await
    }

    /// Replace the upstream identified by `origin`, keeping its set
    pub async fn update_upstream(&self, key: &str, origin: &str, upstream: UpstreamConfig) -> Result<()> {
        self.modify(key, |config| {
            let renamed = upstream.origin != origin;
            if renamed && find_upstream(config, &upstream.origin).is_some() {
                return Err(GatewayError::Config(format!(
                    "Upstream '{}' already exists on '{}'",
                    upstream.origin,
                    config.key()
                )));
            }
            let slot = find_upstream(config, origin)
                .ok_or_else(|| GatewayError::NotFound(format!("upstream '{}'", origin)))?;
            *slot = upstream;
            Ok(())
        })
        .await
    }

    pub async fn set_upstream_weight(&self, key: &str, origin: &str, weight: u32) -> Result<()> {
        self.modify(key, |config| {
            let slot = find_upstream(config, origin)
                .ok_or_else(|| GatewayError::NotFound(format!("upstream '{}'", origin)))?;
            slot.weight = weight;
            Ok(())
        })
        .await
    }

    // --- Virtual directory administration ---

    pub async fn add_virtual_directory(&self, key: &str, vdir: VirtualDirectoryConfig) -> Result<()> {
        self.modify(key, |config| {
            config.virtual_directories.push(vdir);
            Ok(())
        })
        .await
    }

    pub async fn remove_virtual_directory(&self, key: &str, path_prefix: &str) -> Result<()> {
        let wanted = path_prefix.trim().trim_end_matches('/').to_string();
        self.modify(key, |config| {
            let before = config.virtual_directories.len();
            config
                .virtual_directories
                .retain(|v| v.path_prefix.trim().trim_end_matches('/') != wanted);
            if config.virtual_directories.len() == before {
                return Err(GatewayError::NotFound(format!(
                    "virtual directory '{}'",
                    path_prefix
                )));
            }
            Ok(())
        })
        .await
    }

    fn existing(&self, key: &str) -> Result<Arc<ProxyEndpoint>> {
        self.router
            .get(key)
            .ok_or_else(|| GatewayError::NotFound(format!("endpoint '{}'", key)))
    }

    /// Edit a copy of the stored record and commit it
    async fn modify<F>(&self, key: &str, edit: F) -> Result<()>
    where
        F: FnOnce(&mut EndpointConfig) -> Result<()>,
    {
        let _guard = self.admin.lock().await;
        let previous = self.existing(&normalize_key(key))?;
        let mut config = previous.config().clone();
        edit(&mut config)?;
        self.commit(config, Some(previous)).await
    }

    /// Validate, compile, persist, then swap in. Caller holds `admin`.
    async fn commit(&self, config: EndpointConfig, previous: Option<Arc<ProxyEndpoint>>) -> Result<()> {
        validate_endpoint(&config)?;
        let key = config.key();
        if config.kind == EndpointKind::Host {
            for name in matching_names(&config) {
                if self.router.name_taken(&name, &key) {
                    return Err(GatewayError::Config(format!(
                        "Duplicate matching key '{}'",
                        name
                    )));
                }
            }
        }

        let transport = self.config.read().unwrap().transport.clone();
        let compiled = ProxyEndpoint::compile(&config, &transport, previous.as_deref())?;
        self.store.save(&config).await?;
        self.router.insert(Arc::new(compiled));

        tracing::info!(
            endpoint = key,
            kind = %config.kind,
            upstreams = config.upstreams.len(),
            "Endpoint committed"
        );
        Ok(())
    }

    // --- Redirect rules ---

    /// Add a redirect rule, replacing one with the same source
    pub async fn add_redirect_rule(&self, rule: RedirectRuleConfig) -> Result<()> {
        let _guard = self.admin.lock().await;
        self.redirects.add(rule.clone())?;
        let key = rule.source_key();
        let mut config = self.config.write().unwrap();
        config.redirect_rules.retain(|r| r.source_key() != key);
        config.redirect_rules.push(rule);
        Ok(())
    }

    pub async fn remove_redirect_rule(&self, source: &str) -> Result<()> {
        let _guard = self.admin.lock().await;
        if !self.redirects.remove(source) {
            return Err(GatewayError::NotFound(format!(
                "Redirect rule '{}' not found",
                source
            )));
        }
        let key = RedirectRuleConfig::new(source, "").source_key();
        self.config
            .write()
            .unwrap()
            .redirect_rules
            .retain(|r| r.source_key() != key);
        tracing::info!(source = key, "Redirect rule removed");
        Ok(())
    }

    pub fn redirect_rules(&self) -> Vec<RedirectRuleConfig> {
        self.redirects.list()
    }

    // --- Service control ---

    /// Bind the listeners and start serving
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(GatewayError::State("router is already running".to_string()));
        }
        if self.router.root().is_none() {
            return Err(GatewayError::State(
                "no root endpoint is configured".to_string(),
            ));
        }

        self.set_state(RouterState::Starting);
        let config = self.config.read().unwrap().clone();

        let listeners = match entrypoint::start_listeners(
            &config,
            self.shared_state(&config),
            self.certificates.clone(),
        )
        .await
        {
            Ok(listeners) => listeners,
            Err(e) => {
                self.set_state(RouterState::Stopped);
                return Err(e);
            }
        };
        *self.bound.write().unwrap() = Some(listeners.main_addr);

        let probe = config.uptime_probe.as_ref().map(|probe_config| {
            let probe = UptimeProbe::new(self.lb.clone(), self.probe_targets(), probe_config);
            let (tx, rx) = watch::channel(false);
            (tx, tokio::spawn(probe.run(rx)))
        });

        *running = Some(Running {
            listeners,
            probe,
            started_at: Instant::now(),
        });
        self.set_state(RouterState::Running);
        tracing::info!(endpoints = self.router.len(), "Router is running");
        Ok(())
    }

    /// Stop accepting and drain connections within the shutdown window
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(current) = running.take() else {
            return Err(GatewayError::State("router is not running".to_string()));
        };

        self.set_state(RouterState::Stopping);
        if let Some((tx, handle)) = current.probe {
            let _ = tx.send(true);
            let _ = handle.await;
        }
        current.listeners.shutdown().await;
        *self.bound.write().unwrap() = None;

        self.set_state(RouterState::Stopped);
        tracing::info!("Router stopped");
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        if self.is_running().await {
            self.stop().await?;
        }
        self.start().await
    }

    /// Turn HTTPS on the main listener on or off
    pub async fn set_tls(&self, enabled: bool) -> Result<()> {
        self.change_listener(|config| {
            match config.tls.as_mut() {
                Some(tls) => tls.enabled = enabled,
                None if enabled => {
                    return Err(GatewayError::Config(
                        "TLS cannot be enabled without a certificate".to_string(),
                    ));
                }
                None => {}
            }
            tracing::info!(enabled, "TLS mode changed");
            Ok(())
        })
        .await
    }

    /// Change the main listener port
    pub async fn set_listen_port(&self, port: u16) -> Result<()> {
        self.change_listener(|config| {
            let mut addr = config.listen_addr()?;
            addr.set_port(port);
            config.listen = addr.to_string();
            tracing::info!(port, "Listen port changed");
            Ok(())
        })
        .await
    }

    /// Apply a listener setting and restart; a failed restart restores the
    /// previous listen address and TLS settings and serves on them again
    async fn change_listener<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut GatewayConfig) -> Result<()>,
    {
        let previous = {
            let mut config = self.config.write().unwrap();
            let previous = (config.listen.clone(), config.tls.clone());
            edit(&mut config)?;
            previous
        };
        if !self.is_running().await {
            return Ok(());
        }

        let Err(e) = self.restart().await else {
            return Ok(());
        };
        tracing::warn!(error = %e, "Listener change failed, restoring previous settings");
        {
            let mut config = self.config.write().unwrap();
            config.listen = previous.0;
            config.tls = previous.1;
        }
        if !self.is_running().await {
            if let Err(restore) = self.start().await {
                tracing::error!(error = %restore, "Restart on previous listener settings failed");
            }
        }
        Err(e)
    }

    async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    fn set_state(&self, new_state: RouterState) {
        let mut state = self.state.write().unwrap();
        tracing::debug!(from = %*state, to = %new_state, "State transition");
        *state = new_state;
    }

    fn shared_state(&self, config: &GatewayConfig) -> Arc<SharedState> {
        Arc::new(SharedState {
            router: self.router.clone(),
            lb: self.lb.clone(),
            special: self.special.clone(),
            redirects: self.redirects.clone(),
            access: self.access.clone(),
            stats: self.stats.clone(),
            access_log: self.access_log.clone(),
            allow_connect: config.allow_connect,
            tunnel_timeout: Duration::from_secs(config.tunnel_timeout_secs),
            connect_timeout: Duration::from_secs(config.transport.connect_timeout_secs),
        })
    }

    fn probe_targets(&self) -> ProbeTargets {
        let router = self.router.clone();
        Arc::new(move || {
            router
                .endpoints()
                .iter()
                .flat_map(|endpoint| {
                    let mut upstreams = endpoint.all_upstreams();
                    for vdir in &endpoint.virtual_directories {
                        upstreams.extend(vdir.all_upstreams());
                    }
                    upstreams
                })
                .collect()
        })
    }

    // --- Introspection ---

    /// Endpoints, optionally only those of one kind
    pub fn list_endpoints(&self, kind: Option<EndpointKind>) -> Vec<EndpointSummary> {
        self.router
            .endpoints()
            .iter()
            .filter(|ep| kind.map(|k| ep.kind == k).unwrap_or(true))
            .map(|ep| EndpointSummary::of(ep))
            .collect()
    }

    /// One endpoint with the live state of its upstreams
    pub fn endpoint_detail(&self, key: &str) -> Result<EndpointDetail> {
        let endpoint = self.existing(&normalize_key(key))?;
        let upstreams = endpoint
            .upstreams
            .iter()
            .map(|u| self.upstream_status(u, true))
            .chain(
                endpoint
                    .inactive_upstreams
                    .iter()
                    .map(|u| self.upstream_status(u, false)),
            )
            .collect();
        let virtual_directories = endpoint
            .virtual_directories
            .iter()
            .map(|vdir| VirtualDirectoryDetail {
                path_prefix: vdir.key.clone(),
                disabled: vdir.disabled,
                upstreams: vdir
                    .upstreams
                    .iter()
                    .map(|u| self.upstream_status(u, true))
                    .collect(),
            })
            .collect();

        Ok(EndpointDetail {
            summary: EndpointSummary::of(&endpoint),
            upstreams,
            virtual_directories,
            config: endpoint.config().clone(),
        })
    }

    fn upstream_status(&self, upstream: &Upstream, active: bool) -> UpstreamStatus {
        UpstreamStatus {
            origin: upstream.origin.clone(),
            active,
            weight: upstream.weight,
            require_tls: upstream.require_tls,
            ready: upstream.is_ready(),
            online: self.lb.is_online(upstream.authority()),
        }
    }

    /// Overall router state
    pub async fn status(&self) -> RouterStatus {
        let uptime_secs = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|r| r.started_at.elapsed().as_secs())
            .unwrap_or(0);
        let config = self.config.read().unwrap();
        RouterStatus {
            state: self.state(),
            listen: self
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|| config.listen.clone()),
            tls: config.tls_enabled(),
            uptime_secs,
            endpoints: self.router.len(),
        }
    }

    pub fn state(&self) -> RouterState {
        *self.state.read().unwrap()
    }

    /// Bound main listener address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.read().unwrap()
    }

    pub fn config(&self) -> GatewayConfig {
        self.config.read().unwrap().clone()
    }

    pub fn router(&self) -> &Arc<RouterTable> {
        &self.router
    }

    /// Liveness input: [`LoadBalancer::notify_host_online_state`]
    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.lb
    }

    pub fn special_rules(&self) -> &Arc<SpecialRules> {
        &self.special
    }

    pub fn acme(&self) -> &AcmeChallengeResponder {
        &self.acme
    }

    pub fn access_log(&self) -> &Arc<AccessLog> {
        &self.access_log
    }
}

fn normalize_key(key: &str) -> String {
    let key = key.trim();
    if key == "/" {
        key.to_string()
    } else {
        key.to_ascii_lowercase()
    }
}

fn find_upstream<'a>(config: &'a mut EndpointConfig, origin: &str) -> Option<&'a mut UpstreamConfig> {
    config
        .upstreams
        .iter_mut()
        .chain(config.inactive_upstreams.iter_mut())
        .find(|u| u.origin.trim() == origin.trim())
}
