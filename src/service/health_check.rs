//! Uptime probe: background HTTP checks feeding upstream liveness
//!
//! The probe never touches routing state directly; it only reports through
//! [`LoadBalancer::notify_host_online_state`].

use super::{LoadBalancer, Upstream};
use crate::config::UptimeProbeConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Supplies the current upstream set to probe
pub type ProbeTargets = Arc<dyn Fn() -> Vec<Arc<Upstream>> + Send + Sync>;

/// Periodic prober for every known upstream
pub struct UptimeProbe {
    lb: Arc<LoadBalancer>,
    targets: ProbeTargets,
    interval: Duration,
    timeout: Duration,
}

impl UptimeProbe {
    pub fn new(lb: Arc<LoadBalancer>, targets: ProbeTargets, config: &UptimeProbeConfig) -> Self {
        Self {
            lb,
            targets,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    /// Probe every target once and report the outcome
    pub async fn probe_once(&self) {
        let mut seen: HashMap<String, Arc<Upstream>> = HashMap::new();
        for upstream in (self.targets)() {
            seen.entry(upstream.authority().to_string())
                .or_insert(upstream);
        }

        for (address, upstream) in seen {
            let online = probe(&upstream, self.timeout).await;
            self.lb.notify_host_online_state(&address, online);
        }
    }

    /// Probe on an interval until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Uptime probe started");
        loop {
            self.probe_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        tracing::debug!("Uptime probe stopped");
    }
}

/// One GET against the upstream base URL; any non-5xx answer counts as online
async fn probe(upstream: &Upstream, timeout: Duration) -> bool {
    let client = match reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(upstream.skip_cert_validation)
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(upstream = upstream.origin, error = %e, "Probe client build failed");
            return false;
        }
    };

    let url = upstream.base_uri().to_string();
    match client.get(&url).send().await {
        Ok(resp) => !resp.status().is_server_error(),
        Err(e) => {
            tracing::debug!(upstream = upstream.origin, error = %e, "Probe failed");
            false
        }
    }
}
