//! Load balancer: picks one upstream per request
//!
//! Selection honors, in order: a valid sticky binding, liveness, weight.
//! Liveness is a per-address flag written only through
//! [`LoadBalancer::notify_host_online_state`].

use super::sticky::{StickyBinding, StickySessions};
use super::Upstream;
use crate::config::OutagePolicy;
use crate::error::{GatewayError, Result};
use http::{HeaderMap, HeaderValue};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Outcome of one selection
#[derive(Debug, Clone)]
pub struct Selection {
    pub upstream: Arc<Upstream>,
    /// Position in the endpoint's active upstream list
    pub index: usize,
    /// Cookie to attach to the response when a new sticky binding was made
    pub set_cookie: Option<HeaderValue>,
}

/// Weighted-random selector with liveness and stickiness
pub struct LoadBalancer {
    online: RwLock<HashMap<String, bool>>,
    sticky: StickySessions,
    outage_policy: OutagePolicy,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("tracked_hosts", &self.online.read().unwrap().len())
            .field("outage_policy", &self.outage_policy)
            .finish()
    }
}

impl LoadBalancer {
    pub fn new(sticky: StickySessions, outage_policy: OutagePolicy) -> Self {
        Self {
            online: RwLock::new(HashMap::new()),
            sticky,
            outage_policy,
        }
    }

    pub fn outage_policy(&self) -> OutagePolicy {
        self.outage_policy
    }

    /// Record the liveness of an upstream address
    pub fn notify_host_online_state(&self, address: &str, online: bool) {
        let previous = self
            .online
            .write()
            .unwrap()
            .insert(address.to_string(), online);
        if previous != Some(online) {
            if online {
                tracing::info!(address, "Upstream online");
            } else {
                tracing::warn!(address, "Upstream offline");
            }
        }
    }

    /// Liveness of an address; unseen addresses count as online
    pub fn is_online(&self, address: &str) -> bool {
        self.online
            .read()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(true)
    }

    /// Pick an upstream for one request to `endpoint`
    pub fn select(
        &self,
        endpoint: &str,
        upstreams: &[Arc<Upstream>],
        headers: &HeaderMap,
        sticky: bool,
    ) -> Result<Selection> {
        if upstreams.is_empty() {
            return Err(GatewayError::NoUpstream(endpoint.to_string()));
        }

        if sticky {
            if let Some(selection) = self.sticky_hit(endpoint, upstreams, headers) {
                return Ok(selection);
            }
        }

        let ready: Vec<usize> = (0..upstreams.len())
            .filter(|&i| upstreams[i].is_ready())
            .collect();
        if ready.is_empty() {
            return Err(GatewayError::NoOnlineUpstream(endpoint.to_string()));
        }

        let online: Vec<usize> = ready
            .iter()
            .copied()
            .filter(|&i| self.is_online(upstreams[i].authority()))
            .collect();
        let candidates = if !online.is_empty() {
            online
        } else {
            match self.outage_policy {
                OutagePolicy::BestEffort => {
                    tracing::debug!(endpoint, "All upstreams offline, using full set");
                    ready
                }
                OutagePolicy::FailClosed => {
                    return Err(GatewayError::NoOnlineUpstream(endpoint.to_string()));
                }
            }
        };

        let index = if candidates.len() == 1 {
            candidates[0]
        } else {
            let weights: Vec<u32> = candidates.iter().map(|&i| upstreams[i].weight).collect();
            candidates[weighted_pick(&weights, &mut rand::thread_rng())]
        };

        let upstream = upstreams[index].clone();
        let set_cookie = if sticky {
            self.sticky.set_cookie_header(&StickyBinding {
                endpoint: endpoint.to_string(),
                index,
                origin: upstream.origin.clone(),
            })
        } else {
            None
        };

        Ok(Selection {
            upstream,
            index,
            set_cookie,
        })
    }

    fn sticky_hit(
        &self,
        endpoint: &str,
        upstreams: &[Arc<Upstream>],
        headers: &HeaderMap,
    ) -> Option<Selection> {
        let binding = self.sticky.from_headers(headers, endpoint)?;
        let upstream = upstreams.get(binding.index)?;
        if upstream.origin != binding.origin
            || !upstream.is_ready()
            || !self.is_online(upstream.authority())
        {
            return None;
        }
        Some(Selection {
            upstream: upstream.clone(),
            index: binding.index,
            set_cookie: None,
        })
    }
}

/// Index into `weights` drawn proportionally to weight.
///
/// Zero weights are fallback-only: they are chosen (uniformly) only when
/// every weight is zero.
pub fn weighted_pick<R: Rng + ?Sized>(weights: &[u32], rng: &mut R) -> usize {
    let total: u64 = weights.iter().map(|&w| w as u64).sum();
    if total == 0 {
        return rng.gen_range(0..weights.len());
    }
    let mut point = rng.gen_range(0..total);
    for (i, &w) in weights.iter().enumerate() {
        let w = w as u64;
        if point < w {
            return i;
        }
        point -= w;
    }
    weights.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TransportConfig, UpstreamConfig};
    use http::header::COOKIE;

    fn upstream(origin: &str, weight: u32) -> Arc<Upstream> {
        let up = Upstream::from_config(&UpstreamConfig::new(origin).with_weight(weight), false)
            .unwrap();
        up.start_proxy(&TransportConfig::default()).unwrap();
        Arc::new(up)
    }

    fn lb(policy: OutagePolicy) -> LoadBalancer {
        LoadBalancer::new(StickySessions::new(Some("test-secret")), policy)
    }

    fn cookie_headers(set_cookie: &HeaderValue) -> HeaderMap {
        let pair = set_cookie.to_str().unwrap().split(';').next().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(pair).unwrap());
        headers
    }

    #[tokio::test]
    async fn test_empty_set_is_error() {
        let err = lb(OutagePolicy::BestEffort)
            .select("a.example.com", &[], &HeaderMap::new(), false)
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoUpstream(_)));
    }

    #[tokio::test]
    async fn test_single_upstream_returned() {
        let lb = lb(OutagePolicy::BestEffort);
        let ups = vec![upstream("10.0.0.1:80", 1)];
        let sel = lb.select("e", &ups, &HeaderMap::new(), false).unwrap();
        assert_eq!(sel.index, 0);
        assert!(sel.set_cookie.is_none());

        lb.notify_host_online_state("10.0.0.1:80", false);
        let sel = lb.select("e", &ups, &HeaderMap::new(), false).unwrap();
        assert_eq!(sel.upstream.origin, "10.0.0.1:80");
    }

    #[tokio::test]
    async fn test_not_ready_upstream_never_chosen() {
        let lb = lb(OutagePolicy::BestEffort);
        let cold = Arc::new(
            Upstream::from_config(&UpstreamConfig::new("10.0.0.9:80"), false).unwrap(),
        );
        let ups = vec![cold.clone(), upstream("10.0.0.1:80", 1)];
        for _ in 0..50 {
            let sel = lb.select("e", &ups, &HeaderMap::new(), false).unwrap();
            assert_eq!(sel.index, 1);
        }
        let err = lb.select("e", &[cold], &HeaderMap::new(), false).unwrap_err();
        assert!(matches!(err, GatewayError::NoOnlineUpstream(_)));
    }

    #[tokio::test]
    async fn test_weighted_converges_to_uniform() {
        let lb = lb(OutagePolicy::BestEffort);
        let ups: Vec<_> = (1..=4).map(|i| upstream(&format!("10.0.0.{}:80", i), 1)).collect();
        let draws = 10_000;
        let mut counts = [0usize; 4];
        for _ in 0..draws {
            counts[lb.select("e", &ups, &HeaderMap::new(), false).unwrap().index] += 1;
        }
        // Binomial(10000, 0.25), sigma ~ 43.3; the 2 sigma band is checked on the mean
        let expected = draws as f64 * 0.25;
        let sigma = (draws as f64 * 0.25 * 0.75).sqrt();
        let mean_dev: f64 = counts
            .iter()
            .map(|&c| (c as f64 - expected).abs())
            .sum::<f64>()
            / 4.0;
        assert!(mean_dev < 2.0 * sigma, "mean deviation {}", mean_dev);
        for count in counts {
            assert!(
                (count as f64 - expected).abs() < 3.0 * sigma,
                "count {} too far from {}",
                count,
                expected
            );
        }
    }

    #[tokio::test]
    async fn test_zero_weight_is_fallback_only() {
        let lb = lb(OutagePolicy::BestEffort);
        let ups = vec![upstream("10.0.0.1:80", 0), upstream("10.0.0.2:80", 1)];
        for _ in 0..500 {
            assert_eq!(lb.select("e", &ups, &HeaderMap::new(), false).unwrap().index, 1);
        }

        let all_zero = vec![upstream("10.0.0.1:80", 0), upstream("10.0.0.2:80", 0)];
        let mut seen = [false; 2];
        for _ in 0..500 {
            seen[lb.select("e", &all_zero, &HeaderMap::new(), false).unwrap().index] = true;
        }
        assert_eq!(seen, [true, true]);
    }

    #[tokio::test]
    async fn test_offline_filtered() {
        let lb = lb(OutagePolicy::BestEffort);
        let ups = vec![upstream("10.0.0.1:80", 1), upstream("10.0.0.2:80", 1)];
        lb.notify_host_online_state("10.0.0.1:80", false);
        for _ in 0..200 {
            assert_eq!(lb.select("e", &ups, &HeaderMap::new(), false).unwrap().index, 1);
        }
    }

    #[tokio::test]
    async fn test_all_offline_policies() {
        let ups = vec![upstream("10.0.0.1:80", 1), upstream("10.0.0.2:80", 1)];

        let best = lb(OutagePolicy::BestEffort);
        best.notify_host_online_state("10.0.0.1:80", false);
        best.notify_host_online_state("10.0.0.2:80", false);
        assert!(best.select("e", &ups, &HeaderMap::new(), false).is_ok());

        let closed = lb(OutagePolicy::FailClosed);
        closed.notify_host_online_state("10.0.0.1:80", false);
        closed.notify_host_online_state("10.0.0.2:80", false);
        let err = closed.select("e", &ups, &HeaderMap::new(), false).unwrap_err();
        assert!(err.to_string().contains("no online upstream available"));
        let err = closed.select("e", &ups[..1], &HeaderMap::new(), false).unwrap_err();
        assert!(matches!(err, GatewayError::NoOnlineUpstream(_)));
    }

    #[tokio::test]
    async fn test_sticky_stable_then_rebinds() {
        let lb = lb(OutagePolicy::BestEffort);
        let ups: Vec<_> = (1..=4).map(|i| upstream(&format!("10.0.0.{}:80", i), 1)).collect();

        let first = lb.select("app", &ups, &HeaderMap::new(), true).unwrap();
        let headers = cookie_headers(first.set_cookie.as_ref().unwrap());
        for _ in 0..100 {
            let sel = lb.select("app", &ups, &headers, true).unwrap();
            assert_eq!(sel.index, first.index);
            assert!(sel.set_cookie.is_none());
        }

        lb.notify_host_online_state(first.upstream.authority(), false);
        let moved = lb.select("app", &ups, &headers, true).unwrap();
        assert_ne!(moved.index, first.index);
        assert!(moved.set_cookie.is_some());

        let headers = cookie_headers(moved.set_cookie.as_ref().unwrap());
        for _ in 0..20 {
            assert_eq!(lb.select("app", &ups, &headers, true).unwrap().index, moved.index);
        }
    }

    #[tokio::test]
    async fn test_sticky_binding_invalid_after_set_change() {
        let lb = lb(OutagePolicy::BestEffort);
        let ups = vec![upstream("10.0.0.1:80", 1), upstream("10.0.0.2:80", 1)];
        let first = lb.select("app", &ups, &HeaderMap::new(), true).unwrap();
        let headers = cookie_headers(first.set_cookie.as_ref().unwrap());

        let replaced = vec![upstream("10.0.0.7:80", 1), upstream("10.0.0.8:80", 1)];
        let sel = lb.select("app", &replaced, &headers, true).unwrap();
        assert!(sel.set_cookie.is_some());
    }

    #[test]
    fn test_weighted_pick_ranges() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            assert_eq!(weighted_pick(&[0, 5, 0], &mut rng), 1);
            assert!(weighted_pick(&[0, 0], &mut rng) < 2);
        }
    }

    #[test]
    fn test_online_default_and_notify() {
        let lb = lb(OutagePolicy::BestEffort);
        assert!(lb.is_online("10.9.9.9:80"));
        lb.notify_host_online_state("10.9.9.9:80", false);
        assert!(!lb.is_online("10.9.9.9:80"));
        lb.notify_host_online_state("10.9.9.9:80", true);
        assert!(lb.is_online("10.9.9.9:80"));
    }
}
