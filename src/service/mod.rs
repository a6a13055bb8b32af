//! Service layer: upstreams, load balancing and liveness
//!
//! Upstreams own their pooled forwarding client; the load balancer picks
//! one per request using weights, sticky cookies and the online map fed by
//! the uptime probe.

pub mod health_check;
mod load_balancer;
pub mod sticky;
mod upstream;

pub use health_check::UptimeProbe;
pub use load_balancer::{weighted_pick, LoadBalancer, Selection};
pub use sticky::{StickyBinding, StickySessions};
pub use upstream::Upstream;
