//! # dynproxy
//!
//! A dynamic reverse-proxy gateway: requests are matched to endpoints by
//! host, alias or wildcard, then by the longest virtual-directory prefix,
//! and finally fall through to a root endpoint. Each endpoint balances over
//! weighted upstreams with optional sticky sessions and liveness tracking.
//!
//! ## Architecture
//!
//! ```text
//! Listener → Special rules → Redirect rules → Router → Gates → Load Balancer → Forward / WebSocket / Tunnel
//! ```
//!
//! ## Core Features
//!
//! - **Routing**: exact host, aliases, `*.` wildcards, longest-prefix virtual directories, URL redirect rules
//! - **Forwarding**: pooled HTTP/1.1 client, hop-by-hop stripping, `Location` rewrite, streaming flush
//! - **Load Balancing**: weighted random, signed sticky cookies, online/offline tracking
//! - **WebSocket**: upgrade handshake and bidirectional frame relay
//! - **CONNECT**: raw TCP tunnels with a shared deadline
//! - **Administration**: add/edit/remove endpoints and upstreams at runtime
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dynproxy::{Gateway, config::GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> dynproxy::Result<()> {
//!     let config = GatewayConfig::from_file("gateway.hcl").await?;
//!     let gateway = Gateway::new(config)?;
//!     gateway.load_persisted().await?;
//!     gateway.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     gateway.stop().await
//! }
//! ```

pub mod config;
pub(crate) mod entrypoint;
pub mod error;
pub mod gateway;
pub mod middleware;
pub mod observability;
pub mod provider;
pub mod proxy;
pub mod router;
pub mod service;

// Re-export main types
pub use error::{GatewayError, Result};
pub use gateway::{EndpointDetail, EndpointSummary, Gateway, UpstreamStatus};

use serde::{Deserialize, Serialize};

/// Router service lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RouterState {
    /// Not listening
    #[default]
    Stopped,
    /// Binding listeners
    Starting,
    /// Accepting and proxying requests
    Running,
    /// Draining connections
    Stopping,
}

impl std::fmt::Display for RouterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Router status snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterStatus {
    pub state: RouterState,
    /// Bound main listener address while running, configured address otherwise
    pub listen: String,
    /// HTTPS on the main listener
    pub tls: bool,
    /// Seconds since the last successful start
    pub uptime_secs: u64,
    /// Root plus host endpoints
    pub endpoints: usize,
}
