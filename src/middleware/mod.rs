//! Request gate pipeline: per-endpoint checks run before forwarding
//!
//! Gates run in order (basic auth, then rate limit) and the first one that
//! answers short-circuits the request.

mod auth;
mod headers;
mod rate_limit;

pub use auth::{hash_password, BasicAuthMiddleware};
pub use headers::{HeaderOp, HeaderRewriteRules};
pub use rate_limit::RateLimitMiddleware;

use crate::config::EndpointConfig;
use crate::error::Result;
use crate::proxy::body::ProxyBody;
use async_trait::async_trait;
use http::Response;
use std::net::IpAddr;
use std::sync::Arc;

/// Request context passed through the gate pipeline
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Client IP address
    pub client_ip: IpAddr,
    /// Endpoint key that matched
    pub endpoint: String,
    /// Request arrived over TLS
    pub inbound_tls: bool,
}

/// Middleware trait: inspect a request and optionally short-circuit
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Return Ok(None) to continue the pipeline,
    /// or Ok(Some(response)) to answer immediately.
    async fn handle_request(
        &self,
        req: &mut http::request::Parts,
        ctx: &RequestContext,
    ) -> Result<Option<Response<ProxyBody>>>;

    /// Middleware name for logging
    fn name(&self) -> &str;
}

/// Ordered gate pipeline
#[derive(Clone, Default)]
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    /// Build the gates an endpoint asks for
    pub fn for_endpoint(config: &EndpointConfig) -> Result<Self> {
        let mut middlewares: Vec<Arc<dyn Middleware>> = Vec::new();

        if let Some(auth) = &config.basic_auth {
            if !auth.credentials.is_empty() {
                middlewares.push(Arc::new(BasicAuthMiddleware::new(auth)?));
            }
        }
        if config.rate_limit > 0 {
            middlewares.push(Arc::new(RateLimitMiddleware::new(config.rate_limit)));
        }

        Ok(Self { middlewares })
    }

    /// Create an empty pipeline
    pub fn empty() -> Self {
        Self::default()
    }

    /// Run the request through every gate
    pub async fn process_request(
        &self,
        parts: &mut http::request::Parts,
        ctx: &RequestContext,
    ) -> Result<Option<Response<ProxyBody>>> {
        for mw in &self.middlewares {
            if let Some(response) = mw.handle_request(parts, ctx).await? {
                tracing::debug!(
                    middleware = mw.name(),
                    endpoint = ctx.endpoint,
                    "Middleware short-circuited request"
                );
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    /// Number of gates in the pipeline
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Gate names in execution order
    pub fn names(&self) -> Vec<&str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }
}
