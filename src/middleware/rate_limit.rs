//! Rate limiting middleware: token bucket per client IP

use super::{Middleware, RequestContext};
use crate::error::Result;
use crate::proxy::body::{json_error, ProxyBody};
use async_trait::async_trait;
use http::{HeaderValue, Response, StatusCode};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Buckets idle longer than this are dropped when the table is pruned
const IDLE_BUCKET_TTL: Duration = Duration::from_secs(60);

/// Table size that triggers pruning
const PRUNE_THRESHOLD: usize = 4096;

/// Per-IP token bucket rate limiter
pub struct RateLimitMiddleware {
    limit: u32,
    buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
}

struct TokenBucket {
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: u32) -> Self {
        Self {
            rate: rate as f64,
            tokens: rate as f64,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl RateLimitMiddleware {
    /// Allow `limit` requests per second per client IP
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for this client
    pub async fn allow(&self, ip: IpAddr) -> bool {
        let mut buckets = self.buckets.lock().await;
        if buckets.len() > PRUNE_THRESHOLD {
            let now = Instant::now();
            buckets.retain(|_, b| now.duration_since(b.last_refill) < IDLE_BUCKET_TTL);
        }
        buckets
            .entry(ip)
            .or_insert_with(|| TokenBucket::new(self.limit))
            .try_acquire()
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle_request(
        &self,
        _req: &mut http::request::Parts,
        ctx: &RequestContext,
    ) -> Result<Option<Response<ProxyBody>>> {
        if self.allow(ctx.client_ip).await {
            return Ok(None);
        }
        tracing::debug!(
            endpoint = ctx.endpoint,
            client = %ctx.client_ip,
            limit = self.limit,
            "Rate limit exceeded"
        );
        let mut resp = json_error(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
        resp.headers_mut()
            .insert(http::header::RETRY_AFTER, HeaderValue::from_static("1"));
        Ok(Some(resp))
    }

    fn name(&self) -> &str {
        "rate-limit"
    }
}
