//! HTTP reverse proxy: one pooled client per upstream and the per-request
//! rewrite/forward/relay exchange

use super::body::ProxyBody;
use super::headers::{self, ForwardedInfo, LocationContext};
use super::streaming::{flush_policy, relay_body};
use crate::config::TransportConfig;
use crate::error::{GatewayError, Result};
use crate::middleware::HeaderRewriteRules;
use crate::service::Upstream;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CACHE_CONTROL, HOST, LOCATION};
use http::{Request, Response};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

type HttpsClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;

/// Pooled outbound client bound to one upstream
///
/// Created once when the upstream starts and shared by every request to it.
pub struct ForwardClient {
    client: HttpsClient,
    permits: Arc<Semaphore>,
    max_conns: usize,
    timeout: Duration,
}

impl ForwardClient {
    /// Build a client with the given transport limits
    pub fn new(transport: &TransportConfig, skip_verify: bool, max_conn: usize) -> Result<Self> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_keepalive(Some(Duration::from_secs(60)));
        http.set_connect_timeout(Some(Duration::from_secs(transport.connect_timeout_secs)));

        let tls = super::tls::client_config(skip_verify)?;
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config((*tls).clone())
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(transport.idle_timeout_secs))
            .pool_max_idle_per_host(transport.max_idle_per_host)
            .pool_timer(TokioTimer::new())
            .build(https);

        let max_conns = if max_conn > 0 {
            max_conn
        } else {
            transport.max_conns_per_host
        };

        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(max_conns)),
            max_conns,
            timeout: Duration::from_secs(transport.upstream_timeout_secs),
        })
    }

    /// Connection cap for this upstream
    pub fn max_conns(&self) -> usize {
        self.max_conns
    }

    /// Send a request and wait for response headers within the deadline.
    ///
    /// The connection slot is held until the response body is dropped.
    pub async fn round_trip(
        &self,
        req: Request<ProxyBody>,
        target: &str,
    ) -> Result<Response<PermitBody>> {
        let permit = tokio::time::timeout(self.timeout, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| GatewayError::UpstreamTimeout(self.timeout.as_secs()))?
            .map_err(|e| GatewayError::transport(target, e))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| GatewayError::UpstreamTimeout(self.timeout.as_secs()))?
            .map_err(|e| GatewayError::transport(target, e))?;

        Ok(response.map(|inner| PermitBody {
            inner,
            _permit: permit,
        }))
    }
}

/// Upstream response body that keeps its connection slot while alive
#[derive(Debug)]
pub struct PermitBody {
    inner: Incoming,
    _permit: OwnedSemaphorePermit,
}

impl Body for PermitBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Per-request inputs of one forwarded exchange
pub struct ForwardContext<'a> {
    pub upstream: &'a Upstream,
    pub client_ip: IpAddr,
    pub inbound_tls: bool,
    /// Host the client addressed
    pub original_host: &'a str,
    /// Path to request from the upstream (virtual directory prefix removed)
    pub path: &'a str,
    /// Virtual directory mount point
    pub path_prefix: Option<&'a str>,
    pub rules: &'a HeaderRewriteRules,
    pub no_cache: bool,
    pub host_override: Option<&'a str>,
    pub flush_interval: Duration,
}

/// Forward one HTTP exchange to the upstream and stream the answer back.
///
/// Errors are returned, not written, so the caller decides what the client
/// sees.
pub async fn forward(
    req: Request<ProxyBody>,
    ctx: &ForwardContext<'_>,
) -> Result<Response<ProxyBody>> {
    let upstream = ctx.upstream;
    let client = upstream.client().ok_or_else(|| {
        GatewayError::transport(&upstream.origin, "forwarding client not started")
    })?;

    let (mut parts, body) = req.into_parts();

    parts.uri = headers::target_uri(upstream.base_uri(), ctx.path, parts.uri.query())
        .map_err(|e| GatewayError::Protocol(format!("Cannot build upstream URI: {}", e)))?;
    parts.version = http::Version::HTTP_11;

    let outbound = &mut parts.headers;
    headers::remove_hop_by_hop(outbound);
    outbound.remove(headers::ORIGIN_UPGRADE);
    if ctx.no_cache {
        outbound.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
    headers::set_forwarded_headers(
        outbound,
        &ForwardedInfo {
            client_ip: ctx.client_ip,
            inbound_tls: ctx.inbound_tls,
            original_host: ctx.original_host,
        },
    );
    ctx.rules.apply_upstream(outbound);
    headers::ensure_user_agent(outbound);

    let host = headers::outbound_host(
        ctx.host_override,
        upstream.authority(),
        upstream.require_tls,
        ctx.original_host,
    );
    if let Ok(value) = HeaderValue::from_str(host) {
        outbound.insert(HOST, value);
    }

    let outreq = Request::from_parts(parts, body);
    tracing::debug!(
        upstream = upstream.origin,
        uri = %outreq.uri(),
        method = %outreq.method(),
        "Forwarding request"
    );

    let response = client.round_trip(outreq, &upstream.origin).await?;
    let (mut parts, body) = response.into_parts();

    let inbound = &mut parts.headers;
    headers::remove_hop_by_hop(inbound);
    if ctx.no_cache {
        inbound.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
    headers::restore_upgrade(inbound);
    if let Ok(value) = HeaderValue::from_str(&headers::product()) {
        inbound.insert(HeaderName::from_static("x-proxy-by"), value);
    }

    let location = inbound
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Some(location) = location {
        let rewritten = headers::rewrite_location(
            &location,
            &LocationContext {
                upstream: &upstream.origin,
                original_host: ctx.original_host,
                path_prefix: ctx.path_prefix,
                inbound_tls: ctx.inbound_tls,
            },
        );
        if let Ok(value) = HeaderValue::from_str(&rewritten) {
            inbound.insert(LOCATION, value);
        }
    }

    ctx.rules.apply_downstream(inbound);
    ctx.rules.apply_policy(inbound, ctx.inbound_tls);

    let policy = flush_policy(inbound, ctx.flush_interval);
    Ok(Response::from_parts(parts, relay_body(body, policy)))
}
