//! Entrypoint: network listeners and the per-request pipeline
//!
//! The main listener serves HTTP or HTTPS. When TLS is on, an optional
//! plain-HTTP listener redirects to HTTPS, except for endpoints that bypass
//! the global TLS requirement.

use crate::config::{DefaultSite, EndpointKind, GatewayConfig};
use crate::error::{GatewayError, Result};
use crate::middleware::RequestContext;
use crate::observability::{AccessLog, ForwardKind, RequestTracker};
use crate::provider::{AccessControl, CertificateResolver, StatsRecorder};
use crate::proxy::body::{self, ProxyBody};
use crate::proxy::headers::strip_port;
use crate::proxy::websocket::{self, WebSocketContext};
use crate::proxy::{forward, tcp, tls, ForwardContext};
use crate::router::{RedirectRules, RouterTable, SpecialRules};
use crate::service::sticky::append_cookie;
use crate::service::{LoadBalancer, Upstream};
use http::header::HOST;
use http::{Method, Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;

/// Shared state for request handling
pub(crate) struct SharedState {
    pub router: Arc<RouterTable>,
    pub lb: Arc<LoadBalancer>,
    pub special: Arc<SpecialRules>,
    pub redirects: Arc<RedirectRules>,
    pub access: Arc<dyn AccessControl>,
    pub stats: Arc<dyn StatsRecorder>,
    pub access_log: Arc<AccessLog>,
    pub allow_connect: bool,
    pub tunnel_timeout: Duration,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerRole {
    Main { tls: bool },
    /// Plain HTTP beside an HTTPS main listener
    Redirect { https_port: u16 },
}

struct Connection {
    state: Arc<SharedState>,
    remote_addr: SocketAddr,
    role: ListenerRole,
}

impl Connection {
    fn inbound_tls(&self) -> bool {
        matches!(self.role, ListenerRole::Main { tls: true })
    }
}

/// Running listener tasks
pub(crate) struct Listeners {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    pub main_addr: SocketAddr,
    pub redirect_addr: Option<SocketAddr>,
}

impl Listeners {
    /// Stop accepting and wait for every listener to drain
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Bind the main listener (and the redirect listener when TLS is on)
pub(crate) async fn start_listeners(
    config: &GatewayConfig,
    state: Arc<SharedState>,
    certificates: Arc<dyn CertificateResolver>,
) -> Result<Listeners> {
    let addr = config.listen_addr()?;
    let grace = Duration::from_secs(config.shutdown_timeout_secs);

    let acceptor = match config.tls.as_ref().filter(|t| t.enabled) {
        Some(tls_config) => Some(tls::build_tls_acceptor(tls_config, certificates)?),
        None => None,
    };

    let main = bind(addr).await?;
    let main_addr = main.local_addr()?;

    let redirect = match (&acceptor, &config.http_redirect) {
        (Some(_), Some(redirect)) => {
            let addr: SocketAddr = redirect.address.parse().map_err(|e| {
                GatewayError::Config(format!(
                    "Invalid http_redirect address '{}': {}",
                    redirect.address, e
                ))
            })?;
            Some(bind(addr).await?)
        }
        _ => None,
    };
    let redirect_addr = match &redirect {
        Some(listener) => Some(listener.local_addr()?),
        None => None,
    };

    let (shutdown, rx) = watch::channel(false);
    let mut tasks = Vec::with_capacity(2);

    tracing::info!(
        address = %main_addr,
        tls = acceptor.is_some(),
        "Main listener started"
    );
    let role = ListenerRole::Main {
        tls: acceptor.is_some(),
    };
    tasks.push(tokio::spawn(serve(
        main,
        acceptor,
        role,
        state.clone(),
        rx.clone(),
        grace,
    )));

    if let Some(listener) = redirect {
        tracing::info!(address = ?redirect_addr, "HTTP redirect listener started");
        let role = ListenerRole::Redirect {
            https_port: main_addr.port(),
        };
        tasks.push(tokio::spawn(serve(listener, None, role, state, rx, grace)));
    }

    Ok(Listeners {
        shutdown,
        tasks,
        main_addr,
        redirect_addr,
    })
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Other(format!("Failed to bind {}: {}", addr, e)))
}

/// Accept loop; on shutdown, waits up to `grace` for open connections
async fn serve(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    role: ListenerRole,
    state: Arc<SharedState>,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let conn = Arc::new(Connection {
                    state: state.clone(),
                    remote_addr,
                    role,
                });
                let acceptor = acceptor.clone();
                let shutdown = shutdown.clone();
                connections.spawn(async move {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => serve_connection(tls_stream, conn, shutdown).await,
                            Err(e) => {
                                tracing::debug!(client = %remote_addr, error = %e, "TLS handshake failed");
                            }
                        },
                        None => serve_connection(stream, conn, shutdown).await,
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }
    drop(listener);

    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            remaining = connections.len(),
            "Shutdown window elapsed, closing remaining connections"
        );
        connections.shutdown().await;
    }
}

async fn serve_connection<I>(io: I, conn: Arc<Connection>, mut shutdown: watch::Receiver<bool>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let remote_addr = conn.remote_addr;
    let service = service_fn(move |req| handle_request(req, conn.clone()));
    let connection = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades();
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                tracing::debug!(client = %remote_addr, error = %e, "Connection ended with error");
            }
        }
        _ = shutdown.changed() => {
            connection.as_mut().graceful_shutdown();
            let _ = connection.await;
        }
    }
}

/// Handle one request: dispatch, convert errors, log and record
async fn handle_request(
    req: Request<Incoming>,
    conn: Arc<Connection>,
) -> Result<Response<ProxyBody>> {
    let state = &conn.state;
    let host = request_host(&req);
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let mut tracker =
        state
            .access_log
            .start_request(conn.remote_addr.ip(), method.as_str(), &host, &path);

    let response = match dispatch(req, &conn, &host, &mut tracker).await {
        Ok(Some(response)) => response,
        Ok(None) => {
            tracing::debug!(host, path, "Closing connection without a response");
            state.access_log.record(&tracker.finish(0));
            return Err(GatewayError::Other("closed without response".to_string()));
        }
        Err(e) => {
            tracing::error!(
                endpoint = tracker.endpoint().unwrap_or("-"),
                upstream = tracker.upstream().unwrap_or("-"),
                method = %method,
                path,
                error = %e,
                "Request failed"
            );
            body::json_error(e.status_code(), &e.to_string())
        }
    };

    let status = response.status();
    if let Some(endpoint) = tracker.endpoint() {
        state.stats.record_request(endpoint, status, tracker.elapsed());
    }
    state.access_log.record(&tracker.finish(status.as_u16()));
    Ok(response)
}

/// Route and serve one request. `Ok(None)` closes the connection unanswered.
async fn dispatch(
    req: Request<Incoming>,
    conn: &Connection,
    host: &str,
    tracker: &mut RequestTracker,
) -> Result<Option<Response<ProxyBody>>> {
    let state = &conn.state;
    let client_ip = conn.remote_addr.ip();
    let inbound_tls = conn.inbound_tls();

    if !state.access.is_allowed(client_ip, None) {
        tracing::debug!(client = %client_ip, "Client denied by access control");
        return Ok(Some(body::json_error(StatusCode::FORBIDDEN, "access denied")));
    }

    let (mut parts, body) = req.into_parts();

    if let Some((rule, response)) = state.special.respond(&parts) {
        tracing::debug!(rule, path = parts.uri.path(), "Special rule answered");
        tracker.set_kind(ForwardKind::Special);
        return Ok(Some(response));
    }

    if let Some(response) = state.redirects.respond(host, &parts.uri) {
        tracker.set_kind(ForwardKind::Redirect);
        return Ok(Some(response));
    }

    let path = parts.uri.path().to_string();
    let matched = state.router.route(host, &path);

    if let ListenerRole::Redirect { https_port } = conn.role {
        let bypass = matched
            .as_ref()
            .map(|m| m.endpoint.bypass_global_tls)
            .unwrap_or(false);
        if !bypass {
            tracker.set_kind(ForwardKind::Redirect);
            let location = https_location(host, Some(https_port), &parts.uri);
            return Ok(Some(body::redirect(StatusCode::TEMPORARY_REDIRECT, &location)));
        }
    }

    let Some(matched) = matched else {
        return Ok(Some(body::json_error(
            StatusCode::NOT_FOUND,
            "no endpoint matches this host",
        )));
    };
    let label = matched.label();
    tracker.set_endpoint(&label);
    let target = matched.target().clone();

    if matched.endpoint.kind == EndpointKind::Root && matched.virtual_directory.is_none() {
        match matched.endpoint.default_site {
            DefaultSite::ReverseProxy => {}
            DefaultSite::Redirect => {
                tracker.set_kind(ForwardKind::Redirect);
                return Ok(Some(default_site_redirect(
                    &matched.endpoint.default_site_target,
                    host,
                )));
            }
            DefaultSite::NotFound => {
                return Ok(Some(body::json_error(StatusCode::NOT_FOUND, "not found")));
            }
            DefaultSite::NoResponse => return Ok(None),
        }
    }

    if let Some(vdir) = &matched.virtual_directory {
        if vdir.needs_trailing_slash(&path) {
            tracker.set_kind(ForwardKind::Redirect);
            let location = match parts.uri.query() {
                Some(query) => format!("{}/?{}", path, query),
                None => format!("{}/", path),
            };
            return Ok(Some(body::redirect(StatusCode::TEMPORARY_REDIRECT, &location)));
        }
    }

    if target.require_tls && !inbound_tls {
        tracker.set_kind(ForwardKind::Redirect);
        let location = https_location(host, None, &parts.uri);
        return Ok(Some(body::redirect(StatusCode::TEMPORARY_REDIRECT, &location)));
    }

    let ctx = RequestContext {
        client_ip,
        endpoint: label.clone(),
        inbound_tls,
    };
    if let Some(response) = target.pipeline.process_request(&mut parts, &ctx).await? {
        return Ok(Some(response));
    }

    let is_connect = parts.method == Method::CONNECT;
    if is_connect && !state.allow_connect {
        return Ok(Some(body::json_error(
            StatusCode::METHOD_NOT_ALLOWED,
            "CONNECT is not enabled",
        )));
    }

    let selection = state
        .lb
        .select(&label, &target.upstreams, &parts.headers, target.sticky_session)?;
    let upstream = selection.upstream.clone();
    tracker.set_upstream(&upstream.origin);

    let forward_path: &str = match &matched.virtual_directory {
        Some(vdir) => vdir.strip_prefix(&path),
        None => &path,
    };

    let mut response = if is_connect {
        tracker.set_kind(ForwardKind::Tunnel);
        open_tunnel(Request::from_parts(parts, body), &upstream, state).await?
    } else if websocket::is_websocket_upgrade(&parts.headers) {
        tracker.set_kind(ForwardKind::Websocket);
        let ctx = WebSocketContext {
            upstream: &upstream,
            client_ip,
            inbound_tls,
            original_host: host,
            path: forward_path,
            rules: &target.rules,
            copy_all_headers: target.ws_copy_all_headers,
            host_override: target.host_header_override.as_deref(),
            dial_timeout: state.connect_timeout,
        };
        websocket::proxy_upgrade(Request::from_parts(parts, body), &ctx).await?
    } else {
        tracker.set_kind(ForwardKind::Proxy);
        let ctx = ForwardContext {
            upstream: &upstream,
            client_ip,
            inbound_tls,
            original_host: host,
            path: forward_path,
            path_prefix: matched.virtual_directory.as_ref().map(|v| v.prefix()),
            rules: &target.rules,
            no_cache: target.no_cache,
            host_override: target.host_header_override.as_deref(),
            flush_interval: target.flush_interval,
        };
        forward(Request::from_parts(parts, body::incoming(body)), &ctx).await?
    };

    if let Some(cookie) = selection.set_cookie {
        append_cookie(response.headers_mut(), cookie);
    }
    Ok(Some(response))
}

/// Take over the client connection and relay it to the upstream
async fn open_tunnel(
    mut req: Request<Incoming>,
    upstream: &Upstream,
    state: &SharedState,
) -> Result<Response<ProxyBody>> {
    let on_upgrade = tcp::take_connection(&mut req)?;
    let address = upstream.dial_address();
    let stream = tcp::connect_upstream(&address, state.connect_timeout).await?;
    tracing::debug!(upstream = address, "Tunnel established");
    tcp::spawn_tunnel(on_upgrade, stream, state.tunnel_timeout, address);
    Ok(Response::new(body::empty()))
}

/// Host the client addressed: the `Host` header, else the URI authority
fn request_host<B>(req: &Request<B>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

/// `https://host[:port]/path?query`; port 443 is left implicit
fn https_location(host: &str, port: Option<u16>, uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    match port {
        Some(port) if port != 443 => {
            format!("https://{}:{}{}", strip_port(host), port, path_and_query)
        }
        _ => format!("https://{}{}", strip_port(host), path_and_query),
    }
}

fn default_site_redirect(target: &str, request_host: &str) -> Response<ProxyBody> {
    let target_host = target
        .parse::<Uri>()
        .ok()
        .and_then(|uri| uri.host().map(str::to_string));
    if let Some(target_host) = target_host {
        if target_host.eq_ignore_ascii_case(strip_port(request_host)) {
            return body::json_error(StatusCode::LOOP_DETECTED, "default site redirects to itself");
        }
    }
    body::redirect(StatusCode::TEMPORARY_REDIRECT, target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_state() -> Arc<SharedState> {
        Arc::new(SharedState {
            router: Arc::new(RouterTable::new()),
            lb: Arc::new(LoadBalancer::new(
                crate::service::StickySessions::new(None),
                Default::default(),
            )),
            special: Arc::new(SpecialRules::new()),
            redirects: Arc::new(RedirectRules::new()),
            access: Arc::new(crate::provider::AllowAll),
            stats: Arc::new(crate::provider::TracingStats),
            access_log: Arc::new(AccessLog::new()),
            allow_connect: false,
            tunnel_timeout: tcp::DEFAULT_TUNNEL_TIMEOUT,
            connect_timeout: Duration::from_secs(1),
        })
    }

    #[test]
    fn test_https_location() {
        let uri: Uri = "/a/b?x=1".parse().unwrap();
        assert_eq!(
            https_location("app.example.com:80", Some(443), &uri),
            "https://app.example.com/a/b?x=1"
        );
        assert_eq!(
            https_location("app.example.com", Some(8443), &uri),
            "https://app.example.com:8443/a/b?x=1"
        );
        assert_eq!(
            https_location("app.example.com:8080", None, &uri),
            "https://app.example.com/a/b?x=1"
        );
    }

    #[test]
    fn test_request_host_prefers_header() {
        let req = Request::builder()
            .uri("http://other.example.com/x")
            .header(HOST, "app.example.com")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req), "app.example.com");

        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("tunnel.example.com:443")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req), "tunnel.example.com:443");

        let req = Request::builder().uri("/x").body(()).unwrap();
        assert_eq!(request_host(&req), "");
    }

    #[test]
    fn test_default_site_redirect_loop() {
        let resp = default_site_redirect("https://example.com/home", "example.com:443");
        assert_eq!(resp.status(), StatusCode::LOOP_DETECTED);

        let resp = default_site_redirect("https://example.com/home", "other.example.net");
        assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(resp.headers()["location"], "https://example.com/home");
    }

    #[test]
    fn test_connection_inbound_tls() {
        let state = bare_state();
        let conn = |role| Connection {
            state: state.clone(),
            remote_addr: "127.0.0.1:5000".parse().unwrap(),
            role,
        };
        assert!(conn(ListenerRole::Main { tls: true }).inbound_tls());
        assert!(!conn(ListenerRole::Main { tls: false }).inbound_tls());
        assert!(!conn(ListenerRole::Redirect { https_port: 443 }).inbound_tls());
    }

    #[tokio::test]
    async fn test_invalid_redirect_address() {
        let config = GatewayConfig {
            listen: "127.0.0.1:0".into(),
            http_redirect: Some(crate::config::HttpRedirectConfig {
                address: "not-an-address".into(),
            }),
            ..Default::default()
        };
        // Without TLS the redirect listener is never bound
        let state = bare_state();
        let certs = Arc::new(crate::provider::StaticCertificates::default());
        let listeners = start_listeners(&config, state, certs).await.unwrap();
        assert!(listeners.redirect_addr.is_none());
        assert_ne!(listeners.main_addr.port(), 0);
        listeners.shutdown().await;
    }
}
