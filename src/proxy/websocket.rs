//! WebSocket proxy: upgrade handshake and bidirectional frame relay
//!
//! The backend is dialed first. Only after its handshake succeeds is the
//! client connection upgraded, so a backend refusal (redirect, auth
//! challenge) can still be relayed to the client as a normal response.

use super::body::{self, ProxyBody};
use super::headers::{self, is_hop_by_hop};
use crate::error::{GatewayError, Result};
use crate::middleware::HeaderRewriteRules;
use crate::service::Upstream;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http::header::{
    HeaderName, HeaderValue, CONNECTION, HOST, ORIGIN, SEC_WEBSOCKET_ACCEPT,
    SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SET_COOKIE, UPGRADE, USER_AGENT,
};
use http::{HeaderMap, Request, Response, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::net::IpAddr;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector, WebSocketStream};

/// Headers forwarded to the backend dial when copy-all is off
const ALLOW_LIST: [&str; 6] = [
    "origin",
    "sec-websocket-protocol",
    "cookie",
    "user-agent",
    "x-forwarded-for",
    "x-forwarded-proto",
];

/// Handshake headers the dialer generates itself
const HANDSHAKE: [&str; 5] = [
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-accept",
    "host",
];

/// Check if an HTTP request is a WebSocket upgrade request
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .or_else(|| headers.get(headers::ORIGIN_UPGRADE))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Backend URL for an upgrade: `ws(s)://origin[/base]/path[?query]`
pub fn build_ws_url(upstream: &Upstream, path: &str, query: Option<&str>) -> Result<String> {
    let target = headers::target_uri(upstream.base_uri(), path, query)
        .map_err(|e| GatewayError::Protocol(format!("Cannot build WebSocket URL: {}", e)))?;
    let scheme = if upstream.require_tls { "wss" } else { "ws" };
    let path_and_query = target
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Ok(format!("{}://{}{}", scheme, upstream.authority(), path_and_query))
}

/// Browser origin check: when an `Origin` is present its host must equal
/// the requested host
pub fn origin_allowed(headers: &HeaderMap, request_host: &str) -> bool {
    let Some(origin) = headers.get(ORIGIN).and_then(|v| v.to_str().ok()) else {
        return true;
    };
    let host = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin)
        .trim_end_matches('/');
    host.eq_ignore_ascii_case(request_host)
}

/// Per-upgrade inputs
pub struct WebSocketContext<'a> {
    pub upstream: &'a Upstream,
    pub client_ip: IpAddr,
    pub inbound_tls: bool,
    pub original_host: &'a str,
    pub path: &'a str,
    pub rules: &'a HeaderRewriteRules,
    pub copy_all_headers: bool,
    pub host_override: Option<&'a str>,
    pub dial_timeout: Duration,
}

/// Headers for the backend dial
pub fn backend_headers(inbound: &HeaderMap, ctx: &WebSocketContext<'_>) -> HeaderMap {
    let mut out = HeaderMap::new();

    if ctx.copy_all_headers {
        for (name, value) in inbound {
            let lower = name.as_str();
            if is_hop_by_hop(lower)
                || lower == headers::ORIGIN_UPGRADE
                || HANDSHAKE.contains(&lower)
            {
                continue;
            }
            out.append(name.clone(), value.clone());
        }
    } else {
        for name in ALLOW_LIST {
            for value in inbound.get_all(name) {
                out.append(HeaderName::from_static(name), value.clone());
            }
        }
    }

    let client = ctx.client_ip.to_string();
    let chain = inbound
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ");
    let chain = if chain.is_empty() {
        client
    } else {
        format!("{}, {}", chain, client)
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        out.insert("x-forwarded-for", value);
    }
    let proto = if ctx.inbound_tls { "https" } else { "http" };
    out.insert("x-forwarded-proto", HeaderValue::from_static(proto));

    if !out.contains_key(USER_AGENT) {
        if let Ok(value) = HeaderValue::from_str(&headers::product()) {
            out.insert(USER_AGENT, value);
        }
    }

    if ctx.copy_all_headers {
        ctx.rules.apply_upstream(&mut out);
        out.remove(UPGRADE);
        out.remove(CONNECTION);
    }
    out
}

/// Dial the backend, answer the client's upgrade and start relaying frames.
///
/// On a backend refusal that carried an HTTP response, that response is
/// returned as-is; a dial with no response at all is a transport error.
pub async fn proxy_upgrade<B>(
    mut req: Request<B>,
    ctx: &WebSocketContext<'_>,
) -> Result<Response<ProxyBody>> {
    let client_key = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .cloned()
        .ok_or_else(|| GatewayError::Protocol("missing Sec-WebSocket-Key".to_string()))?;

    if !ctx.upstream.skip_ws_origin_check && !origin_allowed(req.headers(), ctx.original_host) {
        return Ok(body::json_error(
            StatusCode::FORBIDDEN,
            "websocket origin not allowed",
        ));
    }

    if req.extensions().get::<OnUpgrade>().is_none() {
        return Err(GatewayError::Protocol(
            "connection does not support upgrade".to_string(),
        ));
    }

    let url = build_ws_url(ctx.upstream, ctx.path, req.uri().query())?;
    let mut dial = url
        .as_str()
        .into_client_request()
        .map_err(|e| GatewayError::Protocol(format!("Invalid WebSocket URL {}: {}", url, e)))?;
    for (name, value) in &backend_headers(req.headers(), ctx) {
        dial.headers_mut().append(name.clone(), value.clone());
    }
    let host = headers::outbound_host(
        ctx.host_override,
        ctx.upstream.authority(),
        ctx.upstream.require_tls,
        ctx.original_host,
    );
    if let Ok(value) = HeaderValue::from_str(host) {
        dial.headers_mut().insert(HOST, value);
    }

    let connector = if ctx.upstream.require_tls {
        Some(Connector::Rustls(ctx.upstream.tls_config()?))
    } else {
        None
    };

    tracing::debug!(upstream = ctx.upstream.origin, url = %url, "Dialing WebSocket backend");
    let dialed = tokio::time::timeout(
        ctx.dial_timeout,
        tokio_tungstenite::connect_async_tls_with_config(dial, None, true, connector),
    )
    .await
    .map_err(|_| GatewayError::UpstreamTimeout(ctx.dial_timeout.as_secs()))?;

    let (backend, backend_response) = match dialed {
        Ok(pair) => pair,
        Err(WsError::Http(refusal)) => {
            tracing::info!(
                upstream = ctx.upstream.origin,
                status = refusal.status().as_u16(),
                "WebSocket backend refused upgrade"
            );
            let mut response = Response::new(body::full(refusal.body().clone().unwrap_or_default()));
            *response.status_mut() = refusal.status();
            for (name, value) in refusal.headers() {
                if !is_hop_by_hop(name.as_str()) {
                    response.headers_mut().append(name.clone(), value.clone());
                }
            }
            return Ok(response);
        }
        Err(e) => return Err(GatewayError::transport(&ctx.upstream.origin, e)),
    };

    let on_upgrade = hyper::upgrade::on(&mut req);

    let mut response = Response::new(body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let out = response.headers_mut();
    out.insert(UPGRADE, HeaderValue::from_static("websocket"));
    out.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    if let Ok(accept) = HeaderValue::from_str(&derive_accept_key(client_key.as_bytes())) {
        out.insert(SEC_WEBSOCKET_ACCEPT, accept);
    }
    if let Some(protocol) = backend_response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
        out.insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
    }
    if let Some(cookie) = backend_response.headers().get(SET_COOKIE) {
        out.insert(SET_COOKIE, cookie.clone());
    }

    let origin = ctx.upstream.origin.clone();
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::warn!(upstream = origin, error = %e, "Client WebSocket upgrade failed");
                return;
            }
        };
        let client = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
            .await;
        relay_websocket(client, backend).await;
        tracing::debug!(upstream = origin, "WebSocket relay finished");
    });

    Ok(response)
}

/// Relay frames both ways; a close or error on one side closes the other
pub async fn relay_websocket<C, U>(client: C, upstream: U)
where
    C: Stream<Item = std::result::Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Unpin,
    U: Stream<Item = std::result::Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(msg) = client_rx.next().await {
            match msg {
                Ok(Message::Close(frame)) => {
                    let _ = upstream_tx.send(Message::Close(frame)).await;
                    break;
                }
                Ok(msg) => {
                    if upstream_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = upstream_tx.close().await;
    };

    let upstream_to_client = async {
        while let Some(msg) = upstream_rx.next().await {
            match msg {
                Ok(Message::Close(frame)) => {
                    let _ = client_tx.send(Message::Close(frame)).await;
                    break;
                }
                Ok(msg) => {
                    if client_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
}
