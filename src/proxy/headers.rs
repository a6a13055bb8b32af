//! Header semantics of the forwarding core
//!
//! Hop-by-hop stripping, forwarded-for chains, outbound Host selection,
//! target URL joining and `Location` rewriting.

use http::header::{HeaderName, HeaderValue, CONNECTION, UPGRADE};
use http::{HeaderMap, Uri};
use std::net::IpAddr;

/// Headers meaningful only to a single connection
pub const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Name under which an inbound `Upgrade` header is kept while hop-by-hop
/// headers are stripped
pub const ORIGIN_UPGRADE: &str = "x-origin-upgrade";

/// Gateway identification used in `User-Agent` and `x-proxy-by`
pub fn product() -> String {
    format!("dynproxy/{}", env!("CARGO_PKG_VERSION"))
}

/// Check if a header name is hop-by-hop
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
///
/// `Upgrade` is stashed under [`ORIGIN_UPGRADE`] first so that it can be
/// restored with [`restore_upgrade`].
pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    if let Some(upgrade) = headers.get(UPGRADE).cloned() {
        headers.insert(HeaderName::from_static(ORIGIN_UPGRADE), upgrade);
    }

    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    for name in listed {
        headers.remove(name.as_str());
    }

    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Move the stashed upgrade token back to `Upgrade`
pub fn restore_upgrade(headers: &mut HeaderMap) {
    if let Some(upgrade) = headers.remove(ORIGIN_UPGRADE) {
        headers.insert(UPGRADE, upgrade);
    }
}

/// Inbound facts the forwarded headers are built from
#[derive(Debug, Clone)]
pub struct ForwardedInfo<'a> {
    pub client_ip: IpAddr,
    pub inbound_tls: bool,
    pub original_host: &'a str,
}

/// Inject `X-Forwarded-*` and `X-Real-IP`
pub fn set_forwarded_headers(headers: &mut HeaderMap, info: &ForwardedInfo<'_>) {
    let client = info.client_ip.to_string();

    let chain = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ");
    let chain = if chain.is_empty() {
        client.clone()
    } else {
        format!("{}, {}", chain, client)
    };
    set(headers, "x-forwarded-for", &chain);

    if !headers.contains_key("x-real-ip") {
        set(headers, "x-real-ip", &client);
    }

    let proto = if info.inbound_tls { "https" } else { "http" };
    set(headers, "x-forwarded-proto", proto);
    set(headers, "x-forwarded-host", info.original_host);
    set(headers, "x-forwarded-server", &gateway_hostname());
}

/// Set `User-Agent` when the client did not send one
pub fn ensure_user_agent(headers: &mut HeaderMap) {
    if !headers.contains_key(http::header::USER_AGENT) {
        set(headers, "user-agent", &product());
    }
}

fn set(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), v);
    }
}

fn gateway_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "dynproxy".to_string())
}

/// Strip the port from a `host[:port]` value (IPv6 literals keep their brackets)
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Public domain name: not an IP literal, not localhost, has a dot
pub fn is_external_domain(host: &str) -> bool {
    let name = strip_port(host).trim_matches(['[', ']']);
    if name.parse::<IpAddr>().is_ok() {
        return false;
    }
    let lower = name.to_ascii_lowercase();
    lower != "localhost" && !lower.ends_with(".localhost") && lower.contains('.')
}

/// Outbound `Host` header value
pub fn outbound_host<'a>(
    override_host: Option<&'a str>,
    upstream_host: &'a str,
    upstream_tls: bool,
    original_host: &'a str,
) -> &'a str {
    if let Some(host) = override_host.filter(|h| !h.is_empty()) {
        return host;
    }
    if upstream_tls && is_external_domain(upstream_host) {
        return upstream_host;
    }
    original_host
}

/// Join two URL paths with exactly one slash between them
pub fn join_url_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Target query first, then the request query
pub fn join_query(target: Option<&str>, request: Option<&str>) -> Option<String> {
    match (target.filter(|q| !q.is_empty()), request.filter(|q| !q.is_empty())) {
        (Some(t), Some(r)) => Some(format!("{}&{}", t, r)),
        (Some(t), None) => Some(t.to_string()),
        (None, Some(r)) => Some(r.to_string()),
        (None, None) => None,
    }
}

/// Build the outbound URI from the upstream base and the inbound path/query
pub fn target_uri(base: &Uri, path: &str, query: Option<&str>) -> Result<Uri, http::Error> {
    let base_path = base.path();
    let joined = if base_path.is_empty() || base_path == "/" {
        if path.is_empty() {
            "/".to_string()
        } else {
            path.to_string()
        }
    } else {
        join_url_path(base_path, path)
    };
    let path_and_query = match join_query(base.query(), query) {
        Some(q) => format!("{}?{}", joined, q),
        None => joined,
    };

    let mut builder = Uri::builder().path_and_query(path_and_query);
    if let Some(scheme) = base.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = base.authority() {
        builder = builder.authority(authority.clone());
    }
    builder.build().map_err(Into::into)
}

/// Context for rewriting a `Location` response header
#[derive(Debug, Clone)]
pub struct LocationContext<'a> {
    /// Upstream origin as configured (`host:port[/base]`)
    pub upstream: &'a str,
    /// Host the client addressed
    pub original_host: &'a str,
    /// Virtual directory mount point, if any
    pub path_prefix: Option<&'a str>,
    pub inbound_tls: bool,
}

/// Rewrite a `Location` value so the client stays on the public host
pub fn rewrite_location(location: &str, ctx: &LocationContext<'_>) -> String {
    let lower = location.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return replace_location_host(location, ctx).unwrap_or_else(|| location.to_string());
    }

    let prefix = match ctx.path_prefix {
        Some(p) if !p.is_empty() && p != "/" => p.trim_end_matches('/'),
        _ => return location.to_string(),
    };

    if location.starts_with('/') {
        return format!("{}{}", prefix, location);
    }

    let scheme = if ctx.inbound_tls { "https" } else { "http" };
    format!("{}://{}{}/{}", scheme, ctx.original_host, prefix, location)
}

fn replace_location_host(location: &str, ctx: &LocationContext<'_>) -> Option<String> {
    let uri: Uri = location.parse().ok()?;
    let authority = uri.authority()?.as_str();

    let (upstream_authority, upstream_base) = match ctx.upstream.find('/') {
        Some(i) => (&ctx.upstream[..i], &ctx.upstream[i..]),
        None => (ctx.upstream, ""),
    };

    let original_with_port = format!("{}:", strip_port(ctx.original_host));
    if !authority.eq_ignore_ascii_case(upstream_authority)
        && !authority.starts_with(&original_with_port)
    {
        return None;
    }

    // Non-standard ports only count when they are the upstream's own
    if let Some(port) = uri.port_u16() {
        if port != 80 && port != 443 && !authority.eq_ignore_ascii_case(upstream_authority) {
            return None;
        }
    }

    let mut path = uri.path().to_string();
    let base = upstream_base.split('?').next().unwrap_or_default().trim_end_matches('/');
    if !base.is_empty() {
        if let Some(rest) = path.strip_prefix(base) {
            path = if rest.is_empty() { "/".to_string() } else { rest.to_string() };
        }
    }
    if let Some(prefix) = ctx.path_prefix.filter(|p| !p.is_empty() && *p != "/") {
        path = join_url_path(prefix.trim_end_matches('/'), &path);
    }

    let scheme = if ctx.inbound_tls { "https" } else { "http" };
    let mut out = format!("{}://{}{}", scheme, ctx.original_host, path);
    if let Some(q) = uri.query() {
        out.push('?');
        out.push_str(q);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(upstream: &'a str, prefix: Option<&'a str>) -> LocationContext<'a> {
        LocationContext {
            upstream,
            original_host: "public.example.com",
            path_prefix: prefix,
            inbound_tls: true,
        }
    }

    #[test]
    fn test_hop_by_hop_detection() {
        for name in HOP_BY_HOP {
            assert!(is_hop_by_hop(name));
        }
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("upgrade"));
    }

    #[test]
    fn test_remove_hop_by_hop_is_total() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, X-Custom"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("proxy-authenticate", HeaderValue::from_static("Basic"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic abc"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("trailer", HeaderValue::from_static("Expires"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-custom", HeaderValue::from_static("gone"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        remove_hop_by_hop(&mut headers);

        for name in HOP_BY_HOP {
            assert!(!headers.contains_key(name), "{} survived", name);
        }
        assert!(!headers.contains_key("x-custom"));
        assert_eq!(headers["content-type"], "text/plain");
    }

    #[test]
    fn test_upgrade_stash_and_restore() {
        let mut headers = HeaderMap::new();
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("connection", HeaderValue::from_static("Upgrade"));
        remove_hop_by_hop(&mut headers);
        assert!(!headers.contains_key("upgrade"));
        assert_eq!(headers[ORIGIN_UPGRADE], "websocket");

        restore_upgrade(&mut headers);
        assert_eq!(headers["upgrade"], "websocket");
        assert!(!headers.contains_key(ORIGIN_UPGRADE));
    }

    #[test]
    fn test_forwarded_for_appends_chain() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.1.1.1"));
        let info = ForwardedInfo {
            client_ip: "2.2.2.2".parse().unwrap(),
            inbound_tls: true,
            original_host: "a.example.com",
        };
        set_forwarded_headers(&mut headers, &info);
        assert_eq!(headers["x-forwarded-for"], "1.1.1.1, 2.2.2.2");
        assert_eq!(headers["x-forwarded-proto"], "https");
        assert_eq!(headers["x-forwarded-host"], "a.example.com");
        assert_eq!(headers["x-real-ip"], "2.2.2.2");
        assert!(headers.contains_key("x-forwarded-server"));
    }

    #[test]
    fn test_forwarded_for_fresh() {
        let mut headers = HeaderMap::new();
        let info = ForwardedInfo {
            client_ip: "10.0.0.9".parse().unwrap(),
            inbound_tls: false,
            original_host: "a.example.com",
        };
        set_forwarded_headers(&mut headers, &info);
        assert_eq!(headers["x-forwarded-for"], "10.0.0.9");
        assert_eq!(headers["x-forwarded-proto"], "http");
    }

    #[test]
    fn test_user_agent_kept_when_present() {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static("curl/8"));
        ensure_user_agent(&mut headers);
        assert_eq!(headers["user-agent"], "curl/8");

        let mut headers = HeaderMap::new();
        ensure_user_agent(&mut headers);
        assert!(headers["user-agent"].to_str().unwrap().starts_with("dynproxy/"));
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("a.example.com:8443"), "a.example.com");
        assert_eq!(strip_port("a.example.com"), "a.example.com");
        assert_eq!(strip_port("[::1]:80"), "[::1]");
        assert_eq!(strip_port("127.0.0.1:80"), "127.0.0.1");
    }

    #[test]
    fn test_is_external_domain() {
        assert!(is_external_domain("github.com"));
        assert!(is_external_domain("api.github.com:443"));
        assert!(!is_external_domain("localhost:8080"));
        assert!(!is_external_domain("192.168.1.10:80"));
        assert!(!is_external_domain("[::1]:80"));
        assert!(!is_external_domain("backend"));
    }

    #[test]
    fn test_outbound_host_precedence() {
        assert_eq!(
            outbound_host(Some("forced.internal"), "github.com", true, "pub.example.com"),
            "forced.internal"
        );
        assert_eq!(
            outbound_host(None, "github.com", true, "pub.example.com"),
            "github.com"
        );
        assert_eq!(
            outbound_host(None, "127.0.0.1:8080", true, "pub.example.com"),
            "pub.example.com"
        );
        assert_eq!(
            outbound_host(Some(""), "github.com", false, "pub.example.com"),
            "pub.example.com"
        );
    }

    #[test]
    fn test_join_url_path() {
        assert_eq!(join_url_path("/a/", "/b"), "/a/b");
        assert_eq!(join_url_path("/a", "b"), "/a/b");
        assert_eq!(join_url_path("/a", "/b"), "/a/b");
        assert_eq!(join_url_path("/a/", "b"), "/a/b");
    }

    #[test]
    fn test_join_query_order() {
        assert_eq!(join_query(Some("t=1"), Some("r=2")).as_deref(), Some("t=1&r=2"));
        assert_eq!(join_query(None, Some("r=2")).as_deref(), Some("r=2"));
        assert_eq!(join_query(Some("t=1"), Some("")).as_deref(), Some("t=1"));
        assert_eq!(join_query(None, None), None);
    }

    #[test]
    fn test_target_uri_with_base_path_and_query() {
        let base: Uri = "http://backend.internal:8080/blog?key=abc".parse().unwrap();
        let uri = target_uri(&base, "/post/1", Some("page=2")).unwrap();
        assert_eq!(
            uri.to_string(),
            "http://backend.internal:8080/blog/post/1?key=abc&page=2"
        );
    }

    #[test]
    fn test_target_uri_plain() {
        let base: Uri = "https://10.0.0.5:443".parse().unwrap();
        let uri = target_uri(&base, "/x", None).unwrap();
        assert_eq!(uri.to_string(), "https://10.0.0.5:443/x");
        let uri = target_uri(&base, "", None).unwrap();
        assert_eq!(uri.path(), "/");
    }

    #[test]
    fn test_location_absolute_upstream_host_rewritten() {
        let out = rewrite_location("https://backend.internal/x", &ctx("backend.internal", None));
        assert_eq!(out, "https://public.example.com/x");
    }

    #[test]
    fn test_location_scheme_follows_inbound_tls() {
        let mut c = ctx("backend.internal", None);
        c.inbound_tls = false;
        let out = rewrite_location("https://backend.internal/x?a=1", &c);
        assert_eq!(out, "http://public.example.com/x?a=1");
    }

    #[test]
    fn test_location_foreign_host_untouched() {
        let out = rewrite_location("https://news.example.org/x", &ctx("backend.internal", None));
        assert_eq!(out, "https://news.example.org/x");
    }

    #[test]
    fn test_location_original_host_odd_port_untouched() {
        let out = rewrite_location(
            "http://public.example.com:8443/x",
            &ctx("backend.internal", None),
        );
        assert_eq!(out, "http://public.example.com:8443/x");
    }

    #[test]
    fn test_location_original_host_standard_port_rewritten() {
        let out = rewrite_location(
            "http://public.example.com:443/x",
            &ctx("backend.internal", None),
        );
        assert_eq!(out, "https://public.example.com/x");
    }

    #[test]
    fn test_location_upstream_base_path_trimmed() {
        let out = rewrite_location(
            "http://example.com/blog/post?id=1",
            &ctx("example.com/blog", None),
        );
        assert_eq!(out, "https://public.example.com/post?id=1");
    }

    #[test]
    fn test_location_root_relative_under_vdir() {
        let out = rewrite_location("/login", &ctx("backend.internal", Some("/app/")));
        assert_eq!(out, "/app/login");
    }

    #[test]
    fn test_location_relative_under_vdir() {
        let out = rewrite_location("api/", &ctx("backend.internal", Some("/app/")));
        assert_eq!(out, "https://public.example.com/app/api/");
    }

    #[test]
    fn test_location_relative_without_vdir_untouched() {
        assert_eq!(rewrite_location("api/", &ctx("backend.internal", None)), "api/");
        assert_eq!(rewrite_location("/login", &ctx("backend.internal", None)), "/login");
    }

    #[test]
    fn test_location_absolute_under_vdir_gets_prefix() {
        let out = rewrite_location(
            "http://backend.internal/dashboard",
            &ctx("backend.internal", Some("/app/")),
        );
        assert_eq!(out, "https://public.example.com/app/dashboard");
    }
}
