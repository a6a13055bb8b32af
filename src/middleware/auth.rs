//! Basic auth gate with path-prefix exceptions

use super::{Middleware, RequestContext};
use crate::config::BasicAuthConfig;
use crate::error::{GatewayError, Result};
use crate::proxy::body::{json_error, ProxyBody};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::{HeaderValue, Response, StatusCode};
use std::collections::HashMap;

/// Basic auth middleware
pub struct BasicAuthMiddleware {
    /// username → lowercase hex SHA-512 of the password
    credentials: HashMap<String, String>,
    exceptions: Vec<String>,
}

impl BasicAuthMiddleware {
    pub fn new(config: &BasicAuthConfig) -> Result<Self> {
        let mut credentials = HashMap::new();
        for cred in &config.credentials {
            if cred.username.is_empty() || cred.username.contains(':') {
                return Err(GatewayError::Config(format!(
                    "Invalid basic auth username '{}'",
                    cred.username
                )));
            }
            credentials.insert(cred.username.clone(), cred.password_hash.to_ascii_lowercase());
        }
        Ok(Self {
            credentials,
            exceptions: config.exceptions.clone(),
        })
    }

    fn is_exception(&self, path: &str) -> bool {
        self.exceptions
            .iter()
            .any(|prefix| !prefix.is_empty() && path.starts_with(prefix.as_str()))
    }

    fn verify(&self, header: Option<&HeaderValue>) -> bool {
        let Some(value) = header.and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let Some(encoded) = value
            .strip_prefix("Basic ")
            .or_else(|| value.strip_prefix("basic "))
        else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((username, password)) = decoded.split_once(':') else {
            return false;
        };
        self.credentials
            .get(username)
            .map(|expected| *expected == hash_password(password))
            .unwrap_or(false)
    }

    fn challenge() -> Response<ProxyBody> {
        let mut resp = json_error(StatusCode::UNAUTHORIZED, "Unauthorized");
        resp.headers_mut().insert(
            http::header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"Restricted\""),
        );
        resp
    }
}

/// Lowercase hex SHA-512 of a password, the stored credential format
pub fn hash_password(password: &str) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA512, password.as_bytes());
    digest.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
}

#[async_trait]
impl Middleware for BasicAuthMiddleware {
    async fn handle_request(
        &self,
        req: &mut http::request::Parts,
        ctx: &RequestContext,
    ) -> Result<Option<Response<ProxyBody>>> {
        if self.is_exception(req.uri.path()) {
            return Ok(None);
        }
        if self.verify(req.headers.get(http::header::AUTHORIZATION)) {
            return Ok(None);
        }
        tracing::debug!(
            endpoint = ctx.endpoint,
            client = %ctx.client_ip,
            path = req.uri.path(),
            "Basic auth rejected request"
        );
        Ok(Some(Self::challenge()))
    }

    fn name(&self) -> &str {
        "basic-auth"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialConfig;
    use http::Request;

    fn make_ctx() -> RequestContext {
        RequestContext {
            client_ip: "127.0.0.1".parse().unwrap(),
            endpoint: "a.example.com".to_string(),
            inbound_tls: false,
        }
    }

    fn make_auth() -> BasicAuthMiddleware {
        BasicAuthMiddleware::new(&BasicAuthConfig {
            credentials: vec![CredentialConfig {
                username: "admin".into(),
                password_hash: hash_password("secret"),
            }],
            exceptions: vec!["/public".into()],
        })
        .unwrap()
    }

    fn parts(path: &str, auth: Option<&str>) -> http::request::Parts {
        let mut builder = Request::builder().uri(path);
        if let Some(a) = auth {
            builder = builder.header("Authorization", a);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn basic(user: &str, pass: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:{}", user, pass)))
    }

    #[test]
    fn test_hash_password_is_sha512_hex() {
        let h = hash_password("secret");
        assert_eq!(h.len(), 128);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(h, hash_password("secret"));
        assert_ne!(h, hash_password("Secret"));
    }

    #[tokio::test]
    async fn test_valid_credentials_pass() {
        let mw = make_auth();
        let mut p = parts("/admin", Some(&basic("admin", "secret")));
        assert!(mw.handle_request(&mut p, &make_ctx()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wrong_password_challenged() {
        let mw = make_auth();
        let mut p = parts("/admin", Some(&basic("admin", "nope")));
        let resp = mw.handle_request(&mut p, &make_ctx()).await.unwrap().unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()["www-authenticate"], "Basic realm=\"Restricted\"");
    }

    #[tokio::test]
    async fn test_missing_header_challenged() {
        let mw = make_auth();
        let mut p = parts("/admin", None);
        let resp = mw.handle_request(&mut p, &make_ctx()).await.unwrap();
        assert!(resp.is_some());
    }

    #[tokio::test]
    async fn test_exception_prefix_bypasses_auth() {
        let mw = make_auth();
        let mut p = parts("/public/logo.png", None);
        assert!(mw.handle_request(&mut p, &make_ctx()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_garbage_header_challenged() {
        let mw = make_auth();
        let mut p = parts("/", Some("Basic !!!notbase64"));
        assert!(mw.handle_request(&mut p, &make_ctx()).await.unwrap().is_some());
        let mut p = parts("/", Some("Bearer abc"));
        assert!(mw.handle_request(&mut p, &make_ctx()).await.unwrap().is_some());
    }

    #[test]
    fn test_username_with_colon_rejected() {
        let result = BasicAuthMiddleware::new(&BasicAuthConfig {
            credentials: vec![CredentialConfig {
                username: "a:b".into(),
                password_hash: String::new(),
            }],
            exceptions: vec![],
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_name() {
        assert_eq!(make_auth().name(), "basic-auth");
    }
}
