//! Special routing rules: predicates evaluated before endpoint matching
//!
//! The first enabled rule whose predicate accepts the request answers it
//! and normal routing is skipped.

use crate::proxy::body::{self, ProxyBody};
use http::header::{HeaderValue, CONTENT_TYPE};
use http::request::Parts;
use http::{Response, StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Request predicate
pub type Predicate = Arc<dyn Fn(&Parts) -> bool + Send + Sync>;
/// Request handler
pub type Handler = Arc<dyn Fn(&Parts) -> Response<ProxyBody> + Send + Sync>;

/// One predicate/handler pair
#[derive(Clone)]
pub struct SpecialRule {
    pub id: String,
    pub predicate: Predicate,
    pub handler: Handler,
    pub enabled: bool,
}

impl std::fmt::Debug for SpecialRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecialRule")
            .field("id", &self.id)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Ordered rule registry
#[derive(Debug, Default)]
pub struct SpecialRules {
    rules: RwLock<Vec<SpecialRule>>,
}

impl SpecialRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule, replacing any rule with the same id
    pub fn add_rule(&self, rule: SpecialRule) {
        let mut rules = self.rules.write().unwrap();
        if let Some(existing) = rules.iter_mut().find(|r| r.id == rule.id) {
            *existing = rule;
        } else {
            rules.push(rule);
        }
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        let mut rules = self.rules.write().unwrap();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        rules.len() != before
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut rules = self.rules.write().unwrap();
        match rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.rules.read().unwrap().iter().map(|r| r.id.clone()).collect()
    }

    /// Answer from the first matching enabled rule
    pub fn respond(&self, parts: &Parts) -> Option<(String, Response<ProxyBody>)> {
        let handler = {
            let rules = self.rules.read().unwrap();
            rules
                .iter()
                .find(|r| r.enabled && (r.predicate)(parts))
                .map(|r| (r.id.clone(), r.handler.clone()))
        };
        handler.map(|(id, handler)| (id, handler(parts)))
    }
}

/// Path prefix of HTTP-01 challenge requests
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// HTTP-01 challenge responder backed by an in-memory token map
#[derive(Debug, Clone, Default)]
pub struct AcmeChallengeResponder {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl AcmeChallengeResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a key authorization for `token`
    pub fn put_token(&self, token: impl Into<String>, key_authorization: impl Into<String>) {
        self.tokens
            .write()
            .unwrap()
            .insert(token.into(), key_authorization.into());
    }

    pub fn remove_token(&self, token: &str) {
        self.tokens.write().unwrap().remove(token);
    }

    /// Registry entry serving the published tokens
    pub fn rule(&self) -> SpecialRule {
        let tokens = self.tokens.clone();
        SpecialRule {
            id: "acme-http-01".to_string(),
            predicate: Arc::new(|parts: &Parts| {
                parts.uri.path().starts_with(ACME_CHALLENGE_PREFIX)
            }),
            handler: Arc::new(move |parts: &Parts| {
                let token = parts
                    .uri
                    .path()
                    .trim_start_matches(ACME_CHALLENGE_PREFIX);
                match tokens.read().unwrap().get(token) {
                    Some(value) => text_response(StatusCode::OK, "text/plain", value.clone()),
                    None => body::json_error(StatusCode::NOT_FOUND, "unknown challenge token"),
                }
            }),
            enabled: true,
        }
    }
}

/// Rule answering one exact path with a fixed body
pub fn static_responder(
    id: impl Into<String>,
    path: impl Into<String>,
    status: StatusCode,
    content_type: &'static str,
    content: impl Into<String>,
) -> SpecialRule {
    let path = path.into();
    let content = content.into();
    SpecialRule {
        id: id.into(),
        predicate: Arc::new(move |parts: &Parts| parts.uri.path() == path),
        handler: Arc::new(move |_: &Parts| text_response(status, content_type, content.clone())),
        enabled: true,
    }
}

fn text_response(status: StatusCode, content_type: &'static str, content: String) -> Response<ProxyBody> {
    let mut response = Response::new(body::full(content));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
