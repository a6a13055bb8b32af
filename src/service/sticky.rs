//! Sticky sessions: signed cookie binding a client to one upstream
//!
//! The binding lives entirely on the client: the cookie carries the
//! endpoint key, the upstream index and the upstream origin, signed with
//! HMAC-SHA256. Nothing is stored server-side.
//!
//! Each endpoint (and each virtual directory) gets its own cookie name, so
//! a client holds independent bindings for a host and its directories.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};

/// Prefix of every binding cookie name
pub const COOKIE_NAME: &str = "STICKYSESSION";

/// Cookie name for one endpoint label: the prefix plus a short digest
pub fn cookie_name(endpoint: &str) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, endpoint.as_bytes());
    let suffix: String = digest.as_ref()[..4]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("{}_{}", COOKIE_NAME, suffix)
}

/// Cookie lifetime in seconds
const COOKIE_MAX_AGE: u64 = 86_400;

/// A decoded, verified binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StickyBinding {
    pub endpoint: String,
    pub index: usize,
    pub origin: String,
}

/// Signs and verifies sticky-session cookies
pub struct StickySessions {
    key: hmac::Key,
}

impl std::fmt::Debug for StickySessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StickySessions").finish_non_exhaustive()
    }
}

impl StickySessions {
    /// Use the configured secret, or a random one for this process
    pub fn new(secret: Option<&str>) -> Self {
        let key = match secret {
            Some(s) if !s.is_empty() => hmac::Key::new(hmac::HMAC_SHA256, s.as_bytes()),
            _ => {
                let mut bytes = [0u8; 32];
                if SystemRandom::new().fill(&mut bytes).is_err() {
                    tracing::warn!("System randomness unavailable, sticky secret is weak");
                    bytes = rand::random();
                }
                hmac::Key::new(hmac::HMAC_SHA256, &bytes)
            }
        };
        Self { key }
    }

    /// Serialize and sign a binding
    pub fn encode(&self, binding: &StickyBinding) -> String {
        let payload = format!("{}|{}|{}", binding.endpoint, binding.index, binding.origin);
        let tag = hmac::sign(&self.key, payload.as_bytes());
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            URL_SAFE_NO_PAD.encode(tag.as_ref())
        )
    }

    /// Verify and parse a cookie value; `None` for anything tampered or malformed
    pub fn decode(&self, value: &str) -> Option<StickyBinding> {
        let (payload_b64, tag_b64) = value.split_once('.')?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let tag = URL_SAFE_NO_PAD.decode(tag_b64).ok()?;
        hmac::verify(&self.key, &payload, &tag).ok()?;

        let payload = String::from_utf8(payload).ok()?;
        let mut parts = payload.splitn(3, '|');
        let endpoint = parts.next()?.to_string();
        let index = parts.next()?.parse().ok()?;
        let origin = parts.next()?.to_string();
        Some(StickyBinding {
            endpoint,
            index,
            origin,
        })
    }

    /// Find a valid binding for `endpoint` among the request cookies
    pub fn from_headers(&self, headers: &HeaderMap, endpoint: &str) -> Option<StickyBinding> {
        let wanted = cookie_name(endpoint);
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == wanted).then_some(value)
            })
            .filter_map(|value| self.decode(value))
            .find(|b| b.endpoint == endpoint)
    }

    /// `Set-Cookie` value persisting `binding`
    pub fn set_cookie_header(&self, binding: &StickyBinding) -> Option<HeaderValue> {
        HeaderValue::from_str(&format!(
            "{}={}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
            cookie_name(&binding.endpoint),
            self.encode(binding),
            COOKIE_MAX_AGE
        ))
        .ok()
    }
}

/// Append a `Set-Cookie` header to a response
pub fn append_cookie(headers: &mut HeaderMap, value: HeaderValue) {
    headers.append(SET_COOKIE, value);
}
