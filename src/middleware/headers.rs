//! Header rewrite rule set: user-defined operations plus policy headers
//!
//! Compiled once per endpoint; applying it never re-parses names or values.

use crate::config::{HeaderAction, HeaderDirection, HeaderRuleConfig};
use crate::error::{GatewayError, Result};
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

/// One compiled header operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderOp {
    Set(HeaderName, HeaderValue),
    Remove(HeaderName),
}

impl HeaderOp {
    fn apply(&self, headers: &mut HeaderMap) {
        match self {
            Self::Set(name, value) => {
                headers.insert(name.clone(), value.clone());
            }
            Self::Remove(name) => {
                headers.remove(name);
            }
        }
    }
}

/// Per-direction header operations and fixed policy headers
#[derive(Debug, Clone, Default)]
pub struct HeaderRewriteRules {
    upstream: Vec<HeaderOp>,
    downstream: Vec<HeaderOp>,
    hsts: Option<HeaderValue>,
    permission_policy: Option<HeaderValue>,
}

impl HeaderRewriteRules {
    /// Compile rules from configuration
    pub fn compile(
        rules: &[HeaderRuleConfig],
        hsts_max_age: u64,
        include_subdomains: bool,
        permission_policy: Option<&str>,
    ) -> Result<Self> {
        let mut compiled = Self::default();

        for rule in rules {
            let name: HeaderName = rule.key.trim().parse().map_err(|e| {
                GatewayError::Config(format!("Invalid header name '{}': {}", rule.key, e))
            })?;
            let op = match rule.action {
                HeaderAction::Set => {
                    let value = HeaderValue::from_str(&rule.value).map_err(|e| {
                        GatewayError::Config(format!(
                            "Invalid value for header '{}': {}",
                            rule.key, e
                        ))
                    })?;
                    HeaderOp::Set(name, value)
                }
                HeaderAction::Remove => HeaderOp::Remove(name),
            };
            match rule.direction {
                HeaderDirection::Upstream => compiled.upstream.push(op),
                HeaderDirection::Downstream => compiled.downstream.push(op),
            }
        }

        if hsts_max_age > 0 {
            let mut value = format!("max-age={}", hsts_max_age);
            if include_subdomains {
                value.push_str("; includeSubDomains");
            }
            compiled.hsts = HeaderValue::from_str(&value).ok();
        }

        if let Some(policy) = permission_policy.filter(|p| !p.trim().is_empty()) {
            compiled.permission_policy = Some(HeaderValue::from_str(policy.trim()).map_err(|e| {
                GatewayError::Config(format!("Invalid permission policy: {}", e))
            })?);
        }

        Ok(compiled)
    }

    /// Append another rule set's user operations after this one's
    pub fn extend(&mut self, other: &HeaderRewriteRules) {
        self.upstream.extend(other.upstream.iter().cloned());
        self.downstream.extend(other.downstream.iter().cloned());
    }

    /// Apply operations to a request bound for the upstream
    pub fn apply_upstream(&self, headers: &mut HeaderMap) {
        for op in &self.upstream {
            op.apply(headers);
        }
    }

    /// Apply operations to a response bound for the client
    pub fn apply_downstream(&self, headers: &mut HeaderMap) {
        for op in &self.downstream {
            op.apply(headers);
        }
    }

    /// Apply HSTS (TLS only) and permission policy headers
    pub fn apply_policy(&self, headers: &mut HeaderMap, inbound_tls: bool) {
        if inbound_tls {
            if let Some(hsts) = &self.hsts {
                headers.insert(http::header::STRICT_TRANSPORT_SECURITY, hsts.clone());
            }
        }
        if let Some(policy) = &self.permission_policy {
            headers.insert(HeaderName::from_static("permissions-policy"), policy.clone());
        }
    }

    /// Upstream operations, for callers that build their own request
    pub fn upstream_ops(&self) -> &[HeaderOp] {
        &self.upstream
    }

    pub fn is_empty(&self) -> bool {
        self.upstream.is_empty()
            && self.downstream.is_empty()
            && self.hsts.is_none()
            && self.permission_policy.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(direction: HeaderDirection, action: HeaderAction, key: &str, value: &str) -> HeaderRuleConfig {
        HeaderRuleConfig {
            direction,
            action,
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_upstream_and_downstream_separated() {
        let rules = HeaderRewriteRules::compile(
            &[
                rule(HeaderDirection::Upstream, HeaderAction::Set, "X-Tenant", "blue"),
                rule(HeaderDirection::Downstream, HeaderAction::Remove, "Server", ""),
            ],
            0,
            false,
            None,
        )
        .unwrap();

        let mut req = HeaderMap::new();
        rules.apply_upstream(&mut req);
        assert_eq!(req["x-tenant"], "blue");

        let mut resp = HeaderMap::new();
        resp.insert("server", HeaderValue::from_static("nginx"));
        rules.apply_downstream(&mut resp);
        assert!(!resp.contains_key("server"));
        assert!(!resp.contains_key("x-tenant"));
    }

    #[test]
    fn test_operations_apply_in_order() {
        let rules = HeaderRewriteRules::compile(
            &[
                rule(HeaderDirection::Upstream, HeaderAction::Set, "X-A", "1"),
                rule(HeaderDirection::Upstream, HeaderAction::Remove, "X-A", ""),
                rule(HeaderDirection::Upstream, HeaderAction::Set, "X-B", "2"),
            ],
            0,
            false,
            None,
        )
        .unwrap();
        let mut headers = HeaderMap::new();
        rules.apply_upstream(&mut headers);
        assert!(!headers.contains_key("x-a"));
        assert_eq!(headers["x-b"], "2");
    }

    #[test]
    fn test_hsts_only_over_tls() {
        let rules = HeaderRewriteRules::compile(&[], 31536000, true, Some("camera=()")).unwrap();

        let mut plain = HeaderMap::new();
        rules.apply_policy(&mut plain, false);
        assert!(!plain.contains_key("strict-transport-security"));
        assert_eq!(plain["permissions-policy"], "camera=()");

        let mut tls = HeaderMap::new();
        rules.apply_policy(&mut tls, true);
        assert_eq!(
            tls["strict-transport-security"],
            "max-age=31536000; includeSubDomains"
        );
    }

    #[test]
    fn test_invalid_header_name_rejected() {
        let err = HeaderRewriteRules::compile(
            &[rule(HeaderDirection::Upstream, HeaderAction::Set, "bad header", "x")],
            0,
            false,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Invalid header name"));
    }

    #[test]
    fn test_extend_appends_after() {
        let mut parent = HeaderRewriteRules::compile(
            &[rule(HeaderDirection::Upstream, HeaderAction::Set, "X-A", "parent")],
            0,
            false,
            None,
        )
        .unwrap();
        let child = HeaderRewriteRules::compile(
            &[rule(HeaderDirection::Upstream, HeaderAction::Set, "X-A", "child")],
            0,
            false,
            None,
        )
        .unwrap();
        parent.extend(&child);
        let mut headers = HeaderMap::new();
        parent.apply_upstream(&mut headers);
        assert_eq!(headers["x-a"], "child");
        assert_eq!(parent.upstream_ops().len(), 2);
    }

    #[test]
    fn test_empty() {
        assert!(HeaderRewriteRules::default().is_empty());
    }
}
