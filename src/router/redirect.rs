//! URL redirection rules
//!
//! Checked after special rules and before endpoint matching. A rule's
//! source is a prefix of `host + path`; when several match, the longest
//! source wins.

use crate::config::{validate_redirect_rule, RedirectRuleConfig};
use crate::error::Result;
use crate::proxy::body::{self, ProxyBody};
use http::{Response, StatusCode, Uri};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Redirection table keyed by normalized source
#[derive(Debug, Default)]
pub struct RedirectRules {
    rules: RwLock<BTreeMap<String, RedirectRuleConfig>>,
}

impl RedirectRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[RedirectRuleConfig]) -> Result<Self> {
        let table = Self::new();
        for rule in configs {
            table.add(rule.clone())?;
        }
        Ok(table)
    }

    /// Add a rule, replacing any rule with the same source
    pub fn add(&self, rule: RedirectRuleConfig) -> Result<()> {
        validate_redirect_rule(&rule)?;
        let key = rule.source_key();
        tracing::info!(source = key, target = rule.target, status = rule.status, "Redirect rule added");
        self.rules.write().unwrap().insert(key, rule);
        Ok(())
    }

    pub fn remove(&self, source: &str) -> bool {
        let key = RedirectRuleConfig::new(source, "").source_key();
        self.rules.write().unwrap().remove(&key).is_some()
    }

    pub fn list(&self) -> Vec<RedirectRuleConfig> {
        self.rules.read().unwrap().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().unwrap().is_empty()
    }

    /// Rule with the longest source that prefixes `host + path`
    pub fn matching(&self, host: &str, path: &str) -> Option<RedirectRuleConfig> {
        let requested = format!("{}{}", host.trim().to_ascii_lowercase(), path);
        self.rules
            .read()
            .unwrap()
            .iter()
            .filter(|(source, _)| requested.starts_with(source.as_str()))
            .max_by_key(|(source, _)| source.len())
            .map(|(_, rule)| rule.clone())
    }

    /// Redirect response for the first matching rule
    pub fn respond(&self, host: &str, uri: &Uri) -> Option<Response<ProxyBody>> {
        if self.is_empty() {
            return None;
        }
        let rule = self.matching(host, uri.path())?;
        let location = redirect_target(&rule, uri);
        let status = StatusCode::from_u16(rule.status).unwrap_or(StatusCode::TEMPORARY_REDIRECT);
        tracing::debug!(source = rule.source, location, status = status.as_u16(), "Redirect rule matched");
        Some(body::redirect(status, &location))
    }
}

/// Location for a matched rule
pub fn redirect_target(rule: &RedirectRuleConfig, uri: &Uri) -> String {
    let mut target = rule.target.trim().to_string();
    if rule.forward_path {
        let path = uri.path();
        if target.ends_with('/') {
            target.push_str(path.trim_start_matches('/'));
        } else {
            target.push_str(path);
        }
        if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
            target.push('?');
            target.push_str(query);
        }
    }
    if !target.starts_with("http://") && !target.starts_with("https://") {
        target.insert_str(0, "http://");
    }
    target
}
