//! Per-endpoint policy configuration: header rules, basic auth, access control

use serde::{Deserialize, Serialize};

/// Which leg of the exchange a header rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderDirection {
    /// Request sent to the upstream
    Upstream,
    /// Response sent back to the client
    Downstream,
}

/// Header operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderAction {
    /// Replace any existing value
    Set,
    /// Delete the header
    Remove,
}

/// One user-defined header rule
///
/// ```hcl
/// header_rules = [
///   { direction = "upstream",   action = "set",    key = "X-Tenant", value = "blue" },
///   { direction = "downstream", action = "remove", key = "Server" },
/// ]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRuleConfig {
    pub direction: HeaderDirection,
    pub action: HeaderAction,
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// Basic auth credentials and the path prefixes that bypass them
///
/// ```hcl
/// basic_auth {
///   credentials = [
///     { username = "admin", password_hash = "<sha512 hex>" },
///   ]
///   exceptions = ["/public", "/.well-known"]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuthConfig {
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,

    /// Path prefixes served without authentication
    #[serde(default)]
    pub exceptions: Vec<String>,
}

/// Username with a hex-encoded SHA-512 password hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub username: String,
    pub password_hash: String,
}

/// Source-address deny list consulted before routing
///
/// ```hcl
/// access_control {
///   deny = ["10.1.2.3", "192.168.0.0/16"]
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessControlConfig {
    /// Exact addresses or IPv4/IPv6 CIDR ranges
    #[serde(default)]
    pub deny: Vec<String>,
}
