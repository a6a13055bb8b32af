//! Listener configuration: TLS material and the plain-HTTP redirect listener

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// TLS configuration for the main listener
///
/// # Example
///
/// ```hcl
/// tls {
///   cert_file = "/etc/certs/fallback.pem"
///   key_file  = "/etc/certs/fallback.key"
///
///   certificates "app.example.com" {
///     cert_file = "/etc/certs/app.pem"
///     key_file  = "/etc/certs/app.key"
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Serve HTTPS on the main listener
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Fallback certificate PEM file, used when no SNI match exists
    pub cert_file: String,

    /// Fallback private key PEM file
    pub key_file: String,

    /// Per-hostname certificate pairs (wildcards allowed)
    #[serde(default)]
    pub certificates: HashMap<String, CertificatePair>,
}

fn default_true() -> bool {
    true
}

/// Paths to one certificate/key pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificatePair {
    pub cert_file: String,
    pub key_file: String,
}

/// Plain-HTTP listener that redirects to HTTPS
///
/// ```hcl
/// http_redirect {
///   address = "0.0.0.0:80"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRedirectConfig {
    #[serde(default = "default_redirect_address")]
    pub address: String,
}

fn default_redirect_address() -> String {
    "0.0.0.0:80".to_string()
}

impl Default for HttpRedirectConfig {
    fn default() -> Self {
        Self {
            address: default_redirect_address(),
        }
    }
}
