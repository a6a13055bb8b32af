//! Upstream: one backend origin and its lazily started forwarding client

use crate::config::{TransportConfig, UpstreamConfig};
use crate::error::{GatewayError, Result};
use crate::proxy::http_proxy::ForwardClient;
use http::Uri;
use rustls::ClientConfig;
use std::sync::{Arc, OnceLock};

/// One backend origin
pub struct Upstream {
    /// `host:port[/base][?query]` as configured
    pub origin: String,
    pub require_tls: bool,
    /// Effective value, including the endpoint-level default
    pub skip_cert_validation: bool,
    pub skip_ws_origin_check: bool,
    pub weight: u32,
    pub max_conn: usize,
    config: UpstreamConfig,
    base_uri: Uri,
    authority_end: usize,
    client: OnceLock<Arc<ForwardClient>>,
    tls: OnceLock<Arc<ClientConfig>>,
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("origin", &self.origin)
            .field("require_tls", &self.require_tls)
            .field("weight", &self.weight)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Upstream {
    /// Build an upstream; `inherit_skip_verify` is the endpoint-level default
    pub fn from_config(config: &UpstreamConfig, inherit_skip_verify: bool) -> Result<Self> {
        let origin = config.origin.trim().to_string();
        let scheme = if config.require_tls { "https" } else { "http" };
        let base_uri: Uri = format!("{}://{}", scheme, origin).parse().map_err(|e| {
            GatewayError::Config(format!("Invalid upstream origin '{}': {}", origin, e))
        })?;
        if base_uri.authority().is_none() {
            return Err(GatewayError::Config(format!(
                "Upstream origin '{}' has no host",
                origin
            )));
        }
        let authority_end = origin.find(['/', '?']).unwrap_or(origin.len());

        Ok(Self {
            require_tls: config.require_tls,
            skip_cert_validation: config.skip_cert_validation || inherit_skip_verify,
            skip_ws_origin_check: config.skip_ws_origin_check,
            weight: config.weight,
            max_conn: config.max_conn,
            config: config.clone(),
            base_uri,
            authority_end,
            origin,
            client: OnceLock::new(),
            tls: OnceLock::new(),
        })
    }

    /// Initialize the forwarding client; later calls are no-ops
    pub fn start_proxy(&self, transport: &TransportConfig) -> Result<()> {
        if self.client.get().is_some() {
            return Ok(());
        }
        let client = ForwardClient::new(transport, self.skip_cert_validation, self.max_conn)?;
        let _ = self.client.set(Arc::new(client));
        Ok(())
    }

    /// Ready once the forwarding client exists
    pub fn is_ready(&self) -> bool {
        self.client.get().is_some()
    }

    pub fn client(&self) -> Option<&Arc<ForwardClient>> {
        self.client.get()
    }

    /// TLS client config for raw dials to this origin, built on first use
    pub fn tls_config(&self) -> Result<Arc<ClientConfig>> {
        if let Some(config) = self.tls.get() {
            return Ok(config.clone());
        }
        let config = crate::proxy::tls::client_config(self.skip_cert_validation)?;
        Ok(self.tls.get_or_init(|| config).clone())
    }

    /// `http(s)://origin`
    pub fn base_uri(&self) -> &Uri {
        &self.base_uri
    }

    /// `host:port` part of the origin; also the liveness key
    pub fn authority(&self) -> &str {
        &self.origin[..self.authority_end]
    }

    /// Configuration this upstream was built from
    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Address a TCP dial should target, with the default port filled in
    pub fn dial_address(&self) -> String {
        let authority = self.authority();
        if self.base_uri.port_u16().is_some() {
            authority.to_string()
        } else if self.require_tls {
            format!("{}:443", authority)
        } else {
            format!("{}:80", authority)
        }
    }
}
