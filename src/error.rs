//! Centralized error types for the proxy gateway

use http::StatusCode;
use thiserror::Error;

/// Gateway error types
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration rejected at load or administrative-write time
    #[error("Configuration error: {0}")]
    Config(String),

    /// Endpoint has no upstream at all
    #[error("no upstream is defined for {0}")]
    NoUpstream(String),

    /// Every upstream of the endpoint is offline
    #[error("no online upstream available for {0}")]
    NoOnlineUpstream(String),

    /// Upstream round trip exceeded its deadline
    #[error("Upstream timed out after {0}s")]
    UpstreamTimeout(u64),

    /// Dial, TLS or transport failure talking to an upstream
    #[error("Upstream {target} unreachable: {message}")]
    Transport { target: String, message: String },

    /// Malformed upgrade/CONNECT request or unsupported hijack
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// TLS material could not be loaded
    #[error("TLS error: {0}")]
    Tls(String),

    /// Lifecycle transition not allowed in the current state
    #[error("Invalid state: {0}")]
    State(String),

    /// Administrative lookup miss
    #[error("Not found: {0}")]
    NotFound(String),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// Build a transport error for the given target address
    pub fn transport(target: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            target: target.into(),
            message: err.to_string(),
        }
    }

    /// Client-visible status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoUpstream(_)
            | Self::NoOnlineUpstream(_)
            | Self::Transport { .. }
            | Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Protocol(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, GatewayError>;
