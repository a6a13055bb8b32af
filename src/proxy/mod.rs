//! Proxy layer: the forwarding core
//!
//! HTTP exchanges, CONNECT tunnels and WebSocket upgrades against a chosen
//! upstream, plus the header, body and TLS plumbing they share.

pub mod body;
pub mod headers;
pub mod http_proxy;
pub mod streaming;
pub mod tcp;
pub mod tls;
pub mod websocket;

pub use body::{BoxError, ProxyBody};
pub use http_proxy::{forward, ForwardClient, ForwardContext};
pub use streaming::FlushPolicy;
