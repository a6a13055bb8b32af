//! Observability: structured access logging

pub mod access_log;

pub use access_log::{AccessLog, AccessLogEntry, ForwardKind, RequestTracker};
