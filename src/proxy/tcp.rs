//! CONNECT tunnel: raw byte relay between the client and an upstream
//!
//! The client connection is taken over through hyper's upgrade mechanism
//! after the `200` reply; both directions share one absolute deadline.

use crate::error::{GatewayError, Result};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Tunnel deadline when none is configured
pub const DEFAULT_TUNNEL_TIMEOUT: Duration = Duration::from_secs(300);

/// Take ownership of the raw client connection, or fail cleanly when the
/// connection cannot be handed over
pub fn take_connection<B>(req: &mut http::Request<B>) -> Result<OnUpgrade> {
    if req.extensions().get::<OnUpgrade>().is_none() {
        return Err(GatewayError::Protocol(
            "connection does not support takeover for tunneling".to_string(),
        ));
    }
    Ok(hyper::upgrade::on(req))
}

/// Dial an upstream TCP server
pub async fn connect_upstream(address: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| GatewayError::UpstreamTimeout(timeout.as_secs()))?
        .map_err(|e| GatewayError::transport(address, e))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Relay bytes in both directions until one side closes or the deadline
/// passes. Returns `(client→upstream, upstream→client)` byte counts.
pub async fn relay<C, U>(client: C, upstream: U, deadline: Duration) -> Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let relay = async {
        let client_to_upstream = tokio::io::copy(&mut client_read, &mut upstream_write);
        let upstream_to_client = tokio::io::copy(&mut upstream_read, &mut client_write);

        tokio::select! {
            result = client_to_upstream => {
                let sent = result.map_err(|e| {
                    GatewayError::Other(format!("Tunnel client→upstream error: {}", e))
                })?;
                Ok::<_, GatewayError>((sent, 0u64))
            }
            result = upstream_to_client => {
                let received = result.map_err(|e| {
                    GatewayError::Other(format!("Tunnel upstream→client error: {}", e))
                })?;
                Ok((0u64, received))
            }
        }
    };

    let outcome = tokio::time::timeout(deadline, relay).await;

    // Either side finishing closes both
    let _ = upstream_write.shutdown().await;
    let _ = client_write.shutdown().await;

    match outcome {
        Ok(result) => result,
        Err(_) => {
            tracing::debug!(deadline_secs = deadline.as_secs(), "Tunnel deadline reached");
            Ok((0, 0))
        }
    }
}

/// Run the tunnel in the background once the client connection is handed over
pub fn spawn_tunnel(on_upgrade: OnUpgrade, upstream: TcpStream, deadline: Duration, target: String) {
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::warn!(target_addr = target, error = %e, "Tunnel takeover failed");
                return;
            }
        };
        match relay(TokioIo::new(upgraded), upstream, deadline).await {
            Ok((sent, received)) => {
                tracing::debug!(target_addr = target, sent, received, "Tunnel closed");
            }
            Err(e) => {
                tracing::debug!(target_addr = target, error = %e, "Tunnel ended with error");
            }
        }
    });
}
