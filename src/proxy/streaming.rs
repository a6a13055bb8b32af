//! Streaming response relay with a configurable flush interval
//!
//! Event streams and bodies of unknown length are forwarded frame by frame.
//! Everything else is coalesced into chunks of at most [`COPY_BUFFER_SIZE`]
//! and released on a timer, so small upstream writes do not each become a
//! separate write to the client.

use super::body::{BoxError, ProxyBody};
use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Frame};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Default copy chunk
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Flush interval for host endpoints
pub const HOST_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Flush interval for virtual directories
pub const VDIR_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// How often buffered response data is released to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Forward every frame as soon as it arrives (`-1`)
    Immediate,
    /// Batch frames and release them on this period
    Interval(Duration),
}

/// Pick the flush policy for an upstream response
pub fn flush_policy(headers: &HeaderMap, default_interval: Duration) -> FlushPolicy {
    if is_event_stream(headers) {
        return FlushPolicy::Immediate;
    }
    // Unknown length covers chunked bodies and bidirectional streams
    if !headers.contains_key(http::header::CONTENT_LENGTH) {
        return FlushPolicy::Immediate;
    }
    if default_interval.is_zero() {
        return FlushPolicy::Immediate;
    }
    FlushPolicy::Interval(default_interval)
}

/// Check if a response is a Server-Sent Events stream
pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|mime| mime.trim().eq_ignore_ascii_case("text/event-stream"))
        .unwrap_or(false)
}

/// Relay an upstream body to the client under the given policy
///
/// Dropping the returned body (client gone) stops the relay and drops the
/// upstream body with it.
pub fn relay_body<B>(body: B, policy: FlushPolicy) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError> + Send,
{
    match policy {
        FlushPolicy::Immediate => body.map_err(Into::into).boxed_unsync(),
        FlushPolicy::Interval(period) => {
            let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, BoxError>>(4);
            tokio::spawn(coalesce(body, period, tx));
            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            StreamBody::new(stream).boxed_unsync()
        }
    }
}

async fn coalesce<B>(
    mut body: B,
    period: Duration,
    tx: mpsc::Sender<Result<Frame<Bytes>, BoxError>>,
) where
    B: Body<Data = Bytes> + Send + Unpin,
    B::Error: Into<BoxError> + Send,
{
    let mut buf = BytesMut::new();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            frame = body.frame() => match frame {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => {
                        buf.extend_from_slice(&data);
                        if buf.len() >= COPY_BUFFER_SIZE && !flush(&tx, &mut buf).await {
                            return;
                        }
                    }
                    Err(trailers) => {
                        if !flush(&tx, &mut buf).await || tx.send(Ok(trailers)).await.is_err() {
                            return;
                        }
                    }
                },
                Some(Err(e)) => {
                    if flush(&tx, &mut buf).await {
                        let _ = tx.send(Err(e.into())).await;
                    }
                    return;
                }
                None => {
                    flush(&tx, &mut buf).await;
                    return;
                }
            },
            _ = ticker.tick() => {
                if !flush(&tx, &mut buf).await {
                    return;
                }
            }
            _ = tx.closed() => {
                tracing::debug!("Client went away, dropping upstream body");
                return;
            }
        }
    }
}

/// Send buffered data; false when the receiving side is gone
async fn flush(tx: &mpsc::Sender<Result<Frame<Bytes>, BoxError>>, buf: &mut BytesMut) -> bool {
    if buf.is_empty() {
        return !tx.is_closed();
    }
    let chunk = buf.split().freeze();
    tx.send(Ok(Frame::data(chunk))).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use http_body_util::{Full, StreamBody};
    use std::convert::Infallible;

    #[test]
    fn test_event_stream_is_immediate() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/event-stream; charset=utf-8"));
        headers.insert("content-length", HeaderValue::from_static("10"));
        assert_eq!(
            flush_policy(&headers, HOST_FLUSH_INTERVAL),
            FlushPolicy::Immediate
        );
    }

    #[test]
    fn test_unknown_length_is_immediate() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/html"));
        assert_eq!(
            flush_policy(&headers, HOST_FLUSH_INTERVAL),
            FlushPolicy::Immediate
        );
    }

    #[test]
    fn test_known_length_uses_interval() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", HeaderValue::from_static("1024"));
        assert_eq!(
            flush_policy(&headers, VDIR_FLUSH_INTERVAL),
            FlushPolicy::Interval(VDIR_FLUSH_INTERVAL)
        );
        assert_eq!(
            flush_policy(&headers, Duration::ZERO),
            FlushPolicy::Immediate
        );
    }

    #[tokio::test]
    async fn test_interval_relay_preserves_bytes() {
        let chunks: Vec<Result<Frame<Bytes>, Infallible>> = (0..50)
            .map(|i| Ok(Frame::data(Bytes::from(format!("chunk-{};", i)))))
            .collect();
        let expected: String = (0..50).map(|i| format!("chunk-{};", i)).collect();
        let body = StreamBody::new(futures_util::stream::iter(chunks));

        let relayed = relay_body(body, FlushPolicy::Interval(Duration::from_millis(5)));
        let collected = relayed.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from(expected));
    }

    #[tokio::test]
    async fn test_interval_relay_surfaces_upstream_error() {
        let frames: Vec<Result<Frame<Bytes>, std::io::Error>> = vec![
            Ok(Frame::data(Bytes::from_static(b"partial"))),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "upstream reset")),
        ];
        let body = StreamBody::new(futures_util::stream::iter(frames));

        let mut relayed = relay_body(body, FlushPolicy::Interval(Duration::from_millis(5)));
        let first = relayed.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), Bytes::from_static(b"partial"));
        let err = relayed.frame().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("upstream reset"));
    }

    #[tokio::test]
    async fn test_interval_relay_splits_large_bodies() {
        let big = Bytes::from(vec![7u8; COPY_BUFFER_SIZE * 2 + 10]);
        let relayed = relay_body(
            Full::new(big.clone()),
            FlushPolicy::Interval(Duration::from_secs(60)),
        );
        let collected = relayed.collect().await.unwrap().to_bytes();
        assert_eq!(collected.len(), big.len());
    }

    #[tokio::test]
    async fn test_immediate_relay() {
        let relayed = relay_body(Full::new(Bytes::from_static(b"abc")), FlushPolicy::Immediate);
        let collected = relayed.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"abc");
    }
}
