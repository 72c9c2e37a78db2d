//! Two-phase relay of an upstream media response.
//!
//! A [`StreamedResponse`] is the response metadata (status + headers) plus, for
//! GET, the still-unread upstream body. Converting it into an axum response
//! emits the metadata once and then spawns a task that pumps the body through
//! a channel of capacity 1: the task never reads more than one chunk ahead of
//! what the client has taken, and stops reading upstream as soon as the client
//! goes away.

use std::fmt;
use std::io;
use std::pin::pin;

use axum::body::Body;
use axum::http::header::{ACCEPT_RANGES, CONNECTION, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::metrics::{ConnectionGuard, ProxyMetrics};

/// Status and headers to send before any body bytes.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// An upstream body that has not been read yet.
///
/// Holds the upstream connection open (and counted) until dropped.
pub struct UpstreamBody {
    response: reqwest::Response,
    guard: ConnectionGuard,
    chunk_size: usize,
    metrics: ProxyMetrics,
}

pub struct StreamedResponse {
    pub metadata: Metadata,
    /// None for HEAD requests.
    pub body: Option<UpstreamBody>,
}

/// How a body relay ended. Never surfaced to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed { bytes: u64 },
    ClientDisconnected { bytes: u64 },
    UpstreamFailed { bytes: u64, error: String },
}

/// Copies upstream headers for the client response.
///
/// Hop-by-hop headers are dropped: the body is de-chunked while it is read and
/// re-framed by our own server. `Accept-Ranges: bytes` is always set since some
/// players will not seek without it.
pub fn relay_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len() + 1);
    for (name, value) in upstream.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == TRANSFER_ENCODING || name == CONNECTION || name.as_str() == "keep-alive"
}

impl UpstreamBody {
    pub(crate) fn new(
        response: reqwest::Response,
        guard: ConnectionGuard,
        chunk_size: usize,
        metrics: ProxyMetrics,
    ) -> Self {
        Self {
            response,
            guard,
            chunk_size,
            metrics,
        }
    }

    /// Starts pumping the upstream body. The returned body yields fixed-size
    /// chunks; the handle resolves once the upstream response has been released.
    pub fn relay(self) -> (Body, JoinHandle<RelayOutcome>) {
        let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(1);
        let Self {
            response,
            guard,
            chunk_size,
            metrics,
        } = self;

        let task = async move {
            // Upstream response is already dropped when `pump` returns.
            let outcome = pump(response.bytes_stream(), tx, chunk_size).await;
            drop(guard);
            let sent = outcome.bytes();

            metrics.relayed_bytes_total.inc_by(sent);
            match &outcome {
                RelayOutcome::Completed { bytes } => {
                    tracing::debug!(bytes, "stream completed");
                }
                RelayOutcome::ClientDisconnected { bytes } => {
                    metrics.client_disconnects_total.inc();
                    tracing::info!(bytes, "client aborted stream");
                }
                RelayOutcome::UpstreamFailed { bytes, error } => {
                    tracing::warn!(bytes, error = %error, "upstream body failed mid-stream");
                }
            }
            outcome
        };

        let handle = tokio::spawn(task.instrument(tracing::Span::current()));
        let body = Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx));
        (body, handle)
    }
}

/// Moves `upstream` into `tx` as `chunk_size` chunks until the stream is
/// over or the receiver goes away. With a capacity-1 channel at most one
/// chunk sits unread ahead of the client.
async fn pump<S, E>(
    upstream: S,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    chunk_size: usize,
) -> RelayOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: fmt::Display,
{
    let mut upstream = pin!(upstream);
    let mut chunker = Rechunker::new(chunk_size);
    let mut sent: u64 = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => None,
            next = upstream.next() => Some(next),
        };
        let Some(next) = next else {
            return RelayOutcome::ClientDisconnected { bytes: sent };
        };

        match next {
            Some(Ok(data)) => {
                for chunk in chunker.push(data) {
                    let len = chunk.len() as u64;
                    if tx.send(Ok(chunk)).await.is_err() {
                        return RelayOutcome::ClientDisconnected { bytes: sent };
                    }
                    sent += len;
                }
            }
            Some(Err(e)) => {
                let error = e.to_string();
                let _ = tx.send(Err(io::Error::other(error.clone()))).await;
                return RelayOutcome::UpstreamFailed { bytes: sent, error };
            }
            None => {
                if let Some(rest) = chunker.finish() {
                    let len = rest.len() as u64;
                    if tx.send(Ok(rest)).await.is_err() {
                        return RelayOutcome::ClientDisconnected { bytes: sent };
                    }
                    sent += len;
                }
                return RelayOutcome::Completed { bytes: sent };
            }
        }
    }
}

impl RelayOutcome {
    /// Bytes handed to the client before the relay ended.
    pub fn bytes(&self) -> u64 {
        match self {
            RelayOutcome::Completed { bytes }
            | RelayOutcome::ClientDisconnected { bytes }
            | RelayOutcome::UpstreamFailed { bytes, .. } => *bytes,
        }
    }
}

impl StreamedResponse {
    pub fn into_parts(self) -> (Metadata, Option<UpstreamBody>) {
        (self.metadata, self.body)
    }
}

impl IntoResponse for StreamedResponse {
    fn into_response(self) -> Response {
        let (metadata, body) = self.into_parts();
        let body = match body {
            Some(upstream) => upstream.relay().0,
            None => Body::empty(),
        };

        let mut response = Response::new(body);
        *response.status_mut() = metadata.status;
        *response.headers_mut() = metadata.headers;
        response
    }
}

/// Regroups arbitrarily sized upstream frames into `size`-byte chunks.
struct Rechunker {
    buf: BytesMut,
    size: usize,
}

impl Rechunker {
    fn new(size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            size: size.max(1),
        }
    }

    fn push(&mut self, data: Bytes) -> Vec<Bytes> {
        self.buf.extend_from_slice(&data);
        let mut ready = Vec::new();
        while self.buf.len() >= self.size {
            ready.push(self.buf.split_to(self.size).freeze());
        }
        ready
    }

    fn finish(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_relay_headers_forces_accept_ranges() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-type", HeaderValue::from_static("video/mp4"));
        upstream.insert("content-range", HeaderValue::from_static("bytes 0-1023/4096"));

        let headers = relay_headers(&upstream);
        assert_eq!(headers.get(ACCEPT_RANGES).unwrap(), "bytes");
        assert_eq!(headers.get("content-type").unwrap(), "video/mp4");
        assert_eq!(headers.get("content-range").unwrap(), "bytes 0-1023/4096");
    }

    #[test]
    fn test_relay_headers_replaces_upstream_accept_ranges() {
        let mut upstream = HeaderMap::new();
        upstream.insert(ACCEPT_RANGES, HeaderValue::from_static("none"));
        let headers = relay_headers(&upstream);
        assert_eq!(headers.get_all(ACCEPT_RANGES).iter().count(), 1);
        assert_eq!(headers.get(ACCEPT_RANGES).unwrap(), "bytes");
    }

    #[test]
    fn test_relay_headers_drops_chunked_framing() {
        let mut upstream = HeaderMap::new();
        upstream.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        upstream.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        upstream.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        upstream.append("x-goog-meta", HeaderValue::from_static("a"));
        upstream.append("x-goog-meta", HeaderValue::from_static("b"));

        let headers = relay_headers(&upstream);
        assert!(headers.get(TRANSFER_ENCODING).is_none());
        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert_eq!(headers.get_all("x-goog-meta").iter().count(), 2);
    }

    /// 64 one-chunk frames; counts how many the relay has pulled.
    fn counted_upstream(
        pulled: Arc<AtomicUsize>,
    ) -> impl Stream<Item = Result<Bytes, io::Error>> {
        futures::stream::iter(0..64u8).map(move |i| {
            pulled.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from(vec![i; 16]))
        })
    }

    #[tokio::test]
    async fn test_pump_stays_one_chunk_ahead_of_slow_client() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel(1);
        let task = tokio::spawn(pump(counted_upstream(pulled.clone()), tx, 16));

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from(vec![0u8; 16]));

        // Client stalls; the relay must park instead of draining upstream.
        tokio::time::sleep(Duration::from_millis(100)).await;
        // delivered + buffered + one blocked in send
        assert!(pulled.load(Ordering::SeqCst) <= 3, "pulled {}", pulled.load(Ordering::SeqCst));
        assert!(!task.is_finished());

        let mut received = first.len();
        while let Some(chunk) = rx.recv().await {
            received += chunk.unwrap().len();
        }
        assert_eq!(received, 64 * 16);
        assert_eq!(pulled.load(Ordering::SeqCst), 64);
        assert_eq!(task.await.unwrap(), RelayOutcome::Completed { bytes: 64 * 16 });
    }

    #[tokio::test]
    async fn test_pump_stops_pulling_when_client_leaves() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel(1);
        let task = tokio::spawn(pump(counted_upstream(pulled.clone()), tx, 16));

        rx.recv().await.unwrap().unwrap();
        drop(rx);

        match task.await.unwrap() {
            RelayOutcome::ClientDisconnected { bytes } => assert!(bytes <= 3 * 16),
            other => panic!("expected disconnect, got {:?}", other),
        }
        assert!(pulled.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_pump_reports_upstream_failure() {
        let upstream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"abcd")),
            Err(io::Error::other("connection reset")),
        ]);
        let (tx, mut rx) = mpsc::channel(1);
        let task = tokio::spawn(pump(upstream, tx, 4));

        assert_eq!(rx.recv().await.unwrap().unwrap(), Bytes::from_static(b"abcd"));
        assert!(rx.recv().await.unwrap().is_err());
        assert_eq!(
            task.await.unwrap(),
            RelayOutcome::UpstreamFailed {
                bytes: 4,
                error: "connection reset".into()
            }
        );
    }

    #[test]
    fn test_rechunker_emits_fixed_sizes() {
        let mut chunker = Rechunker::new(4);
        assert!(chunker.push(Bytes::from_static(b"ab")).is_empty());
        let ready = chunker.push(Bytes::from_static(b"cdefghij"));
        assert_eq!(ready, vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"efgh")]);
        assert_eq!(chunker.finish(), Some(Bytes::from_static(b"ij")));
        assert_eq!(chunker.finish(), None);
    }

    #[test]
    fn test_rechunker_exact_multiple_leaves_nothing() {
        let mut chunker = Rechunker::new(3);
        assert_eq!(chunker.push(Bytes::from_static(b"abcdef")).len(), 2);
        assert_eq!(chunker.finish(), None);
    }
}
