//! Turning a vendor's SSE byte stream into canonical chunks.
//!
//! [`decode_sse`] owns the upstream body for the lifetime of the returned
//! stream. The stream is single-pass and always ends with exactly one terminal
//! item: [`StreamEvent::Done`] or [`StreamEvent::Error`]. `Done` is only
//! produced when the vendor's end marker was seen; a body that closes early or
//! goes quiet for longer than the idle timeout ends in a transport error.
//! Dropping the stream at any point (including a client disconnect) drops the
//! body and releases the connection.

use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use eventsource_stream::{Event, Eventsource};
use futures::{Stream, StreamExt};

use crate::canonical::CanonicalChatChunk;
use crate::error::{BrokerError, Result};

/// One item of a canonical chunk stream.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(CanonicalChatChunk),
    /// Terminal: the stream failed after it had started.
    Error(BrokerError),
    /// Terminal: the vendor signalled end of generation.
    Done,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Result of decoding one SSE event.
#[derive(Debug)]
pub enum Decoded {
    Continue(Vec<CanonicalChatChunk>),
    /// The vendor's end-of-stream marker was seen; these are the last chunks.
    Finished(Vec<CanonicalChatChunk>),
}

/// Per-dialect translation of SSE events into canonical chunks.
pub trait ChunkDecoder: Send + 'static {
    fn decode(&mut self, event: &Event) -> Result<Decoded>;
}

/// Logs the release of the upstream body when the owning stream goes away.
struct UpstreamRelease {
    vendor: String,
}

impl Drop for UpstreamRelease {
    fn drop(&mut self) {
        tracing::debug!(vendor = %self.vendor, "upstream stream released");
    }
}

/// Decode an SSE body with `decoder`, yielding canonical stream events.
/// `idle_timeout` bounds the wait for each event.
pub fn decode_sse<S, B, E, D>(
    body: S,
    mut decoder: D,
    vendor: &str,
    idle_timeout: Duration,
) -> ChunkStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
    D: ChunkDecoder,
{
    let vendor = vendor.to_string();

    Box::pin(async_stream::stream! {
        let _release = UpstreamRelease { vendor: vendor.clone() };
        let mut events = Box::pin(body.eventsource());

        let terminal = loop {
            let next = match tokio::time::timeout(idle_timeout, events.next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::error!(vendor = %vendor, timeout = ?idle_timeout, "upstream stream stalled");
                    break StreamEvent::Error(BrokerError::transport("upstream stream timed out"));
                }
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    tracing::error!(vendor = %vendor, error = %e, "upstream stream failed");
                    break StreamEvent::Error(BrokerError::transport(
                        "upstream stream interrupted",
                    ));
                }
                None => {
                    tracing::warn!(vendor = %vendor, "upstream closed without end marker");
                    break StreamEvent::Error(BrokerError::transport(
                        "upstream closed stream before completion",
                    ));
                }
            };

            if event.data.trim().is_empty() {
                continue;
            }

            match decoder.decode(&event) {
                Ok(Decoded::Continue(chunks)) => {
                    for chunk in chunks {
                        yield StreamEvent::Chunk(chunk);
                    }
                }
                Ok(Decoded::Finished(chunks)) => {
                    for chunk in chunks {
                        yield StreamEvent::Chunk(chunk);
                    }
                    break StreamEvent::Done;
                }
                Err(e) => {
                    tracing::warn!(vendor = %vendor, error = %e, "failed to decode stream event");
                    break StreamEvent::Error(e);
                }
            }
        };

        yield terminal;
    })
}

/// Parse an event's JSON payload, reporting malformed data as a translation error.
pub(crate) fn parse_event<T: serde::de::DeserializeOwned>(event: &Event) -> Result<T> {
    serde_json::from_str(&event.data).map_err(|e| {
        BrokerError::translation(format!("unparseable stream event: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::ChunkDelta;
    use bytes::Bytes;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};

    const IDLE: Duration = Duration::from_secs(30);

    /// Byte stream that counts how many times it is dropped.
    struct TrackedBody<S> {
        inner: S,
        drops: Arc<AtomicUsize>,
    }

    impl<S: Stream + Unpin> Stream for TrackedBody<S> {
        type Item = S::Item;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.inner).poll_next(cx)
        }
    }

    impl<S> Drop for TrackedBody<S> {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Emits one chunk per event, finishing on `[DONE]`.
    struct EchoDecoder;

    impl ChunkDecoder for EchoDecoder {
        fn decode(&mut self, event: &Event) -> Result<Decoded> {
            match event.data.as_str() {
                "[DONE]" => Ok(Decoded::Finished(Vec::new())),
                "boom" => Err(BrokerError::translation("boom")),
                text => Ok(Decoded::Continue(vec![CanonicalChatChunk::new(
                    "c1",
                    "m",
                    ChunkDelta {
                        content: Some(text.to_string()),
                        ..Default::default()
                    },
                )])),
            }
        }
    }

    fn frames(data: &[&str]) -> Vec<std::result::Result<Bytes, std::io::Error>> {
        data.iter()
            .map(|d| Ok(Bytes::from(format!("data: {d}\n\n"))))
            .collect()
    }

    fn content(event: &StreamEvent) -> Option<&str> {
        match event {
            StreamEvent::Chunk(c) => c.choices[0].delta.content.as_deref(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_stream_ends_with_done() {
        let drops = Arc::new(AtomicUsize::new(0));
        let body = TrackedBody {
            inner: stream::iter(frames(&["Hel", "lo", "[DONE]"])),
            drops: drops.clone(),
        };

        let events: Vec<StreamEvent> = decode_sse(body, EchoDecoder, "test", IDLE).collect().await;

        assert_eq!(events.len(), 3);
        assert_eq!(content(&events[0]), Some("Hel"));
        assert_eq!(content(&events[1]), Some("lo"));
        assert!(matches!(events[2], StreamEvent::Done));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_decode_error_is_single_terminal_item() {
        let body = stream::iter(frames(&["a", "boom", "never"]));
        let events: Vec<StreamEvent> = decode_sse(body, EchoDecoder, "test", IDLE).collect().await;

        assert_eq!(events.len(), 2);
        assert_eq!(content(&events[0]), Some("a"));
        assert!(matches!(
            events[1],
            StreamEvent::Error(BrokerError::Translation { .. })
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_mid_stream() {
        let mut items = frames(&["a"]);
        items.push(Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));
        let events: Vec<StreamEvent> = decode_sse(stream::iter(items), EchoDecoder, "test", IDLE)
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            StreamEvent::Error(BrokerError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_end_marker_is_transport_error() {
        let events: Vec<StreamEvent> =
            decode_sse(stream::iter(frames(&["a"])), EchoDecoder, "test", IDLE)
                .collect()
                .await;

        assert_eq!(events.len(), 2);
        assert_eq!(content(&events[0]), Some("a"));
        match &events[1] {
            StreamEvent::Error(err) => {
                assert!(matches!(err, BrokerError::Transport { .. }));
                assert!(err.to_string().contains("before completion"));
            }
            other => panic!("unexpected terminal {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stalled_upstream_times_out() {
        let body = stream::iter(frames(&["one"])).chain(stream::pending());
        let chunks = decode_sse(body, EchoDecoder, "test", Duration::from_millis(50));

        let events: Vec<StreamEvent> =
            tokio::time::timeout(Duration::from_secs(5), chunks.collect())
                .await
                .expect("stream should end on its own");

        assert_eq!(events.len(), 2);
        assert_eq!(content(&events[0]), Some("one"));
        match &events[1] {
            StreamEvent::Error(err) => {
                assert!(matches!(err, BrokerError::Transport { .. }));
                assert!(err.to_string().contains("timed out"));
            }
            other => panic!("unexpected terminal {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_releases_body_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        // Two chunks, then the vendor keeps the connection open indefinitely.
        let body = TrackedBody {
            inner: stream::iter(frames(&["one", "two"])).chain(stream::pending()),
            drops: drops.clone(),
        };

        let mut chunks = decode_sse(body, EchoDecoder, "test", IDLE);
        let first = chunks.next().await.unwrap();
        assert_eq!(content(&first), Some("one"));
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        // Client goes away mid-generation.
        drop(chunks);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
