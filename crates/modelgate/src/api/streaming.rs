//! Server-Sent Events relay from an upstream provider to a downstream caller.
//!
//! [`relay`] turns the upstream's raw byte stream into a lazy stream of text
//! frames. Chunks are forwarded verbatim because providers already speak SSE.
//! A read failure becomes one terminal `stream_error` frame and ends the
//! stream; nothing is propagated to the consumer as an error.
//!
//! The upstream connection is held by a [`ConnectionLease`] whose release
//! callback runs exactly once, whether the stream completes, fails, is
//! cancelled through a [`CancellationToken`], or is simply dropped by its
//! consumer.

use std::fmt::Display;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// One SSE frame: an optional `event:` line and a `data:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// The terminal frame emitted when reading the upstream fails.
    pub fn stream_error(cause: impl Display) -> Self {
        let payload = json!({
            "error": {
                "message": format!("Streaming error: {cause}"),
                "type": "stream_error",
            }
        });
        Self::data(payload.to_string())
    }

    /// Wire form, terminated by a blank line.
    pub fn to_sse(&self) -> String {
        match &self.event {
            Some(event) => format!("event: {event}\ndata: {}\n\n", self.data),
            None => format!("data: {}\n\n", self.data),
        }
    }

    /// Split SSE text into frames. Comment lines and fields other than
    /// `event` and `data` are ignored; multiple `data` lines are joined with
    /// `\n`.
    pub fn parse_all(text: &str) -> Vec<SseFrame> {
        let normalized = text.replace("\r\n", "\n");
        normalized
            .split("\n\n")
            .filter_map(|block| {
                let mut event = None;
                let mut data: Vec<&str> = Vec::new();
                for line in block.lines() {
                    if let Some(value) = line.strip_prefix("event:") {
                        event = Some(value.trim_start().to_string());
                    } else if let Some(value) = line.strip_prefix("data:") {
                        data.push(value.strip_prefix(' ').unwrap_or(value));
                    }
                }
                if data.is_empty() {
                    return None;
                }
                Some(SseFrame {
                    event,
                    data: data.join("\n"),
                })
            })
            .collect()
    }
}

/// Scoped ownership of an upstream connection.
///
/// The release callback runs at most once: on the first [`release`] call or
/// when the lease is dropped, whichever comes first.
///
/// [`release`]: ConnectionLease::release
pub struct ConnectionLease {
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl ConnectionLease {
    pub fn new(on_release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_release: Some(Box::new(on_release)),
        }
    }

    pub fn release(&mut self) {
        if let Some(on_release) = self.on_release.take() {
            on_release();
        }
    }

    pub fn is_released(&self) -> bool {
        self.on_release.is_none()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("released", &self.is_released())
            .finish()
    }
}

/// Relay `upstream` chunks as text frames.
///
/// - Empty chunks are skipped.
/// - Chunks that are not valid UTF-8 are dropped with a warning.
/// - The first read error yields one [`SseFrame::stream_error`] frame and
///   ends the stream.
/// - Cancelling `cancel` ends the stream without an error frame.
///
/// `upstream` is dropped before `lease` is released on every exit path.
pub fn relay<S, E>(
    upstream: S,
    lease: ConnectionLease,
    cancel: Option<CancellationToken>,
) -> impl Stream<Item = String> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let cancel = cancel.unwrap_or_default();
    async_stream::stream! {
        // Declared before `upstream` so that on drop the connection goes first.
        let mut lease = lease;
        let mut upstream = Box::pin(upstream);
        let mut forwarded: usize = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(forwarded, "stream relay cancelled by caller");
                    break;
                }
                next = upstream.next() => next,
            };

            match next {
                None => {
                    debug!(forwarded, "upstream stream completed");
                    break;
                }
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    match std::str::from_utf8(&chunk) {
                        Ok(text) => {
                            forwarded += 1;
                            yield text.to_string();
                        }
                        Err(e) => {
                            warn!(bytes = chunk.len(), "dropping stream chunk that is not UTF-8: {e}");
                        }
                    }
                }
                Some(Err(e)) => {
                    error!(context = "streaming request", forwarded, "upstream stream failed: {e}");
                    yield SseFrame::stream_error(&e).to_sse();
                    break;
                }
            }
        }

        drop(upstream);
        lease.release();
    }
}
