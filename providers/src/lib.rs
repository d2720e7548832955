//! Model stream client with unified streaming support.
//!
//! The crate normalizes a provider's server-sent-event wire format into
//! [`StreamEvent`]s delivered over a `tokio::sync::mpsc` channel. Consumers
//! never see partial tool-call argument fragments: the parser assembles them
//! and emits whole [`StreamEvent::ToolCall`] events in the order the model
//! started them.
//!
//! Most provider/API errors during streaming are delivered as
//! [`StreamEvent::Error`] events rather than `Result::Err` returns, so
//! partial output can be captured before the error occurs. There is no
//! retry/backoff here; a failed request surfaces as a single error event.

pub mod openai;

pub use openai::{ChatClient, ChatConfig};

pub(crate) use anyhow::Result;
pub(crate) use tether_types::StreamEvent;
pub(crate) use tokio::sync::mpsc;

use std::sync::OnceLock;
use std::time::Duration;

const CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 60;

const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

const MAX_SSE_PARSE_ERRORS: usize = 3;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

pub fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default()
    })
}

pub(crate) fn stream_idle_timeout() -> Duration {
    static TIMEOUT: OnceLock<Duration> = OnceLock::new();
    *TIMEOUT.get_or_init(|| {
        let timeout = std::env::var("TETHER_STREAM_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT_SECS);
        Duration::from_secs(timeout)
    })
}

pub(crate) async fn send_event(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tx.send(event).await.is_ok()
}

/// Incremental SSE frame buffer.
///
/// Frames are separated by a blank line (`\n\n` or `\r\n\r\n`). Bytes are
/// accumulated with [`SseBuffer::push`] and complete frames drained with
/// [`SseBuffer::next_frame`]; an incomplete trailing frame stays buffered.
#[derive(Debug, Default)]
pub(crate) struct SseBuffer {
    bytes: Vec<u8>,
}

impl SseBuffer {
    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn next_frame(&mut self) -> Option<Vec<u8>> {
        let lf = self.bytes.windows(2).position(|w| w == b"\n\n");
        let crlf = self.bytes.windows(4).position(|w| w == b"\r\n\r\n");
        let (pos, delim_len) = match (lf, crlf) {
            (Some(a), Some(b)) if b < a => (b, 4),
            (Some(a), _) => (a, 2),
            (None, Some(b)) => (b, 4),
            (None, None) => return None,
        };
        let frame = self.bytes[..pos].to_vec();
        self.bytes.drain(..pos + delim_len);
        Some(frame)
    }
}

/// Extract the concatenated `data:` payload of one SSE frame.
pub(crate) fn frame_data(frame: &str) -> Option<String> {
    let mut data = String::new();
    let mut found = false;

    for line in frame.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let Some(rest) = line.strip_prefix("data:") else {
            continue;
        };
        if found {
            data.push('\n');
        }
        data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        found = true;
    }

    found.then_some(data)
}

#[derive(Debug)]
pub(crate) enum SseAction {
    /// Continue processing, nothing to emit.
    Continue,
    /// Emit these events and continue.
    Emit(Vec<StreamEvent>),
    /// Stream finished cleanly.
    Done,
    Error(String),
}

pub(crate) trait SseParser {
    fn parse(&mut self, json: &serde_json::Value) -> SseAction;

    /// Flush anything assembled but not yet emitted. Called when the stream
    /// signals completion (`[DONE]` marker or EOF) before the terminal event.
    fn finish(&mut self) -> Vec<StreamEvent>;

    fn provider_name(&self) -> &'static str;
}

/// Pump an SSE response body through a provider parser.
///
/// Handles idle timeouts, buffer growth limits, UTF-8 validation, the
/// `[DONE]` marker, and parse-error thresholds. Terminal events close the
/// stream; a connection that ends without one produces an error event.
pub(crate) async fn pump_sse_stream<P: SseParser>(
    response: reqwest::Response,
    parser: &mut P,
    tx: &mpsc::Sender<StreamEvent>,
    idle_timeout: Duration,
) -> Result<()> {
    use futures_util::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buffer = SseBuffer::default();
    let mut parse_errors = 0usize;

    loop {
        let Ok(next) = tokio::time::timeout(idle_timeout, stream.next()).await else {
            let _ = send_event(tx, StreamEvent::Error("Stream idle timeout".to_string())).await;
            return Ok(());
        };

        let Some(chunk) = next else { break };
        buffer.push(&chunk?);

        if buffer.len() > MAX_SSE_BUFFER_BYTES {
            let _ = send_event(
                tx,
                StreamEvent::Error("SSE buffer exceeded maximum size (4 MiB)".to_string()),
            )
            .await;
            return Ok(());
        }

        while let Some(frame) = buffer.next_frame() {
            if frame.is_empty() {
                continue;
            }

            let Ok(frame) = std::str::from_utf8(&frame) else {
                let _ = send_event(
                    tx,
                    StreamEvent::Error("Received invalid UTF-8 from SSE stream".to_string()),
                )
                .await;
                return Ok(());
            };

            let Some(data) = frame_data(frame) else {
                continue;
            };

            if data == "[DONE]" {
                for event in parser.finish() {
                    if !send_event(tx, event).await {
                        return Ok(());
                    }
                }
                let _ = send_event(tx, StreamEvent::Done).await;
                return Ok(());
            }

            let json: serde_json::Value = match serde_json::from_str(&data) {
                Ok(json) => json,
                Err(e) => {
                    parse_errors = parse_errors.saturating_add(1);
                    tracing::warn!(
                        %e,
                        payload_bytes = data.len(),
                        provider = parser.provider_name(),
                        "Invalid SSE JSON payload"
                    );
                    if parse_errors >= MAX_SSE_PARSE_ERRORS {
                        let _ = send_event(
                            tx,
                            StreamEvent::Error(format!("Invalid stream payload: {e}")),
                        )
                        .await;
                        return Ok(());
                    }
                    continue;
                }
            };

            parse_errors = 0;
            match parser.parse(&json) {
                SseAction::Continue => {}
                SseAction::Emit(events) => {
                    for event in events {
                        let is_terminal =
                            matches!(&event, StreamEvent::Done | StreamEvent::Error(_));
                        if !send_event(tx, event).await {
                            return Ok(());
                        }
                        if is_terminal {
                            return Ok(());
                        }
                    }
                }
                SseAction::Done => {
                    for event in parser.finish() {
                        if !send_event(tx, event).await {
                            return Ok(());
                        }
                    }
                    let _ = send_event(tx, StreamEvent::Done).await;
                    return Ok(());
                }
                SseAction::Error(msg) => {
                    let _ = send_event(tx, StreamEvent::Error(msg)).await;
                    return Ok(());
                }
            }
        }
    }

    // Premature EOF: connection closed without a completion signal.
    let _ = send_event(
        tx,
        StreamEvent::Error("Connection closed before stream completed".to_string()),
    )
    .await;
    Ok(())
}

/// Read an error response body, capped so a hostile server can't balloon memory.
pub(crate) async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}
