//! Server-sent events framing
//!
//! Serialisation side: frame builders and a response body that injects
//! `: keepalive` comments during quiet periods. Parsing side: an incremental
//! [`SseParser`] used by the client.

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

pub const KEEPALIVE_FRAME: &str = ": keepalive\n\n";

/// Reconnect hint sent first on resumable streams
pub const RETRY_MS: u64 = 3000;

/// Unnamed frame: `data: <payload>`
pub fn data_frame(payload: &str) -> String {
    let mut frame = String::with_capacity(payload.len() + 8);
    for line in payload.split('\n') {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    frame
}

/// Named frame with an id
pub fn named_frame(event: &str, id: u64, payload: &str) -> String {
    format!("id: {}\nevent: {}\n{}", id, event, data_frame(payload))
}

pub fn retry_frame(millis: u64) -> String {
    format!("retry: {}\n\n", millis)
}

/// Response body fed from `frames`, with a keepalive comment after every
/// `keepalive` of silence. The pump stops when the client goes away.
pub fn sse_body(
    mut frames: BoxStream<'static, String>,
    keepalive: Duration,
) -> BoxBody<Bytes, hyper::Error> {
    let (tx, rx) = mpsc::channel::<String>(32);

    tokio::spawn(async move {
        loop {
            let frame = match tokio::time::timeout(keepalive, frames.next()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(_) => KEEPALIVE_FRAME.to_string(),
            };
            if tx.send(frame).await.is_err() {
                debug!("SSE client disconnected");
                return;
            }
        }
    });

    let frames =
        ReceiverStream::new(rx).map(|text| Ok::<_, hyper::Error>(Frame::data(Bytes::from(text))));
    BodyExt::boxed(StreamBody::new(frames))
}

// =============================================================================
// Parsing
// =============================================================================

/// One dispatched event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// Event name, `message` when unnamed
    pub fn name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
    retry: Option<u64>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last reconnect hint received
    pub fn retry(&self) -> Option<u64> {
        self.retry
    }

    /// Feed raw bytes, returning every event completed by them
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "data" => self.data.push(value.to_string()),
                "event" => self.event = Some(value.to_string()),
                "id" => self.id = Some(value.to_string()),
                "retry" => self.retry = value.parse().ok().or(self.retry),
                _ => {}
            }
        }

        frames
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() {
            return None;
        }
        Some(SseFrame {
            event,
            id,
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}
