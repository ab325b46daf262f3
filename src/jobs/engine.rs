//! Content engine seam
//!
//! The orchestrator asks an engine for one section at a time and receives a
//! stream of text deltas. The engine is opaque: [`HttpContentEngine`] forwards
//! the request to an external service, [`OutlineEngine`] composes sections from
//! the scope itself for development.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::model::{GenerationOptions, ProjectScope};
use super::template::SectionPlan;
use crate::connections::ServiceName;

/// Text deltas of one section, in production order
pub type DeltaStream = BoxStream<'static, Result<String, EngineError>>;

/// Access credential for one connected data source
#[derive(Clone)]
pub struct SourceAccess {
    pub service: ServiceName,
    pub access_token: Zeroizing<String>,
}

impl fmt::Debug for SourceAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceAccess")
            .field("service", &self.service)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SectionRequest {
    pub job_id: Uuid,
    pub index: usize,
    pub total: usize,
    pub section: SectionPlan,
    pub scope: ProjectScope,
    pub options: GenerationOptions,
    pub sources: Arc<Vec<SourceAccess>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("engine unreachable: {0}")]
    Transport(String),
    #[error("engine rejected section: {0}")]
    Rejected(String),
    #[error("malformed engine output: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait ContentEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn generate_section(&self, request: SectionRequest) -> Result<DeltaStream, EngineError>;
}

// =============================================================================
// HTTP engine
// =============================================================================

#[derive(Deserialize)]
struct EngineFrame {
    delta: Option<String>,
    error: Option<String>,
    #[serde(default)]
    done: bool,
}

enum Frame {
    Delta(String),
    Failed(String),
    Done,
}

fn parse_frame(line: &[u8]) -> Result<Option<Frame>, EngineError> {
    let line = std::str::from_utf8(line)
        .map_err(|e| EngineError::Protocol(e.to_string()))?
        .trim();
    if line.is_empty() {
        return Ok(None);
    }
    let frame: EngineFrame =
        serde_json::from_str(line).map_err(|e| EngineError::Protocol(e.to_string()))?;
    Ok(Some(match frame {
        EngineFrame { error: Some(err), .. } => Frame::Failed(err),
        EngineFrame { delta: Some(delta), .. } => Frame::Delta(delta),
        EngineFrame { done: true, .. } => Frame::Done,
        _ => return Ok(None),
    }))
}

/// Engine reached over HTTP.
///
/// `POST {base}/v1/sections` answers with newline-delimited JSON frames:
/// `{"delta": "..."}` repeated, then `{"done": true}`, or `{"error": "..."}`.
pub struct HttpContentEngine {
    base_url: String,
    http: reqwest::Client,
}

impl HttpContentEngine {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl ContentEngine for HttpContentEngine {
    fn name(&self) -> &str {
        "http"
    }

    async fn generate_section(&self, request: SectionRequest) -> Result<DeltaStream, EngineError> {
        let sources: Vec<_> = request
            .sources
            .iter()
            .map(|s| json!({ "service": s.service, "access_token": s.access_token.as_str() }))
            .collect();
        let body = json!({
            "job_id": request.job_id,
            "model": request.options.model_name,
            "template": request.options.template,
            "template_focus": request.options.template.focus(),
            "industry": request.options.industry,
            "focus": request.options.focus,
            "custom_instructions": request.options.custom_instructions,
            "section": request.section,
            "index": request.index,
            "total": request.total,
            "scope": request.scope,
            "sources": sources,
        });

        let response = self
            .http
            .post(format!("{}/v1/sections", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EngineError::Rejected(format!("{}: {}", status, detail)));
        }

        let (tx, rx) = mpsc::channel(64);
        let mut body = response.bytes_stream();
        let section = request.section.key.clone();

        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            loop {
                let chunk = match body.next().await {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(EngineError::Transport(e.to_string()))).await;
                        return;
                    }
                    None => {
                        let tail = std::mem::take(&mut buffer);
                        let result = match parse_frame(&tail) {
                            Ok(Some(Frame::Done)) => return,
                            Ok(Some(Frame::Delta(_))) | Ok(None) => Err(EngineError::Protocol(
                                "stream ended before done".into(),
                            )),
                            Ok(Some(Frame::Failed(err))) => Err(EngineError::Rejected(err)),
                            Err(err) => Err(err),
                        };
                        let _ = tx.send(result).await;
                        return;
                    }
                };

                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match parse_frame(&line) {
                        Ok(None) => continue,
                        Ok(Some(Frame::Delta(delta))) => {
                            if tx.send(Ok(delta)).await.is_err() {
                                debug!(section = %section, "Section consumer went away");
                                return;
                            }
                        }
                        Ok(Some(Frame::Done)) => return,
                        Ok(Some(Frame::Failed(err))) => {
                            let _ = tx.send(Err(EngineError::Rejected(err))).await;
                            return;
                        }
                        Err(err) => {
                            let _ = tx.send(Err(err)).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

// =============================================================================
// Outline engine (development)
// =============================================================================

/// Composes sections straight from the scope, in small word chunks
pub struct OutlineEngine {
    chunk_words: usize,
    delay: Option<Duration>,
}

impl Default for OutlineEngine {
    fn default() -> Self {
        Self {
            chunk_words: 6,
            delay: None,
        }
    }
}

impl OutlineEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause before every delta, to imitate a slow model
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn compose(&self, request: &SectionRequest) -> String {
        let scope = &request.scope;
        let subjects: Vec<&str> = scope
            .keywords
            .iter()
            .chain(scope.participants.iter())
            .map(String::as_str)
            .collect();
        let window = format!(
            "{} to {}",
            scope.date_range.start.format("%Y-%m-%d"),
            scope.date_range.end.format("%Y-%m-%d")
        );

        if request.section.list {
            let mut text = String::new();
            for subject in &subjects {
                text.push_str(&format!(
                    "- {} work on {} shaped {} between {}.\n",
                    request.section.title, subject, scope.project_name, window
                ));
            }
            text.push('\n');
            return text;
        }

        let mut text = format!(
            "{} covers {} from {}. {}",
            request.section.title, scope.project_name, window, request.section.guidance
        );
        if !subjects.is_empty() {
            text.push_str(&format!(" Threads followed: {}.", subjects.join(", ")));
        }
        if let Some(instructions) = &request.options.custom_instructions {
            text.push_str(&format!(" {}", instructions));
        }
        text.push_str("\n\n");
        text
    }
}

/// Split text into chunks of `words` words, preserving every byte
fn chunk_words(text: &str, words: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for (i, word) in text.split_inclusive(' ').enumerate() {
        current.push_str(word);
        if (i + 1) % words.max(1) == 0 {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[async_trait]
impl ContentEngine for OutlineEngine {
    fn name(&self) -> &str {
        "outline"
    }

    async fn generate_section(&self, request: SectionRequest) -> Result<DeltaStream, EngineError> {
        let chunks = chunk_words(&self.compose(&request), self.chunk_words);
        let delay = self.delay;
        Ok(stream::iter(chunks)
            .then(move |chunk| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(chunk)
            })
            .boxed())
    }
}
