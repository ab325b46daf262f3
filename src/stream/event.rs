//! Typed events for both job streams

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::jobs::{GenerationJob, JobStatus};

/// Metadata key marking successful termination of the content-delta stream
pub const COMPLETION_MARKER: &str = "generation_complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    SectionStart,
    Content,
    SectionEnd,
    Metadata,
    Error,
}

/// One frame of the content-delta stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: StreamEventType,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    fn new(event_type: StreamEventType, content: String, section: Option<String>) -> Self {
        Self {
            event_type,
            content,
            section,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn section_start(title: &str) -> Self {
        Self::new(StreamEventType::SectionStart, String::new(), Some(title.into()))
    }

    pub fn content(text: impl Into<String>, section: &str) -> Self {
        Self::new(StreamEventType::Content, text.into(), Some(section.into()))
    }

    pub fn section_end(title: &str) -> Self {
        Self::new(StreamEventType::SectionEnd, String::new(), Some(title.into()))
    }

    pub fn metadata(metadata: Map<String, Value>) -> Self {
        let mut event = Self::new(StreamEventType::Metadata, String::new(), None);
        event.metadata = Some(metadata);
        event
    }

    /// Terminal metadata event carrying the completion marker
    pub fn completion(mut metadata: Map<String, Value>) -> Self {
        metadata.insert(COMPLETION_MARKER.into(), Value::Bool(true));
        Self::metadata(metadata)
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self::new(StreamEventType::Error, detail.into(), None)
    }

    pub fn is_completion(&self) -> bool {
        self.event_type == StreamEventType::Metadata
            && self
                .metadata
                .as_ref()
                .and_then(|m| m.get(COMPLETION_MARKER))
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    /// Nothing follows a terminal event on its stream
    pub fn is_terminal(&self) -> bool {
        self.event_type == StreamEventType::Error || self.is_completion()
    }
}

/// Full current state of a job, emitted on the progress stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(default)]
    pub current_section: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub key_insights: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    /// Present once the job has completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_content: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressSnapshot {
    pub fn from_job(job: &GenerationJob) -> Self {
        let error = match job.status {
            JobStatus::Failed => Some(
                job.metadata
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("generation failed")
                    .to_string(),
            ),
            _ => None,
        };
        Self {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            current_section: job.current_section.clone(),
            summary: job.artifacts.summary.clone(),
            key_insights: job.artifacts.key_insights.clone(),
            recommendations: job.artifacts.recommendations.clone(),
            full_content: (job.status == JobStatus::Completed)
                .then(|| job.artifacts.full_content.clone()),
            metadata: job.metadata.clone(),
            updated_at: job.updated_at,
            sequence: 0,
            error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Named event of the progress stream
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress(ProgressSnapshot),
    /// Final artifacts; also used for a cancelled job
    Complete(ProgressSnapshot),
    Error(ProgressSnapshot),
}

impl ProgressEvent {
    pub fn for_snapshot(snapshot: ProgressSnapshot) -> Self {
        match snapshot.status {
            JobStatus::Completed | JobStatus::Cancelled => Self::Complete(snapshot),
            JobStatus::Failed => Self::Error(snapshot),
            JobStatus::Pending | JobStatus::Generating => Self::Progress(snapshot),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Progress(_) => "progress",
            Self::Complete(_) => "complete",
            Self::Error(_) => "error",
        }
    }

    pub fn snapshot(&self) -> &ProgressSnapshot {
        match self {
            Self::Progress(s) | Self::Complete(s) | Self::Error(s) => s,
        }
    }

    pub fn into_snapshot(self) -> ProgressSnapshot {
        match self {
            Self::Progress(s) | Self::Complete(s) | Self::Error(s) => s,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }

    /// Rebuild from an SSE frame. Unknown event names yield `None`.
    pub fn from_named(name: &str, data: &str) -> Result<Option<Self>, serde_json::Error> {
        let build = match name {
            "progress" => Self::Progress,
            "complete" => Self::Complete,
            "error" => Self::Error,
            _ => return Ok(None),
        };
        Ok(Some(build(serde_json::from_str(data)?)))
    }
}
