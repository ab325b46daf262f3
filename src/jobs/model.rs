//! Generation job model
//!
//! Status only moves forward along `pending -> generating -> {completed,
//! failed, cancelled}`. Every mutation goes through a method here that checks
//! the move, so a terminal job cannot be written to again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use super::error::JobError;
use super::extract::Artifacts;

/// Progress when generation starts
pub const PROGRESS_STARTED: u8 = 5;
/// Progress while data-source access is being resolved
pub const PROGRESS_FETCHING: u8 = 10;
/// Progress once data sources are resolved, before the first section
pub const PROGRESS_SOURCES_READY: u8 = 20;
/// Progress after the last section, before completion is recorded
pub const PROGRESS_SECTIONS_DONE: u8 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Generating,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Generating | Failed | Cancelled)
                | (Generating, Generating | Completed | Failed | Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Document shape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateType {
    #[default]
    Comprehensive,
    Technical,
    Marketing,
    Product,
    Custom,
}

impl fmt::Display for TemplateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Comprehensive => "comprehensive",
            Self::Technical => "technical",
            Self::Marketing => "marketing",
            Self::Product => "product",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Input boundary of a job. Immutable once attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectScope {
    pub project_name: String,
    pub date_range: DateRange,
    pub participants: Vec<String>,
    pub keywords: Vec<String>,
    pub source_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub template: TemplateType,
    pub model_name: String,
    pub industry: Option<String>,
    pub focus: Option<String>,
    pub custom_instructions: Option<String>,
}

/// Body of a generation request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub project_name: String,
    #[serde(default)]
    pub project_industry: Option<String>,
    #[serde(default)]
    pub project_focus: Option<String>,
    #[serde(default)]
    pub date_range_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_range_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub source_reference: Option<String>,
    #[serde(default)]
    pub template_type: TemplateType,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub custom_instructions: Option<String>,
}

fn clean(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect()
}

fn clean_opt(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

impl GenerationRequest {
    /// Validate into a scope and options
    pub fn into_parts(
        self,
        default_model: &str,
    ) -> Result<(ProjectScope, GenerationOptions), JobError> {
        let project_name = self.project_name.trim().to_string();
        if project_name.is_empty() {
            return Err(JobError::ScopeInvalid("project_name is required".into()));
        }

        let (Some(start), Some(end)) = (self.date_range_start, self.date_range_end) else {
            return Err(JobError::ScopeInvalid(
                "date_range_start and date_range_end are required".into(),
            ));
        };
        if start >= end {
            return Err(JobError::ScopeInvalid(
                "date range is empty: start must be before end".into(),
            ));
        }

        let participants = clean(&self.participants);
        let keywords = clean(&self.keywords);
        if participants.is_empty() && keywords.is_empty() {
            return Err(JobError::ScopeInvalid(
                "at least one keyword or participant is required".into(),
            ));
        }

        if self.template_type == TemplateType::Custom
            && clean_opt(&self.custom_instructions).is_none()
        {
            return Err(JobError::ScopeInvalid(
                "custom template requires custom_instructions".into(),
            ));
        }

        let scope = ProjectScope {
            project_name,
            date_range: DateRange { start, end },
            participants,
            keywords,
            source_reference: clean_opt(&self.source_reference),
        };
        let options = GenerationOptions {
            template: self.template_type,
            model_name: clean_opt(&self.model_name).unwrap_or_else(|| default_model.to_string()),
            industry: clean_opt(&self.project_industry),
            focus: clean_opt(&self.project_focus),
            custom_instructions: clean_opt(&self.custom_instructions),
        };
        Ok((scope, options))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: Uuid,
    pub owner: Uuid,
    pub scope: ProjectScope,
    pub options: GenerationOptions,
    pub status: JobStatus,
    pub progress: u8,
    pub current_section: Option<String>,
    pub artifacts: Artifacts,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationJob {
    pub fn new(owner: Uuid, scope: ProjectScope, options: GenerationOptions) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner,
            scope,
            options,
            status: JobStatus::Pending,
            progress: 0,
            current_section: None,
            artifacts: Artifacts::default(),
            metadata: Map::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    fn advance(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<(), JobError> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidState {
                job_id: self.id,
                status: self.status,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    fn raise_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
    }

    pub fn begin(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        self.advance(JobStatus::Generating, now)?;
        self.started_at = Some(now);
        self.raise_progress(PROGRESS_STARTED);
        self.current_section = Some("Preparing".into());
        Ok(())
    }

    /// Progress update while generating
    pub fn report(
        &mut self,
        progress: u8,
        section: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        self.advance(JobStatus::Generating, now)?;
        self.raise_progress(progress);
        self.current_section = section;
        Ok(())
    }

    /// Append one finished section and refresh the partial artifacts
    pub fn record_section(
        &mut self,
        title: &str,
        content: &str,
        progress: u8,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        self.advance(JobStatus::Generating, now)?;
        self.artifacts.full_content.push_str(content);
        self.artifacts.refresh();
        self.raise_progress(progress);
        self.current_section = Some(title.to_string());
        Ok(())
    }

    pub fn complete(&mut self, metadata: Map<String, Value>, now: DateTime<Utc>) -> Result<(), JobError> {
        self.advance(JobStatus::Completed, now)?;
        self.artifacts.refresh();
        self.raise_progress(100);
        self.current_section = None;
        self.completed_at = Some(now);
        self.metadata.extend(metadata);
        Ok(())
    }

    /// Progress keeps its last value on failure
    pub fn fail(&mut self, detail: &str, section: Option<&str>, now: DateTime<Utc>) -> Result<(), JobError> {
        self.advance(JobStatus::Failed, now)?;
        self.completed_at = Some(now);
        self.metadata.insert("error".into(), Value::String(detail.to_string()));
        if let Some(section) = section {
            self.metadata
                .insert("failed_section".into(), Value::String(section.to_string()));
        }
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        self.advance(JobStatus::Cancelled, now)?;
        self.completed_at = Some(now);
        self.metadata.insert("cancelled".into(), Value::Bool(true));
        Ok(())
    }

    pub fn merge_metadata(&mut self, metadata: Map<String, Value>) {
        self.metadata.extend(metadata);
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            project_name: self.scope.project_name.clone(),
            template: self.options.template,
            status: self.status,
            progress: self.progress,
            current_section: self.current_section.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// List entry without content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub project_name: String,
    pub template: TemplateType,
    pub status: JobStatus,
    pub progress: u8,
    pub current_section: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Returned by `create`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub stream_url: String,
}

impl JobHandle {
    pub fn for_job(job: &GenerationJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            stream_url: format!("/case-study/{}/stream", job.id),
        }
    }
}
