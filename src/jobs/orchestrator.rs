//! Generation Job Orchestrator
//!
//! `create` validates the scope, checks that the owner has at least one
//! healthy data-source connection, stores the job as `pending` and returns.
//! Generation then runs on its own task, section by section:
//!
//! ```text
//! begin (5) -> resolve source access (10) -> sources ready (20)
//!   -> per section: section_start, content..., section_end, record (..95)
//!   -> complete (100) + completion marker
//! ```
//!
//! Before the first section every connected source with a registered
//! [`DataSource`](crate::sources::DataSource) is searched for the scope; a
//! source whose search fails is dropped from the run. `preview` runs the same
//! searches without creating a job.
//!
//! Cancellation is cooperative. `cancel` records the new status right away and
//! raises a flag the runner checks between sections; a section already being
//! written finishes but is never recorded.

use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::engine::{ContentEngine, EngineError, SectionRequest, SourceAccess};
use super::error::JobError;
use super::model::{
    GenerationJob, GenerationRequest, JobHandle, JobStatus, JobSummary, ProjectScope,
    PROGRESS_FETCHING, PROGRESS_SECTIONS_DONE, PROGRESS_SOURCES_READY,
};
use super::store::{JobMutation, JobStore};
use super::template::SectionPlan;
use crate::connections::{ConnectionLifecycleManager, ServiceName};
use crate::sources::{DataPreview, SourceRegistry, PREVIEW_LIMIT};
use crate::stream::{
    DeltaSubscription, JobChannel, ProgressSnapshot, ProgressSubscription, StreamEvent, StreamHub,
};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Model used when a request names none
    pub default_model: String,
    pub default_list_limit: usize,
    pub max_list_limit: usize,
    /// Results requested from each data source before generating
    pub source_sample_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_model: "gpt-4".into(),
            default_list_limit: 20,
            max_list_limit: 100,
            source_sample_limit: 50,
        }
    }
}

/// Progress after `done` of `total` sections
fn section_progress(done: usize, total: usize) -> u8 {
    let span = (PROGRESS_SECTIONS_DONE - PROGRESS_SOURCES_READY) as usize;
    let step = span * done / total.max(1);
    PROGRESS_SOURCES_READY + step as u8
}

struct OrchestratorCore {
    store: Arc<dyn JobStore>,
    connections: Arc<ConnectionLifecycleManager>,
    engine: Arc<dyn ContentEngine>,
    hub: Arc<StreamHub>,
    cancellations: DashMap<Uuid, Arc<AtomicBool>>,
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct GenerationJobOrchestrator {
    config: OrchestratorConfig,
    core: Arc<OrchestratorCore>,
    sources: Arc<SourceRegistry>,
}

impl GenerationJobOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn JobStore>,
        connections: Arc<ConnectionLifecycleManager>,
        engine: Arc<dyn ContentEngine>,
        hub: Arc<StreamHub>,
    ) -> Self {
        Self {
            config,
            core: Arc::new(OrchestratorCore {
                store,
                connections,
                engine,
                hub,
                cancellations: DashMap::new(),
            }),
            sources: Arc::new(SourceRegistry::new()),
        }
    }

    /// Search these sources before generating and in `preview`
    pub fn with_sources(mut self, sources: SourceRegistry) -> Self {
        self.sources = Arc::new(sources);
        self
    }

    pub fn engine_name(&self) -> &str {
        self.core.engine.name()
    }

    /// Jobs whose generation has not settled yet
    pub fn active_jobs(&self) -> usize {
        self.core.cancellations.len()
    }

    /// Create a job and start generating it in the background
    pub async fn create(
        &self,
        owner: Uuid,
        request: GenerationRequest,
    ) -> Result<JobHandle, JobError> {
        let (job, channel) = self.prepare(owner, request).await?;
        let handle = JobHandle::for_job(&job);
        self.start(job, channel);
        Ok(handle)
    }

    /// Like `create`, with a content-delta subscription taken before the
    /// first event is produced
    pub async fn create_streaming(
        &self,
        owner: Uuid,
        request: GenerationRequest,
    ) -> Result<(JobHandle, DeltaSubscription), JobError> {
        let (job, channel) = self.prepare(owner, request).await?;
        let handle = JobHandle::for_job(&job);
        let subscription = channel.subscribe_deltas();
        self.start(job, channel);
        Ok((handle, subscription))
    }

    async fn prepare(
        &self,
        owner: Uuid,
        request: GenerationRequest,
    ) -> Result<(GenerationJob, Arc<JobChannel>), JobError> {
        let (scope, options) = request.into_parts(&self.config.default_model)?;

        let health = self.core.connections.health(owner).await;
        if !health.has_healthy_connection() {
            debug!(user_id = %owner, overall = ?health.overall, "Generation refused, no healthy connection");
            return Err(JobError::ConnectionRequired(
                "connect at least one data source before generating".into(),
            ));
        }

        let job = GenerationJob::new(owner, scope, options);
        self.core.store.insert(job.clone()).await?;
        let channel = self.core.hub.open(&job);

        info!(
            job_id = %job.id,
            user_id = %owner,
            template = %job.options.template,
            model = %job.options.model_name,
            "Case study job created"
        );
        Ok((job, channel))
    }

    fn start(&self, job: GenerationJob, channel: Arc<JobChannel>) {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.core
            .cancellations
            .insert(job.id, Arc::clone(&cancelled));

        let runner = JobRunner {
            core: Arc::clone(&self.core),
            sources: Arc::clone(&self.sources),
            sample_limit: self.config.source_sample_limit,
            job_id: job.id,
            channel,
            cancelled,
        };
        tokio::spawn(runner.run(job));
    }

    /// Search every connected source for a scope without creating a job
    pub async fn preview(
        &self,
        owner: Uuid,
        request: GenerationRequest,
    ) -> Result<DataPreview, JobError> {
        let (scope, _) = request.into_parts(&self.config.default_model)?;
        let connections = &self.core.connections;
        let mut preview = DataPreview::new(&scope);

        for service in connections.services() {
            let Some(source) = self.sources.get(service) else {
                continue;
            };
            match connections.connection(owner, service).await {
                Ok(connection) if connection.holds_credentials() => {}
                _ => continue,
            }
            let result = match connections.access_token(owner, service).await {
                Ok(token) => source
                    .sample(token.as_str(), &scope, PREVIEW_LIMIT)
                    .await
                    .map_err(|e| e.to_string()),
                Err(err) => Err(err.to_string()),
            };
            preview.record(service, result);
        }

        info!(
            user_id = %owner,
            available = preview.available_sources.len(),
            searched = preview.estimated_results.len(),
            "Data preview"
        );
        Ok(preview)
    }

    /// Fetch a job owned by `owner`
    pub async fn get(&self, owner: Uuid, job_id: Uuid) -> Result<GenerationJob, JobError> {
        match self.core.store.get(job_id).await? {
            Some(job) if job.owner == owner => Ok(job),
            _ => Err(JobError::NotFound(job_id)),
        }
    }

    /// Summaries, newest first. `limit` is clamped to `1..=max_list_limit`.
    pub async fn list(
        &self,
        owner: Uuid,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<JobSummary>, JobError> {
        let limit = limit
            .unwrap_or(self.config.default_list_limit)
            .clamp(1, self.config.max_list_limit);
        self.core
            .store
            .list_for_owner(owner, limit, offset.unwrap_or(0))
            .await
    }

    /// Stop a job at its next section boundary. A no-op on settled jobs.
    pub async fn cancel(&self, owner: Uuid, job_id: Uuid) -> Result<GenerationJob, JobError> {
        let job = self.get(owner, job_id).await?;
        if job.status.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "Cancel on settled job ignored");
            return Ok(job);
        }

        if let Some(flag) = self.core.cancellations.get(&job_id) {
            flag.store(true, Ordering::Release);
        }

        let now = Utc::now();
        match self.core.store.update(job_id, &|j| j.cancel(now)).await {
            Ok(job) => {
                if let Some(channel) = self.core.hub.get(job_id) {
                    channel.publish(StreamEvent::error("generation cancelled"));
                    channel.publish_progress(ProgressSnapshot::from_job(&job));
                }
                info!(job_id = %job_id, progress = job.progress, "Case study job cancelled");
                Ok(job)
            }
            // Settled between the read and the write
            Err(JobError::InvalidState { .. }) => self.get(owner, job_id).await,
            Err(err) => Err(err),
        }
    }

    /// Remove a settled job
    pub async fn delete(&self, owner: Uuid, job_id: Uuid) -> Result<(), JobError> {
        self.get(owner, job_id).await?;
        self.core
            .store
            .delete(job_id, &|job| {
                if job.status.is_terminal() {
                    Ok(())
                } else {
                    Err(JobError::InvalidState {
                        job_id: job.id,
                        status: job.status,
                    })
                }
            })
            .await?;
        self.core.hub.remove(job_id);
        info!(job_id = %job_id, "Case study job deleted");
        Ok(())
    }

    /// Progress stream for a job. Retired channels yield the stored final state.
    pub async fn subscribe_progress(
        &self,
        owner: Uuid,
        job_id: Uuid,
    ) -> Result<ProgressSubscription, JobError> {
        let job = self.get(owner, job_id).await?;
        Ok(match self.core.hub.get(job_id) {
            Some(channel) => channel.subscribe_progress(),
            None => ProgressSubscription::settled(ProgressSnapshot::from_job(&job)),
        })
    }
}

// ============================================================================
// Background runner
// ============================================================================

enum RunError {
    Cancelled,
    Failed {
        detail: String,
        section: Option<String>,
    },
}

impl RunError {
    fn failed(detail: impl Into<String>) -> Self {
        Self::Failed {
            detail: detail.into(),
            section: None,
        }
    }
}

struct JobRunner {
    core: Arc<OrchestratorCore>,
    sources: Arc<SourceRegistry>,
    sample_limit: usize,
    job_id: Uuid,
    channel: Arc<JobChannel>,
    cancelled: Arc<AtomicBool>,
}

impl JobRunner {
    async fn run(self, job: GenerationJob) {
        let started = Instant::now();

        match self.generate(job, started).await {
            Ok(job) => info!(
                job_id = %self.job_id,
                duration_ms = started.elapsed().as_millis() as u64,
                chars = job.artifacts.full_content.len(),
                "Case study generated"
            ),
            Err(RunError::Cancelled) => {
                debug!(job_id = %self.job_id, "Generation stopped after cancel")
            }
            Err(RunError::Failed { detail, section }) => self.fail(&detail, section.as_deref()).await,
        }

        self.core.cancellations.remove(&self.job_id);
        self.core.hub.retire_later(self.job_id);
    }

    fn checkpoint(&self) -> Result<(), RunError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(RunError::Cancelled);
        }
        Ok(())
    }

    async fn update(&self, mutation: JobMutation<'_>) -> Result<GenerationJob, RunError> {
        match self.core.store.update(self.job_id, mutation).await {
            Ok(job) => {
                self.channel.publish_progress(ProgressSnapshot::from_job(&job));
                Ok(job)
            }
            Err(JobError::InvalidState {
                status: JobStatus::Cancelled,
                ..
            }) => Err(RunError::Cancelled),
            Err(err) => Err(RunError::failed(err.to_string())),
        }
    }

    async fn generate(&self, job: GenerationJob, started: Instant) -> Result<GenerationJob, RunError> {
        let owner = job.owner;
        let now = Utc::now();
        let job = self.update(&|j| j.begin(now)).await?;

        let sections = job.options.template.sections();
        let total = sections.len();
        self.channel.publish(StreamEvent::metadata(object(json!({
            "generation_started": true,
            "job_id": job.id,
            "model": job.options.model_name,
            "template": job.options.template,
            "total_sections": total,
        }))));

        let now = Utc::now();
        self.update(&|j| j.report(PROGRESS_FETCHING, Some("Fetching data sources".into()), now))
            .await?;
        let (sources, mut failed) = self.resolve_sources(owner).await;
        let (sources, source_items) = self.sample_sources(&job.scope, sources, &mut failed).await;
        let source_names: Vec<ServiceName> = sources.iter().map(|s| s.service).collect();
        let total_items: usize = source_items.values().sum();
        self.channel.publish(StreamEvent::metadata(object(json!({
            "data_sources": source_names,
            "sources_failed": failed,
            "source_items": source_items,
        }))));
        if sources.is_empty() {
            return Err(RunError::failed("no connected data source could be accessed"));
        }

        let now = Utc::now();
        let mut job = self
            .update(&|j| {
                j.report(PROGRESS_SOURCES_READY, Some("Data sources ready".into()), now)
            })
            .await?;

        let sources = Arc::new(sources);
        for (index, section) in sections.into_iter().enumerate() {
            self.checkpoint()?;
            let title = section.title.clone();

            let now = Utc::now();
            self.update(&|j| j.report(0, Some(title.clone()), now)).await?;
            self.channel.publish(StreamEvent::section_start(&title));

            let request = SectionRequest {
                job_id: self.job_id,
                index,
                total,
                section,
                scope: job.scope.clone(),
                options: job.options.clone(),
                sources: Arc::clone(&sources),
            };
            let content = self.write_section(request).await.map_err(|err| RunError::Failed {
                detail: err.to_string(),
                section: Some(title.clone()),
            })?;
            self.channel.publish(StreamEvent::section_end(&title));

            let progress = section_progress(index + 1, total);
            let now = Utc::now();
            job = self
                .update(&|j| j.record_section(&title, &content, progress, now))
                .await?;
            self.channel.publish(StreamEvent::metadata(object(json!({
                "section_index": index,
                "sections_total": total,
                "progress": job.progress,
            }))));
        }

        let duration = (started.elapsed().as_secs_f64() * 100.0).round() / 100.0;
        let tokens_estimate = job.artifacts.full_content.chars().count() / 4;
        let metadata = object(json!({
            "model_used": job.options.model_name,
            "template": job.options.template,
            "engine": self.core.engine.name(),
            "duration_seconds": duration,
            "sections_generated": total,
            "total_sections": total,
            "data_sources": source_names,
            "sources_failed": failed,
            "source_items": source_items,
            "total_items_fetched": total_items,
            "participant_count": job.scope.participants.len(),
            "keyword_count": job.scope.keywords.len(),
            "tokens_estimate": tokens_estimate,
        }));

        let now = Utc::now();
        let job = self.update(&|j| j.complete(metadata.clone(), now)).await?;
        self.channel.publish(StreamEvent::completion(object(json!({
            "duration_seconds": duration,
            "sections_generated": total,
            "tokens_estimate": tokens_estimate,
            "model_used": job.options.model_name,
        }))));
        Ok(job)
    }

    async fn resolve_sources(&self, owner: Uuid) -> (Vec<SourceAccess>, Vec<ServiceName>) {
        let connections = &self.core.connections;
        let mut sources = Vec::new();
        let mut failed = Vec::new();

        for service in connections.services() {
            match connections.connection(owner, service).await {
                Ok(connection) if connection.holds_credentials() => {}
                _ => continue,
            }
            match connections.access_token(owner, service).await {
                Ok(access_token) => sources.push(SourceAccess {
                    service,
                    access_token,
                }),
                Err(err) => {
                    warn!(job_id = %self.job_id, service = %service, error = %err, "Data source unavailable");
                    failed.push(service);
                }
            }
        }

        (sources, failed)
    }

    /// Search each source that has a registered [`DataSource`](crate::sources::DataSource).
    /// Sources whose search fails are moved to `failed`.
    async fn sample_sources(
        &self,
        scope: &ProjectScope,
        sources: Vec<SourceAccess>,
        failed: &mut Vec<ServiceName>,
    ) -> (Vec<SourceAccess>, BTreeMap<ServiceName, usize>) {
        let mut usable = Vec::with_capacity(sources.len());
        let mut items = BTreeMap::new();

        for access in sources {
            let Some(source) = self.sources.get(access.service) else {
                usable.push(access);
                continue;
            };
            match source
                .sample(access.access_token.as_str(), scope, self.sample_limit)
                .await
            {
                Ok(sample) => {
                    debug!(
                        job_id = %self.job_id,
                        service = %access.service,
                        items = sample.sample_count,
                        "Data source searched"
                    );
                    items.insert(access.service, sample.sample_count);
                    usable.push(access);
                }
                Err(err) => {
                    warn!(job_id = %self.job_id, service = %access.service, error = %err, "Data source search failed");
                    failed.push(access.service);
                }
            }
        }

        (usable, items)
    }

    /// Stream one section. The returned text equals the concatenated deltas.
    async fn write_section(&self, request: SectionRequest) -> Result<String, EngineError> {
        let title = request.section.title.clone();
        let mut content = String::new();
        self.emit(&mut content, heading(&request.section), &title);

        let mut deltas = self.core.engine.generate_section(request).await?;
        while let Some(delta) = deltas.next().await {
            let delta = delta?;
            if !delta.is_empty() {
                self.emit(&mut content, delta, &title);
            }
        }

        if !content.ends_with("\n\n") {
            let pad = if content.ends_with('\n') { "\n" } else { "\n\n" };
            self.emit(&mut content, pad.to_string(), &title);
        }
        Ok(content)
    }

    fn emit(&self, content: &mut String, delta: String, title: &str) {
        content.push_str(&delta);
        self.channel.publish(StreamEvent::content(delta, title));
    }

    async fn fail(&self, detail: &str, section: Option<&str>) {
        let now = Utc::now();
        let result = self
            .core
            .store
            .update(self.job_id, &|j| j.fail(detail, section, now))
            .await;
        match result {
            Ok(job) => {
                warn!(
                    job_id = %self.job_id,
                    section = section.unwrap_or("-"),
                    progress = job.progress,
                    error = %detail,
                    "Case study generation failed"
                );
                self.channel
                    .publish(StreamEvent::error(format!("generation failed: {}", detail)));
                self.channel.publish_progress(ProgressSnapshot::from_job(&job));
            }
            Err(err) => debug!(job_id = %self.job_id, error = %err, "Job settled before failure was recorded"),
        }
    }
}

fn heading(section: &SectionPlan) -> String {
    format!("## {}\n\n", section.title)
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_progress_spans_to_95() {
        assert_eq!(section_progress(0, 8), 20);
        assert_eq!(section_progress(8, 8), 95);
        let steps: Vec<u8> = (1..=8).map(|i| section_progress(i, 8)).collect();
        assert!(steps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_heading_format() {
        let plan = &crate::jobs::TemplateType::Comprehensive.sections()[0];
        assert_eq!(heading(plan), "## Executive Summary\n\n");
    }
}
