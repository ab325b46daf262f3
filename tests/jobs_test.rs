//! Job orchestration: validation, gating on connections, delivery, cancellation

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use http_body_util::StreamBody;
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use casebook::connections::{
    ConnectionConfig, ConnectionLifecycleManager, CredentialVault, GrantOutcome,
    InMemoryConnectionStore, LoopbackProvider, ProviderCallback, ProviderRegistry, ServiceName,
};
use casebook::jobs::{
    ContentEngine, DeltaStream, EngineError, GenerationJobOrchestrator, GenerationRequest,
    HttpContentEngine, InMemoryJobStore, JobError, JobStatus, OrchestratorConfig, OutlineEngine,
    ProjectScope, SectionRequest, TemplateType,
};
use casebook::sources::{DataSource, SourceError, SourceRegistry, SourceSample};
use casebook::stream::{ProgressEvent, StreamEventType, StreamHub};

/// Writes sections normally until `fail_at`, then errors mid-section
struct FailingEngine {
    fail_at: usize,
}

#[async_trait]
impl ContentEngine for FailingEngine {
    fn name(&self) -> &str {
        "failing"
    }

    async fn generate_section(&self, request: SectionRequest) -> Result<DeltaStream, EngineError> {
        if request.index < self.fail_at {
            return Ok(stream::iter(vec![Ok("Fine.".to_string())]).boxed());
        }
        Ok(stream::iter(vec![
            Ok("Partial ".to_string()),
            Err(EngineError::Rejected("model overloaded".into())),
        ])
        .boxed())
    }
}

/// Source that answers with a fixed number of results, or fails
struct StaticSource {
    service: ServiceName,
    found: Result<usize, SourceError>,
}

#[async_trait]
impl DataSource for StaticSource {
    fn service(&self) -> ServiceName {
        self.service
    }

    fn query(&self, scope: &ProjectScope) -> String {
        scope.keywords.join(" ")
    }

    async fn sample(
        &self,
        _access_token: &str,
        scope: &ProjectScope,
        limit: usize,
    ) -> Result<SourceSample, SourceError> {
        let found = self.found.clone()?.min(limit);
        Ok(SourceSample {
            service: self.service,
            query: self.query(scope),
            sample_count: found,
            estimated_total: Some(found as u64),
            sample_titles: Vec::new(),
        })
    }
}

fn static_sources(
    gmail: Result<usize, SourceError>,
    drive: Result<usize, SourceError>,
) -> SourceRegistry {
    SourceRegistry::new()
        .with(Arc::new(StaticSource {
            service: ServiceName::Gmail,
            found: gmail,
        }))
        .with(Arc::new(StaticSource {
            service: ServiceName::Drive,
            found: drive,
        }))
}

struct Harness {
    connections: Arc<ConnectionLifecycleManager>,
    jobs: GenerationJobOrchestrator,
}

fn harness(engine: Arc<dyn ContentEngine>) -> Harness {
    harness_with_sources(engine, SourceRegistry::new())
}

fn harness_with_sources(engine: Arc<dyn ContentEngine>, sources: SourceRegistry) -> Harness {
    let mut providers = ProviderRegistry::new();
    for service in ServiceName::ALL {
        providers = providers.with(
            service,
            Arc::new(LoopbackProvider::new(format!(
                "http://localhost:8001/auth/connections/{}/callback",
                service
            ))),
        );
    }
    let connections = Arc::new(ConnectionLifecycleManager::new(
        ConnectionConfig::default(),
        Arc::new(InMemoryConnectionStore::new()),
        providers,
        Arc::new(CredentialVault::ephemeral()),
    ));
    let jobs = GenerationJobOrchestrator::new(
        OrchestratorConfig::default(),
        Arc::new(InMemoryJobStore::new()),
        Arc::clone(&connections),
        engine,
        Arc::new(StreamHub::new(1024, Duration::from_secs(60))),
    )
    .with_sources(sources);
    Harness { connections, jobs }
}

async fn connect(connections: &ConnectionLifecycleManager, user_id: Uuid, service: ServiceName) {
    let GrantOutcome::Redirect { redirect_url } =
        connections.grant(user_id, service).await.unwrap()
    else {
        panic!("expected a consent redirect");
    };
    let query = redirect_url.split_once('?').map(|(_, q)| q).unwrap_or("");
    let callback: ProviderCallback = serde_urlencoded::from_str(query).unwrap();
    connections
        .complete_grant(user_id, service, callback)
        .await
        .unwrap();
}

fn request() -> GenerationRequest {
    GenerationRequest {
        project_name: "Checkout redesign".into(),
        date_range_start: Some(Utc::now() - ChronoDuration::days(30)),
        date_range_end: Some(Utc::now()),
        participants: vec!["ana@example.com".into()],
        keywords: vec!["checkout".into(), "conversion".into()],
        ..Default::default()
    }
}

async fn connected_user(harness: &Harness) -> Uuid {
    let user_id = Uuid::new_v4();
    connect(&harness.connections, user_id, ServiceName::Gmail).await;
    user_id
}

/// Drain the progress stream of a job
async fn progress_events(jobs: &GenerationJobOrchestrator, owner: Uuid, job_id: Uuid) -> Vec<ProgressEvent> {
    let mut subscription = jobs.subscribe_progress(owner, job_id).await.unwrap();
    let mut events = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(10), subscription.next())
        .await
        .unwrap()
    {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn scope_without_participants_or_keywords_is_invalid() {
    let harness = harness(Arc::new(OutlineEngine::new()));
    let user_id = connected_user(&harness).await;

    let mut req = request();
    req.participants.clear();
    req.keywords = vec!["  ".into()];

    let err = harness.jobs.create(user_id, req).await.unwrap_err();
    assert!(matches!(err, JobError::ScopeInvalid(_)));
}

#[tokio::test]
async fn create_requires_a_connection_then_succeeds() {
    let harness = harness(Arc::new(OutlineEngine::new()));
    let user_id = Uuid::new_v4();

    let err = harness.jobs.create(user_id, request()).await.unwrap_err();
    assert!(matches!(err, JobError::ConnectionRequired(_)));

    connect(&harness.connections, user_id, ServiceName::Drive).await;
    let handle = harness.jobs.create(user_id, request()).await.unwrap();
    assert_eq!(handle.status, JobStatus::Pending);
    assert_eq!(handle.stream_url, format!("/case-study/{}/stream", handle.job_id));
}

#[tokio::test]
async fn content_deltas_concatenate_to_full_content() {
    let harness = harness(Arc::new(OutlineEngine::new()));
    let user_id = connected_user(&harness).await;

    let (handle, mut deltas) = harness
        .jobs
        .create_streaming(user_id, request())
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(10), deltas.next())
        .await
        .unwrap()
    {
        events.push(event);
    }

    let last = events.last().unwrap();
    assert!(last.is_completion());
    assert!(events.iter().all(|e| e.event_type != StreamEventType::Error));

    let sections = TemplateType::Comprehensive.sections();
    let starts: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == StreamEventType::SectionStart)
        .filter_map(|e| e.section.clone())
        .collect();
    let titles: Vec<_> = sections.iter().map(|s| s.title.clone()).collect();
    assert_eq!(starts, titles);

    let streamed: String = events
        .iter()
        .filter(|e| e.event_type == StreamEventType::Content)
        .map(|e| e.content.as_str())
        .collect();

    let job = harness.jobs.get(user_id, handle.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(streamed, job.artifacts.full_content);
    assert!(streamed.starts_with("## Executive Summary\n\n"));
    assert!(job.artifacts.summary.is_some());
    assert!(!job.artifacts.recommendations.is_empty());
    assert_eq!(job.metadata["sections_generated"], sections.len());
}

#[tokio::test]
async fn progress_is_monotonic_and_ends_complete() {
    let harness = harness(Arc::new(
        OutlineEngine::new().with_delay(Duration::from_millis(2)),
    ));
    let user_id = connected_user(&harness).await;
    let handle = harness.jobs.create(user_id, request()).await.unwrap();

    let events = progress_events(&harness.jobs, user_id, handle.job_id).await;
    let snapshots: Vec<_> = events.iter().map(|e| e.snapshot().clone()).collect();

    assert!(snapshots.windows(2).all(|w| w[0].progress <= w[1].progress));
    assert!(snapshots.windows(2).all(|w| w[0].sequence <= w[1].sequence));
    let terminal_at = snapshots.iter().position(|s| s.is_terminal()).unwrap();
    assert_eq!(terminal_at, snapshots.len() - 1);

    let last = events.last().unwrap();
    assert_eq!(last.name(), "complete");
    assert_eq!(last.snapshot().progress, 100);
    assert!(last.snapshot().full_content.is_some());
}

#[tokio::test]
async fn reconnecting_progress_subscriber_never_regresses() {
    let harness = harness(Arc::new(
        OutlineEngine::new().with_delay(Duration::from_millis(5)),
    ));
    let user_id = connected_user(&harness).await;
    let handle = harness.jobs.create(user_id, request()).await.unwrap();

    let mut first = harness
        .jobs
        .subscribe_progress(user_id, handle.job_id)
        .await
        .unwrap();
    let mut last_seen = 0;
    while let Some(event) = first.next().await {
        last_seen = event.snapshot().progress;
        if last_seen >= 30 || event.is_terminal() {
            break;
        }
    }
    first.unsubscribe();
    assert!(first.next().await.is_none());

    // Dropped connection: the job keeps running meanwhile
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut second = harness
        .jobs
        .subscribe_progress(user_id, handle.job_id)
        .await
        .unwrap();
    let resumed = second.next().await.unwrap();
    assert!(resumed.snapshot().progress >= last_seen);
}

#[tokio::test]
async fn cancel_stops_generation_and_is_idempotent() {
    let harness = harness(Arc::new(
        OutlineEngine::new().with_delay(Duration::from_millis(20)),
    ));
    let user_id = connected_user(&harness).await;
    let (handle, mut deltas) = harness
        .jobs
        .create_streaming(user_id, request())
        .await
        .unwrap();

    // Wait for the first section to begin
    while let Some(event) = deltas.next().await {
        if event.event_type == StreamEventType::SectionStart {
            break;
        }
    }

    let err = harness.jobs.delete(user_id, handle.job_id).await.unwrap_err();
    assert!(matches!(err, JobError::InvalidState { .. }));

    let cancelled = harness.jobs.cancel(user_id, handle.job_id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let mut terminal = None;
    while let Some(event) = deltas.next().await {
        terminal = Some(event);
    }
    let terminal = terminal.unwrap();
    assert_eq!(terminal.event_type, StreamEventType::Error);
    assert_eq!(terminal.content, "generation cancelled");

    // The runner stops at the next boundary without touching the job again
    tokio::time::sleep(Duration::from_millis(200)).await;
    let job = harness.jobs.get(user_id, handle.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.progress < 100);

    let again = harness.jobs.cancel(user_id, handle.job_id).await.unwrap();
    assert_eq!(again.status, JobStatus::Cancelled);
    assert_eq!(again.updated_at, job.updated_at);

    let events = progress_events(&harness.jobs, user_id, handle.job_id).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name(), "complete");
    assert_eq!(events[0].snapshot().status, JobStatus::Cancelled);

    harness.jobs.delete(user_id, handle.job_id).await.unwrap();
    assert!(matches!(
        harness.jobs.get(user_id, handle.job_id).await,
        Err(JobError::NotFound(_))
    ));
}

#[tokio::test]
async fn cancel_on_completed_job_is_a_noop() {
    let harness = harness(Arc::new(OutlineEngine::new()));
    let user_id = connected_user(&harness).await;
    let handle = harness.jobs.create(user_id, request()).await.unwrap();
    progress_events(&harness.jobs, user_id, handle.job_id).await;

    let before = harness.jobs.get(user_id, handle.job_id).await.unwrap();
    let after = harness.jobs.cancel(user_id, handle.job_id).await.unwrap();
    assert_eq!(after.status, JobStatus::Completed);
    assert_eq!(after, before);
}

#[tokio::test]
async fn engine_failure_fails_the_job() {
    let harness = harness(Arc::new(FailingEngine { fail_at: 2 }));
    let user_id = connected_user(&harness).await;
    let (handle, deltas) = harness
        .jobs
        .create_streaming(user_id, request())
        .await
        .unwrap();

    let events: Vec<_> = deltas.into_stream().collect().await;
    let terminal = events.last().unwrap();
    assert_eq!(terminal.event_type, StreamEventType::Error);
    assert!(terminal.content.starts_with("generation failed:"));

    let job = harness.jobs.get(user_id, handle.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.progress < 100);
    assert!(job.metadata["error"].as_str().unwrap().contains("model overloaded"));
    assert_eq!(
        job.metadata["failed_section"],
        TemplateType::Comprehensive.sections()[2].title.as_str()
    );

    let events = progress_events(&harness.jobs, user_id, handle.job_id).await;
    let last = events.last().unwrap();
    assert_eq!(last.name(), "error");
    assert!(last.snapshot().error.is_some());
}

#[tokio::test]
async fn list_is_newest_first_and_scoped_to_owner() {
    let harness = harness(Arc::new(OutlineEngine::new()));
    let user_id = connected_user(&harness).await;
    let other = connected_user(&harness).await;

    let first = harness.jobs.create(user_id, request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = harness.jobs.create(user_id, request()).await.unwrap();
    harness.jobs.create(other, request()).await.unwrap();

    let listed = harness.jobs.list(user_id, None, None).await.unwrap();
    let ids: Vec<_> = listed.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![second.job_id, first.job_id]);

    let paged = harness.jobs.list(user_id, Some(1), Some(1)).await.unwrap();
    assert_eq!(paged.len(), 1);
    assert_eq!(paged[0].id, first.job_id);

    assert!(matches!(
        harness.jobs.get(other, first.job_id).await,
        Err(JobError::NotFound(_))
    ));
}

#[tokio::test]
async fn failing_source_is_dropped_and_reported() {
    let harness = harness_with_sources(
        Arc::new(OutlineEngine::new()),
        static_sources(Ok(12), Err(SourceError::Unauthorized)),
    );
    let user_id = connected_user(&harness).await;
    connect(&harness.connections, user_id, ServiceName::Drive).await;

    let handle = harness.jobs.create(user_id, request()).await.unwrap();
    let events = progress_events(&harness.jobs, user_id, handle.job_id).await;
    assert_eq!(events.last().unwrap().name(), "complete");

    let job = harness.jobs.get(user_id, handle.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.metadata["data_sources"], serde_json::json!(["gmail"]));
    assert_eq!(job.metadata["sources_failed"], serde_json::json!(["drive"]));
    assert_eq!(job.metadata["source_items"]["gmail"], 12);
    assert_eq!(job.metadata["total_items_fetched"], 12);
}

#[tokio::test]
async fn job_fails_when_every_source_search_fails() {
    let harness = harness_with_sources(
        Arc::new(OutlineEngine::new()),
        static_sources(
            Err(SourceError::Transport("connection reset".into())),
            Ok(3),
        ),
    );
    let user_id = connected_user(&harness).await;

    let handle = harness.jobs.create(user_id, request()).await.unwrap();
    progress_events(&harness.jobs, user_id, handle.job_id).await;

    let job = harness.jobs.get(user_id, handle.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.metadata["error"]
        .as_str()
        .unwrap()
        .contains("no connected data source"));
    assert!(job.metadata.get("failed_section").is_none());
}

#[tokio::test]
async fn preview_counts_per_connected_service() {
    let harness = harness_with_sources(
        Arc::new(OutlineEngine::new()),
        static_sources(
            Ok(40),
            Err(SourceError::Rejected {
                status: 403,
                detail: "insufficient scope".into(),
            }),
        ),
    );
    let user_id = connected_user(&harness).await;

    let preview = harness.jobs.preview(user_id, request()).await.unwrap();
    assert_eq!(preview.available_sources, vec![ServiceName::Gmail]);
    // Capped at the preview limit
    assert_eq!(preview.sample_count(ServiceName::Gmail), Some(10));
    assert!(!preview.estimated_results.contains_key(&ServiceName::Drive));

    connect(&harness.connections, user_id, ServiceName::Drive).await;
    let preview = harness.jobs.preview(user_id, request()).await.unwrap();
    assert_eq!(preview.available_sources, vec![ServiceName::Gmail]);
    let drive = serde_json::to_value(&preview.estimated_results[&ServiceName::Drive]).unwrap();
    assert!(drive["error"].as_str().unwrap().contains("insufficient scope"));

    let mut invalid = request();
    invalid.project_name.clear();
    assert!(matches!(
        harness.jobs.preview(user_id, invalid).await,
        Err(JobError::ScopeInvalid(_))
    ));
}

// =============================================================================
// HTTP engine
// =============================================================================

/// Engine service answering every section request with the chunks `script`
/// writes. The body ends when the script drops its sender.
async fn engine_server<F, Fut>(script: F) -> String
where
    F: Fn(mpsc::Sender<Bytes>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    use http_body_util::BodyExt;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let script = Arc::new(script);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let script = Arc::clone(&script);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let script = Arc::clone(&script);
                    async move {
                        let _ = req.into_body().collect().await;
                        let (tx, rx) = mpsc::channel::<Bytes>(8);
                        tokio::spawn((*script)(tx));
                        let frames = ReceiverStream::new(rx)
                            .map(|chunk| Ok::<_, Infallible>(Frame::data(chunk)));
                        let body = StreamBody::new(frames);
                        Ok::<_, Infallible>(Response::new(body))
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    base
}

async fn send_lines(tx: &mpsc::Sender<Bytes>, chunks: &[&'static str]) {
    for chunk in chunks {
        if tx.send(Bytes::from_static(chunk.as_bytes())).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn http_engine(base: &str) -> HttpContentEngine {
    HttpContentEngine::new(base, Duration::from_secs(2)).unwrap()
}

fn section_request() -> SectionRequest {
    let (scope, options) = request().into_parts("gpt-4").unwrap();
    let sections = TemplateType::Comprehensive.sections();
    SectionRequest {
        job_id: Uuid::new_v4(),
        index: 0,
        total: sections.len(),
        section: sections[0].clone(),
        scope,
        options,
        sources: Arc::new(Vec::new()),
    }
}

async fn drain(engine: &HttpContentEngine) -> Vec<Result<String, EngineError>> {
    let deltas = engine.generate_section(section_request()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), deltas.collect::<Vec<_>>())
        .await
        .unwrap()
}

#[tokio::test]
async fn http_engine_error_frame_ends_the_section() {
    let base = engine_server(|tx| async move {
        send_lines(
            &tx,
            &[
                "{\"delta\":\"Intro \"}\n",
                "{\"error\":\"quota exhausted\"}\n",
                "{\"delta\":\"never read\"}\n",
            ],
        )
        .await;
    })
    .await;

    let frames = drain(&http_engine(&base)).await;
    assert_eq!(
        frames,
        vec![
            Ok("Intro ".to_string()),
            Err(EngineError::Rejected("quota exhausted".into())),
        ]
    );
}

#[tokio::test]
async fn http_engine_eof_without_done_is_a_protocol_error() {
    let base = engine_server(|tx| async move {
        send_lines(&tx, &["{\"delta\":\"a\"}\n", "{\"delta\":\"b\"}\n"]).await;
    })
    .await;

    let frames = drain(&http_engine(&base)).await;
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0], Ok("a".to_string()));
    assert_eq!(frames[1], Ok("b".to_string()));
    assert!(matches!(
        &frames[2],
        Err(EngineError::Protocol(detail)) if detail.contains("before done")
    ));
}

#[tokio::test]
async fn http_engine_accepts_final_done_without_newline() {
    let base = engine_server(|tx| async move {
        send_lines(
            &tx,
            &["{\"delta\":\"a\"}\n{\"del", "ta\":\"b\"}\n", "{\"done\":true}"],
        )
        .await;
    })
    .await;

    let frames = drain(&http_engine(&base)).await;
    assert_eq!(frames, vec![Ok("a".to_string()), Ok("b".to_string())]);
}

#[tokio::test]
async fn http_engine_stops_reading_when_consumer_drops() {
    let (gone_tx, gone_rx) = oneshot::channel::<()>();
    let gone_tx = Arc::new(std::sync::Mutex::new(Some(gone_tx)));
    let base = engine_server(move |tx| {
        let gone_tx = Arc::clone(&gone_tx);
        async move {
            while tx.send(Bytes::from_static(b"{\"delta\":\"x \"}\n")).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            if let Some(gone) = gone_tx.lock().unwrap().take() {
                let _ = gone.send(());
            }
        }
    })
    .await;

    let engine = http_engine(&base);
    let mut deltas = engine.generate_section(section_request()).await.unwrap();
    assert_eq!(deltas.next().await, Some(Ok("x ".to_string())));
    drop(deltas);

    // The engine pump drops the response, which closes the connection
    tokio::time::timeout(Duration::from_secs(5), gone_rx)
        .await
        .expect("engine kept the response open after the consumer left")
        .unwrap();
}

#[tokio::test]
async fn truncated_engine_stream_fails_the_job_at_that_section() {
    let base = engine_server(|tx| async move {
        send_lines(&tx, &["{\"delta\":\"Half a sentence\"}\n"]).await;
    })
    .await;
    let harness = harness(Arc::new(http_engine(&base)));
    let user_id = connected_user(&harness).await;

    let handle = harness.jobs.create(user_id, request()).await.unwrap();
    let events = progress_events(&harness.jobs, user_id, handle.job_id).await;
    assert_eq!(events.last().unwrap().name(), "error");

    let job = harness.jobs.get(user_id, handle.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.metadata["error"]
        .as_str()
        .unwrap()
        .contains("stream ended before done"));
    assert_eq!(
        job.metadata["failed_section"],
        TemplateType::Comprehensive.sections()[0].title.as_str()
    );
}
