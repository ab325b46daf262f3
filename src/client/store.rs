//! Client-side state container
//!
//! Identity resolves in two phases: the cached profile is shown at once, then
//! the server is asked. The server always wins. A 401 anywhere clears the
//! identity and connection caches before the error reaches the caller.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::api::ApiClient;
use super::backoff::Backoff;
use super::cache::IdentityCache;
use super::progress::follow_progress;
use crate::connections::{ConnectionHealthReport, GrantOutcome, ServiceName};
use crate::identity::User;
use crate::jobs::{GenerationJob, GenerationRequest, JobHandle, JobSummary};
use crate::stream::ProgressSnapshot;
use crate::types::CasebookError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthState {
    #[default]
    Unknown,
    Authenticated,
    Unauthenticated,
}

/// Everything presentation code reads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientState {
    pub auth: AuthState,
    pub user: Option<User>,
    /// True once the server has confirmed or denied the identity
    pub verified: bool,
    pub loading: bool,
    pub connections: Option<ConnectionHealthReport>,
    pub jobs: Vec<JobSummary>,
    /// Latest known snapshot per job
    pub job_details: BTreeMap<Uuid, ProgressSnapshot>,
    pub last_error: Option<String>,
}

impl ClientState {
    pub fn is_authenticated(&self) -> bool {
        self.auth == AuthState::Authenticated
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound on initial revalidation
    pub init_timeout: Duration,
    /// Template for progress-stream reconnects
    pub backoff: Backoff,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(10),
            backoff: Backoff::default(),
        }
    }
}

/// Whether `incoming` may replace `existing`. Snapshots never move backwards.
fn supersedes(existing: Option<&ProgressSnapshot>, incoming: &ProgressSnapshot) -> bool {
    match existing {
        None => true,
        Some(existing) if existing.is_terminal() => false,
        Some(_) if incoming.is_terminal() => true,
        Some(existing) => incoming.progress >= existing.progress,
    }
}

pub struct ClientSyncStore {
    api: Arc<dyn ApiClient>,
    cache: Arc<dyn IdentityCache>,
    config: SyncConfig,
    state: watch::Sender<ClientState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientSyncStore {
    pub fn new(api: Arc<dyn ApiClient>, cache: Arc<dyn IdentityCache>, config: SyncConfig) -> Self {
        let (state, _) = watch::channel(ClientState::default());
        Self {
            api,
            cache,
            config,
            state,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> ClientState {
        self.state.borrow().clone()
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Fast path: show the cached identity, unverified
    pub fn load_cached(&self) {
        let cached = self.cache.load();
        self.state.send_modify(|state| {
            state.loading = true;
            state.verified = false;
            match cached {
                Some(user) => {
                    state.auth = AuthState::Authenticated;
                    state.user = Some(user);
                }
                None => {
                    state.auth = AuthState::Unknown;
                    state.user = None;
                }
            }
        });
    }

    /// Both phases, bounded by `init_timeout`
    pub async fn initialize(&self) -> ClientState {
        self.load_cached();
        self.revalidate_bounded().await;
        self.snapshot()
    }

    /// Load the cache now and revalidate in the background
    pub fn spawn_initialize(self: &Arc<Self>) {
        self.load_cached();
        let store = Arc::clone(self);
        let handle = tokio::spawn(async move {
            store.revalidate_bounded().await;
        });
        self.track(handle);
    }

    async fn revalidate_bounded(&self) {
        match tokio::time::timeout(self.config.init_timeout, self.api.me()).await {
            Ok(Ok(user)) => {
                if let Err(e) = self.cache.store(&user) {
                    warn!(error = %e, "Failed to cache identity");
                }
                info!(user_id = %user.id, "Session confirmed");
                self.state.send_modify(|state| {
                    state.auth = AuthState::Authenticated;
                    state.user = Some(user);
                    state.verified = true;
                    state.loading = false;
                    state.last_error = None;
                });
                if let Err(e) = self.refresh_connections().await {
                    debug!(error = %e, "Connection status unavailable after login");
                }
            }
            Ok(Err(CasebookError::Unauthorized(detail))) => {
                self.clear_session(&detail);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Identity revalidation failed");
                self.settle_unauthenticated(e.to_string());
            }
            Err(_) => {
                warn!(timeout = ?self.config.init_timeout, "Identity revalidation timed out");
                self.settle_unauthenticated("identity check timed out".into());
            }
        }
    }

    /// Server unreachable: not authenticated, cache kept for the next attempt
    fn settle_unauthenticated(&self, detail: String) {
        self.state.send_modify(|state| {
            state.auth = AuthState::Unauthenticated;
            state.user = None;
            state.verified = false;
            state.loading = false;
            state.last_error = Some(detail);
        });
    }

    /// Server denied the session: drop identity and connection caches
    fn clear_session(&self, detail: &str) {
        info!("Session rejected by server, clearing local state");
        self.cache.clear();
        self.state.send_modify(|state| {
            state.auth = AuthState::Unauthenticated;
            state.user = None;
            state.verified = true;
            state.loading = false;
            state.connections = None;
            state.jobs.clear();
            state.job_details.clear();
            state.last_error = Some(detail.to_string());
        });
    }

    fn guard<T>(&self, result: Result<T, CasebookError>) -> Result<T, CasebookError> {
        if let Err(CasebookError::Unauthorized(detail)) = &result {
            self.clear_session(detail);
        }
        result
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Stop background work and reset to the initial state
    pub fn teardown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        self.state.send_replace(ClientState::default());
    }

    // =========================================================================
    // Identity and connections
    // =========================================================================

    pub async fn logout(&self) -> Result<(), CasebookError> {
        let result = self.api.logout().await;
        self.clear_session("logged out");
        match result {
            Err(CasebookError::Unauthorized(_)) => Ok(()),
            other => other,
        }
    }

    pub async fn refresh_connections(&self) -> Result<ConnectionHealthReport, CasebookError> {
        let report = self.guard(self.api.connection_status().await)?;
        self.state
            .send_modify(|state| state.connections = Some(report.clone()));
        Ok(report)
    }

    pub async fn grant_connection(&self, service: ServiceName) -> Result<GrantOutcome, CasebookError> {
        self.guard(self.api.grant_connection(service).await)
    }

    pub async fn revoke_connection(&self, service: ServiceName) -> Result<(), CasebookError> {
        self.guard(self.api.revoke_connection(service).await)?;
        self.refresh_connections().await?;
        Ok(())
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    pub async fn refresh_jobs(
        &self,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<JobSummary>, CasebookError> {
        let jobs = self.guard(self.api.list_jobs(limit, offset).await)?;
        self.state.send_modify(|state| state.jobs = jobs.clone());
        Ok(jobs)
    }

    pub async fn create_job(&self, request: &GenerationRequest) -> Result<JobHandle, CasebookError> {
        self.guard(self.api.create_job(request).await)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<GenerationJob, CasebookError> {
        let job = self.guard(self.api.get_job(job_id).await)?;
        self.apply_snapshot(ProgressSnapshot::from_job(&job));
        Ok(job)
    }

    pub async fn cancel_job(&self, job_id: Uuid) -> Result<GenerationJob, CasebookError> {
        let job = self.guard(self.api.cancel_job(job_id).await)?;
        self.apply_snapshot(ProgressSnapshot::from_job(&job));
        Ok(job)
    }

    pub async fn delete_job(&self, job_id: Uuid) -> Result<(), CasebookError> {
        self.guard(self.api.delete_job(job_id).await)?;
        self.state.send_modify(|state| {
            state.jobs.retain(|job| job.id != job_id);
            state.job_details.remove(&job_id);
        });
        Ok(())
    }

    /// Fold a snapshot into the view. Returns false when it would regress.
    pub fn apply_snapshot(&self, snapshot: ProgressSnapshot) -> bool {
        self.state.send_if_modified(|state| {
            if !supersedes(state.job_details.get(&snapshot.job_id), &snapshot) {
                return false;
            }
            if let Some(summary) = state.jobs.iter_mut().find(|job| job.id == snapshot.job_id) {
                summary.status = snapshot.status;
                summary.progress = summary.progress.max(snapshot.progress);
                summary.current_section = snapshot.current_section.clone();
            }
            state.job_details.insert(snapshot.job_id, snapshot);
            true
        })
    }

    /// Track a job through its progress stream until it settles
    pub async fn follow_job(&self, job_id: Uuid) -> Result<ProgressSnapshot, CasebookError> {
        let mut backoff = self.config.backoff.clone();
        let result = follow_progress(self.api.as_ref(), job_id, &mut backoff, |event| {
            self.apply_snapshot(event.snapshot().clone());
        })
        .await;
        self.guard(result)
    }

    pub fn spawn_follow_job(self: &Arc<Self>, job_id: Uuid) {
        let store = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = store.follow_job(job_id).await {
                warn!(job_id = %job_id, error = %e, "Stopped following job");
                store
                    .state
                    .send_modify(|state| state.last_error = Some(e.to_string()));
            }
        });
        self.track(handle);
    }
}
