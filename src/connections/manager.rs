//! Connection lifecycle manager.
//!
//! Owns per-(user, service) OAuth state: consent (grant / complete grant),
//! credential rotation, revocation and health reporting.
//!
//! ## Single-flight refresh
//!
//! Rotating a refresh credential twice in parallel can invalidate the first
//! result at the provider. Concurrent `refresh` calls for the same key are
//! therefore coalesced: the first caller registers an in-flight entry holding a
//! broadcast sender and starts the rotation on its own task, later callers
//! subscribe to that sender. The entry is removed before the result is
//! broadcast, so a caller arriving afterwards starts a fresh rotation instead
//! of missing the result. A rotation task that dies still removes its entry.
//!
//! Writes that follow a provider call are compare-and-set: a rotation only
//! lands on the refresh credential it started from, so a `revoke` that wins
//! the race stays revoked.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::error::ConnectionError;
use super::health::{ConnectionHealthReport, ServiceHealth};
use super::model::{ConnectionKey, ConnectionStatus, ServiceConnection, ServiceName};
use super::provider::{
    OAuthProvider, ProviderError, ProviderRegistry, TokenGrant, DEFAULT_EXPIRES_IN_SECS,
};
use super::store::ConnectionStore;
use super::vault::{CredentialHandle, CredentialVault};
use crate::crypto::{random_token, Pkce};

/// Rounds a caller will join before giving up on a vanished refresh
const MAX_REFRESH_ROUNDS: usize = 3;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Credentials expiring within this window are rotated before use
    pub refresh_buffer: Duration,
    /// Lifetime of an outstanding consent
    pub pending_grant_ttl: Duration,
    /// Expired connections older than this are disconnected by the sweeper
    pub expired_retention: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            refresh_buffer: Duration::minutes(5),
            pending_grant_ttl: Duration::minutes(5),
            expired_retention: Duration::days(30),
        }
    }
}

// =============================================================================
// Types
// =============================================================================

/// Result of starting a grant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GrantOutcome {
    /// Send the user agent here to give consent
    Redirect { redirect_url: String },
    /// Nothing to do; the service is already connected and healthy
    AlreadyConnected { connection: ServiceConnection },
}

/// Query parameters the provider sends back to the callback
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderCallback {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Outcome of one sweeper pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub disconnected: usize,
    pub abandoned_grants: usize,
}

struct PendingGrant {
    key: ConnectionKey,
    verifier: Zeroizing<String>,
    expires_at: DateTime<Utc>,
}

type RefreshResult = Result<ServiceConnection, ConnectionError>;

struct InFlightRefresh {
    sender: broadcast::Sender<RefreshResult>,
    started_at: Instant,
}

type InFlightMap = DashMap<ConnectionKey, InFlightRefresh>;

/// Removes an in-flight entry when its rotation task ends, panics included
struct InFlightGuard {
    in_flight: Arc<InFlightMap>,
    key: ConnectionKey,
    armed: bool,
}

impl InFlightGuard {
    fn release(mut self) -> Option<InFlightRefresh> {
        self.armed = false;
        self.in_flight.remove(&self.key).map(|(_, entry)| entry)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.armed {
            self.in_flight.remove(&self.key);
        }
    }
}

/// Credentials sealed for a grant that is not yet stored
struct SealedGrant {
    access: CredentialHandle,
    refresh: Option<CredentialHandle>,
}

/// Handles detached inside a store mutation, purged once it commits
#[derive(Default)]
struct Detached(Mutex<Vec<CredentialHandle>>);

impl Detached {
    fn set(&self, handles: Vec<CredentialHandle>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = handles;
    }

    fn take(self) -> Vec<CredentialHandle> {
        self.0.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State shared with spawned rotation tasks
struct LifecycleCore {
    config: ConnectionConfig,
    store: Arc<dyn ConnectionStore>,
    providers: ProviderRegistry,
    vault: Arc<CredentialVault>,
    rotations: AtomicU64,
}

// =============================================================================
// Manager
// =============================================================================

pub struct ConnectionLifecycleManager {
    core: Arc<LifecycleCore>,
    pending: DashMap<String, PendingGrant>,
    in_flight: Arc<InFlightMap>,
}

impl ConnectionLifecycleManager {
    pub fn new(
        config: ConnectionConfig,
        store: Arc<dyn ConnectionStore>,
        providers: ProviderRegistry,
        vault: Arc<CredentialVault>,
    ) -> Self {
        Self {
            core: Arc::new(LifecycleCore {
                config,
                store,
                providers,
                vault,
                rotations: AtomicU64::new(0),
            }),
            pending: DashMap::new(),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.core.config
    }

    /// Services a user can connect
    pub fn services(&self) -> Vec<ServiceName> {
        self.core.providers.services()
    }

    /// Number of provider refresh calls made since startup
    pub fn rotations_performed(&self) -> u64 {
        self.core.rotations.load(Ordering::Relaxed)
    }

    /// Current connection, with expiry applied
    pub async fn connection(
        &self,
        user_id: Uuid,
        service: ServiceName,
    ) -> Result<ServiceConnection, ConnectionError> {
        self.core.provider(service)?;
        self.core
            .load(ConnectionKey::new(user_id, service), Utc::now())
            .await
    }

    /// Start OAuth consent for a service.
    pub async fn grant(
        &self,
        user_id: Uuid,
        service: ServiceName,
    ) -> Result<GrantOutcome, ConnectionError> {
        let provider = self.core.provider(service)?;
        let key = ConnectionKey::new(user_id, service);
        let now = Utc::now();
        let mut connection = self.core.load(key, now).await?;

        if connection.is_healthy(now) {
            debug!(user_id = %user_id, service = %service, "Grant skipped, already connected");
            return Ok(GrantOutcome::AlreadyConnected { connection });
        }

        for handle in connection.clear_credentials() {
            self.core.vault.purge(&handle);
        }
        connection.last_error = None;
        connection.transition(ConnectionStatus::PendingGrant, now)?;
        self.core.store.put(connection).await?;

        // One outstanding consent per connection
        self.pending.retain(|_, pending| pending.key != key);

        let pkce = Pkce::generate();
        let state = random_token();
        let redirect_url = provider.authorization_url(&state, &pkce.challenge);
        self.pending.insert(
            state,
            PendingGrant {
                key,
                verifier: pkce.verifier,
                expires_at: now + self.core.config.pending_grant_ttl,
            },
        );

        info!(user_id = %user_id, service = %service, "Connection grant started");
        Ok(GrantOutcome::Redirect { redirect_url })
    }

    /// Exchange the provider callback for credentials.
    ///
    /// Any failure returns the connection to `disconnected`.
    pub async fn complete_grant(
        &self,
        user_id: Uuid,
        service: ServiceName,
        callback: ProviderCallback,
    ) -> Result<ServiceConnection, ConnectionError> {
        let key = ConnectionKey::new(user_id, service);
        let now = Utc::now();

        match self.exchange_grant(key, callback, now).await {
            Ok(connection) => {
                info!(
                    user_id = %user_id,
                    service = %service,
                    expires_at = ?connection.expires_at,
                    "Connection granted"
                );
                Ok(connection)
            }
            Err(err) => {
                warn!(user_id = %user_id, service = %service, error = %err, "Connection grant failed");
                self.abandon_grant(key, &err, now).await;
                Err(err)
            }
        }
    }

    async fn exchange_grant(
        &self,
        key: ConnectionKey,
        callback: ProviderCallback,
        now: DateTime<Utc>,
    ) -> Result<ServiceConnection, ConnectionError> {
        if let Some(error) = callback.error {
            let detail = callback.error_description.unwrap_or(error);
            return Err(ConnectionError::Grant(format!(
                "provider denied consent: {}",
                detail
            )));
        }

        let state = callback
            .state
            .ok_or_else(|| ConnectionError::Grant("callback is missing state".into()))?;
        let (state, pending) = self
            .pending
            .remove(&state)
            .ok_or_else(|| ConnectionError::Grant("unknown or already used grant state".into()))?;

        if pending.key != key {
            self.pending.insert(state, pending);
            return Err(ConnectionError::Grant(
                "grant state belongs to a different connection".into(),
            ));
        }
        if pending.expires_at <= now {
            return Err(ConnectionError::Grant(
                "consent window expired; grant access again".into(),
            ));
        }

        let code = callback
            .code
            .filter(|code| !code.is_empty())
            .ok_or_else(|| ConnectionError::Grant("callback is missing code".into()))?;

        let provider = self.core.provider(key.service)?;
        let grant = provider
            .exchange_code(&code, &pending.verifier)
            .await
            .map_err(|err| match err {
                ProviderError::Transport(_) => ConnectionError::Provider(err),
                other => ConnectionError::Grant(format!("code exchange failed: {}", other)),
            })?;

        let expires_in = grant.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        if expires_in <= 0 {
            return Err(ConnectionError::Grant(
                "provider issued an already expired credential".into(),
            ));
        }

        let mut connection = self.core.load(key, now).await?;
        connection.transition(ConnectionStatus::Connected, now)?;
        for handle in connection.clear_credentials() {
            self.core.vault.purge(&handle);
        }
        let sealed = self.core.seal_grant(&grant)?;
        apply_grant(&mut connection, &sealed, &grant, expires_in, now);
        connection.connected_at = Some(now);
        connection.last_error = None;
        self.core.store.put(connection.clone()).await?;
        Ok(connection)
    }

    async fn abandon_grant(&self, key: ConnectionKey, err: &ConnectionError, now: DateTime<Utc>) {
        let detail = err.to_string();
        let result = self
            .core
            .store
            .modify(key, &|connection| {
                if connection.status == ConnectionStatus::PendingGrant {
                    connection.status = ConnectionStatus::Disconnected;
                    connection.last_error = Some(detail.clone());
                    connection.updated_at = now;
                }
                Ok(())
            })
            .await;
        if let Err(store_err) = result {
            warn!(error = %store_err, "Failed to reset abandoned grant");
        }
    }

    /// Rotate the access credential. Single-flight per (user, service).
    pub async fn refresh(
        &self,
        user_id: Uuid,
        service: ServiceName,
    ) -> Result<ServiceConnection, ConnectionError> {
        let key = ConnectionKey::new(user_id, service);

        for round in 1..=MAX_REFRESH_ROUNDS {
            match self.refresh_round(key).await {
                Err(ConnectionError::RefreshConflict(_)) => {
                    debug!(user_id = %user_id, service = %service, round, "Refresh round vanished, retrying");
                }
                result => return result,
            }
        }

        Err(ConnectionError::Provider(ProviderError::Transport(
            "credential refresh did not complete".into(),
        )))
    }

    async fn refresh_round(&self, key: ConnectionKey) -> RefreshResult {
        let mut receiver = self.join_or_start_refresh(key);
        receiver
            .recv()
            .await
            .map_err(|_| ConnectionError::RefreshConflict(key.service))?
    }

    fn join_or_start_refresh(&self, key: ConnectionKey) -> broadcast::Receiver<RefreshResult> {
        let (sender, receiver) = match self.in_flight.entry(key) {
            Entry::Occupied(existing) => {
                debug!(
                    user_id = %key.user_id,
                    service = %key.service,
                    waiting = existing.get().sender.receiver_count(),
                    "Joining in-flight refresh"
                );
                return existing.get().sender.subscribe();
            }
            Entry::Vacant(slot) => {
                let (sender, receiver) = broadcast::channel(1);
                slot.insert(InFlightRefresh {
                    sender: sender.clone(),
                    started_at: Instant::now(),
                });
                (sender, receiver)
            }
        };

        let core = Arc::clone(&self.core);
        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            key,
            armed: true,
        };
        tokio::spawn(async move {
            let result = core.rotate(key).await;

            if let Some(entry) = guard.release() {
                debug!(
                    user_id = %key.user_id,
                    service = %key.service,
                    waiting = entry.sender.receiver_count(),
                    duration_ms = entry.started_at.elapsed().as_millis() as u64,
                    ok = result.is_ok(),
                    "Refresh settled"
                );
            }
            let _ = sender.send(result);
        });

        receiver
    }

    /// Clear stored credentials and disconnect. Idempotent.
    pub async fn revoke(&self, user_id: Uuid, service: ServiceName) -> Result<(), ConnectionError> {
        let key = ConnectionKey::new(user_id, service);
        let now = Utc::now();
        self.pending.retain(|_, pending| pending.key != key);

        // Detach whatever credentials are current, so a rotation finishing
        // later finds nothing to land on
        let detached = Detached::default();
        let revoked = self
            .core
            .store
            .modify(key, &|connection| {
                let handles = connection.clear_credentials();
                connection.last_error = None;
                connection.transition(ConnectionStatus::Disconnected, now)?;
                detached.set(handles);
                Ok(())
            })
            .await?;
        if revoked.is_none() {
            return Ok(());
        }

        let handles = detached.take();
        // Revoking the refresh credential (last, when present) ends the whole grant
        if let (Some(provider), Some(handle)) = (self.core.providers.get(service), handles.last()) {
            match self.core.vault.open(handle) {
                Ok(token) => {
                    if let Err(err) = provider.revoke(&token).await {
                        warn!(
                            user_id = %user_id,
                            service = %service,
                            error = %err,
                            "Provider revocation failed, dropping credentials locally"
                        );
                    }
                }
                Err(err) => debug!(error = %err, "Credential already gone from vault"),
            }
        }
        for handle in &handles {
            self.core.vault.purge(handle);
        }

        info!(user_id = %user_id, service = %service, "Connection revoked");
        Ok(())
    }

    /// Health report for every connectable service.
    ///
    /// Read-only with respect to credentials: nothing is rotated here.
    pub async fn health(&self, user_id: Uuid) -> ConnectionHealthReport {
        self.health_at(user_id, Utc::now()).await
    }

    pub async fn health_at(&self, user_id: Uuid, now: DateTime<Utc>) -> ConnectionHealthReport {
        match self.collect_health(user_id, now).await {
            Ok(services) => ConnectionHealthReport::from_services(user_id, services, now),
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "Connection health check failed");
                ConnectionHealthReport::failed(user_id, err.to_string(), now)
            }
        }
    }

    async fn collect_health(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<ServiceName, ServiceHealth>, ConnectionError> {
        let buffer = self.core.config.refresh_buffer;
        let mut services = BTreeMap::new();

        for service in self.core.providers.services() {
            let key = ConnectionKey::new(user_id, service);
            let checked = self
                .core
                .store
                .modify(key, &|connection| {
                    connection.observe(now);
                    connection.last_checked_at = Some(now);
                    Ok(())
                })
                .await?;
            let connection =
                checked.unwrap_or_else(|| ServiceConnection::disconnected(user_id, service, now));
            services.insert(
                service,
                ServiceHealth::from_connection(&connection, now, buffer),
            );
        }

        Ok(services)
    }

    /// A usable access credential, rotated first when close to expiry
    pub async fn access_token(
        &self,
        user_id: Uuid,
        service: ServiceName,
    ) -> Result<Zeroizing<String>, ConnectionError> {
        let now = Utc::now();
        let mut connection = self
            .core
            .load(ConnectionKey::new(user_id, service), now)
            .await?;

        if !connection.holds_credentials() {
            return Err(ConnectionError::ConnectionRequired(service));
        }

        if connection.status != ConnectionStatus::Connected
            || connection.expires_within(now, self.core.config.refresh_buffer)
        {
            connection = self.refresh(user_id, service).await?;
        }

        let handle = connection
            .access_handle
            .as_ref()
            .ok_or(ConnectionError::ConnectionRequired(service))?;
        Ok(self.core.vault.open(handle)?)
    }

    /// Apply expiry, retire long-expired connections and stale consents
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, ConnectionError> {
        let mut report = SweepReport::default();

        let before = self.pending.len();
        self.pending.retain(|_, pending| pending.expires_at > now);
        let live_grants: Vec<ConnectionKey> = self.pending.iter().map(|p| p.key).collect();
        debug!(dropped = before - self.pending.len(), "Stale consents dropped");

        let retention = self.core.config.expired_retention;
        for connection in self.core.store.list_all().await? {
            let key = connection.key();
            match connection.status {
                ConnectionStatus::Connected
                    if connection.expires_at.map_or(false, |at| at <= now) =>
                {
                    self.core
                        .store
                        .modify(key, &|c| {
                            c.observe(now);
                            Ok(())
                        })
                        .await?;
                    report.expired += 1;
                }
                ConnectionStatus::Expired
                    if connection.expires_at.map_or(true, |at| at + retention <= now) =>
                {
                    self.revoke(key.user_id, key.service).await?;
                    report.disconnected += 1;
                }
                ConnectionStatus::PendingGrant if !live_grants.contains(&key) => {
                    self.core
                        .store
                        .modify(key, &|c| {
                            if c.status == ConnectionStatus::PendingGrant {
                                c.status = ConnectionStatus::Disconnected;
                                c.updated_at = now;
                            }
                            Ok(())
                        })
                        .await?;
                    report.abandoned_grants += 1;
                }
                _ => {}
            }
        }

        Ok(report)
    }
}

impl LifecycleCore {
    fn provider(&self, service: ServiceName) -> Result<Arc<dyn OAuthProvider>, ConnectionError> {
        self.providers
            .get(service)
            .ok_or(ConnectionError::UnsupportedService(service))
    }

    /// Stored connection with expiry applied, or a fresh disconnected one
    async fn load(
        &self,
        key: ConnectionKey,
        now: DateTime<Utc>,
    ) -> Result<ServiceConnection, ConnectionError> {
        let observed = self
            .store
            .modify(key, &|connection| {
                connection.observe(now);
                Ok(())
            })
            .await?;
        Ok(observed
            .unwrap_or_else(|| ServiceConnection::disconnected(key.user_id, key.service, now)))
    }

    fn seal_grant(&self, grant: &TokenGrant) -> Result<SealedGrant, ConnectionError> {
        let access = self.vault.seal(&grant.access_token)?;
        let refresh = match &grant.refresh_token {
            Some(token) => match self.vault.seal(token) {
                Ok(handle) => Some(handle),
                Err(err) => {
                    self.vault.purge(&access);
                    return Err(err.into());
                }
            },
            None => None,
        };
        Ok(SealedGrant { access, refresh })
    }

    fn discard(&self, sealed: SealedGrant) {
        self.vault.purge(&sealed.access);
        if let Some(refresh) = &sealed.refresh {
            self.vault.purge(refresh);
        }
    }

    fn purge_all(&self, handles: Vec<CredentialHandle>) {
        for handle in &handles {
            self.vault.purge(handle);
        }
    }

    async fn rotate(&self, key: ConnectionKey) -> RefreshResult {
        let connection = self.load(key, Utc::now()).await?;
        match connection.status {
            ConnectionStatus::Disconnected | ConnectionStatus::PendingGrant => {
                return Err(ConnectionError::ConnectionRequired(key.service));
            }
            _ => {}
        }
        let Some(refresh_handle) = connection.refresh_handle.clone() else {
            return Err(ConnectionError::TokenExpired(key.service));
        };

        let refresh_token = self.vault.open(&refresh_handle)?;
        let provider = self.provider(key.service)?;
        self.rotations.fetch_add(1, Ordering::Relaxed);

        let outcome = provider
            .refresh(&refresh_token)
            .await
            .and_then(|grant| match grant.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS) {
                secs if secs > 0 => Ok((grant, secs)),
                _ => Err(ProviderError::InvalidResponse(
                    "refreshed credential is already expired".into(),
                )),
            });

        let now = Utc::now();
        match outcome {
            Ok((grant, expires_in)) => {
                self.commit_rotation(key, &refresh_handle, &grant, expires_in, now)
                    .await
            }
            Err(ProviderError::InvalidGrant(detail)) => {
                warn!(
                    user_id = %key.user_id,
                    service = %key.service,
                    detail = %detail,
                    "Refresh credential rejected, disconnecting"
                );
                let detached = Detached::default();
                self.store
                    .modify(key, &|c| {
                        still_current(c, &refresh_handle, key.service)?;
                        let handles = c.clear_credentials();
                        c.last_error = Some(detail.clone());
                        c.transition(ConnectionStatus::Disconnected, now)?;
                        detached.set(handles);
                        Ok(())
                    })
                    .await?
                    .ok_or(ConnectionError::ConnectionRequired(key.service))?;
                self.purge_all(detached.take());
                Err(ConnectionError::TokenExpired(key.service))
            }
            Err(err) => {
                warn!(
                    user_id = %key.user_id,
                    service = %key.service,
                    error = %err,
                    "Credential refresh failed"
                );
                let detail = err.to_string();
                self.store
                    .modify(key, &|c| {
                        still_current(c, &refresh_handle, key.service)?;
                        c.last_error = Some(detail.clone());
                        c.transition(ConnectionStatus::Error, now)?;
                        Ok(())
                    })
                    .await?
                    .ok_or(ConnectionError::ConnectionRequired(key.service))?;
                Err(ConnectionError::Provider(err))
            }
        }
    }

    /// Store a refreshed grant, unless the connection moved on meanwhile
    async fn commit_rotation(
        &self,
        key: ConnectionKey,
        refresh_handle: &CredentialHandle,
        grant: &TokenGrant,
        expires_in: i64,
        now: DateTime<Utc>,
    ) -> RefreshResult {
        let sealed = self.seal_grant(grant)?;
        let replaced = Detached::default();
        let committed = self
            .store
            .modify(key, &|c| {
                still_current(c, refresh_handle, key.service)?;
                c.transition(ConnectionStatus::Connected, now)?;
                c.last_error = None;
                replaced.set(apply_grant(c, &sealed, grant, expires_in, now));
                Ok(())
            })
            .await;

        match committed {
            Ok(Some(connection)) => {
                self.purge_all(replaced.take());
                info!(
                    user_id = %key.user_id,
                    service = %key.service,
                    expires_at = ?connection.expires_at,
                    "Credential rotated"
                );
                Ok(connection)
            }
            Ok(None) => {
                self.discard(sealed);
                Err(ConnectionError::ConnectionRequired(key.service))
            }
            Err(err) => {
                debug!(
                    user_id = %key.user_id,
                    service = %key.service,
                    error = %err,
                    "Rotated credential discarded"
                );
                self.discard(sealed);
                Err(err)
            }
        }
    }
}

/// A rotation may only land on the grant it started from
fn still_current(
    connection: &ServiceConnection,
    refresh_handle: &CredentialHandle,
    service: ServiceName,
) -> Result<(), ConnectionError> {
    if connection.holds_credentials() && connection.refresh_handle.as_ref() == Some(refresh_handle) {
        Ok(())
    } else {
        Err(ConnectionError::ConnectionRequired(service))
    }
}

/// Point a connection at freshly sealed credentials. Returns the handles it replaced.
fn apply_grant(
    connection: &mut ServiceConnection,
    sealed: &SealedGrant,
    grant: &TokenGrant,
    expires_in: i64,
    now: DateTime<Utc>,
) -> Vec<CredentialHandle> {
    let mut replaced: Vec<CredentialHandle> = connection
        .access_handle
        .replace(sealed.access.clone())
        .into_iter()
        .collect();
    if let Some(refresh) = &sealed.refresh {
        replaced.extend(connection.refresh_handle.replace(refresh.clone()));
    }
    if !grant.scopes.is_empty() {
        connection.scopes = grant.scopes.clone();
    }
    connection.expires_at = Some(now + Duration::seconds(expires_in));
    connection.last_checked_at = Some(now);
    replaced
}

// ============================================================================
// Background Sweep Task
// ============================================================================

/// Spawn a background task that periodically applies expiry to connections
pub fn spawn_connection_sweep_task(
    manager: Arc<ConnectionLifecycleManager>,
    interval: std::time::Duration,
) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match manager.sweep(Utc::now()).await {
                Ok(report) => debug!(
                    expired = report.expired,
                    disconnected = report.disconnected,
                    abandoned_grants = report.abandoned_grants,
                    "Connection sweep completed"
                ),
                Err(err) => warn!(error = %err, "Connection sweep failed"),
            }
        }
    });

    info!(
        interval_secs = interval.as_secs(),
        "Connection sweep task started"
    );
}
