//! Connection lifecycle: single-flight refresh, health reduction, revocation

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use casebook::connections::{
    ConnectionConfig, ConnectionError, ConnectionKey, ConnectionLifecycleManager,
    ConnectionMutation, ConnectionStatus, ConnectionStore, CredentialVault, GrantOutcome,
    InMemoryConnectionStore, LoopbackProvider, OAuthProvider, OverallHealth, ProviderCallback,
    ProviderError, ProviderProfile, ProviderRegistry, ServiceConnection, ServiceName, TokenGrant,
};

/// Loopback provider whose refresh is slow and counted
struct CountingProvider {
    inner: LoopbackProvider,
    refreshes: AtomicUsize,
    delay: Duration,
    reject_refresh: AtomicBool,
    panic_next: AtomicBool,
}

impl CountingProvider {
    fn new(service: ServiceName, access_ttl_secs: i64) -> Self {
        Self {
            inner: LoopbackProvider::new(format!(
                "http://localhost:8001/auth/connections/{}/callback",
                service
            ))
            .with_access_ttl(access_ttl_secs),
            refreshes: AtomicUsize::new(0),
            delay: Duration::from_millis(100),
            reject_refresh: AtomicBool::new(false),
            panic_next: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl OAuthProvider for CountingProvider {
    fn name(&self) -> &str {
        "counting"
    }

    fn authorization_url(&self, state: &str, code_challenge: &str) -> String {
        self.inner.authorization_url(state, code_challenge)
    }

    async fn exchange_code(&self, code: &str, verifier: &str) -> Result<TokenGrant, ProviderError> {
        self.inner.exchange_code(code, verifier).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("provider client crashed");
        }
        tokio::time::sleep(self.delay).await;
        if self.reject_refresh.load(Ordering::SeqCst) {
            return Err(ProviderError::InvalidGrant("token revoked upstream".into()));
        }
        self.inner.refresh(refresh_token).await
    }

    async fn revoke(&self, token: &str) -> Result<(), ProviderError> {
        self.inner.revoke(token).await
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<ProviderProfile, ProviderError> {
        self.inner.fetch_profile(access_token).await
    }
}

/// Store whose writes that install new credentials are slow
struct SlowCommitStore {
    inner: InMemoryConnectionStore,
    delay: Duration,
}

#[async_trait]
impl ConnectionStore for SlowCommitStore {
    async fn get(&self, key: ConnectionKey) -> Result<Option<ServiceConnection>, ConnectionError> {
        self.inner.get(key).await
    }

    async fn put(&self, connection: ServiceConnection) -> Result<(), ConnectionError> {
        self.inner.put(connection).await
    }

    async fn modify(
        &self,
        key: ConnectionKey,
        mutate: ConnectionMutation<'_>,
    ) -> Result<Option<ServiceConnection>, ConnectionError> {
        if let Some(current) = self.inner.get(key).await? {
            let mut preview = current.clone();
            let installs_credentials = mutate(&mut preview).is_ok()
                && preview.status == ConnectionStatus::Connected
                && preview.access_handle != current.access_handle;
            if installs_credentials {
                tokio::time::sleep(self.delay).await;
            }
        }
        self.inner.modify(key, mutate).await
    }

    async fn delete(&self, key: ConnectionKey) -> Result<(), ConnectionError> {
        self.inner.delete(key).await
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<ServiceConnection>, ConnectionError> {
        self.inner.list_for_user(user_id).await
    }

    async fn list_all(&self) -> Result<Vec<ServiceConnection>, ConnectionError> {
        self.inner.list_all().await
    }
}

struct Fixture {
    manager: ConnectionLifecycleManager,
    gmail: Arc<CountingProvider>,
}

fn fixture(access_ttl_secs: i64) -> Fixture {
    let gmail = Arc::new(CountingProvider::new(ServiceName::Gmail, access_ttl_secs));
    let drive = Arc::new(CountingProvider::new(ServiceName::Drive, access_ttl_secs));
    let providers = ProviderRegistry::new()
        .with(ServiceName::Gmail, Arc::clone(&gmail) as Arc<dyn OAuthProvider>)
        .with(ServiceName::Drive, drive as Arc<dyn OAuthProvider>);
    let manager = ConnectionLifecycleManager::new(
        ConnectionConfig::default(),
        Arc::new(InMemoryConnectionStore::new()),
        providers,
        Arc::new(CredentialVault::ephemeral()),
    );
    Fixture { manager, gmail }
}

async fn connect(
    manager: &ConnectionLifecycleManager,
    user_id: Uuid,
    service: ServiceName,
) -> ServiceConnection {
    let GrantOutcome::Redirect { redirect_url } = manager.grant(user_id, service).await.unwrap()
    else {
        panic!("expected a consent redirect");
    };
    let query = redirect_url.split_once('?').map(|(_, q)| q).unwrap_or("");
    let callback: ProviderCallback = serde_urlencoded::from_str(query).unwrap();
    manager.complete_grant(user_id, service, callback).await.unwrap()
}

#[tokio::test]
async fn concurrent_refresh_rotates_once() {
    let Fixture { manager, gmail } = fixture(3600);
    let user_id = Uuid::new_v4();
    let granted = connect(&manager, user_id, ServiceName::Gmail).await;

    let (first, second, third) = tokio::join!(
        manager.refresh(user_id, ServiceName::Gmail),
        manager.refresh(user_id, ServiceName::Gmail),
        manager.refresh(user_id, ServiceName::Gmail),
    );
    let first = first.unwrap();

    assert_eq!(gmail.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(manager.rotations_performed(), 1);
    assert_eq!(first, second.unwrap());
    assert_eq!(first, third.unwrap());
    assert_eq!(first.status, ConnectionStatus::Connected);
    assert_ne!(first.access_handle, granted.access_handle);

    // A later refresh is a new rotation
    manager.refresh(user_id, ServiceName::Gmail).await.unwrap();
    assert_eq!(gmail.refreshes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn refreshes_for_different_services_run_independently() {
    let Fixture { manager, .. } = fixture(3600);
    let user_id = Uuid::new_v4();
    connect(&manager, user_id, ServiceName::Gmail).await;
    connect(&manager, user_id, ServiceName::Drive).await;

    let (gmail, drive) = tokio::join!(
        manager.refresh(user_id, ServiceName::Gmail),
        manager.refresh(user_id, ServiceName::Drive),
    );
    assert_eq!(gmail.unwrap().service, ServiceName::Gmail);
    assert_eq!(drive.unwrap().service, ServiceName::Drive);
    assert_eq!(manager.rotations_performed(), 2);
}

#[tokio::test]
async fn expired_plus_disconnected_is_degraded() {
    let Fixture { manager, .. } = fixture(60);
    let user_id = Uuid::new_v4();
    connect(&manager, user_id, ServiceName::Gmail).await;

    let report = manager
        .health_at(user_id, Utc::now() + ChronoDuration::hours(2))
        .await;

    assert_eq!(report.overall, OverallHealth::Degraded);
    let gmail = &report.services[&ServiceName::Gmail];
    assert!(gmail.connected);
    assert!(!gmail.healthy);
    assert_eq!(gmail.status, ConnectionStatus::Expired);
    assert!(!report.services[&ServiceName::Drive].connected);
    assert!(!report.issues.is_empty());
}

#[tokio::test]
async fn expired_connection_recovers_through_refresh() {
    let Fixture { manager, .. } = fixture(60);
    let user_id = Uuid::new_v4();
    connect(&manager, user_id, ServiceName::Gmail).await;
    manager
        .health_at(user_id, Utc::now() + ChronoDuration::hours(2))
        .await;

    let refreshed = manager.refresh(user_id, ServiceName::Gmail).await.unwrap();
    assert_eq!(refreshed.status, ConnectionStatus::Connected);
    assert_eq!(
        manager.health(user_id).await.overall,
        OverallHealth::Healthy
    );
}

#[tokio::test]
async fn rejected_refresh_disconnects() {
    let Fixture { manager, gmail } = fixture(3600);
    let user_id = Uuid::new_v4();
    connect(&manager, user_id, ServiceName::Gmail).await;
    gmail.reject_refresh.store(true, Ordering::SeqCst);

    let err = manager
        .refresh(user_id, ServiceName::Gmail)
        .await
        .unwrap_err();
    assert_eq!(err, ConnectionError::TokenExpired(ServiceName::Gmail));

    let connection = manager
        .connection(user_id, ServiceName::Gmail)
        .await
        .unwrap();
    assert_eq!(connection.status, ConnectionStatus::Disconnected);
    assert!(!connection.holds_credentials());
    assert_eq!(
        manager.health(user_id).await.overall,
        OverallHealth::NoConnections
    );
}

#[tokio::test]
async fn revoke_disconnects_and_is_idempotent() {
    let Fixture { manager, .. } = fixture(3600);
    let user_id = Uuid::new_v4();
    connect(&manager, user_id, ServiceName::Drive).await;

    manager.revoke(user_id, ServiceName::Drive).await.unwrap();
    manager.revoke(user_id, ServiceName::Drive).await.unwrap();

    let connection = manager
        .connection(user_id, ServiceName::Drive)
        .await
        .unwrap();
    assert_eq!(connection.status, ConnectionStatus::Disconnected);
    assert!(matches!(
        manager.access_token(user_id, ServiceName::Drive).await,
        Err(ConnectionError::ConnectionRequired(ServiceName::Drive))
    ));
}

#[tokio::test]
async fn revoke_during_refresh_stays_revoked() {
    let gmail = Arc::new(CountingProvider::new(ServiceName::Gmail, 3600));
    let vault = Arc::new(CredentialVault::ephemeral());
    let store = Arc::new(SlowCommitStore {
        inner: InMemoryConnectionStore::new(),
        delay: Duration::from_millis(200),
    });
    let manager = Arc::new(ConnectionLifecycleManager::new(
        ConnectionConfig::default(),
        store,
        ProviderRegistry::new().with(ServiceName::Gmail, gmail as Arc<dyn OAuthProvider>),
        Arc::clone(&vault),
    ));
    let user_id = Uuid::new_v4();
    connect(&manager, user_id, ServiceName::Gmail).await;

    // Provider answers at ~100ms, the commit then stalls for 200ms
    let refreshing = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.refresh(user_id, ServiceName::Gmail).await }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    manager.revoke(user_id, ServiceName::Gmail).await.unwrap();

    let refreshed = refreshing.await.unwrap();
    assert_eq!(
        refreshed.unwrap_err(),
        ConnectionError::ConnectionRequired(ServiceName::Gmail)
    );

    let connection = manager
        .connection(user_id, ServiceName::Gmail)
        .await
        .unwrap();
    assert_eq!(connection.status, ConnectionStatus::Disconnected);
    assert!(!connection.holds_credentials());
    assert!(vault.is_empty());
}

#[tokio::test]
async fn refresh_recovers_after_rotation_task_panics() {
    let Fixture { manager, gmail } = fixture(3600);
    let user_id = Uuid::new_v4();
    connect(&manager, user_id, ServiceName::Gmail).await;
    gmail.panic_next.store(true, Ordering::SeqCst);

    let refreshed = tokio::time::timeout(
        Duration::from_secs(5),
        manager.refresh(user_id, ServiceName::Gmail),
    )
    .await
    .expect("refresh hung after a crashed rotation")
    .unwrap();

    assert_eq!(refreshed.status, ConnectionStatus::Connected);
    assert_eq!(gmail.refreshes.load(Ordering::SeqCst), 2);
}
