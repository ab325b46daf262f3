//! Identity: users, sessions and login through the identity provider
//!
//! Login follows the same consent shape as a service grant: redirect to the
//! provider with a state and PKCE challenge, then exchange the callback code,
//! fetch the profile, find or create the [`User`] and issue a session.

pub mod session;
pub mod user;

pub use session::{cookie_value, Claims, SessionTokens, SESSION_COOKIE};
pub use user::{User, UserStore};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::connections::{OAuthProvider, ProviderCallback};
use crate::crypto::{random_token, Pkce};
use crate::types::CasebookError;

struct PendingLogin {
    verifier: Zeroizing<String>,
    expires_at: DateTime<Utc>,
}

/// Authenticated caller
#[derive(Debug, Clone)]
pub struct Session {
    pub user: User,
    pub claims: Claims,
}

pub struct IdentityService {
    users: UserStore,
    sessions: SessionTokens,
    provider: Arc<dyn OAuthProvider>,
    pending: DashMap<String, PendingLogin>,
    login_ttl: Duration,
}

impl IdentityService {
    pub fn new(sessions: SessionTokens, provider: Arc<dyn OAuthProvider>, login_ttl: Duration) -> Self {
        Self {
            users: UserStore::new(),
            sessions,
            provider,
            pending: DashMap::new(),
            login_ttl,
        }
    }

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    pub fn sessions(&self) -> &SessionTokens {
        &self.sessions
    }

    /// Consent URL for the identity provider
    pub fn begin_login(&self) -> String {
        let pkce = Pkce::generate();
        let state = random_token();
        let url = self.provider.authorization_url(&state, &pkce.challenge);
        self.pending.insert(
            state,
            PendingLogin {
                verifier: pkce.verifier,
                expires_at: Utc::now() + self.login_ttl,
            },
        );
        url
    }

    /// Exchange the login callback for a user and a session token
    pub async fn complete_login(
        &self,
        callback: ProviderCallback,
    ) -> Result<(User, String), CasebookError> {
        if let Some(error) = callback.error {
            let detail = callback.error_description.unwrap_or(error);
            return Err(CasebookError::Unauthorized(format!(
                "Login denied by provider: {}",
                detail
            )));
        }

        let state = callback
            .state
            .ok_or_else(|| CasebookError::BadRequest("Login callback is missing state".into()))?;
        let (_, pending) = self
            .pending
            .remove(&state)
            .ok_or_else(|| CasebookError::Unauthorized("Unknown or expired login".into()))?;
        if pending.expires_at <= Utc::now() {
            return Err(CasebookError::Unauthorized("Login window expired".into()));
        }
        let code = callback
            .code
            .ok_or_else(|| CasebookError::BadRequest("Login callback is missing code".into()))?;

        let grant = self
            .provider
            .exchange_code(&code, &pending.verifier)
            .await
            .map_err(|e| CasebookError::Unauthorized(format!("Login failed: {}", e)))?;
        let profile = self
            .provider
            .fetch_profile(&grant.access_token)
            .await
            .map_err(|e| CasebookError::Provider(format!("Profile lookup failed: {}", e)))?;

        let user = self.users.upsert_from_profile(&profile);
        let (token, _) = self.sessions.issue(&user)?;
        info!(user_id = %user.id, "User logged in");
        Ok((user, token))
    }

    /// Resolve the session cookie in a `Cookie` header
    pub fn authenticate(&self, cookie_header: Option<&str>) -> Result<Session, CasebookError> {
        let token = cookie_header
            .and_then(|header| cookie_value(header, SESSION_COOKIE))
            .ok_or_else(|| CasebookError::Unauthorized("Not authenticated".into()))?;

        let claims = self.sessions.verify(token)?;
        let user_id: Uuid = claims
            .sub
            .parse()
            .map_err(|_| CasebookError::Unauthorized("Invalid session subject".into()))?;
        let user = self
            .users
            .get(user_id)
            .ok_or_else(|| CasebookError::Unauthorized("User no longer exists".into()))?;

        Ok(Session { user, claims })
    }

    /// End the session in the cookie, if any. Idempotent.
    pub fn logout(&self, cookie_header: Option<&str>) {
        match self.authenticate(cookie_header) {
            Ok(session) => {
                self.sessions.revoke(&session.claims);
                info!(user_id = %session.user.id, "User logged out");
            }
            Err(err) => warn!(error = %err, "Logout without a valid session"),
        }
    }

    /// Drop stale logins and expired revocations
    pub fn sweep(&self) {
        let now = Utc::now();
        self.pending.retain(|_, pending| pending.expires_at > now);
        self.sessions.purge_revoked();
    }
}

/// Spawn a background task that drops stale logins and expired revocations
pub fn spawn_identity_sweep_task(identity: Arc<IdentityService>, interval: std::time::Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            identity.sweep();
        }
    });

    info!(interval_secs = interval.as_secs(), "Identity sweep task started");
}
