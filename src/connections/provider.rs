//! OAuth provider seam.
//!
//! [`OAuthProvider`] is the only thing the lifecycle manager and the login flow
//! know about the identity provider: a consent URL to redirect to, and code
//! exchange / refresh / revoke / userinfo calls. [`HttpOAuthProvider`] speaks
//! standard OAuth 2.0 with PKCE over reqwest; [`LoopbackProvider`] approves
//! every consent locally for development.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use zeroize::Zeroizing;

use super::model::ServiceName;
use crate::config::OAuthArgs;
use crate::crypto::{challenge_for, random_token};

/// Default access credential lifetime when the provider omits `expires_in`
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Credentials returned by a code exchange or refresh
#[derive(Clone)]
pub struct TokenGrant {
    pub access_token: Zeroizing<String>,
    pub refresh_token: Option<Zeroizing<String>>,
    pub expires_in: Option<i64>,
    pub scopes: Vec<String>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Identity returned by the provider's userinfo endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub subject: String,
    pub email: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The grant or refresh credential is no longer valid
    #[error("grant rejected: {0}")]
    InvalidGrant(String),
    #[error("provider rejected request: {0}")]
    Rejected(String),
    #[error("provider unreachable: {0}")]
    Transport(String),
    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Consent URL the user agent is redirected to
    fn authorization_url(&self, state: &str, code_challenge: &str) -> String;

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenGrant, ProviderError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError>;

    async fn revoke(&self, token: &str) -> Result<(), ProviderError>;

    async fn fetch_profile(&self, access_token: &str) -> Result<ProviderProfile, ProviderError>;
}

// =============================================================================
// HTTP provider
// =============================================================================

/// Endpoint and client settings for one OAuth client registration
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_uri: String,
    pub token_uri: String,
    pub revoke_uri: String,
    pub userinfo_uri: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

impl OAuthClientConfig {
    /// Build from CLI args, `None` when no client is configured
    pub fn from_args(args: &OAuthArgs, redirect_uri: String, scopes: &[&str]) -> Option<Self> {
        Some(Self {
            client_id: args.oauth_client_id.clone()?,
            client_secret: args.oauth_client_secret.clone()?,
            auth_uri: args.oauth_auth_uri.clone(),
            token_uri: args.oauth_token_uri.clone(),
            revoke_uri: args.oauth_revoke_uri.clone(),
            userinfo_uri: args.oauth_userinfo_uri.clone(),
            redirect_uri,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct UserInfoResponse {
    sub: String,
    email: String,
    name: Option<String>,
    picture: Option<String>,
}

/// Standard OAuth 2.0 provider over HTTP
pub struct HttpOAuthProvider {
    config: OAuthClientConfig,
    http: reqwest::Client,
}

impl HttpOAuthProvider {
    pub fn new(config: OAuthClientConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self { config, http })
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant, ProviderError> {
        let response = self
            .http
            .post(&self.config.token_uri)
            .form(form)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_token_error(status, &body));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Ok(TokenGrant {
            access_token: Zeroizing::new(token.access_token),
            refresh_token: token.refresh_token.map(Zeroizing::new),
            expires_in: token.expires_in,
            scopes: token
                .scope
                .map(|s| s.split_whitespace().map(String::from).collect())
                .unwrap_or_else(|| self.config.scopes.clone()),
        })
    }
}

fn classify_token_error(status: reqwest::StatusCode, body: &str) -> ProviderError {
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(err) => {
            let detail = err.error_description.unwrap_or_else(|| err.error.clone());
            if err.error == "invalid_grant" {
                ProviderError::InvalidGrant(detail)
            } else {
                ProviderError::Rejected(format!("{}: {}", err.error, detail))
            }
        }
        Err(_) if status.is_server_error() => {
            ProviderError::Transport(format!("token endpoint returned {}", status))
        }
        Err(_) => ProviderError::Rejected(format!("token endpoint returned {}", status)),
    }
}

#[async_trait]
impl OAuthProvider for HttpOAuthProvider {
    fn name(&self) -> &str {
        "oauth2"
    }

    fn authorization_url(&self, state: &str, code_challenge: &str) -> String {
        let scope = self.config.scopes.join(" ");
        let query = serde_urlencoded::to_string([
            ("client_id", self.config.client_id.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("state", state),
            ("code_challenge", code_challenge),
            ("code_challenge_method", "S256"),
            ("access_type", "offline"),
            ("include_granted_scopes", "true"),
            ("prompt", "consent"),
        ])
        .unwrap_or_default();
        format!("{}?{}", self.config.auth_uri, query)
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenGrant, ProviderError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", code_verifier),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ])
        .await
    }

    async fn revoke(&self, token: &str) -> Result<(), ProviderError> {
        let response = self
            .http
            .post(&self.config.revoke_uri)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        // Already revoked or expired tokens come back as invalid_token
        if body.contains("invalid_token") {
            debug!("Token already revoked at provider");
            return Ok(());
        }
        Err(ProviderError::Rejected(format!(
            "revocation endpoint returned {}",
            status
        )))
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<ProviderProfile, ProviderError> {
        let response = self
            .http
            .get(&self.config.userinfo_uri)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::Rejected(format!(
                "userinfo endpoint returned {}",
                response.status()
            )));
        }

        let info: UserInfoResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Ok(ProviderProfile {
            subject: info.sub,
            email: info.email,
            name: info.name,
            avatar_url: info.picture,
        })
    }
}

// =============================================================================
// Loopback provider (development)
// =============================================================================

const LOOPBACK_CODE_PREFIX: &str = "loopback-";
const LOOPBACK_REFRESH_PREFIX: &str = "loopback-refresh-";

/// Provider that approves consent immediately by redirecting straight back to
/// the callback with a code bound to the PKCE challenge.
pub struct LoopbackProvider {
    redirect_uri: String,
    access_ttl_secs: i64,
}

impl LoopbackProvider {
    pub fn new(redirect_uri: impl Into<String>) -> Self {
        Self {
            redirect_uri: redirect_uri.into(),
            access_ttl_secs: DEFAULT_EXPIRES_IN_SECS,
        }
    }

    pub fn with_access_ttl(mut self, secs: i64) -> Self {
        self.access_ttl_secs = secs;
        self
    }

    fn issue(&self) -> TokenGrant {
        TokenGrant {
            access_token: Zeroizing::new(format!("loopback-access-{}", random_token())),
            refresh_token: Some(Zeroizing::new(format!(
                "{}{}",
                LOOPBACK_REFRESH_PREFIX,
                random_token()
            ))),
            expires_in: Some(self.access_ttl_secs),
            scopes: vec!["loopback".to_string()],
        }
    }
}

#[async_trait]
impl OAuthProvider for LoopbackProvider {
    fn name(&self) -> &str {
        "loopback"
    }

    fn authorization_url(&self, state: &str, code_challenge: &str) -> String {
        let code = format!("{}{}", LOOPBACK_CODE_PREFIX, code_challenge);
        let query = serde_urlencoded::to_string([("code", code.as_str()), ("state", state)])
            .unwrap_or_default();
        format!("{}?{}", self.redirect_uri, query)
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenGrant, ProviderError> {
        let expected = format!("{}{}", LOOPBACK_CODE_PREFIX, challenge_for(code_verifier));
        if code != expected {
            return Err(ProviderError::InvalidGrant(
                "code does not match verifier".into(),
            ));
        }
        Ok(self.issue())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError> {
        if !refresh_token.starts_with(LOOPBACK_REFRESH_PREFIX) {
            return Err(ProviderError::InvalidGrant("unknown refresh token".into()));
        }
        Ok(self.issue())
    }

    async fn revoke(&self, _token: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn fetch_profile(&self, _access_token: &str) -> Result<ProviderProfile, ProviderError> {
        Ok(ProviderProfile {
            subject: "loopback-developer".into(),
            email: "developer@localhost".into(),
            name: Some("Local Developer".into()),
            avatar_url: None,
        })
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Provider per connectable service
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<ServiceName, Arc<dyn OAuthProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, service: ServiceName, provider: Arc<dyn OAuthProvider>) -> Self {
        self.providers.insert(service, provider);
        self
    }

    pub fn get(&self, service: ServiceName) -> Option<Arc<dyn OAuthProvider>> {
        self.providers.get(&service).cloned()
    }

    pub fn services(&self) -> Vec<ServiceName> {
        self.providers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Pkce;

    fn http_provider() -> HttpOAuthProvider {
        HttpOAuthProvider::new(OAuthClientConfig {
            client_id: "client-123".into(),
            client_secret: "secret".into(),
            auth_uri: "https://accounts.example/auth".into(),
            token_uri: "https://accounts.example/token".into(),
            revoke_uri: "https://accounts.example/revoke".into(),
            userinfo_uri: "https://accounts.example/userinfo".into(),
            redirect_uri: "http://localhost:8001/auth/connections/gmail/callback".into(),
            scopes: vec!["a".into(), "b".into()],
        })
        .unwrap()
    }

    #[test]
    fn test_authorization_url_carries_pkce_and_state() {
        let url = http_provider().authorization_url("state-xyz", "challenge-abc");
        assert!(url.starts_with("https://accounts.example/auth?"));
        assert!(url.contains("client_id=client-123"));
        assert!(url.contains("state=state-xyz"));
        assert!(url.contains("code_challenge=challenge-abc"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("scope=a+b"));
        assert!(url.contains("access_type=offline"));
    }

    #[test]
    fn test_classify_token_errors() {
        let err = classify_token_error(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#,
        );
        assert!(matches!(err, ProviderError::InvalidGrant(_)));

        let err = classify_token_error(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_client"}"#,
        );
        assert!(matches!(err, ProviderError::Rejected(_)));

        let err = classify_token_error(reqwest::StatusCode::BAD_GATEWAY, "<html>");
        assert!(matches!(err, ProviderError::Transport(_)));
    }

    #[tokio::test]
    async fn test_loopback_binds_code_to_verifier() {
        let provider = LoopbackProvider::new("http://localhost:8001/auth/callback");
        let pkce = Pkce::generate();
        let url = provider.authorization_url("st", &pkce.challenge);
        let code = format!("loopback-{}", pkce.challenge);
        assert!(url.contains("state=st"));

        let grant = provider.exchange_code(&code, &pkce.verifier).await.unwrap();
        assert!(grant.refresh_token.is_some());

        let other = Pkce::generate();
        assert!(matches!(
            provider.exchange_code(&code, &other.verifier).await,
            Err(ProviderError::InvalidGrant(_))
        ));
    }

    #[tokio::test]
    async fn test_loopback_refresh_rejects_foreign_token() {
        let provider = LoopbackProvider::new("http://localhost/cb");
        assert!(provider.refresh("loopback-refresh-abc").await.is_ok());
        assert!(matches!(
            provider.refresh("other").await,
            Err(ProviderError::InvalidGrant(_))
        ));
    }

    #[test]
    fn test_token_grant_debug_is_redacted() {
        let grant = TokenGrant {
            access_token: Zeroizing::new("super-secret".into()),
            refresh_token: None,
            expires_in: Some(10),
            scopes: vec![],
        };
        assert!(!format!("{:?}", grant).contains("super-secret"));
    }
}
