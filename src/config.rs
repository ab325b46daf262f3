//! Configuration for Casebook
//!
//! CLI arguments and environment variable handling using clap.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// Casebook - case study generation from connected data sources
#[derive(Parser, Debug, Clone)]
#[command(name = "casebook")]
#[command(about = "Case study generation service with OAuth-gated data sources")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8001")]
    pub listen: SocketAddr,

    /// Public base URL of this service, used to build OAuth redirect URIs
    #[arg(long, env = "PUBLIC_URL", default_value = "http://localhost:8001")]
    pub public_url: String,

    /// Frontend origin: CORS allow-origin and post-login redirect target
    #[arg(long, env = "FRONTEND_URL", default_value = "http://localhost:3000")]
    pub frontend_url: String,

    /// Enable development mode (ephemeral keys, loopback OAuth, outline engine)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// JWT secret for session signing (required in production)
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// Session lifetime in seconds
    #[arg(long, env = "SESSION_TTL_SECS", default_value = "1800")]
    pub session_ttl_secs: u64,

    /// Base64 encoded 32-byte key sealing stored OAuth credentials
    #[arg(long, env = "CREDENTIAL_KEY")]
    pub credential_key: Option<String>,

    /// OAuth provider configuration
    #[command(flatten)]
    pub oauth: OAuthArgs,

    /// Content engine base URL (built-in outline engine when unset)
    #[arg(long, env = "ENGINE_URL")]
    pub engine_url: Option<String>,

    /// Content engine connect timeout in milliseconds
    #[arg(long, env = "ENGINE_CONNECT_TIMEOUT_MS", default_value = "5000")]
    pub engine_connect_timeout_ms: u64,

    /// Gmail API base URL
    #[arg(long, env = "GMAIL_API_URL", default_value = "https://gmail.googleapis.com")]
    pub gmail_api_url: String,

    /// Drive API base URL
    #[arg(long, env = "DRIVE_API_URL", default_value = "https://www.googleapis.com")]
    pub drive_api_url: String,

    /// Timeout for one data-source search in milliseconds
    #[arg(long, env = "SOURCE_TIMEOUT_MS", default_value = "10000")]
    pub source_timeout_ms: u64,

    /// Model requested when a generation request names none
    #[arg(long, env = "DEFAULT_MODEL", default_value = "gpt-4")]
    pub default_model: String,

    /// Seconds of silence before a keepalive comment is written to an event stream
    #[arg(long, env = "KEEPALIVE_SECS", default_value = "15")]
    pub keepalive_secs: u64,

    /// Per-job content event buffer
    #[arg(long, env = "STREAM_BUFFER", default_value = "1024")]
    pub stream_buffer: usize,

    /// How long a finished job keeps its live channel
    #[arg(long, env = "CHANNEL_RETENTION_SECS", default_value = "300")]
    pub channel_retention_secs: u64,

    /// Refresh credentials that expire within this many seconds
    #[arg(long, env = "TOKEN_REFRESH_BUFFER_SECS", default_value = "300")]
    pub token_refresh_buffer_secs: i64,

    /// Lifetime of a pending consent (grant or login)
    #[arg(long, env = "PENDING_GRANT_TTL_SECS", default_value = "300")]
    pub pending_grant_ttl_secs: i64,

    /// Days an expired connection is kept before it is disconnected
    #[arg(long, env = "EXPIRED_RETENTION_DAYS", default_value = "30")]
    pub expired_retention_days: i64,

    /// Connection sweeper interval in seconds
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "60")]
    pub sweep_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// OAuth client configuration shared by login and service connections
#[derive(Parser, Debug, Clone)]
pub struct OAuthArgs {
    /// OAuth client id (required in production)
    #[arg(long, env = "OAUTH_CLIENT_ID")]
    pub oauth_client_id: Option<String>,

    /// OAuth client secret (required in production)
    #[arg(long, env = "OAUTH_CLIENT_SECRET")]
    pub oauth_client_secret: Option<String>,

    /// Authorization endpoint
    #[arg(
        long,
        env = "OAUTH_AUTH_URI",
        default_value = "https://accounts.google.com/o/oauth2/v2/auth"
    )]
    pub oauth_auth_uri: String,

    /// Token endpoint
    #[arg(
        long,
        env = "OAUTH_TOKEN_URI",
        default_value = "https://oauth2.googleapis.com/token"
    )]
    pub oauth_token_uri: String,

    /// Revocation endpoint
    #[arg(
        long,
        env = "OAUTH_REVOKE_URI",
        default_value = "https://oauth2.googleapis.com/revoke"
    )]
    pub oauth_revoke_uri: String,

    /// Userinfo endpoint
    #[arg(
        long,
        env = "OAUTH_USERINFO_URI",
        default_value = "https://openidconnect.googleapis.com/v1/userinfo"
    )]
    pub oauth_userinfo_uri: String,
}

impl OAuthArgs {
    /// Whether real provider credentials are configured
    pub fn is_configured(&self) -> bool {
        self.oauth_client_id.is_some() && self.oauth_client_secret.is_some()
    }
}

impl Args {
    /// Get effective JWT secret (uses default in dev mode)
    pub fn jwt_secret(&self) -> String {
        match &self.jwt_secret {
            Some(secret) => secret.clone(),
            None => "dev-only-insecure-secret-do-not-deploy".to_string(),
        }
    }

    /// Decode the credential key, if one is configured
    pub fn credential_key_bytes(&self) -> Result<Option<[u8; 32]>, String> {
        let Some(encoded) = &self.credential_key else {
            return Ok(None);
        };
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| format!("CREDENTIAL_KEY is not valid base64: {}", e))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "CREDENTIAL_KEY must decode to exactly 32 bytes".to_string())?;
        Ok(Some(key))
    }

    /// Public base URL without a trailing slash
    pub fn public_base(&self) -> &str {
        self.public_url.trim_end_matches('/')
    }

    /// Redirect URI for the login callback
    pub fn login_redirect_uri(&self) -> String {
        format!("{}/auth/callback", self.public_base())
    }

    /// Redirect URI for a service connection callback
    pub fn connection_redirect_uri(&self, service: &str) -> String {
        format!("{}/auth/connections/{}/callback", self.public_base(), service)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }

    pub fn channel_retention(&self) -> Duration {
        Duration::from_secs(self.channel_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode {
            match &self.jwt_secret {
                None => return Err("JWT_SECRET is required in production mode".to_string()),
                Some(secret) if secret.len() < 32 => {
                    return Err("JWT_SECRET must be at least 32 characters".to_string())
                }
                Some(_) => {}
            }

            if self.credential_key.is_none() {
                return Err("CREDENTIAL_KEY is required in production mode".to_string());
            }

            if !self.oauth.is_configured() {
                return Err(
                    "OAUTH_CLIENT_ID and OAUTH_CLIENT_SECRET are required in production mode"
                        .to_string(),
                );
            }

            if self.engine_url.is_none() {
                return Err("ENGINE_URL is required in production mode".to_string());
            }
        }

        self.credential_key_bytes()?;

        if self.session_ttl_secs == 0 {
            return Err("SESSION_TTL_SECS must be greater than zero".to_string());
        }

        if self.stream_buffer == 0 {
            return Err("STREAM_BUFFER must be greater than zero".to_string());
        }

        if self.token_refresh_buffer_secs < 0 || self.pending_grant_ttl_secs <= 0 {
            return Err("token buffer and pending grant TTL must be positive".to_string());
        }

        Ok(())
    }
}
