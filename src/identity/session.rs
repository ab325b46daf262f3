//! Session tokens
//!
//! Sessions are HS256 JWTs carried only in an HTTP-only cookie. Logout adds
//! the session id to a revocation list until the token would have expired
//! anyway.

use dashmap::DashMap;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use super::user::User;
use crate::crypto::random_token;
use crate::types::CasebookError;

pub const SESSION_COOKIE: &str = "casebook_session";

/// Payload stored in the session token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub email: String,
    pub name: Option<String>,
    /// Session id, the unit of revocation
    pub sid: String,
    pub iat: u64,
    pub exp: u64,
}

fn unix_now() -> Result<u64, CasebookError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| CasebookError::Internal(format!("System time error: {}", e)))
}

pub struct SessionTokens {
    secret: String,
    expiry_seconds: u64,
    secure_cookie: bool,
    revoked: DashMap<String, u64>,
}

impl SessionTokens {
    /// Returns an error if the secret is too short
    pub fn new(secret: String, expiry_seconds: u64, secure_cookie: bool) -> Result<Self, CasebookError> {
        if secret.len() < 32 {
            return Err(CasebookError::Config(
                "JWT_SECRET must be at least 32 characters".into(),
            ));
        }
        Ok(Self {
            secret,
            expiry_seconds,
            secure_cookie,
            revoked: DashMap::new(),
        })
    }

    /// Dev mode: fixed secret, cookie usable over plain HTTP
    pub fn new_dev(expiry_seconds: u64) -> Self {
        Self {
            secret: "dev-mode-secret-not-for-production-use-123456".into(),
            expiry_seconds,
            secure_cookie: false,
            revoked: DashMap::new(),
        }
    }

    pub fn expiry_seconds(&self) -> u64 {
        self.expiry_seconds
    }

    pub fn issue(&self, user: &User) -> Result<(String, Claims), CasebookError> {
        let now = unix_now()?;
        let claims = Claims {
            sub: user.id.to_string(),
            email: user.email.clone(),
            name: user.display_name.clone(),
            sid: random_token(),
            iat: now,
            exp: now + self.expiry_seconds,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| CasebookError::Internal(format!("Failed to issue session: {}", e)))?;

        Ok((token, claims))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, CasebookError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|err| {
            use jsonwebtoken::errors::ErrorKind;
            let detail = match err.kind() {
                ErrorKind::ExpiredSignature => "Session expired",
                ErrorKind::InvalidSignature => "Invalid session signature",
                _ => "Invalid session",
            };
            CasebookError::Unauthorized(detail.into())
        })?;

        if self.revoked.contains_key(&data.claims.sid) {
            return Err(CasebookError::Unauthorized("Session ended".into()));
        }
        Ok(data.claims)
    }

    pub fn revoke(&self, claims: &Claims) {
        self.revoked.insert(claims.sid.clone(), claims.exp);
    }

    /// Forget revocations for tokens that have expired on their own
    pub fn purge_revoked(&self) -> usize {
        let now = unix_now().unwrap_or(0);
        let before = self.revoked.len();
        self.revoked.retain(|_, exp| *exp > now);
        before - self.revoked.len()
    }

    /// `Set-Cookie` value carrying a session
    pub fn session_cookie(&self, token: &str) -> String {
        let mut cookie = format!(
            "{}={}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}",
            SESSION_COOKIE, token, self.expiry_seconds
        );
        if self.secure_cookie {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// `Set-Cookie` value that removes the session
    pub fn clear_cookie(&self) -> String {
        let mut cookie = format!("{}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0", SESSION_COOKIE);
        if self.secure_cookie {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

/// Value of a named cookie in a `Cookie` header
pub fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name && !value.is_empty()).then_some(value)
    })
}
