//! Connection data model
//!
//! One [`ServiceConnection`] per (user, service). Credentials are never held
//! here directly; the connection carries opaque [`CredentialHandle`]s into the
//! vault.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::vault::CredentialHandle;

/// External data-source integration requiring its own OAuth grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceName {
    Gmail,
    Drive,
}

impl ServiceName {
    pub const ALL: [ServiceName; 2] = [ServiceName::Gmail, ServiceName::Drive];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Drive => "drive",
        }
    }

    /// OAuth scopes requested when granting this service
    pub fn scopes(&self) -> &'static [&'static str] {
        match self {
            Self::Gmail => &["https://www.googleapis.com/auth/gmail.readonly"],
            Self::Drive => &["https://www.googleapis.com/auth/drive.readonly"],
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gmail" => Ok(Self::Gmail),
            "drive" => Ok(Self::Drive),
            other => Err(format!("unknown service: {}", other)),
        }
    }
}

/// Lifecycle status of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    PendingGrant,
    Connected,
    Expired,
    Error,
}

impl ConnectionStatus {
    /// Legal moves of the per-(user, service) state machine
    pub fn can_transition_to(&self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self, next) {
            (_, Error) => true,
            (Disconnected, Disconnected | PendingGrant) => true,
            (PendingGrant, PendingGrant | Connected | Disconnected) => true,
            (Connected, Connected | Expired | Disconnected) => true,
            (Expired, Connected | Disconnected | PendingGrant) => true,
            (Error, Connected | Disconnected | PendingGrant) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::PendingGrant => "pending_grant",
            Self::Connected => "connected",
            Self::Expired => "expired",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Store key for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub user_id: Uuid,
    pub service: ServiceName,
}

impl ConnectionKey {
    pub fn new(user_id: Uuid, service: ServiceName) -> Self {
        Self { user_id, service }
    }
}

/// Per-(user, service) OAuth connection state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConnection {
    pub user_id: Uuid,
    pub service: ServiceName,
    pub status: ConnectionStatus,
    #[serde(skip)]
    pub access_handle: Option<CredentialHandle>,
    #[serde(skip)]
    pub refresh_handle: Option<CredentialHandle>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceConnection {
    pub fn disconnected(user_id: Uuid, service: ServiceName, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            service,
            status: ConnectionStatus::Disconnected,
            access_handle: None,
            refresh_handle: None,
            expires_at: None,
            last_checked_at: None,
            connected_at: None,
            scopes: Vec::new(),
            last_error: None,
            updated_at: now,
        }
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.user_id, self.service)
    }

    /// Move to `next`, rejecting moves the state machine does not allow
    pub fn transition(
        &mut self,
        next: ConnectionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), ConnectionStatusError> {
        if !self.status.can_transition_to(next) {
            return Err(ConnectionStatusError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Detect credential expiry. Returns true when the status changed.
    pub fn observe(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != ConnectionStatus::Connected {
            return false;
        }
        match self.expires_at {
            Some(expires_at) if expires_at <= now => {
                self.status = ConnectionStatus::Expired;
                self.updated_at = now;
                true
            }
            _ => false,
        }
    }

    /// Whether this connection holds credentials at all
    pub fn holds_credentials(&self) -> bool {
        self.access_handle.is_some()
            && matches!(
                self.status,
                ConnectionStatus::Connected | ConnectionStatus::Expired | ConnectionStatus::Error
            )
    }

    /// Connected with an unexpired credential
    pub fn is_healthy(&self, now: DateTime<Utc>) -> bool {
        self.status == ConnectionStatus::Connected
            && self.access_handle.is_some()
            && self.expires_at.map_or(true, |at| at > now)
    }

    pub fn expires_within(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        self.expires_at.map_or(false, |at| at <= now + buffer)
    }

    pub fn token_status(&self, now: DateTime<Utc>, buffer: Duration) -> Option<TokenStatus> {
        if !self.holds_credentials() {
            return None;
        }
        let expired = self.expires_at.map_or(false, |at| at <= now);
        Some(TokenStatus {
            expired,
            expiring_soon: !expired && self.expires_within(now, buffer),
            expires_at: self.expires_at,
            expires_in_minutes: self
                .expires_at
                .map(|at| (at - now).num_minutes().max(0)),
        })
    }

    /// Forget every credential-related field
    pub fn clear_credentials(&mut self) -> Vec<CredentialHandle> {
        self.expires_at = None;
        self.connected_at = None;
        self.scopes.clear();
        self.access_handle
            .take()
            .into_iter()
            .chain(self.refresh_handle.take())
            .collect()
    }
}

/// Token summary reported by health checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenStatus {
    pub expired: bool,
    pub expiring_soon: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub expires_in_minutes: Option<i64>,
}

/// Rejected state machine move
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal connection transition {from} -> {to}")]
pub struct ConnectionStatusError {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(now: DateTime<Utc>, expires_in: Duration) -> ServiceConnection {
        let mut conn = ServiceConnection::disconnected(Uuid::new_v4(), ServiceName::Gmail, now);
        conn.status = ConnectionStatus::Connected;
        conn.access_handle = Some(CredentialHandle::new());
        conn.expires_at = Some(now + expires_in);
        conn
    }

    #[test]
    fn test_state_machine() {
        use ConnectionStatus::*;
        assert!(Disconnected.can_transition_to(PendingGrant));
        assert!(PendingGrant.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Expired));
        assert!(Expired.can_transition_to(Connected));
        assert!(Expired.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Error));

        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(PendingGrant));
        assert!(!Disconnected.can_transition_to(Expired));
    }

    #[test]
    fn test_observe_expires_connected() {
        let now = Utc::now();
        let mut conn = connected(now, Duration::minutes(10));
        assert!(!conn.observe(now));
        assert!(conn.is_healthy(now));

        let later = now + Duration::minutes(11);
        assert!(conn.observe(later));
        assert_eq!(conn.status, ConnectionStatus::Expired);
        assert!(!conn.is_healthy(later));
        assert!(conn.holds_credentials());
    }

    #[test]
    fn test_token_status() {
        let now = Utc::now();
        let conn = connected(now, Duration::minutes(3));
        let status = conn.token_status(now, Duration::minutes(5)).unwrap();
        assert!(!status.expired);
        assert!(status.expiring_soon);
        assert_eq!(status.expires_in_minutes, Some(3));

        let idle = ServiceConnection::disconnected(Uuid::new_v4(), ServiceName::Drive, now);
        assert!(idle.token_status(now, Duration::minutes(5)).is_none());
    }

    #[test]
    fn test_transition_rejects_illegal_move() {
        let now = Utc::now();
        let mut conn = ServiceConnection::disconnected(Uuid::new_v4(), ServiceName::Drive, now);
        let err = conn.transition(ConnectionStatus::Connected, now).unwrap_err();
        assert_eq!(err.from, ConnectionStatus::Disconnected);
        assert_eq!(conn.status, ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_service_name_parse() {
        assert_eq!("Gmail".parse::<ServiceName>().unwrap(), ServiceName::Gmail);
        assert!("dropbox".parse::<ServiceName>().is_err());
        assert_eq!(
            serde_json::to_string(&ServiceName::Drive).unwrap(),
            "\"drive\""
        );
    }
}
