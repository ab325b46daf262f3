//! Connection lifecycle errors

use super::model::{ConnectionStatusError, ServiceName};
use super::provider::ProviderError;
use super::vault::VaultError;
use crate::types::CasebookError;

/// Errors from the connection lifecycle.
///
/// `Clone` so a single refresh result can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("{0} is not connected")]
    ConnectionRequired(ServiceName),

    #[error("{0} credentials expired; grant access again")]
    TokenExpired(ServiceName),

    #[error("{0}")]
    Grant(String),

    /// The in-flight refresh this caller joined vanished before reporting.
    /// Resolved by joining or starting another round.
    #[error("refresh for {0} did not report a result")]
    RefreshConflict(ServiceName),

    #[error("no provider configured for {0}")]
    UnsupportedService(ServiceName),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Transition(#[from] ConnectionStatusError),

    #[error("connection store: {0}")]
    Storage(String),
}

impl From<ConnectionError> for CasebookError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::ConnectionRequired(_) => Self::ConnectionRequired(err.to_string()),
            ConnectionError::TokenExpired(_) => Self::TokenExpired(err.to_string()),
            ConnectionError::Grant(_) => Self::GrantError(err.to_string()),
            ConnectionError::UnsupportedService(_) => Self::NotFound(err.to_string()),
            ConnectionError::Provider(ProviderError::InvalidGrant(_)) => {
                Self::GrantError(err.to_string())
            }
            ConnectionError::Provider(_) => Self::Provider(err.to_string()),
            ConnectionError::Transition(_) => Self::InvalidState(err.to_string()),
            ConnectionError::Storage(_) => Self::Storage(err.to_string()),
            ConnectionError::RefreshConflict(_) | ConnectionError::Vault(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}
