//! Orchestrator errors

use uuid::Uuid;

use super::model::JobStatus;
use crate::types::CasebookError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    ScopeInvalid(String),

    #[error("{0}")]
    ConnectionRequired(String),

    #[error("case study {0} not found")]
    NotFound(Uuid),

    #[error("case study {job_id} is {status}")]
    InvalidState { job_id: Uuid, status: JobStatus },

    #[error("job store: {0}")]
    Storage(String),
}

impl From<JobError> for CasebookError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::ScopeInvalid(detail) => Self::ScopeInvalid(detail),
            JobError::ConnectionRequired(detail) => Self::ConnectionRequired(detail),
            JobError::NotFound(_) => Self::NotFound(err.to_string()),
            JobError::InvalidState { .. } => Self::InvalidState(err.to_string()),
            JobError::Storage(_) => Self::Storage(err.to_string()),
        }
    }
}
