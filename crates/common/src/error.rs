//! Error taxonomy shared by the store, the HTTP surface and the clients.
//!
//! Every variant maps to exactly one `(HTTP status, wire code)` pair so
//! the router never has to guess how to serialize a failure.

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid team id '{0}'")]
    InvalidTeamId(String),
    #[error("invalid agent id '{0}'")]
    InvalidAgentId(String),
    #[error("invalid task: {0}")]
    InvalidTask(String),
    #[error("invalid thread message: {0}")]
    InvalidThreadMessage(String),
    #[error("invalid json: {0}")]
    InvalidJson(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("lease on {0} has expired")]
    LeaseExpired(String),
    #[error("lease on {task} is held by {holder}")]
    LeaseHolderMismatch { task: String, holder: String },

    #[error("team '{0}' not found")]
    TeamNotFound(String),
    #[error("task '{0}' not found")]
    TaskNotFound(String),
    #[error("thread '{0}' not found")]
    ThreadNotFound(String),

    #[error("task '{0}' is not claimable")]
    TaskNotClaimable(String),
    #[error("task '{0}' is not in progress")]
    TaskNotInProgress(String),
    #[error("epoch mismatch on {task}: current {current}, presented {presented}")]
    EpochMismatch {
        task: String,
        current: u64,
        presented: u64,
    },

    #[error("path traversal rejected: {0}")]
    PathTraversal(String),
    #[error("symlink escapes workspace: {0}")]
    SymlinkEscape(String),
    #[error("unparsable line {line} in {file}")]
    InvalidLine { file: String, line: usize },
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// HTTP status the router responds with.
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidTeamId(_)
            | Self::InvalidAgentId(_)
            | Self::InvalidTask(_)
            | Self::InvalidThreadMessage(_)
            | Self::InvalidJson(_) => 400,
            Self::Unauthorized => 401,
            Self::LeaseExpired(_) | Self::LeaseHolderMismatch { .. } => 403,
            Self::TeamNotFound(_) | Self::TaskNotFound(_) | Self::ThreadNotFound(_) => 404,
            Self::TaskNotClaimable(_)
            | Self::TaskNotInProgress(_)
            | Self::EpochMismatch { .. } => 409,
            Self::PathTraversal(_)
            | Self::SymlinkEscape(_)
            | Self::InvalidLine { .. }
            | Self::Internal(_) => 500,
        }
    }

    /// Stable wire code carried in `{error:{code}}` bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTeamId(_) => "INVALID_TEAM_ID",
            Self::InvalidAgentId(_) => "INVALID_AGENT_ID",
            Self::InvalidTask(_) => "INVALID_TASK",
            Self::InvalidThreadMessage(_) => "INVALID_THREAD_MESSAGE",
            Self::InvalidJson(_) => "INVALID_JSON",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::LeaseExpired(_) => "LEASE_EXPIRED",
            Self::LeaseHolderMismatch { .. } => "LEASE_HOLDER_MISMATCH",
            Self::TeamNotFound(_) => "TEAM_NOT_FOUND",
            Self::TaskNotFound(_) => "TASK_NOT_FOUND",
            Self::ThreadNotFound(_) => "THREAD_NOT_FOUND",
            Self::TaskNotClaimable(_) => "TASK_NOT_CLAIMABLE",
            Self::TaskNotInProgress(_) => "TASK_NOT_IN_PROGRESS",
            Self::EpochMismatch { .. } => "EPOCH_MISMATCH",
            Self::PathTraversal(_) => "PATH_TRAVERSAL",
            Self::SymlinkEscape(_) => "SYMLINK_ESCAPE",
            Self::InvalidLine { .. } => "INVALID_LINE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_code_stay_paired() {
        let err = StoreError::EpochMismatch {
            task: "task-0001".into(),
            current: 3,
            presented: 2,
        };
        assert_eq!(err.status(), 409);
        assert_eq!(err.code(), "EPOCH_MISMATCH");

        assert_eq!(StoreError::Unauthorized.status(), 401);
        assert_eq!(
            StoreError::LeaseExpired("task-0001".into()).status(),
            403
        );
        assert_eq!(
            StoreError::PathTraversal("../etc".into()).code(),
            "PATH_TRAVERSAL"
        );
    }
}
