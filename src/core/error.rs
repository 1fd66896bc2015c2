use std::io;
use thiserror::Error;

use super::result::FailureReason;

/// Internal failure while handling a request.
///
/// Carries the underlying cause for the logs. Callers only ever see the
/// `FailureReason` it maps to.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to prepare workspace: {0}")]
    Workspace(#[source] io::Error),

    #[error("failed to spawn compiler {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for compiler: {0}")]
    Wait(#[source] io::Error),

    #[error("compiler exceeded its time limit of {limit_ms}ms")]
    Timeout { limit_ms: u128 },

    #[error("no compile slot became free within {waited_ms}ms")]
    Busy { waited_ms: u128 },

    #[error("compilation cancelled by caller")]
    Cancelled,

    #[error("compiler exited successfully but produced no artifact")]
    MissingArtifact,

    #[error("failed to read artifact: {0}")]
    ArtifactRead(#[source] io::Error),
}

impl ServiceError {
    pub fn reason(&self) -> FailureReason {
        match self {
            ServiceError::InvalidInput(_) => FailureReason::InvalidInput,
            ServiceError::Workspace(_)
            | ServiceError::Spawn { .. }
            | ServiceError::Wait(_)
            | ServiceError::ArtifactRead(_) => FailureReason::IoError,
            ServiceError::Timeout { .. } | ServiceError::Busy { .. } => FailureReason::Timeout,
            ServiceError::Cancelled => FailureReason::Cancelled,
            ServiceError::MissingArtifact => FailureReason::MissingArtifact,
        }
    }
}
