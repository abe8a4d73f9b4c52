use courier_types::JobStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    /// Malformed caller input; reported to the user as-is.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Stale offer response, double accept, already-rated job or role guard failure.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: cannot apply '{event}' to a job in status '{from}'")]
    InvalidTransition { from: JobStatus, event: &'static str },

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DispatchError {
    pub fn no_longer_available() -> Self {
        DispatchError::Conflict("this job is no longer available".to_string())
    }

    /// Whether the caller should see this as a conflict with current state.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            DispatchError::Conflict(_) | DispatchError::InvalidTransition { .. }
        )
    }
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;
