use thiserror::Error;

/// Errors raised when decoding identifiers and labels from their string form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown participant role '{0}'")]
    UnknownRole(String),

    #[error("malformed participant '{0}', expected '<role>:<uuid>'")]
    MalformedParticipant(String),

    #[error("invalid identifier: {0}")]
    InvalidId(#[from] uuid::Error),
}
