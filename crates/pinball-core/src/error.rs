//! Error taxonomy shared by the master and its clients.

use thiserror::Error;

/// Errors returned by master operations, in-process or over the wire.
///
/// The first four variants are the wire-level taxonomy of code + message;
/// `NotReady` is the retryable answer while the master is still recovering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MasterError {
    /// Precondition on a token version was violated.
    #[error("version conflict: {0}")]
    VersionConflict(String),

    /// Referenced token does not exist.
    #[error("token not found: {0}")]
    NotFound(String),

    /// Malformed request; a client bug, not a race.
    #[error("invalid input: {0}")]
    Input(String),

    /// The master is recovering; retry later.
    #[error("master is recovering")]
    NotReady,

    /// Anything else, including transport and persistence failures. The
    /// operation is not guaranteed to have applied.
    #[error("{0}")]
    Unknown(String),
}

impl MasterError {
    /// A version-conflict error describing one token's mismatch.
    pub fn conflict(name: &str, expected: Option<i64>, found: Option<i64>) -> Self {
        MasterError::VersionConflict(format!(
            "{name}: expected {expected:?}, found {found:?}"
        ))
    }

    pub fn input(msg: impl Into<String>) -> Self {
        MasterError::Input(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        MasterError::Unknown(msg.into())
    }

    /// Whether a client may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MasterError::NotReady | MasterError::Unknown(_))
    }
}
