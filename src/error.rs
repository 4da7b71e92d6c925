//! Error types that cross the dispatch boundary.
//!
//! The `Display` text of [`DispatchError`] is what the client sees inside the
//! fatal pkt-line, so none of the variants carry paths or backend detail.

use crate::git::guard::ContainmentError;

/// Terminal outcome of a git command that could not be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid repository path")]
    Containment,
    #[error("you are not authorized to do this")]
    NotAuthorized,
    #[error("invalid repo")]
    InvalidRepository,
    #[error("something went wrong")]
    SystemMalfunction,
}

impl From<ContainmentError> for DispatchError {
    fn from(_: ContainmentError) -> Self {
        DispatchError::Containment
    }
}

/// Failure reported by a protocol executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The target path is not a valid bare repository.
    #[error("not a valid git repository")]
    InvalidRepository,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}
