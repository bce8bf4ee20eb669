use thiserror::Error;

/// Errors surfaced by the startup guard.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The pass observed its cancellation token. This is the only error
    /// that escapes an enforcement pass.
    #[error("startup guard pass was cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GuardError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GuardError::Cancelled)
    }
}
