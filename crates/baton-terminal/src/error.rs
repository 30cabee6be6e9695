use thiserror::Error;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("Terminal host unavailable: {0}")]
    Unavailable(String),

    #[error("Terminal target not found: {0}")]
    TargetNotFound(String),

    #[error("Automation permission denied: {0}")]
    PermissionDenied(String),

    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Unexpected terminal output: {0}")]
    InvalidOutput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TerminalError {
    /// Whether the target no longer exists, as opposed to the host failing.
    pub fn is_target_gone(&self) -> bool {
        matches!(self, TerminalError::TargetNotFound(_))
    }
}
