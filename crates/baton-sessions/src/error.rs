use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Maximum sessions reached (limit: {0})")]
    MaxSessionsReached(usize),

    #[error("Correlation id {correlation_id} already belongs to session {owner}")]
    CorrelationClaimed {
        correlation_id: String,
        owner: String,
    },

    #[error("Session state is corrupt: {0}")]
    CorruptState(String),

    #[error("Failed to persist session state: {0}")]
    Persist(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Open-files probe failed: {0}")]
    ProbeFailed(String),

    #[error("No log artifact found for session {session_id} after {attempts} attempts")]
    NotDetected { session_id: String, attempts: u32 },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
