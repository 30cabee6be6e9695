use baton_core::ExecutionState;
use baton_sessions::RegistryError;
use baton_terminal::TerminalError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Dispatch never queues behind a running execution.
    #[error("An execution is already in progress (state: {0})")]
    Busy(ExecutionState),

    #[error("Payload is empty")]
    EmptyPayload,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Failed to provision a session: {0}")]
    Provisioning(String),

    #[error("Delivery to session {session_id} failed: {source}")]
    Delivery {
        session_id: String,
        #[source]
        source: TerminalError,
    },

    #[error("Execution machine is not running")]
    MachineStopped,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Terminal(#[from] TerminalError),
}
