//! Shared types, configuration loading, and persistence helpers for Baton.
//!
//! Baton dispatches prompts to an agent CLI running inside terminal sessions,
//! tracks each dispatch through a completion lifecycle, and keeps every
//! session correlated with the conversation log it is writing.

pub mod atomic_write;
pub mod config;
pub mod execution;
pub mod session;

pub const BATON_DIR: &str = ".baton";

pub use atomic_write::atomic_write;
pub use config::*;
pub use execution::{
    ChainLink, CompletionSignal, ExecutionContext, ExecutionResult, ExecutionState,
    FailureReason, HookSignal,
};
pub use session::SessionRecord;

/// Resolve the Baton state directory (`~/.baton`), falling back to the XDG
/// data dir when no home directory is available.
pub fn default_state_dir() -> std::path::PathBuf {
    dirs::home_dir()
        .map(|h| h.join(BATON_DIR))
        .or_else(|| dirs::data_dir().map(|d| d.join("baton")))
        .unwrap_or_else(|| std::path::PathBuf::from(BATON_DIR))
}
