//! Baton CLI
//!
//! The `baton` binary runs the completion listener together with the
//! execution machine (`serve`, `run`, `chain`), manages the session registry
//! (`sessions`), and doubles as the agent's stop hook (`notify`).

pub mod commands;
pub mod notify;
pub mod runtime;

pub use commands::{Cli, Commands, ConfigCommands, SessionsCommands};
pub use runtime::Runtime;
