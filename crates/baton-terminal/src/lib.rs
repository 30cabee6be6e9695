//! Terminal host integration for Baton.
//!
//! The orchestration core only needs a handful of operations from the terminal
//! that hosts the agent: find targets, create one, bring it forward, type into
//! it, and read its visible output. [`TerminalHost`] is that contract and
//! [`TmuxHost`] implements it on top of the `tmux` CLI.

pub mod error;
pub mod host;
pub mod signature;
pub mod testing;
pub mod tmux;

pub use error::TerminalError;
pub use host::{TerminalHost, TerminalTarget};
pub use signature::ReadySignature;
pub use tmux::TmuxHost;
