//! Session lifecycle and identity for Baton.
//!
//! [`SessionRegistry`] is the only writer of session records: the bounded
//! set of open sessions, the per-project active pointer, and each session's
//! correlation id. [`SessionCorrelator`] works out which conversation log a
//! session's process is writing and records the answer through the registry.

pub mod correlator;
pub mod error;
pub mod registry;
pub mod store;
pub mod testing;

pub use correlator::{
    Artifact, BackgroundTask, Correlation, CorrelationMethod, CorrelationTiming, LogLayout,
    LsofProbe, OpenFilesProbe, RecoveryReport, SessionCorrelator,
};
pub use error::{CorrelationError, RegistryError};
pub use registry::{NewSession, SessionRegistry};
pub use store::{PersistedState, SessionStore};
