//! Loopback HTTP listener for Baton.
//!
//! Receives completion notifications from the agent's hook script and the
//! screenshot capture subsystem's control messages, and republishes both as
//! typed [`GatewayEvent`]s on a broadcast channel.

pub mod error;
pub mod events;
pub mod screenshots;
pub mod server;

pub use error::{GatewayError, ScreenshotError};
pub use events::GatewayEvent;
pub use screenshots::{ScreenshotRun, ScreenshotRuns};
pub use server::GatewayServer;
