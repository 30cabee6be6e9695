use std::path::PathBuf;

use baton_core::HookSignal;
use serde::Serialize;

/// Everything the listener observed, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// `POST /hook/complete`, including bodies that failed to parse
    HookCompleted(HookSignal),

    ScreenshotRunStarted {
        run_id: String,
        project: String,
        path: PathBuf,
    },

    ScreenshotRunCompleted { run_id: String, path: PathBuf },
}

impl GatewayEvent {
    pub fn as_hook(&self) -> Option<&HookSignal> {
        match self {
            GatewayEvent::HookCompleted(signal) => Some(signal),
            _ => None,
        }
    }
}
