use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle phase of the single in-flight execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    #[default]
    Idle,
    Sending,
    Executing,
    Completed,
}

impl ExecutionState {
    /// `sending` and `executing` are the states cancel/timeout apply to.
    pub fn is_active(self) -> bool {
        matches!(self, ExecutionState::Sending | ExecutionState::Executing)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionState::Idle => "idle",
            ExecutionState::Sending => "sending",
            ExecutionState::Executing => "executing",
            ExecutionState::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Position of an execution inside a named chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub name: String,
    /// 1-based step number
    pub step: usize,
    pub total: usize,
}

/// Immutable snapshot of one execution request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub payload: String,
    pub title: String,
    /// Registry id of the session the payload is dispatched to
    pub session_id: String,
    /// Terminal target the payload is delivered to and polled on
    #[serde(default)]
    pub terminal_id: Option<String>,
    #[serde(default)]
    pub chain: Option<ChainLink>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(
        payload: impl Into<String>,
        title: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            payload: payload.into(),
            title: title.into(),
            session_id: session_id.into(),
            terminal_id: None,
            chain: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_terminal(mut self, terminal_id: impl Into<String>) -> Self {
        self.terminal_id = Some(terminal_id.into());
        self
    }

    pub fn with_chain(mut self, link: ChainLink) -> Self {
        self.chain = Some(link);
        self
    }
}

/// Why an execution terminated without success.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("Execution timed out")]
    Timeout,

    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Automation permission denied: {0}")]
    PermissionDenied(String),

    #[error("Payload is empty")]
    EmptyPayload,
}

/// Terminal outcome carried by the `completed` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success,
    Failure(FailureReason),
    Cancelled,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success)
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionResult::Success => f.write_str("success"),
            ExecutionResult::Failure(reason) => write!(f, "failure ({})", reason),
            ExecutionResult::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Inbound completion notification from the agent's hook script.
///
/// Both fields are optional: the script is best-effort and a body that fails
/// to parse still produces a signal with empty fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSignal {
    pub session: Option<String>,
    pub timestamp: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl HookSignal {
    pub fn new(session: Option<String>, timestamp: Option<String>) -> Self {
        Self {
            session,
            timestamp,
            received_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new(None, None)
    }
}

/// One of the two completion sources raced by the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionSignal {
    Hook(HookSignal),
    PollingDetected,
}

impl CompletionSignal {
    pub fn source(&self) -> &'static str {
        match self {
            CompletionSignal::Hook(_) => "hook",
            CompletionSignal::PollingDetected => "polling",
        }
    }
}
