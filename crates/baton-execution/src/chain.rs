use std::path::PathBuf;
use std::sync::Arc;

use baton_core::{ChainLink, ExecutionResult, FailureReason};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dispatcher::{DispatchRequest, Dispatcher};
use crate::error::DispatchError;

/// An ordered list of payloads run back-to-back against one session.
///
/// # Example
///
/// ```yaml
/// name: release
/// steps:
///   - title: bump
///     payload: Bump the version to 1.4.0
///   - payload: Update the changelog
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSpec {
    pub name: String,
    pub steps: Vec<ChainStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStep {
    #[serde(default)]
    pub title: Option<String>,
    pub payload: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChainTarget {
    pub project_path: Option<PathBuf>,
    pub project_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOutcome {
    pub name: String,
    /// One result per step that ran, in order
    pub results: Vec<ExecutionResult>,
    /// Whether every step ran and succeeded
    pub completed: bool,
}

pub struct ChainRunner {
    dispatcher: Arc<Dispatcher>,
}

impl ChainRunner {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Run every step, honouring pause between steps and stopping at the
    /// first step that does not succeed.
    pub async fn run(
        &self,
        spec: &ChainSpec,
        target: ChainTarget,
    ) -> Result<ChainOutcome, DispatchError> {
        let machine = self.dispatcher.machine();
        if !machine.enter_chain(spec.name.as_str()).await {
            return Err(DispatchError::Busy(machine.state()));
        }

        let outcome = self.run_steps(spec, target).await;
        machine.leave_chain().await;
        outcome
    }

    async fn run_steps(
        &self,
        spec: &ChainSpec,
        target: ChainTarget,
    ) -> Result<ChainOutcome, DispatchError> {
        let machine = self.dispatcher.machine();
        let total = spec.steps.len();
        let mut results = Vec::with_capacity(total);
        let mut session_id = None;

        for (index, step) in spec.steps.iter().enumerate() {
            let link = ChainLink {
                name: spec.name.clone(),
                step: index + 1,
                total,
            };

            if machine.is_paused() {
                info!(chain = %spec.name, step = link.step, "Chain paused");
            }
            // a pause may land while the previous step is still lingering
            loop {
                if !machine.wait_until_resumed().await || !machine.wait_for_idle().await {
                    return Err(DispatchError::MachineStopped);
                }
                if !machine.is_paused() {
                    break;
                }
            }

            let dispatched = self
                .dispatcher
                .dispatch(DispatchRequest {
                    payload: step.payload.clone(),
                    title: step.title.clone(),
                    project_path: target.project_path.clone(),
                    project_label: target.project_label.clone(),
                    session_id: session_id.clone(),
                    retry_on_closed_target: false,
                    chain: Some(link.clone()),
                })
                .await;

            let result = match dispatched {
                Ok(dispatch) => {
                    session_id = Some(dispatch.session_id);
                    machine
                        .wait_for_result(dispatch.generation)
                        .await
                        .ok_or(DispatchError::MachineStopped)?
                }
                // these already completed the execution with a failure
                Err(e @ (DispatchError::Delivery { .. } | DispatchError::EmptyPayload)) => machine
                    .snapshot()
                    .last_completed
                    .map(|(_, result)| result)
                    .unwrap_or_else(|| {
                        ExecutionResult::Failure(FailureReason::DeliveryFailed(e.to_string()))
                    }),
                Err(e) => return Err(e),
            };
            info!(chain = %spec.name, step = link.step, total, %result, "Chain step finished");

            let success = result.is_success();
            results.push(result);
            if !success {
                warn!(chain = %spec.name, step = link.step, "Chain stopped at failed step");
                return Ok(ChainOutcome {
                    name: spec.name.clone(),
                    results,
                    completed: false,
                });
            }
        }

        Ok(ChainOutcome {
            name: spec.name.clone(),
            results,
            completed: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_spec_from_yaml() {
        let yaml = r#"
name: release
steps:
  - title: bump
    payload: Bump the version
  - payload: Update the changelog
"#;
        let spec: ChainSpec = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(spec.steps.len(), 2);
        assert_eq!(spec.steps[0].title.as_deref(), Some("bump"));
        assert!(spec.steps[1].title.is_none());
    }
}
