use std::path::{Path, PathBuf};
use std::sync::Arc;

use baton_core::{
    ChainLink, ExecutionContext, ExecutionResult, ExecutionState, FailureReason, SessionRecord,
    TerminalSettings,
};
use baton_sessions::{NewSession, SessionCorrelator, SessionRegistry};
use baton_terminal::{TerminalError, TerminalHost, TerminalTarget};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;
use crate::machine::ExecutionHandle;

const TITLE_MAX_CHARS: usize = 60;

/// What to deliver and where.
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub payload: String,
    pub title: Option<String>,
    /// Working directory for a newly provisioned session (home if absent)
    pub project_path: Option<PathBuf>,
    /// Matched against session labels and target titles
    pub project_label: Option<String>,
    /// Deliver to this session if its target is still alive
    pub session_id: Option<String>,
    /// Retry once against a freshly resolved target if the first one closed
    pub retry_on_closed_target: bool,
    pub chain: Option<ChainLink>,
}

impl DispatchRequest {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }
}

/// An accepted dispatch. Its outcome arrives through the execution machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub generation: u64,
    pub session_id: String,
    pub terminal_id: String,
    pub provisioned: bool,
}

struct Resolved {
    session: SessionRecord,
    target: TerminalTarget,
    provisioned: bool,
}

/// Finds or creates the session a payload goes to, delivers it, and drives
/// the execution machine through `sending` and into `executing`.
pub struct Dispatcher {
    machine: ExecutionHandle,
    registry: Arc<SessionRegistry>,
    host: Arc<dyn TerminalHost>,
    correlator: Option<Arc<SessionCorrelator>>,
    terminal: TerminalSettings,
    /// Held from the idle check until the machine leaves `sending`
    dispatching: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        machine: ExecutionHandle,
        registry: Arc<SessionRegistry>,
        host: Arc<dyn TerminalHost>,
        terminal: TerminalSettings,
    ) -> Self {
        Self {
            machine,
            registry,
            host,
            correlator: None,
            terminal,
            dispatching: Mutex::new(()),
        }
    }

    /// Start log correlation for every session this dispatcher provisions.
    pub fn with_correlator(mut self, correlator: Arc<SessionCorrelator>) -> Self {
        self.correlator = Some(correlator);
        self
    }

    pub fn machine(&self) -> &ExecutionHandle {
        &self.machine
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Deliver `request`. Fails with [`DispatchError::Busy`] while another
    /// execution or dispatch is in progress; dispatches never queue.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<Dispatch, DispatchError> {
        let Ok(_dispatching) = self.dispatching.try_lock() else {
            debug!("Rejected dispatch: another dispatch is resolving its target");
            return Err(DispatchError::Busy(ExecutionState::Sending));
        };
        let state = self.machine.state();
        if state != ExecutionState::Idle {
            return Err(DispatchError::Busy(state));
        }

        let title = request
            .title
            .clone()
            .unwrap_or_else(|| summarize(&request.payload));

        if request.payload.trim().is_empty() {
            if let Some(generation) = self
                .machine
                .begin_sending(ExecutionContext::new("", title, ""))
                .await
            {
                self.machine
                    .mark_completed_for(
                        generation,
                        ExecutionResult::Failure(FailureReason::EmptyPayload),
                    )
                    .await;
            }
            warn!("Rejected empty payload");
            return Err(DispatchError::EmptyPayload);
        }

        let resolved = self.resolve(&request).await?;
        let mut provisioned = resolved.provisioned;
        let mut session_id = resolved.session.id;
        let mut target = resolved.target;

        let mut context = ExecutionContext::new(request.payload.as_str(), title, session_id.as_str())
            .with_terminal(target.id.as_str());
        if let Some(link) = request.chain.clone() {
            context = context.with_chain(link);
        }
        let Some(generation) = self.machine.begin_sending(context).await else {
            if provisioned {
                self.discard(&session_id, Some(&target.id)).await;
            }
            return Err(DispatchError::Busy(self.machine.state()));
        };
        self.touch(&session_id).await;

        let mut delivery = self.host.send_text(&target.id, &request.payload).await;

        if let Err(e) = &delivery {
            if e.is_target_gone() && request.retry_on_closed_target {
                warn!(
                    %session_id,
                    generation,
                    target = %target.id,
                    "Target closed before delivery, retrying against a fresh target"
                );
                let retry = DispatchRequest {
                    session_id: None,
                    ..request.clone()
                };
                let fresh = match self.resolve(&retry).await {
                    Ok(fresh) => fresh,
                    Err(resolve_err) => {
                        self.machine
                            .mark_completed_for(
                                generation,
                                ExecutionResult::Failure(FailureReason::DeliveryFailed(
                                    resolve_err.to_string(),
                                )),
                            )
                            .await;
                        return Err(resolve_err);
                    }
                };
                provisioned |= fresh.provisioned;
                session_id = fresh.session.id;
                target = fresh.target;
                self.machine
                    .retarget(generation, session_id.clone(), target.id.clone())
                    .await;
                self.touch(&session_id).await;
                delivery = self.host.send_text(&target.id, &request.payload).await;
            }
        }

        if let Err(e) = delivery {
            let reason = match &e {
                TerminalError::PermissionDenied(detail) => {
                    FailureReason::PermissionDenied(detail.clone())
                }
                other => FailureReason::DeliveryFailed(other.to_string()),
            };
            error!(%session_id, generation, target = %target.id, "Delivery failed: {}", e);
            self.machine
                .mark_completed_for(generation, ExecutionResult::Failure(reason))
                .await;
            return Err(DispatchError::Delivery {
                session_id,
                source: e,
            });
        }

        if !self.machine.begin_executing().await {
            // cancelled while the payload was in flight
            debug!(generation, "Execution ended before it could start executing");
        }

        info!(%session_id, generation, target = %target.id, provisioned, "Payload delivered");
        Ok(Dispatch {
            generation,
            session_id,
            terminal_id: target.id,
            provisioned,
        })
    }

    /// Provision a session without delivering anything to it.
    pub async fn open_session(
        &self,
        project_path: Option<PathBuf>,
        label: Option<String>,
    ) -> Result<SessionRecord, DispatchError> {
        let request = DispatchRequest {
            project_path,
            project_label: label,
            ..Default::default()
        };
        Ok(self.provision(&request).await?.session)
    }

    /// Remove a session and close its terminal target (best effort).
    pub async fn close_session(&self, session_id: &str) -> Result<SessionRecord, DispatchError> {
        let record = self.registry.close_session(session_id).await?;
        self.close_target(&record).await;
        Ok(record)
    }

    /// Remove sessions idle for longer than `max_idle`, closing their targets.
    pub async fn cleanup_stale(&self, now: DateTime<Utc>, max_idle: Duration) -> Vec<SessionRecord> {
        let removed = self.registry.cleanup_stale(now, max_idle).await;
        for record in &removed {
            self.close_target(record).await;
        }
        removed
    }

    async fn resolve(&self, request: &DispatchRequest) -> Result<Resolved, DispatchError> {
        let targets = self.host.list_targets().await?;

        if let Some(session_id) = &request.session_id {
            let session = self
                .registry
                .get(session_id)
                .await
                .ok_or_else(|| DispatchError::SessionNotFound(session_id.clone()))?;
            if let Some(target) = live_target(&session, &targets) {
                self.focus(&target).await;
                return Ok(Resolved {
                    session,
                    target,
                    provisioned: false,
                });
            }
            warn!(session_id = %session.id, "Pinned session has no live target");
        }

        if let Some(label) = request
            .project_label
            .as_deref()
            .filter(|label| !label.trim().is_empty())
        {
            let needle = label.to_lowercase();
            for session in self.registry.list().await {
                let Some(target) = live_target(&session, &targets) else {
                    continue;
                };
                let label_match = session
                    .label
                    .as_deref()
                    .is_some_and(|l| l.to_lowercase().contains(&needle));
                if label_match || target.matches_label(label) {
                    debug!(session_id = %session.id, target = %target.id, label, "Matched existing session");
                    self.focus(&target).await;
                    return Ok(Resolved {
                        session,
                        target,
                        provisioned: false,
                    });
                }
            }
        }

        self.provision(request).await
    }

    async fn provision(&self, request: &DispatchRequest) -> Result<Resolved, DispatchError> {
        let working_dir = match &request.project_path {
            Some(path) => path.clone(),
            None => dirs::home_dir()
                .ok_or_else(|| DispatchError::Provisioning("no home directory".into()))?,
        };

        let session = self
            .registry
            .create_session(NewSession {
                working_directory: Some(working_dir.clone()),
                label: request.project_label.clone(),
                ..Default::default()
            })
            .await?;
        let name = target_name(request.project_label.as_deref(), &working_dir, &session.id);

        let target = match self.host.create_target(&working_dir, &name).await {
            Ok(target) => target,
            Err(e) => {
                self.discard(&session.id, None).await;
                return Err(DispatchError::Provisioning(e.to_string()));
            }
        };
        if let Err(e) = self
            .registry
            .attach_terminal(&session.id, target.id.clone(), target.pid)
            .await
        {
            self.discard(&session.id, Some(&target.id)).await;
            return Err(e.into());
        }
        info!(
            session_id = %session.id,
            target = %target.id,
            path = %working_dir.display(),
            "Provisioned session"
        );

        tokio::time::sleep(self.terminal.init_delay()).await;
        if let Err(e) = self
            .host
            .send_text(&target.id, &self.terminal.launch_command)
            .await
        {
            self.discard(&session.id, Some(&target.id)).await;
            return Err(DispatchError::Provisioning(format!(
                "failed to launch agent: {}",
                e
            )));
        }

        if let Some(correlator) = &self.correlator {
            correlator.spawn_detection(session.id.clone());
        }
        tokio::time::sleep(self.terminal.startup_delay()).await;

        let session = self.registry.get(&session.id).await.unwrap_or(session);
        Ok(Resolved {
            session,
            target,
            provisioned: true,
        })
    }

    async fn discard(&self, session_id: &str, target_id: Option<&str>) {
        if let Some(target_id) = target_id {
            if let Err(e) = self.host.close(target_id).await {
                debug!(target = target_id, "Failed to close target: {}", e);
            }
        }
        if let Err(e) = self.registry.close_session(session_id).await {
            warn!(session_id, "Failed to discard session: {}", e);
        }
    }

    async fn close_target(&self, record: &SessionRecord) {
        let Some(target_id) = &record.terminal_id else {
            return;
        };
        if let Err(e) = self.host.close(target_id).await {
            debug!(session_id = %record.id, target = %target_id, "Failed to close target: {}", e);
        }
    }

    async fn focus(&self, target: &TerminalTarget) {
        if let Err(e) = self.host.focus(&target.id).await {
            warn!(target = %target.id, "Failed to focus target: {}", e);
        }
    }

    async fn touch(&self, session_id: &str) {
        if let Err(e) = self.registry.touch(session_id).await {
            warn!(session_id, "Failed to record activity: {}", e);
        }
    }
}

fn live_target(session: &SessionRecord, targets: &[TerminalTarget]) -> Option<TerminalTarget> {
    let terminal_id = session.terminal_id.as_deref()?;
    targets.iter().find(|t| t.id == terminal_id).cloned()
}

fn target_name(label: Option<&str>, working_dir: &Path, session_id: &str) -> String {
    label
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .or_else(|| {
            working_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| session_id.to_string())
}

/// First line of the payload, shortened for display.
fn summarize(payload: &str) -> String {
    let first_line = payload.trim().lines().next().unwrap_or_default();
    if first_line.chars().count() <= TITLE_MAX_CHARS {
        return first_line.to_string();
    }
    let mut title: String = first_line.chars().take(TITLE_MAX_CHARS - 1).collect();
    title.push('…');
    title
}
