use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use baton_core::{
    CompletionSignal, ExecutionResult, ExecutionState, FailureReason, HookSignal,
    TerminalSettings,
};
use baton_execution::{
    ChainRunner, ChainSpec, ChainStep, ChainTarget, CompletionAggregator, DispatchError,
    DispatchRequest, Dispatcher, ExecutionEvent, ExecutionHandle, ExecutionMachine,
    MachineSettings, PollingSettings,
};
use baton_gateway::GatewayEvent;
use baton_sessions::testing::FakeOpenFilesProbe;
use baton_sessions::{
    CorrelationTiming, LogLayout, RegistryError, SessionCorrelator, SessionRegistry, SessionStore,
};
use baton_terminal::testing::FakeTerminalHost;
use baton_terminal::{ReadySignature, TerminalError, TerminalHost, TerminalTarget};
use tempfile::TempDir;
use tokio::sync::broadcast;

const READY: &str = "╭───╮\n│ > │\n╰───╯\n  ? for shortcuts";
const BUSY: &str = "✻ Working… (esc to interrupt)";

struct Harness {
    state_dir: TempDir,
    host: Arc<FakeTerminalHost>,
    hooks: broadcast::Sender<GatewayEvent>,
    registry: Arc<SessionRegistry>,
    machine: ExecutionHandle,
    dispatcher: Arc<Dispatcher>,
}

impl Harness {
    fn new(max_sessions: usize) -> Self {
        Self::build(max_sessions, |dispatcher| dispatcher)
    }

    fn build(max_sessions: usize, customize: impl FnOnce(Dispatcher) -> Dispatcher) -> Self {
        let state_dir = TempDir::new().unwrap();
        let host = Arc::new(FakeTerminalHost::new());
        let (hooks, _) = broadcast::channel(16);
        let registry = Arc::new(SessionRegistry::new(
            SessionStore::in_dir(state_dir.path()),
            max_sessions,
        ));

        let aggregator = CompletionAggregator::new(
            host.clone(),
            ReadySignature::default(),
            PollingSettings {
                interval: Duration::from_secs(2),
                capture_lines: 40,
                confirmations: 2,
            },
        )
        .with_hooks(hooks.clone());
        let machine = ExecutionMachine::spawn(
            MachineSettings {
                timeout: Duration::from_secs(300),
                completion_linger: Duration::from_millis(500),
            },
            Some(aggregator),
        );
        let dispatcher = customize(Dispatcher::new(
            machine.clone(),
            registry.clone(),
            host.clone(),
            TerminalSettings::default(),
        ));

        Self {
            state_dir,
            host,
            hooks,
            registry,
            machine,
            dispatcher: Arc::new(dispatcher),
        }
    }

    fn hook(&self, session: &str) {
        self.hooks
            .send(GatewayEvent::HookCompleted(HookSignal::new(
                Some(session.to_string()),
                None,
            )))
            .unwrap();
    }
}

fn at(path: &str, payload: &str) -> DispatchRequest {
    DispatchRequest {
        project_path: Some(PathBuf::from(path)),
        ..DispatchRequest::new(payload)
    }
}

fn states(events: &mut broadcast::Receiver<ExecutionEvent>) -> Vec<ExecutionState> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::StateChanged { state, .. } = event {
            states.push(state);
        }
    }
    states
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_to_fresh_project_provisions_and_completes_on_hook() {
    let h = Harness::new(4);
    let mut events = h.machine.subscribe();

    let dispatch = h.dispatcher.dispatch(at("/work/app", "hello")).await.unwrap();

    assert!(dispatch.provisioned);
    assert_eq!(h.host.created_count(), 1);
    assert_eq!(
        h.host.sent(),
        vec![
            (dispatch.terminal_id.clone(), "claude".to_string()),
            (dispatch.terminal_id.clone(), "hello".to_string()),
        ]
    );
    assert_eq!(h.machine.state(), ExecutionState::Executing);
    let record = h.registry.get(&dispatch.session_id).await.unwrap();
    assert_eq!(record.terminal_id.as_deref(), Some(dispatch.terminal_id.as_str()));

    h.hook("abc");
    assert_eq!(
        h.machine.wait_for_result(dispatch.generation).await,
        Some(ExecutionResult::Success)
    );
    assert_eq!(h.machine.state(), ExecutionState::Completed);

    h.machine.wait_for_idle().await;
    assert_eq!(
        states(&mut events),
        vec![
            ExecutionState::Sending,
            ExecutionState::Executing,
            ExecutionState::Completed,
            ExecutionState::Idle,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_polling_completes_when_no_hook_arrives() {
    let h = Harness::new(4);
    let dispatch = h.dispatcher.dispatch(at("/work/app", "hello")).await.unwrap();
    h.host.push_output(&dispatch.terminal_id, BUSY);
    h.host.push_output(&dispatch.terminal_id, BUSY);
    h.host.push_output(&dispatch.terminal_id, READY);

    let result = h.machine.wait_for_result(dispatch.generation).await;

    assert_eq!(result, Some(ExecutionResult::Success));
    assert_eq!(h.host.capture_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_hook_and_polling_produce_exactly_one_completion() {
    let h = Harness::new(4);
    let mut events = h.machine.subscribe();
    let dispatch = h.dispatcher.dispatch(at("/work/app", "hello")).await.unwrap();
    h.host.push_output(&dispatch.terminal_id, READY);

    // polling needs two reads; the hook lands in between
    tokio::time::sleep(Duration::from_millis(2500)).await;
    h.hook("abc");
    h.machine.wait_for_result(dispatch.generation).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let mut completions = 0;
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::Completed { result, .. } = event {
            assert_eq!(result, ExecutionResult::Success);
            completions += 1;
        }
    }
    assert_eq!(completions, 1);
    // polling stopped with the completion
    let captured = h.host.capture_count();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.host.capture_count(), captured);
}

#[tokio::test(start_paused = true)]
async fn test_late_signal_cannot_complete_the_next_execution() {
    let h = Harness::new(4);
    let first = h.dispatcher.dispatch(at("/work/app", "one")).await.unwrap();
    assert!(h.machine.cancel().await);
    h.machine.wait_for_idle().await;

    let second = h
        .dispatcher
        .dispatch(DispatchRequest {
            session_id: Some(first.session_id.clone()),
            ..DispatchRequest::new("two")
        })
        .await
        .unwrap();
    h.machine
        .signal(first.generation, CompletionSignal::PollingDetected)
        .await;

    assert_eq!(second.session_id, first.session_id);
    assert_eq!(h.machine.state(), ExecutionState::Executing);
    assert_eq!(h.machine.snapshot().generation, second.generation);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_completes_with_failure() {
    let h = Harness::new(4);
    let dispatch = h.dispatcher.dispatch(at("/work/app", "hello")).await.unwrap();
    h.host.push_output(&dispatch.terminal_id, BUSY);

    let result = h.machine.wait_for_result(dispatch.generation).await;

    assert_eq!(result, Some(ExecutionResult::Failure(FailureReason::Timeout)));
}

#[tokio::test(start_paused = true)]
async fn test_label_reuses_live_session() {
    let h = Harness::new(4);
    let first = h
        .dispatcher
        .dispatch(DispatchRequest {
            project_label: Some("Billing".into()),
            ..at("/work/billing", "one")
        })
        .await
        .unwrap();
    h.hook("x");
    h.machine.wait_for_idle().await;

    let second = h
        .dispatcher
        .dispatch(DispatchRequest {
            project_label: Some("bill".into()),
            ..DispatchRequest::new("two")
        })
        .await
        .unwrap();

    assert!(!second.provisioned);
    assert_eq!(second.session_id, first.session_id);
    assert_eq!(h.host.created_count(), 1);
    assert_eq!(h.host.focused(), vec![first.terminal_id.clone()]);
}

#[tokio::test(start_paused = true)]
async fn test_label_matches_hand_opened_target_subtitle() {
    let h = Harness::new(4);
    let first = h.dispatcher.dispatch(at("/work/inventory-api", "one")).await.unwrap();
    h.hook("x");
    h.machine.wait_for_idle().await;

    // no label was stored, but the target's directory matches
    let second = h
        .dispatcher
        .dispatch(DispatchRequest {
            project_label: Some("INVENTORY".into()),
            ..DispatchRequest::new("two")
        })
        .await
        .unwrap();

    assert_eq!(second.session_id, first.session_id);
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_never_queues() {
    let h = Harness::new(4);
    h.dispatcher.dispatch(at("/work/app", "one")).await.unwrap();

    let err = h.dispatcher.dispatch(at("/work/app", "two")).await.unwrap_err();

    assert!(matches!(err, DispatchError::Busy(ExecutionState::Executing)));
    assert_eq!(h.host.created_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_dispatches_provision_one_session() {
    let h = Harness::new(4);

    let (a, b) = tokio::join!(
        h.dispatcher.dispatch(at("/work/a", "one")),
        h.dispatcher.dispatch(at("/work/b", "two")),
    );

    let (accepted, rejected) = match (a, b) {
        (Ok(dispatch), Err(err)) | (Err(err), Ok(dispatch)) => (dispatch, err),
        other => panic!("expected exactly one accepted dispatch, got {:?}", other),
    };
    assert!(matches!(rejected, DispatchError::Busy(_)));
    assert!(accepted.provisioned);
    assert_eq!(h.registry.session_count().await, 1);
    assert_eq!(h.host.created_count(), 1);
    assert_eq!(h.machine.snapshot().generation, accepted.generation);
}

#[tokio::test(start_paused = true)]
async fn test_empty_payload_fails_the_execution() {
    let h = Harness::new(4);

    let err = h.dispatcher.dispatch(at("/work/app", "   ")).await.unwrap_err();

    assert!(matches!(err, DispatchError::EmptyPayload));
    let (_, result) = h.machine.snapshot().last_completed.unwrap();
    assert_eq!(result, ExecutionResult::Failure(FailureReason::EmptyPayload));
    assert_eq!(h.host.created_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delivery_failure_is_typed_and_completes_with_failure() {
    let h = Harness::new(4);
    let first = h.dispatcher.dispatch(at("/work/app", "one")).await.unwrap();
    h.hook("x");
    h.machine.wait_for_idle().await;

    h.host
        .fail_next_send(TerminalError::TargetNotFound(first.terminal_id.clone()));
    let err = h
        .dispatcher
        .dispatch(DispatchRequest {
            session_id: Some(first.session_id.clone()),
            ..DispatchRequest::new("two")
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::Delivery { .. }));
    let (_, result) = h.machine.snapshot().last_completed.unwrap();
    assert!(matches!(
        result,
        ExecutionResult::Failure(FailureReason::DeliveryFailed(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_closed_target_is_retried_only_when_asked() {
    let h = Harness::new(4);
    let first = h
        .dispatcher
        .dispatch(DispatchRequest {
            project_label: Some("app".into()),
            ..at("/work/app", "one")
        })
        .await
        .unwrap();
    h.hook("x");
    h.machine.wait_for_idle().await;

    h.host
        .fail_next_send(TerminalError::TargetNotFound(first.terminal_id.clone()));
    let dispatch = h
        .dispatcher
        .dispatch(DispatchRequest {
            project_label: Some("app".into()),
            retry_on_closed_target: true,
            ..DispatchRequest::new("two")
        })
        .await
        .unwrap();

    assert_eq!(h.machine.state(), ExecutionState::Executing);
    let delivered: Vec<_> = h
        .host
        .sent()
        .into_iter()
        .filter(|(_, text)| text == "two")
        .collect();
    assert_eq!(delivered, vec![(dispatch.terminal_id.clone(), "two".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn test_permission_denial_is_reported() {
    let h = Harness::new(4);
    let first = h.dispatcher.dispatch(at("/work/app", "one")).await.unwrap();
    h.hook("x");
    h.machine.wait_for_idle().await;

    h.host
        .fail_next_send(TerminalError::PermissionDenied("not allowed".into()));
    let _ = h
        .dispatcher
        .dispatch(DispatchRequest {
            session_id: Some(first.session_id),
            ..DispatchRequest::new("two")
        })
        .await;

    let (_, result) = h.machine.snapshot().last_completed.unwrap();
    assert_eq!(
        result,
        ExecutionResult::Failure(FailureReason::PermissionDenied("not allowed".into()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_session_bound_is_enforced_during_provisioning() {
    let h = Harness::new(1);
    h.dispatcher.dispatch(at("/work/a", "one")).await.unwrap();
    h.hook("x");
    h.machine.wait_for_idle().await;
    let generation = h.machine.snapshot().generation;

    let err = h.dispatcher.dispatch(at("/work/b", "two")).await.unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Registry(RegistryError::MaxSessionsReached(1))
    ));
    assert_eq!(h.registry.session_count().await, 1);
    assert_eq!(h.machine.snapshot().generation, generation);
    assert_eq!(h.machine.state(), ExecutionState::Idle);
}

/// Host whose new targets come up after their session was already removed.
struct SessionRemovingHost {
    inner: Arc<FakeTerminalHost>,
    registry: Arc<SessionRegistry>,
}

#[async_trait]
impl TerminalHost for SessionRemovingHost {
    async fn list_targets(&self) -> Result<Vec<TerminalTarget>, TerminalError> {
        self.inner.list_targets().await
    }

    async fn create_target(
        &self,
        working_dir: &Path,
        name: &str,
    ) -> Result<TerminalTarget, TerminalError> {
        for session in self.registry.list().await {
            self.registry.close_session(&session.id).await.unwrap();
        }
        self.inner.create_target(working_dir, name).await
    }

    async fn focus(&self, target_id: &str) -> Result<(), TerminalError> {
        self.inner.focus(target_id).await
    }

    async fn send_text(&self, target_id: &str, text: &str) -> Result<(), TerminalError> {
        self.inner.send_text(target_id, text).await
    }

    async fn capture(&self, target_id: &str, lines: usize) -> Result<String, TerminalError> {
        self.inner.capture(target_id, lines).await
    }

    async fn close(&self, target_id: &str) -> Result<(), TerminalError> {
        self.inner.close(target_id).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_attach_discards_new_target() {
    let state_dir = TempDir::new().unwrap();
    let inner = Arc::new(FakeTerminalHost::new());
    let registry = Arc::new(SessionRegistry::new(SessionStore::in_dir(state_dir.path()), 4));
    let host = Arc::new(SessionRemovingHost {
        inner: inner.clone(),
        registry: registry.clone(),
    });
    let machine = ExecutionMachine::spawn(
        MachineSettings {
            timeout: Duration::from_secs(300),
            completion_linger: Duration::from_millis(500),
        },
        None,
    );
    let dispatcher = Dispatcher::new(
        machine.clone(),
        registry.clone(),
        host,
        TerminalSettings::default(),
    );

    let err = dispatcher.dispatch(at("/work/app", "hello")).await.unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Registry(RegistryError::SessionNotFound(_))
    ));
    assert_eq!(inner.created_count(), 1);
    assert!(inner.list_targets().await.unwrap().is_empty());
    assert!(inner.sent().is_empty());
    assert_eq!(registry.session_count().await, 0);
    assert_eq!(machine.snapshot().generation, 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_session_closes_its_target() {
    let h = Harness::new(4);
    let dispatch = h.dispatcher.dispatch(at("/work/app", "one")).await.unwrap();
    h.hook("x");
    h.machine.wait_for_idle().await;

    h.dispatcher.close_session(&dispatch.session_id).await.unwrap();

    assert!(!h.registry.has_session(&dispatch.session_id).await);
    assert!(h.host.list_targets().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_provisioned_session_gets_correlated() {
    let logs = TempDir::new().unwrap();
    let probe = Arc::new(FakeOpenFilesProbe::new());
    let layout = LogLayout::new(logs.path(), "jsonl");

    let h = Harness::build(4, |dispatcher| {
        let correlator = Arc::new(SessionCorrelator::new(
            dispatcher.registry().clone(),
            probe.clone(),
            layout.clone(),
            CorrelationTiming::default(),
        ));
        dispatcher.with_correlator(correlator)
    });

    let log_id = "0f0f0f0f-aaaa-4bbb-8ccc-123456789abc";
    let log = layout.artifact_path(Path::new("/work/app"), log_id);
    std::fs::create_dir_all(log.parent().unwrap()).unwrap();
    std::fs::write(&log, "{}\n").unwrap();
    // the fake host gives its first target pid 10001
    probe.set_open_files(10_001, vec![log]);

    let dispatch = h.dispatcher.dispatch(at("/work/app", "hello")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let record = h.registry.get(&dispatch.session_id).await.unwrap();
    assert_eq!(record.correlation_id.as_deref(), Some(log_id));
    assert!(h.state_dir.path().join("sessions.json").exists());
}

fn chain(steps: &[&str]) -> ChainSpec {
    ChainSpec {
        name: "release".into(),
        steps: steps
            .iter()
            .map(|payload| ChainStep {
                title: None,
                payload: payload.to_string(),
            })
            .collect(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_chain_runs_steps_against_one_session() {
    let h = Harness::new(4);
    let runner = ChainRunner::new(h.dispatcher.clone());
    let mut events = h.machine.subscribe();
    let hooks = h.hooks.clone();

    // answer every execution with a hook
    let mut executions = h.machine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = executions.recv().await {
            if let ExecutionEvent::StateChanged {
                state: ExecutionState::Executing,
                ..
            } = event
            {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let _ = hooks.send(GatewayEvent::HookCompleted(HookSignal::empty()));
            }
        }
    });

    let outcome = runner
        .run(
            &chain(&["bump", "changelog", "tag"]),
            ChainTarget {
                project_path: Some(PathBuf::from("/work/app")),
                project_label: None,
            },
        )
        .await
        .unwrap();

    assert!(outcome.completed);
    assert_eq!(outcome.results, vec![ExecutionResult::Success; 3]);
    assert_eq!(h.host.created_count(), 1);
    let payloads: Vec<String> = h.host.sent().into_iter().map(|(_, text)| text).collect();
    assert_eq!(payloads, vec!["claude", "bump", "changelog", "tag"]);

    let mut links = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::Completed {
            context: Some(context),
            ..
        } = event
        {
            links.push(context.chain.unwrap().step);
        }
    }
    assert_eq!(links, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_chain_stops_at_first_failure() {
    let h = Harness::new(4);
    let runner = ChainRunner::new(h.dispatcher.clone());
    let hooks = h.hooks.clone();
    let host = h.host.clone();

    let mut executions = h.machine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = executions.recv().await {
            if let ExecutionEvent::StateChanged {
                state: ExecutionState::Executing,
                ..
            } = event
            {
                // the second delivery will fail
                host.fail_next_send(TerminalError::CommandFailed {
                    command: "send-keys".into(),
                    stderr: "broken pipe".into(),
                });
                let _ = hooks.send(GatewayEvent::HookCompleted(HookSignal::empty()));
            }
        }
    });

    let outcome = runner
        .run(&chain(&["one", "two", "three"]), ChainTarget::default())
        .await
        .unwrap();

    assert!(!outcome.completed);
    assert_eq!(outcome.results.len(), 2);
    assert_eq!(outcome.results[0], ExecutionResult::Success);
    assert!(matches!(
        outcome.results[1],
        ExecutionResult::Failure(FailureReason::DeliveryFailed(_))
    ));
    assert!(h.machine.snapshot().chain.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_paused_chain_waits_between_steps() {
    let h = Harness::new(4);
    let runner = ChainRunner::new(h.dispatcher.clone());
    let mut events = h.machine.subscribe();

    let run = tokio::spawn(async move {
        runner
            .run(
                &chain(&["one", "two"]),
                ChainTarget {
                    project_path: Some(PathBuf::from("/work/app")),
                    project_label: None,
                },
            )
            .await
    });

    // wait for step one to start executing, then pause and complete it
    loop {
        if let ExecutionEvent::StateChanged {
            state: ExecutionState::Executing,
            ..
        } = events.recv().await.unwrap()
        {
            break;
        }
    }
    assert!(h.machine.pause().await);
    h.hook("x");

    tokio::time::sleep(Duration::from_secs(60)).await;
    let payloads: Vec<String> = h.host.sent().into_iter().map(|(_, text)| text).collect();
    assert_eq!(payloads, vec!["claude", "one"]);
    assert_eq!(h.machine.state(), ExecutionState::Idle);

    assert!(h.machine.resume().await);
    loop {
        if let ExecutionEvent::StateChanged {
            state: ExecutionState::Executing,
            ..
        } = events.recv().await.unwrap()
        {
            break;
        }
    }
    h.hook("x");

    let outcome = run.await.unwrap().unwrap();
    assert!(outcome.completed);
    assert_eq!(outcome.results.len(), 2);
}
