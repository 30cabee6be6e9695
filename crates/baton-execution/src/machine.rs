//! The execution state machine.
//!
//! One actor task owns the state; [`ExecutionHandle`] talks to it over a
//! command channel. The timeout watchdog and the completed-to-idle linger are
//! deadlines inside the actor's own `select!`, so clearing them is part of the
//! transition that makes them obsolete. Every execution gets a new generation
//! number and every signal or event carries it.

use std::future::Future;
use std::time::Duration;

use baton_core::{
    CompletionSignal, ExecutionContext, ExecutionResult, ExecutionSettings, ExecutionState,
    FailureReason,
};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::aggregator::{ArmedDetection, CompletionAggregator};

const COMMAND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;

/// Published on [`ExecutionHandle::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    StateChanged {
        generation: u64,
        state: ExecutionState,
    },
    Completed {
        generation: u64,
        context: Option<ExecutionContext>,
        result: ExecutionResult,
    },
    ChainPaused {
        chain: String,
    },
    ChainResumed {
        chain: String,
    },
}

/// Current machine state as seen on [`ExecutionHandle::watch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionSnapshot {
    pub state: ExecutionState,
    pub generation: u64,
    pub context: Option<ExecutionContext>,
    /// Result of the most recent completed generation; survives the return
    /// to `idle`.
    pub last_completed: Option<(u64, ExecutionResult)>,
    /// Chain currently driving the machine, if any
    pub chain: Option<String>,
    pub paused: bool,
}

#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub timeout: Duration,
    pub completion_linger: Duration,
}

impl From<&ExecutionSettings> for MachineSettings {
    fn from(settings: &ExecutionSettings) -> Self {
        Self {
            timeout: settings.timeout(),
            completion_linger: settings.completion_linger(),
        }
    }
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self::from(&ExecutionSettings::default())
    }
}

enum Command {
    BeginSending {
        context: ExecutionContext,
        reply: oneshot::Sender<Option<u64>>,
    },
    Retarget {
        generation: u64,
        session_id: String,
        terminal_id: String,
        reply: oneshot::Sender<bool>,
    },
    BeginExecuting {
        reply: oneshot::Sender<bool>,
    },
    MarkCompleted {
        generation: Option<u64>,
        result: ExecutionResult,
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Signal {
        generation: u64,
        signal: CompletionSignal,
    },
    EnterChain {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    LeaveChain {
        reply: oneshot::Sender<()>,
    },
    Pause {
        reply: oneshot::Sender<bool>,
    },
    Resume {
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to the machine actor.
///
/// Transition methods report whether the transition was taken. A call from a
/// state that does not permit it is logged and ignored; nothing is queued.
#[derive(Clone)]
pub struct ExecutionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ExecutionEvent>,
    snapshot: watch::Receiver<ExecutionSnapshot>,
}

pub struct ExecutionMachine;

impl ExecutionMachine {
    /// Start the actor. Completion detection is armed at `begin_executing`
    /// when an aggregator is given.
    pub fn spawn(
        settings: MachineSettings,
        aggregator: Option<CompletionAggregator>,
    ) -> ExecutionHandle {
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot_tx, snapshot) = watch::channel(ExecutionSnapshot::default());
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let actor = MachineActor {
            settings,
            aggregator,
            snapshot: ExecutionSnapshot::default(),
            watchdog: None,
            linger: None,
            detection: None,
            events: events.clone(),
            snapshot_tx,
            signal_tx,
        };
        tokio::spawn(actor.run(command_rx, signal_rx));

        ExecutionHandle {
            commands,
            events,
            snapshot,
        }
    }
}

impl ExecutionHandle {
    /// `idle -> sending`. Returns the new generation.
    pub async fn begin_sending(&self, context: ExecutionContext) -> Option<u64> {
        self.call(|reply| Command::BeginSending { context, reply })
            .await
            .flatten()
    }

    /// Point a `sending` execution at a different session and target, used
    /// when delivery is retried against a freshly resolved target.
    pub async fn retarget(&self, generation: u64, session_id: String, terminal_id: String) -> bool {
        self.call(|reply| Command::Retarget {
            generation,
            session_id,
            terminal_id,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// `sending -> executing`; starts the watchdog and completion detection.
    pub async fn begin_executing(&self) -> bool {
        self.call(|reply| Command::BeginExecuting { reply })
            .await
            .unwrap_or(false)
    }

    /// `sending | executing -> completed` for whatever execution is current.
    pub async fn mark_completed(&self, result: ExecutionResult) -> bool {
        self.call(|reply| Command::MarkCompleted {
            generation: None,
            result,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Like [`mark_completed`](Self::mark_completed) but ignored unless
    /// `generation` is still current.
    pub async fn mark_completed_for(&self, generation: u64, result: ExecutionResult) -> bool {
        self.call(|reply| Command::MarkCompleted {
            generation: Some(generation),
            result,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Complete the active execution as cancelled. Watchdog and detection
    /// are stopped before this returns.
    pub async fn cancel(&self) -> bool {
        self.call(|reply| Command::Cancel { reply })
            .await
            .unwrap_or(false)
    }

    /// Back to `idle` from anywhere, bypassing guards. An in-flight generation
    /// is recorded as cancelled.
    pub async fn reset(&self) {
        let _ = self.call(|reply| Command::Reset { reply }).await;
    }

    /// Inject a completion signal for `generation`.
    pub async fn signal(&self, generation: u64, signal: CompletionSignal) {
        if self
            .commands
            .send(Command::Signal { generation, signal })
            .await
            .is_err()
        {
            debug!("Execution machine is gone, dropping signal");
        }
    }

    pub async fn enter_chain(&self, name: impl Into<String>) -> bool {
        let name = name.into();
        self.call(|reply| Command::EnterChain { name, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn leave_chain(&self) {
        let _ = self.call(|reply| Command::LeaveChain { reply }).await;
    }

    /// Hold the running chain before its next step. Only valid during a chain.
    pub async fn pause(&self) -> bool {
        self.call(|reply| Command::Pause { reply })
            .await
            .unwrap_or(false)
    }

    pub async fn resume(&self) -> bool {
        self.call(|reply| Command::Resume { reply })
            .await
            .unwrap_or(false)
    }

    /// Stop the actor and everything it armed.
    pub async fn shutdown(&self) {
        let _ = self.call(|reply| Command::Shutdown { reply }).await;
    }

    pub fn state(&self) -> ExecutionState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn is_paused(&self) -> bool {
        self.snapshot.borrow().paused
    }

    pub fn watch(&self) -> watch::Receiver<ExecutionSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Wait for `generation` to complete and return its result.
    ///
    /// Returns immediately if it already completed, `None` if the machine
    /// stopped or a later generation completed first.
    pub async fn wait_for_result(&self, generation: u64) -> Option<ExecutionResult> {
        let mut rx = self.snapshot.clone();
        let last_completed = rx
            .wait_for(|s| matches!(&s.last_completed, Some((g, _)) if *g >= generation))
            .await
            .ok()?
            .last_completed
            .clone();
        match last_completed {
            Some((g, result)) if g == generation => Some(result),
            _ => None,
        }
    }

    pub async fn wait_for_idle(&self) -> bool {
        let mut rx = self.snapshot.clone();
        let idle = rx.wait_for(|s| s.state == ExecutionState::Idle).await.is_ok();
        idle
    }

    /// Wait until the machine is not paused.
    pub async fn wait_until_resumed(&self) -> bool {
        let mut rx = self.snapshot.clone();
        let resumed = rx.wait_for(|s| !s.paused).await.is_ok();
        resumed
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(command(reply)).await.is_err() {
            warn!("Execution machine is not running");
            return None;
        }
        rx.await.ok()
    }
}

struct MachineActor {
    settings: MachineSettings,
    aggregator: Option<CompletionAggregator>,
    snapshot: ExecutionSnapshot,
    watchdog: Option<Instant>,
    linger: Option<Instant>,
    detection: Option<ArmedDetection>,
    events: broadcast::Sender<ExecutionEvent>,
    snapshot_tx: watch::Sender<ExecutionSnapshot>,
    signal_tx: mpsc::UnboundedSender<(u64, CompletionSignal)>,
}

impl MachineActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut signals: mpsc::UnboundedReceiver<(u64, CompletionSignal)>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.disarm();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some((generation, signal)) = signals.recv() => {
                    self.on_signal(generation, signal);
                }
                _ = deadline(self.watchdog) => self.on_watchdog(),
                _ = deadline(self.linger) => self.on_linger(),
            }
        }

        self.disarm();
        debug!("Execution machine stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::BeginSending { context, reply } => {
                let _ = reply.send(self.begin_sending(context));
            }
            Command::Retarget {
                generation,
                session_id,
                terminal_id,
                reply,
            } => {
                let _ = reply.send(self.retarget(generation, session_id, terminal_id));
            }
            Command::BeginExecuting { reply } => {
                let _ = reply.send(self.begin_executing());
            }
            Command::MarkCompleted {
                generation,
                result,
                reply,
            } => {
                let current = generation.map_or(true, |g| g == self.snapshot.generation);
                let taken = if current {
                    self.mark_completed(result)
                } else {
                    debug!(generation, current = self.snapshot.generation, "Ignoring completion for stale generation");
                    false
                };
                let _ = reply.send(taken);
            }
            Command::Cancel { reply } => {
                let taken = if self.snapshot.state.is_active() {
                    self.mark_completed(ExecutionResult::Cancelled)
                } else {
                    debug!(state = %self.snapshot.state, "Ignoring cancel outside an active execution");
                    false
                };
                let _ = reply.send(taken);
            }
            Command::Reset { reply } => {
                self.reset();
                let _ = reply.send(());
            }
            Command::Signal { generation, signal } => self.on_signal(generation, signal),
            Command::EnterChain { name, reply } => {
                let taken = if self.snapshot.chain.is_none() {
                    self.snapshot.chain = Some(name);
                    self.publish_snapshot();
                    true
                } else {
                    false
                };
                let _ = reply.send(taken);
            }
            Command::LeaveChain { reply } => {
                self.snapshot.chain = None;
                self.snapshot.paused = false;
                self.publish_snapshot();
                let _ = reply.send(());
            }
            Command::Pause { reply } => {
                let _ = reply.send(self.set_paused(true));
            }
            Command::Resume { reply } => {
                let _ = reply.send(self.set_paused(false));
            }
            // handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn begin_sending(&mut self, context: ExecutionContext) -> Option<u64> {
        if self.snapshot.state != ExecutionState::Idle {
            warn!(state = %self.snapshot.state, "begin_sending ignored: machine is not idle");
            return None;
        }

        self.snapshot.generation += 1;
        info!(
            generation = self.snapshot.generation,
            session_id = %context.session_id,
            title = %context.title,
            "Execution started"
        );
        self.snapshot.context = Some(context);
        self.transition(ExecutionState::Sending);
        Some(self.snapshot.generation)
    }

    fn retarget(&mut self, generation: u64, session_id: String, terminal_id: String) -> bool {
        if self.snapshot.state != ExecutionState::Sending || generation != self.snapshot.generation {
            debug!(generation, "retarget ignored");
            return false;
        }
        let Some(context) = self.snapshot.context.as_mut() else {
            return false;
        };
        context.session_id = session_id;
        context.terminal_id = Some(terminal_id);
        self.publish_snapshot();
        true
    }

    fn begin_executing(&mut self) -> bool {
        if self.snapshot.state != ExecutionState::Sending {
            warn!(state = %self.snapshot.state, "begin_executing ignored: machine is not sending");
            return false;
        }

        let generation = self.snapshot.generation;
        self.watchdog = Some(Instant::now() + self.settings.timeout);
        if let Some(aggregator) = &self.aggregator {
            let target = self
                .snapshot
                .context
                .as_ref()
                .and_then(|c| c.terminal_id.as_deref());
            self.detection = Some(aggregator.arm(generation, target, self.signal_tx.clone()));
        }
        self.transition(ExecutionState::Executing);
        true
    }

    fn mark_completed(&mut self, result: ExecutionResult) -> bool {
        if !self.snapshot.state.is_active() {
            debug!(state = %self.snapshot.state, %result, "mark_completed ignored: no active execution");
            return false;
        }

        self.disarm();
        self.linger = Some(Instant::now() + self.settings.completion_linger);

        let generation = self.snapshot.generation;
        info!(generation, %result, "Execution completed");
        self.snapshot.last_completed = Some((generation, result.clone()));
        self.transition(ExecutionState::Completed);
        self.emit(ExecutionEvent::Completed {
            generation,
            context: self.snapshot.context.clone(),
            result,
        });
        true
    }

    fn reset(&mut self) {
        self.disarm();
        self.linger = None;
        self.snapshot.context = None;
        self.snapshot.paused = false;
        if self.snapshot.state != ExecutionState::Idle {
            warn!(generation = self.snapshot.generation, state = %self.snapshot.state, "Execution machine hard reset");
            if self.snapshot.state.is_active() {
                // waiters on this generation must not hang
                self.snapshot.last_completed =
                    Some((self.snapshot.generation, ExecutionResult::Cancelled));
            }
            self.transition(ExecutionState::Idle);
        } else {
            self.publish_snapshot();
        }
    }

    fn on_signal(&mut self, generation: u64, signal: CompletionSignal) {
        if generation != self.snapshot.generation
            || self.snapshot.state != ExecutionState::Executing
        {
            debug!(
                generation,
                current = self.snapshot.generation,
                state = %self.snapshot.state,
                source = signal.source(),
                "Ignoring late completion signal"
            );
            return;
        }
        info!(generation, source = signal.source(), "Completion signal received");
        self.mark_completed(ExecutionResult::Success);
    }

    fn on_watchdog(&mut self) {
        self.watchdog = None;
        if self.snapshot.state == ExecutionState::Executing {
            warn!(
                generation = self.snapshot.generation,
                timeout_secs = self.settings.timeout.as_secs(),
                "Execution timed out"
            );
            self.mark_completed(ExecutionResult::Failure(FailureReason::Timeout));
        }
    }

    fn on_linger(&mut self) {
        self.linger = None;
        if self.snapshot.state == ExecutionState::Completed {
            self.snapshot.context = None;
            self.transition(ExecutionState::Idle);
        }
    }

    fn set_paused(&mut self, paused: bool) -> bool {
        let Some(chain) = self.snapshot.chain.clone() else {
            debug!(paused, "Pause/resume ignored: no chain is running");
            return false;
        };
        if self.snapshot.paused == paused {
            return false;
        }
        self.snapshot.paused = paused;
        self.publish_snapshot();
        self.emit(if paused {
            ExecutionEvent::ChainPaused { chain }
        } else {
            ExecutionEvent::ChainResumed { chain }
        });
        true
    }

    fn disarm(&mut self) {
        self.watchdog = None;
        if let Some(detection) = self.detection.take() {
            detection.disarm();
        }
    }

    fn transition(&mut self, state: ExecutionState) {
        debug!(generation = self.snapshot.generation, from = %self.snapshot.state, to = %state, "State transition");
        self.snapshot.state = state;
        self.publish_snapshot();
        self.emit(ExecutionEvent::StateChanged {
            generation: self.snapshot.generation,
            state,
        });
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.snapshot.clone());
    }

    fn emit(&self, event: ExecutionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

fn deadline(at: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match at {
            Some(at) => sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}
