//! Completion signal aggregation.
//!
//! Once an execution enters `executing`, two producers are armed: a hook
//! forwarder listening to the gateway's event feed, and a poller watching the
//! target's visible output. Both push `(generation, signal)` into the machine;
//! the machine keeps the first one for the current generation and drops the
//! rest.

use std::sync::Arc;
use std::time::Duration;

use baton_core::{CompletionSignal, ExecutionSettings};
use baton_gateway::GatewayEvent;
use baton_terminal::{ReadySignature, TerminalHost};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Where armed producers deliver their signals.
pub type SignalSink = mpsc::UnboundedSender<(u64, CompletionSignal)>;

#[derive(Debug, Clone)]
pub struct PollingSettings {
    pub interval: Duration,
    pub capture_lines: usize,
    pub confirmations: u32,
}

impl From<&ExecutionSettings> for PollingSettings {
    fn from(settings: &ExecutionSettings) -> Self {
        Self {
            interval: settings.poll_interval(),
            capture_lines: settings.capture_lines,
            confirmations: settings.ready_confirmations.max(1),
        }
    }
}

pub struct CompletionAggregator {
    host: Arc<dyn TerminalHost>,
    hooks: Option<broadcast::Sender<GatewayEvent>>,
    signature: ReadySignature,
    polling: PollingSettings,
}

impl CompletionAggregator {
    pub fn new(
        host: Arc<dyn TerminalHost>,
        signature: ReadySignature,
        polling: PollingSettings,
    ) -> Self {
        Self {
            host,
            hooks: None,
            signature,
            polling,
        }
    }

    pub fn from_settings(host: Arc<dyn TerminalHost>, settings: &ExecutionSettings) -> Self {
        Self::new(
            host,
            ReadySignature::from_settings(settings),
            PollingSettings::from(settings),
        )
    }

    /// Listen for completion hooks on the gateway's event feed.
    pub fn with_hooks(mut self, hooks: broadcast::Sender<GatewayEvent>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Start both producers for one execution.
    ///
    /// Polling is skipped when there is no terminal target to read.
    pub fn arm(&self, generation: u64, target_id: Option<&str>, sink: SignalSink) -> ArmedDetection {
        let hook_task = self.hooks.as_ref().map(|hooks| {
            let rx = hooks.subscribe();
            let sink = sink.clone();
            tokio::spawn(forward_hooks(generation, rx, sink))
        });

        let poll_task = target_id.map(|target_id| {
            tokio::spawn(poll_until_ready(
                generation,
                self.host.clone(),
                target_id.to_string(),
                self.signature.clone(),
                self.polling.clone(),
                sink,
            ))
        });

        debug!(
            generation,
            hook = hook_task.is_some(),
            polling = poll_task.is_some(),
            "Completion detection armed"
        );
        ArmedDetection {
            generation,
            tasks: hook_task.into_iter().chain(poll_task).collect(),
        }
    }
}

/// Producers running for one generation.
pub struct ArmedDetection {
    generation: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl ArmedDetection {
    /// Stop both producers. Signals already queued are dropped by the
    /// machine's generation check.
    pub fn disarm(self) {
        for task in &self.tasks {
            task.abort();
        }
        debug!(generation = self.generation, "Completion detection disarmed");
    }
}

async fn forward_hooks(
    generation: u64,
    mut rx: broadcast::Receiver<GatewayEvent>,
    sink: SignalSink,
) {
    loop {
        match rx.recv().await {
            Ok(GatewayEvent::HookCompleted(signal)) => {
                let _ = sink.send((generation, CompletionSignal::Hook(signal)));
                return;
            }
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(generation, skipped, "Hook forwarder lagged behind gateway events");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn poll_until_ready(
    generation: u64,
    host: Arc<dyn TerminalHost>,
    target_id: String,
    signature: ReadySignature,
    polling: PollingSettings,
    sink: SignalSink,
) {
    let mut ticker = tokio::time::interval(polling.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;

    let mut streak = 0;
    let mut attempt: u64 = 0;
    loop {
        ticker.tick().await;
        attempt += 1;

        match host.capture(&target_id, polling.capture_lines).await {
            Ok(output) if signature.is_ready(&output) => {
                streak += 1;
                if streak >= polling.confirmations {
                    debug!(generation, attempt, target = %target_id, "Ready signature confirmed");
                    let _ = sink.send((generation, CompletionSignal::PollingDetected));
                    return;
                }
            }
            Ok(_) => streak = 0,
            Err(e) => {
                streak = 0;
                warn!(generation, attempt, target = %target_id, "Output capture failed: {}", e);
            }
        }
    }
}
