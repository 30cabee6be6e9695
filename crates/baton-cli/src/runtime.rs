//! Wires the listener, machine, registry, and correlator into one process.

use std::sync::Arc;

use anyhow::{Context, Result};
use baton_core::BatonConfig;
use baton_execution::{
    CompletionAggregator, Dispatcher, ExecutionHandle, ExecutionMachine, MachineSettings,
};
use baton_gateway::{GatewayServer, ScreenshotRuns};
use baton_sessions::{BackgroundTask, SessionCorrelator, SessionRegistry, SessionStore};
use baton_terminal::{TerminalHost, TmuxHost};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Registry backed by the configured state directory, restored from disk.
pub async fn open_registry(config: &BatonConfig) -> Result<Arc<SessionRegistry>> {
    let state_dir = config.sessions.resolved_state_dir();
    let registry = SessionRegistry::new(
        SessionStore::in_dir(&state_dir),
        config.sessions.max_sessions,
    );
    let restored = registry
        .restore()
        .await
        .with_context(|| format!("Failed to restore sessions from {}", state_dir.display()))?;
    info!(restored, path = %state_dir.display(), "Session registry ready");
    Ok(Arc::new(registry))
}

pub fn terminal_host(config: &BatonConfig) -> Arc<dyn TerminalHost> {
    Arc::new(TmuxHost::new(config.terminal.tmux_session.as_str()))
}

pub struct Runtime {
    pub machine: ExecutionHandle,
    pub dispatcher: Arc<Dispatcher>,
    pub correlator: Arc<SessionCorrelator>,
    revalidation: BackgroundTask,
    listener_stop: oneshot::Sender<()>,
    listener: JoinHandle<()>,
}

impl Runtime {
    pub async fn start(config: &BatonConfig) -> Result<Self> {
        let registry = open_registry(config).await?;
        let host = terminal_host(config);

        let gateway = GatewayServer::new(ScreenshotRuns::new(config.screenshots.resolved_root()));
        let listener = GatewayServer::bind(&config.listener.host, config.listener.port)
            .await
            .context("Failed to start completion listener")?;

        let aggregator = CompletionAggregator::from_settings(host.clone(), &config.execution)
            .with_hooks(gateway.events());
        let machine = ExecutionMachine::spawn(
            MachineSettings::from(&config.execution),
            Some(aggregator),
        );

        let correlator = Arc::new(SessionCorrelator::from_settings(
            registry.clone(),
            &config.correlation,
        ));
        match correlator.recover_on_startup().await {
            Ok(report) => info!(
                validated = report.validated.len(),
                cleared = report.cleared.len(),
                recovered = report.recovered.len(),
                "Startup correlation recovery finished"
            ),
            Err(e) => warn!("Startup correlation recovery failed: {}", e),
        }
        let revalidation = correlator.start_revalidation();

        let dispatcher = Arc::new(
            Dispatcher::new(machine.clone(), registry, host, config.terminal.clone())
                .with_correlator(correlator.clone()),
        );

        let (listener_stop, stopped) = oneshot::channel::<()>();
        let listener = tokio::spawn(async move {
            let shutdown = async move {
                let _ = stopped.await;
            };
            if let Err(e) = gateway.serve(listener, shutdown).await {
                error!("Completion listener stopped: {}", e);
            }
        });

        Ok(Self {
            machine,
            dispatcher,
            correlator,
            revalidation,
            listener_stop,
            listener,
        })
    }

    pub async fn shutdown(self) {
        self.revalidation.stop().await;
        self.machine.shutdown().await;
        let _ = self.listener_stop.send(());
        if let Err(e) = self.listener.await {
            warn!("Completion listener task failed: {}", e);
        }
        info!("Shut down");
    }
}
