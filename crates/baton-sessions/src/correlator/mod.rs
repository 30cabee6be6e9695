//! Session-identity correlation.
//!
//! Works out which conversation log a session's process is writing. The
//! primary method asks an [`OpenFilesProbe`] for the open files of the
//! process tree; when that finds nothing within the attempt budget, the
//! newest recently created unclaimed log in the project directory is taken
//! instead. That fallback can pick the wrong log when several sessions start
//! in the same directory at once, so the periodic re-validation pass keeps
//! running the primary method and corrects the mapping when it disagrees.
//!
//! All writes go through [`SessionRegistry`], which refuses to hand one log to
//! two sessions.

mod layout;
mod probe;

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use baton_core::{CorrelationSettings, SessionRecord};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{CorrelationError, RegistryError};
use crate::registry::SessionRegistry;

pub use layout::{Artifact, LogLayout};
pub use probe::{LsofProbe, OpenFilesProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationMethod {
    /// Open-files probe found exactly one log
    Primary,
    /// Newest recently created unclaimed log in the project directory
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub correlation_id: String,
    pub method: CorrelationMethod,
}

/// Outcome of [`SessionCorrelator::recover_on_startup`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sessions whose stored log still exists
    pub validated: Vec<String>,
    /// Sessions whose stored log was gone and whose id was cleared
    pub cleared: Vec<String>,
    /// `(session id, correlation id)` pairs assigned by the second-chance pass
    pub recovered: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct CorrelationTiming {
    pub probe_interval: Duration,
    pub probe_attempts: u32,
    pub fallback_window: Duration,
    pub revalidate_interval: Duration,
    pub recovery_window: Duration,
}

impl From<&CorrelationSettings> for CorrelationTiming {
    fn from(settings: &CorrelationSettings) -> Self {
        Self {
            probe_interval: settings.probe_interval(),
            probe_attempts: settings.probe_attempts,
            fallback_window: settings.fallback_window(),
            revalidate_interval: settings.revalidate_interval(),
            recovery_window: settings.recovery_window(),
        }
    }
}

impl Default for CorrelationTiming {
    fn default() -> Self {
        Self::from(&CorrelationSettings::default())
    }
}

/// Handle to a periodic task started by the correlator.
pub struct BackgroundTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Signal the task and wait for its current pass to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }
}

pub struct SessionCorrelator {
    registry: Arc<SessionRegistry>,
    probe: Arc<dyn OpenFilesProbe>,
    layout: LogLayout,
    timing: CorrelationTiming,
}

impl SessionCorrelator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        probe: Arc<dyn OpenFilesProbe>,
        layout: LogLayout,
        timing: CorrelationTiming,
    ) -> Self {
        Self {
            registry,
            probe,
            layout,
            timing,
        }
    }

    /// Correlator backed by `lsof`, laid out per the configured logs root.
    pub fn from_settings(registry: Arc<SessionRegistry>, settings: &CorrelationSettings) -> Self {
        Self::new(
            registry,
            Arc::new(LsofProbe::new(settings.lsof_command.clone())),
            LogLayout::new(
                settings.resolved_logs_root(),
                settings.artifact_extension.clone(),
            ),
            CorrelationTiming::from(settings),
        )
    }

    pub fn layout(&self) -> &LogLayout {
        &self.layout
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// One run of the primary method.
    ///
    /// Returns the log id only when the process tree holds exactly one
    /// unclaimed log open in the session's project directory.
    pub async fn probe_once(
        &self,
        session: &SessionRecord,
    ) -> Result<Option<String>, CorrelationError> {
        let claimed = self.registry.claimed_correlations(Some(&session.id)).await;
        let mut matches = self.open_artifacts(session).await?;
        matches.retain(|id| !claimed.contains(id));

        if matches.len() > 1 {
            debug!(session_id = %session.id, count = matches.len(), "Ambiguous open logs");
            return Ok(None);
        }
        Ok(matches.into_iter().next())
    }

    /// Every log in the session's project directory its process tree holds
    /// open, claimed or not.
    async fn open_artifacts(
        &self,
        session: &SessionRecord,
    ) -> Result<BTreeSet<String>, CorrelationError> {
        let (Some(pid), Some(working_dir)) = (session.pid, session.working_directory.as_deref())
        else {
            return Ok(BTreeSet::new());
        };

        let project_dir = self.layout.project_dir(working_dir);
        let open_files = self.probe.open_files(pid).await?;
        Ok(open_files
            .iter()
            .filter_map(|path| self.layout.artifact_id_in(&project_dir, path))
            .collect())
    }

    /// Primary method with retries, then the filesystem fallback.
    ///
    /// The id is persisted through the registry the moment it is found.
    pub async fn detect(&self, session_id: &str) -> Result<Correlation, CorrelationError> {
        let attempts = self.timing.probe_attempts;

        for attempt in 1..=attempts {
            tokio::time::sleep(self.timing.probe_interval).await;
            let session = self.session(session_id).await?;

            match self.probe_once(&session).await {
                Ok(Some(correlation_id)) => {
                    match self
                        .registry
                        .assign_correlation(session_id, &correlation_id)
                        .await
                    {
                        Ok(_) => {
                            info!(session_id, attempt, %correlation_id, "Correlated session via open files");
                            return Ok(Correlation {
                                correlation_id,
                                method: CorrelationMethod::Primary,
                            });
                        }
                        Err(RegistryError::CorrelationClaimed { owner, .. }) => {
                            debug!(session_id, attempt, %owner, "Probed log is claimed by another session");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(None) => debug!(session_id, attempt, "No open log yet"),
                Err(e) => debug!(session_id, attempt, "Open-files probe failed: {}", e),
            }
        }

        warn!(session_id, attempts, "Open-files probe exhausted, trying filesystem fallback");
        match self.fallback(session_id).await? {
            Some(correlation) => Ok(correlation),
            None => Err(CorrelationError::NotDetected {
                session_id: session_id.to_string(),
                attempts,
            }),
        }
    }

    /// Assign the most recently created unclaimed log from the fallback window.
    pub async fn fallback(&self, session_id: &str) -> Result<Option<Correlation>, CorrelationError> {
        let session = self.session(session_id).await?;
        let Some(working_dir) = session.working_directory.as_deref() else {
            return Ok(None);
        };

        let cutoff = SystemTime::now()
            .checked_sub(self.timing.fallback_window)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut candidates: Vec<Artifact> = self
            .layout
            .list_artifacts(&self.layout.project_dir(working_dir))?
            .into_iter()
            .filter(|artifact| artifact.created >= cutoff)
            .collect();
        candidates.sort_by(|a, b| b.created.cmp(&a.created));

        for artifact in candidates {
            match self
                .registry
                .assign_correlation(session_id, &artifact.id)
                .await
            {
                Ok(_) => {
                    info!(session_id, correlation_id = %artifact.id, "Correlated session via filesystem fallback");
                    return Ok(Some(Correlation {
                        correlation_id: artifact.id,
                        method: CorrelationMethod::Fallback,
                    }));
                }
                Err(RegistryError::CorrelationClaimed { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        warn!(session_id, "No unclaimed log in the fallback window");
        Ok(None)
    }

    /// Run [`detect`](Self::detect) in the background.
    pub fn spawn_detection(
        self: &Arc<Self>,
        session_id: String,
    ) -> JoinHandle<Result<Correlation, CorrelationError>> {
        let correlator = Arc::clone(self);
        tokio::spawn(async move {
            let result = correlator.detect(&session_id).await;
            if let Err(e) = &result {
                warn!(session_id = %session_id, "Session correlation failed: {}", e);
            }
            result
        })
    }

    /// Re-run the primary method for every session with a live process,
    /// following log rotation and undoing wrong fallback picks. Returns the
    /// number of sessions updated.
    ///
    /// A process that holds exactly one log open owns it. If another session
    /// holds that id, it is taken over unless the holder's own process also
    /// has it open.
    pub async fn revalidate_all(&self) -> usize {
        let mut updated = 0;

        for session in self.registry.list().await {
            let Some(pid) = session.pid else {
                continue;
            };
            if !self.probe.is_alive(pid).await {
                continue;
            }

            match self.revalidate(&session).await {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(e) => debug!(session_id = %session.id, pid, "Re-validation failed: {}", e),
            }
        }

        updated
    }

    async fn revalidate(&self, session: &SessionRecord) -> Result<bool, CorrelationError> {
        let observed = self.open_artifacts(session).await?;
        if observed.len() != 1 {
            return Ok(false);
        }
        let Some(current) = observed.into_iter().next() else {
            return Ok(false);
        };

        // an earlier step of this pass may have changed the record
        let stored = self.session(&session.id).await?.correlation_id;
        if stored.as_deref() == Some(current.as_str()) {
            return Ok(false);
        }

        if let Some(holder) = self.registry.holder_of(&current).await {
            if self.holder_has_open(&holder, &current).await {
                debug!(
                    session_id = %session.id,
                    holder = %holder.id,
                    correlation_id = %current,
                    "Log is open in both sessions, leaving it with its holder"
                );
                return Ok(false);
            }
        }

        let taken_from = self
            .registry
            .reassign_correlation(&session.id, &current)
            .await?;
        info!(
            session_id = %session.id,
            previous = stored.as_deref().unwrap_or("-"),
            correlation_id = %current,
            taken_from = taken_from.as_deref().unwrap_or("-"),
            "Session log corrected"
        );
        Ok(true)
    }

    async fn holder_has_open(&self, holder: &SessionRecord, correlation_id: &str) -> bool {
        let Some(pid) = holder.pid else {
            return false;
        };
        if !self.probe.is_alive(pid).await {
            return false;
        }
        match self.open_artifacts(holder).await {
            Ok(open) => open.contains(correlation_id),
            // unknown, keep the current owner
            Err(_) => true,
        }
    }

    /// Start the periodic re-validation loop.
    pub fn start_revalidation(self: &Arc<Self>) -> BackgroundTask {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let correlator = Arc::clone(self);
        let period = self.timing.revalidate_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let updated = correlator.revalidate_all().await;
                        debug!(updated, "Re-validation pass finished");
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        BackgroundTask { shutdown, handle }
    }

    /// Validate restored correlation ids, then pair orphaned sessions with
    /// recently modified unclaimed logs.
    ///
    /// Orphans are visited oldest first and each takes the most recently
    /// modified remaining log in its project directory.
    pub async fn recover_on_startup(&self) -> Result<RecoveryReport, CorrelationError> {
        let mut report = RecoveryReport::default();

        for session in self.registry.list().await {
            let (Some(correlation_id), Some(working_dir)) = (
                session.correlation_id.as_deref(),
                session.working_directory.as_deref(),
            ) else {
                continue;
            };

            if self.layout.artifact_path(working_dir, correlation_id).is_file() {
                report.validated.push(session.id);
            } else {
                warn!(session_id = %session.id, correlation_id, "Stored log is gone, clearing correlation id");
                self.registry.clear_correlation(&session.id).await?;
                report.cleared.push(session.id);
            }
        }

        let cutoff = SystemTime::now()
            .checked_sub(self.timing.recovery_window)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut candidates_by_dir: HashMap<PathBuf, Vec<Artifact>> = HashMap::new();

        for session in self.registry.list().await {
            if session.correlation_id.is_some() {
                continue;
            }
            let Some(working_dir) = session.working_directory.as_deref() else {
                continue;
            };

            let project_dir = self.layout.project_dir(working_dir);
            if !candidates_by_dir.contains_key(&project_dir) {
                let mut recent: Vec<Artifact> = self
                    .layout
                    .list_artifacts(&project_dir)?
                    .into_iter()
                    .filter(|artifact| artifact.modified >= cutoff)
                    .collect();
                recent.sort_by(|a, b| b.modified.cmp(&a.modified));
                candidates_by_dir.insert(project_dir.clone(), recent);
            }
            let Some(candidates) = candidates_by_dir.get_mut(&project_dir) else {
                continue;
            };

            while !candidates.is_empty() {
                let artifact = candidates.remove(0);
                match self
                    .registry
                    .assign_correlation(&session.id, &artifact.id)
                    .await
                {
                    Ok(_) => {
                        info!(session_id = %session.id, correlation_id = %artifact.id, "Recovered session log");
                        report.recovered.push((session.id.clone(), artifact.id));
                        break;
                    }
                    Err(RegistryError::CorrelationClaimed { .. }) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        info!(
            validated = report.validated.len(),
            cleared = report.cleared.len(),
            recovered = report.recovered.len(),
            "Startup correlation recovery finished"
        );
        Ok(report)
    }

    async fn session(&self, session_id: &str) -> Result<SessionRecord, CorrelationError> {
        self.registry
            .get(session_id)
            .await
            .ok_or_else(|| CorrelationError::SessionNotFound(session_id.to_string()))
    }
}
