use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use baton_core::SessionRecord;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::RegistryError;
use crate::store::{PersistedState, SessionStore};

/// Parameters for a new session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub working_directory: Option<PathBuf>,
    pub label: Option<String>,
    pub terminal_id: Option<String>,
    pub pid: Option<u32>,
}

#[derive(Default)]
struct RegistryState {
    /// Creation order
    sessions: Vec<SessionRecord>,
    active: HashMap<String, String>,
}

impl RegistryState {
    fn find(&self, id: &str) -> Option<&SessionRecord> {
        self.sessions.iter().find(|s| s.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Result<&mut SessionRecord, RegistryError> {
        self.sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))
    }

    fn owner_of(&self, correlation_id: &str) -> Option<&SessionRecord> {
        self.sessions
            .iter()
            .find(|s| s.correlation_id.as_deref() == Some(correlation_id))
    }

    fn snapshot(&self) -> PersistedState {
        PersistedState {
            version: 0,
            sessions: self.sessions.clone(),
            active_sessions: self.active.clone(),
        }
    }
}

/// Bounded collection of open sessions; the only writer of session records.
///
/// Every mutation is written through to the [`SessionStore`] before the
/// write lock is released, so a crash right after a correlation id is assigned
/// does not lose it. The write (including its fsync) is synchronous and runs
/// under the lock. A failed write is returned as [`RegistryError::Persist`];
/// session creation and correlation assignment are rolled back when that
/// happens, other mutations stay in memory until the next successful write.
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
    store: SessionStore,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(store: SessionStore, max_sessions: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            store,
            max_sessions,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Reload persisted sessions, marking each as restored.
    ///
    /// Correlation ids are not validated here; that is the correlator's job.
    /// Returns the number of sessions restored.
    pub async fn restore(&self) -> Result<usize, RegistryError> {
        let persisted = match self.store.load() {
            Ok(persisted) => persisted,
            Err(RegistryError::CorruptState(reason)) => {
                warn!(path = %self.store.path().display(), %reason, "Discarding corrupt session state");
                if let Err(e) = self.store.quarantine() {
                    warn!("Failed to move corrupt session state aside: {}", e);
                }
                PersistedState::default()
            }
            Err(e) => return Err(e),
        };

        let mut sessions = persisted.sessions;
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        if sessions.len() > self.max_sessions {
            // keep the most recently active ones
            sessions.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
            for dropped in sessions.drain(self.max_sessions..) {
                warn!(session_id = %dropped.id, "Dropping persisted session beyond max_sessions");
            }
            sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        }

        let mut seen = HashSet::new();
        for session in sessions.iter_mut() {
            session.restored = true;
            if let Some(correlation_id) = session.correlation_id.clone() {
                if !seen.insert(correlation_id.clone()) {
                    warn!(session_id = %session.id, %correlation_id, "Clearing duplicate correlation id");
                    session.correlation_id = None;
                }
            }
        }

        let ids: HashSet<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
        let active = persisted
            .active_sessions
            .into_iter()
            .filter(|(_, id)| ids.contains(id.as_str()))
            .collect();

        let mut state = self.state.write().await;
        state.sessions = sessions;
        state.active = active;
        let count = state.sessions.len();
        self.persist(&state)?;

        info!(count, "Restored sessions");
        Ok(count)
    }

    /// Register a new session. Fails without side effects at the bound.
    pub async fn create_session(&self, new: NewSession) -> Result<SessionRecord, RegistryError> {
        let mut state = self.state.write().await;

        if state.sessions.len() >= self.max_sessions {
            return Err(RegistryError::MaxSessionsReached(self.max_sessions));
        }

        let id = format!("ses_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let mut record = SessionRecord::new(id, new.working_directory);
        record.label = new.label;
        record.terminal_id = new.terminal_id;
        record.pid = new.pid;

        let active_before = state.active.clone();
        if let Some(project) = record.project_key() {
            state.active.insert(project, record.id.clone());
        }
        state.sessions.push(record.clone());
        if let Err(e) = self.persist(&state) {
            state.sessions.pop();
            state.active = active_before;
            return Err(e);
        }

        info!(session_id = %record.id, "Session created");
        Ok(record)
    }

    pub async fn close_session(&self, id: &str) -> Result<SessionRecord, RegistryError> {
        let mut state = self.state.write().await;
        let index = state
            .sessions
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))?;

        let record = state.sessions.remove(index);
        state.active.retain(|_, active_id| active_id != id);
        self.persist(&state)?;

        info!(session_id = %id, "Session closed");
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Option<SessionRecord> {
        self.state.read().await.find(id).cloned()
    }

    /// All sessions in creation order.
    pub async fn list(&self) -> Vec<SessionRecord> {
        self.state.read().await.sessions.clone()
    }

    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    pub async fn has_session(&self, id: &str) -> bool {
        self.state.read().await.find(id).is_some()
    }

    /// Record dispatch activity and make the session its project's active one.
    pub async fn touch(&self, id: &str) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        let session = state.find_mut(id)?;
        session.last_activity_at = Utc::now();
        if let Some(project) = session.project_key() {
            state.active.insert(project, id.to_string());
        }
        self.persist(&state)

    }

    pub async fn attach_terminal(
        &self,
        id: &str,
        terminal_id: String,
        pid: Option<u32>,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        let session = state.find_mut(id)?;
        session.terminal_id = Some(terminal_id);
        session.pid = pid;
        self.persist(&state)

    }

    pub async fn set_active(&self, project: &str, id: &str) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        if state.find(id).is_none() {
            return Err(RegistryError::SessionNotFound(id.to_string()));
        }
        state.active.insert(project.to_string(), id.to_string());
        self.persist(&state)

    }

    pub async fn active_for(&self, project: &str) -> Option<SessionRecord> {
        let state = self.state.read().await;
        let id = state.active.get(project)?;
        state.find(id).cloned()
    }

    /// Assign a correlation id, refusing one already held by another session.
    ///
    /// Returns `false` when the session already had exactly this id.
    pub async fn assign_correlation(
        &self,
        id: &str,
        correlation_id: &str,
    ) -> Result<bool, RegistryError> {
        let mut state = self.state.write().await;

        if let Some(owner) = state.owner_of(correlation_id) {
            if owner.id == id {
                return Ok(false);
            }
            return Err(RegistryError::CorrelationClaimed {
                correlation_id: correlation_id.to_string(),
                owner: owner.id.clone(),
            });
        }

        let session = state.find_mut(id)?;
        let previous = session.correlation_id.replace(correlation_id.to_string());
        if let Err(e) = self.persist(&state) {
            if let Ok(session) = state.find_mut(id) {
                session.correlation_id = previous;
            }
            return Err(e);
        }

        info!(
            session_id = %id,
            correlation_id,
            previous = previous.as_deref().unwrap_or("-"),
            "Correlation id assigned"
        );
        Ok(true)
    }

    /// Give `correlation_id` to session `id`, taking it from whichever session
    /// holds it now. Both changes land in one write.
    ///
    /// Only for when ownership has been observed directly; a guess goes
    /// through [`Self::assign_correlation`]. Returns the previous holder.
    pub async fn reassign_correlation(
        &self,
        id: &str,
        correlation_id: &str,
    ) -> Result<Option<String>, RegistryError> {
        let mut state = self.state.write().await;
        state.find_mut(id)?;

        let holder = state
            .owner_of(correlation_id)
            .map(|owner| owner.id.clone())
            .filter(|owner| owner != id);
        if let Some(holder) = &holder {
            state.find_mut(holder)?.correlation_id = None;
        }
        let session = state.find_mut(id)?;
        let previous = session.correlation_id.replace(correlation_id.to_string());

        if let Err(e) = self.persist(&state) {
            state.find_mut(id)?.correlation_id = previous;
            if let Some(holder) = &holder {
                state.find_mut(holder)?.correlation_id = Some(correlation_id.to_string());
            }
            return Err(e);
        }

        info!(
            session_id = %id,
            correlation_id,
            previous = previous.as_deref().unwrap_or("-"),
            taken_from = holder.as_deref().unwrap_or("-"),
            "Correlation id reassigned"
        );
        Ok(holder)
    }

    pub async fn clear_correlation(&self, id: &str) -> Result<Option<String>, RegistryError> {
        let mut state = self.state.write().await;
        let previous = state.find_mut(id)?.correlation_id.take();
        if previous.is_some() {
            self.persist(&state)?;
            debug!(session_id = %id, "Correlation id cleared");
        }
        Ok(previous)
    }

    /// The session holding `correlation_id`, if any.
    pub async fn holder_of(&self, correlation_id: &str) -> Option<SessionRecord> {
        self.state.read().await.owner_of(correlation_id).cloned()
    }

    /// Correlation ids held by sessions other than `except`.
    pub async fn claimed_correlations(&self, except: Option<&str>) -> HashSet<String> {
        self.state
            .read()
            .await
            .sessions
            .iter()
            .filter(|s| Some(s.id.as_str()) != except)
            .filter_map(|s| s.correlation_id.clone())
            .collect()
    }

    /// Remove sessions with no activity for longer than `max_idle`.
    pub async fn cleanup_stale(&self, now: DateTime<Utc>, max_idle: Duration) -> Vec<SessionRecord> {
        let mut state = self.state.write().await;
        let (stale, live): (Vec<_>, Vec<_>) = std::mem::take(&mut state.sessions)
            .into_iter()
            .partition(|s| s.is_stale(now, max_idle));
        state.sessions = live;

        if !stale.is_empty() {
            let removed: HashSet<&str> = stale.iter().map(|s| s.id.as_str()).collect();
            state.active.retain(|_, id| !removed.contains(id.as_str()));
            if let Err(e) = self.persist(&state) {
                error!(path = %self.store.path().display(), "Failed to persist sessions: {}", e);
            }
            info!(count = stale.len(), "Removed stale sessions");
        }
        stale
    }

    fn persist(&self, state: &RegistryState) -> Result<(), RegistryError> {
        self.store.save(&state.snapshot())
    }
}
