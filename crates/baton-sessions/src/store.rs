use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use baton_core::atomic_write::atomic_write_json;
use baton_core::SessionRecord;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

const STATE_FILE: &str = "sessions.json";
const STATE_VERSION: u32 = 1;

/// On-disk shape of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub version: u32,

    #[serde(default)]
    pub sessions: Vec<SessionRecord>,

    /// project key (working directory) -> session id
    #[serde(default)]
    pub active_sessions: HashMap<String, String>,
}

/// JSON file holding every session record and the active-session map.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(STATE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty state.
    pub fn load(&self) -> Result<PersistedState, RegistryError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedState::default())
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&content).map_err(|e| RegistryError::CorruptState(e.to_string()))
    }

    pub fn save(&self, state: &PersistedState) -> Result<(), RegistryError> {
        let mut state = state.clone();
        state.version = STATE_VERSION;
        atomic_write_json(&self.path, &state)?;
        Ok(())
    }

    /// Move an unreadable state file aside so the next save starts clean.
    pub fn quarantine(&self) -> std::io::Result<PathBuf> {
        let target = self.path.with_extension("json.corrupt");
        fs::rename(&self.path, &target)?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty_state() {
        let dir = tempdir().unwrap();
        let store = SessionStore::in_dir(dir.path());
        assert_eq!(store.load().unwrap(), PersistedState::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = SessionStore::in_dir(dir.path());

        let mut record = SessionRecord::new("ses_a", Some(PathBuf::from("/work/app")));
        record.correlation_id = Some("0b7c".into());
        let mut state = PersistedState {
            sessions: vec![record],
            ..Default::default()
        };
        state
            .active_sessions
            .insert("/work/app".into(), "ses_a".into());

        store.save(&state).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.sessions, state.sessions);
        assert_eq!(loaded.active_sessions["/work/app"], "ses_a");
    }

    #[test]
    fn test_corrupt_file_is_reported_and_can_be_quarantined() {
        let dir = tempdir().unwrap();
        let store = SessionStore::in_dir(dir.path());
        fs::write(store.path(), "{ not json").unwrap();

        assert!(matches!(store.load(), Err(RegistryError::CorruptState(_))));

        let moved = store.quarantine().unwrap();
        assert!(moved.exists());
        assert_eq!(store.load().unwrap(), PersistedState::default());
    }
}
