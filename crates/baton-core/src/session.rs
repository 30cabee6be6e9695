use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One spawned agent instance and the conversation log it is writing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,

    /// Identifier of the log artifact this session writes; `None` until
    /// correlation succeeds or after the artifact disappears.
    #[serde(default)]
    pub correlation_id: Option<String>,

    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    /// Project label used by the dispatch resolver for matching
    #[serde(default)]
    pub label: Option<String>,

    /// Terminal host target (tmux pane id)
    #[serde(default)]
    pub terminal_id: Option<String>,

    /// Process id of the shell hosting the agent
    #[serde(default)]
    pub pid: Option<u32>,

    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,

    /// Set when the record was reloaded from disk after a restart
    #[serde(default)]
    pub restored: bool,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, working_directory: Option<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            correlation_id: None,
            working_directory,
            label: None,
            terminal_id: None,
            pid: None,
            created_at: now,
            last_activity_at: now,
            restored: false,
        }
    }

    /// Key used for the per-project "active session" map.
    pub fn project_key(&self) -> Option<String> {
        self.working_directory
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_idle: Duration) -> bool {
        now.signed_duration_since(self.last_activity_at) > max_idle
    }
}
