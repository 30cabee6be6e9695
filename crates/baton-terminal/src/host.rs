use std::path::Path;

use async_trait::async_trait;

use crate::error::TerminalError;

/// A live place the agent can run in (a tmux pane, a terminal tab, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalTarget {
    pub id: String,
    /// Primary title, matched against project labels
    pub title: String,
    /// Secondary title (current directory for tmux)
    pub subtitle: String,
    /// Process id of the program attached to the target
    pub pid: Option<u32>,
}

impl TerminalTarget {
    /// Case-insensitive substring match against title or subtitle.
    pub fn matches_label(&self, label: &str) -> bool {
        let needle = label.to_lowercase();
        !needle.is_empty()
            && (self.title.to_lowercase().contains(&needle)
                || self.subtitle.to_lowercase().contains(&needle))
    }
}

/// Operations the orchestration core needs from the terminal host.
///
/// `send_text` delivers the text and submits it. It is only idempotent if the
/// target has not changed between attempts.
#[async_trait]
pub trait TerminalHost: Send + Sync {
    async fn list_targets(&self) -> Result<Vec<TerminalTarget>, TerminalError>;

    async fn create_target(
        &self,
        working_dir: &Path,
        name: &str,
    ) -> Result<TerminalTarget, TerminalError>;

    async fn focus(&self, target_id: &str) -> Result<(), TerminalError>;

    async fn send_text(&self, target_id: &str, text: &str) -> Result<(), TerminalError>;

    async fn capture(&self, target_id: &str, lines: usize) -> Result<String, TerminalError>;

    async fn close(&self, target_id: &str) -> Result<(), TerminalError>;

    async fn find_target(&self, target_id: &str) -> Result<Option<TerminalTarget>, TerminalError> {
        Ok(self
            .list_targets()
            .await?
            .into_iter()
            .find(|t| t.id == target_id))
    }

    async fn is_alive(&self, target_id: &str) -> bool {
        matches!(self.find_target(target_id).await, Ok(Some(_)))
    }
}
