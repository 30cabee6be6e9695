use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::TerminalError;
use crate::host::{TerminalHost, TerminalTarget};

const PANE_FORMAT: &str = "#{pane_id}|#{session_name}:#{window_name}|#{pane_current_path}|#{pane_pid}";
const PASTE_BUFFER: &str = "baton-payload";

/// [`TerminalHost`] backed by the `tmux` CLI. New targets are windows inside
/// one dedicated tmux session.
#[derive(Debug, Clone)]
pub struct TmuxHost {
    session_name: String,
    binary: String,
}

impl TmuxHost {
    pub fn new(session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            binary: "tmux".to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, TerminalError> {
        let output = Command::new(&self.binary).args(args).output().await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        Err(classify_failure(
            args,
            &String::from_utf8_lossy(&output.stderr),
        ))
    }

    async fn has_session(&self) -> bool {
        self.run(&["has-session", "-t", &self.session_name])
            .await
            .is_ok()
    }

    async fn set_buffer_from_stdin(&self, text: &str) -> Result<(), TerminalError> {
        let mut child = Command::new(&self.binary)
            .args(["load-buffer", "-b", PASTE_BUFFER, "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify_failure(
                &["load-buffer"],
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }
}

#[async_trait]
impl TerminalHost for TmuxHost {
    async fn list_targets(&self) -> Result<Vec<TerminalTarget>, TerminalError> {
        match self.run(&["list-panes", "-a", "-F", PANE_FORMAT]).await {
            Ok(stdout) => Ok(parse_pane_list(&stdout)),
            // no server means no panes, not a failure
            Err(TerminalError::Unavailable(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn create_target(
        &self,
        working_dir: &Path,
        name: &str,
    ) -> Result<TerminalTarget, TerminalError> {
        let dir = working_dir.to_string_lossy();
        let stdout = if self.has_session().await {
            self.run(&[
                "new-window", "-d", "-P", "-F", PANE_FORMAT, "-t", &self.session_name, "-n",
                name, "-c", &dir,
            ])
            .await?
        } else {
            self.run(&[
                "new-session", "-d", "-P", "-F", PANE_FORMAT, "-s", &self.session_name, "-n",
                name, "-c", &dir,
            ])
            .await?
        };

        parse_pane_list(&stdout)
            .into_iter()
            .next()
            .ok_or_else(|| TerminalError::InvalidOutput(stdout.trim().to_string()))
    }

    async fn focus(&self, target_id: &str) -> Result<(), TerminalError> {
        self.run(&["select-window", "-t", target_id]).await?;
        self.run(&["select-pane", "-t", target_id]).await?;
        if std::env::var("TMUX").is_ok() {
            // only meaningful when we are attached ourselves
            let _ = self.run(&["switch-client", "-t", target_id]).await;
        }
        Ok(())
    }

    async fn send_text(&self, target_id: &str, text: &str) -> Result<(), TerminalError> {
        // Bracketed paste keeps embedded newlines from submitting early
        self.set_buffer_from_stdin(text).await?;
        self.run(&["paste-buffer", "-p", "-d", "-b", PASTE_BUFFER, "-t", target_id])
            .await?;
        self.run(&["send-keys", "-t", target_id, "Enter"]).await?;
        Ok(())
    }

    async fn capture(&self, target_id: &str, lines: usize) -> Result<String, TerminalError> {
        let start = format!("-{}", lines);
        self.run(&["capture-pane", "-p", "-t", target_id, "-S", &start])
            .await
    }

    async fn close(&self, target_id: &str) -> Result<(), TerminalError> {
        self.run(&["kill-pane", "-t", target_id]).await.map(|_| ())
    }
}

fn parse_pane_list(stdout: &str) -> Vec<TerminalTarget> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.splitn(4, '|').collect();
            if parts.len() != 4 || parts[0].is_empty() {
                return None;
            }
            Some(TerminalTarget {
                id: parts[0].to_string(),
                title: parts[1].to_string(),
                subtitle: parts[2].to_string(),
                pid: parts[3].trim().parse().ok(),
            })
        })
        .collect()
}

fn classify_failure(args: &[&str], stderr: &str) -> TerminalError {
    let stderr = stderr.trim().to_string();
    let lower = stderr.to_lowercase();

    if lower.contains("no server running") || lower.contains("error connecting") {
        TerminalError::Unavailable(stderr)
    } else if lower.contains("can't find") || lower.contains("no such") {
        TerminalError::TargetNotFound(stderr)
    } else if lower.contains("permission denied") || lower.contains("not permitted") {
        TerminalError::PermissionDenied(stderr)
    } else {
        TerminalError::CommandFailed {
            command: format!("tmux {}", args.first().copied().unwrap_or_default()),
            stderr,
        }
    }
}
