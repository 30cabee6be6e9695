use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::CorrelationError;

/// Bound on the process-tree walk below a session's shell.
const MAX_TREE_DEPTH: usize = 8;

/// Reports which files a process tree currently holds open.
#[async_trait]
pub trait OpenFilesProbe: Send + Sync {
    /// Open files of `pid` and all of its descendants.
    async fn open_files(&self, pid: u32) -> Result<Vec<PathBuf>, CorrelationError>;

    async fn is_alive(&self, pid: u32) -> bool;
}

/// [`OpenFilesProbe`] backed by `pgrep` and `lsof`.
#[derive(Debug, Clone)]
pub struct LsofProbe {
    lsof_command: String,
}

impl LsofProbe {
    pub fn new(lsof_command: impl Into<String>) -> Self {
        Self {
            lsof_command: lsof_command.into(),
        }
    }

    async fn children(&self, pid: u32) -> Vec<u32> {
        let output = match Command::new("pgrep")
            .args(["-P", &pid.to_string()])
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                debug!(pid, "pgrep failed: {}", e);
                return Vec::new();
            }
        };
        // exit code 1 means "no children"
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect()
    }

    async fn process_tree(&self, root: u32) -> Vec<u32> {
        let mut seen = HashSet::from([root]);
        let mut tree = vec![root];
        let mut frontier = vec![root];

        for _ in 0..MAX_TREE_DEPTH {
            let mut next = Vec::new();
            for pid in frontier {
                for child in self.children(pid).await {
                    if seen.insert(child) {
                        tree.push(child);
                        next.push(child);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        tree
    }
}

impl Default for LsofProbe {
    fn default() -> Self {
        Self::new("lsof")
    }
}

#[async_trait]
impl OpenFilesProbe for LsofProbe {
    async fn open_files(&self, pid: u32) -> Result<Vec<PathBuf>, CorrelationError> {
        let pids = self
            .process_tree(pid)
            .await
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let output = Command::new(&self.lsof_command)
            .args(["-n", "-P", "-Fn", "-p", &pids])
            .output()
            .await
            .map_err(|e| CorrelationError::ProbeFailed(format!("{}: {}", self.lsof_command, e)))?;

        // lsof exits 1 when nothing matched, which is not an error here
        if !output.status.success() && output.status.code() != Some(1) {
            return Err(CorrelationError::ProbeFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(parse_lsof_names(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn is_alive(&self, pid: u32) -> bool {
        Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

/// Extract file names from `lsof -F n` output.
fn parse_lsof_names(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix('n'))
        .filter(|name| name.starts_with('/'))
        .map(PathBuf::from)
        .collect()
}
