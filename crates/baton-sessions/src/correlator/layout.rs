use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use regex::Regex;

static ARTIFACT_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("Invalid artifact id regex")
});

/// A conversation-log file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub id: String,
    pub path: PathBuf,
    /// Earliest of birth time and mtime; filesystems without birth time
    /// fall back to mtime alone.
    pub created: SystemTime,
    pub modified: SystemTime,
}

/// Where the agent keeps its logs: one directory per project under `root`,
/// one `<uuid>.<extension>` file per conversation.
#[derive(Debug, Clone)]
pub struct LogLayout {
    root: PathBuf,
    extension: String,
}

impl LogLayout {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Project directory for a working directory. Every character outside
    /// `[A-Za-z0-9-]` is replaced with `-`, so `/work/my.app` maps to
    /// `-work-my-app`.
    pub fn project_dir(&self, working_dir: &Path) -> PathBuf {
        let encoded: String = working_dir
            .to_string_lossy()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        self.root.join(encoded)
    }

    pub fn artifact_path(&self, working_dir: &Path, id: &str) -> PathBuf {
        self.project_dir(working_dir)
            .join(format!("{}.{}", id, self.extension))
    }

    /// The artifact id if `path` is a log file directly inside `project_dir`.
    pub fn artifact_id_in(&self, project_dir: &Path, path: &Path) -> Option<String> {
        if path.parent()? != project_dir {
            return None;
        }
        if path.extension()?.to_str()? != self.extension {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        ARTIFACT_ID_PATTERN
            .is_match(stem)
            .then(|| stem.to_string())
    }

    /// All log artifacts in a project directory. A missing directory is empty.
    pub fn list_artifacts(&self, project_dir: &Path) -> std::io::Result<Vec<Artifact>> {
        let entries = match fs::read_dir(project_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut artifacts = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(id) = self.artifact_id_in(project_dir, &path) else {
                continue;
            };
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified()?;
            let created = metadata
                .created()
                .map(|born| born.min(modified))
                .unwrap_or(modified);
            artifacts.push(Artifact {
                id,
                path,
                created,
                modified,
            });
        }
        Ok(artifacts)
    }
}
