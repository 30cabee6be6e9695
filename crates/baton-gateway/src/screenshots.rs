use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::ScreenshotError;

/// An open capture run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotRun {
    pub run_id: String,
    pub project: String,
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// Directory bookkeeping for the screenshot capture subsystem.
///
/// Layout: `<root>/<project>/<name>[-<device>]-<timestamp>/`.
pub struct ScreenshotRuns {
    root: PathBuf,
    runs: RwLock<HashMap<String, ScreenshotRun>>,
}

impl ScreenshotRuns {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ensure the project's capture directory exists and return it.
    pub fn location(&self, project: &str) -> Result<PathBuf, ScreenshotError> {
        let dir = self.root.join(path_component(project).unwrap_or_else(|| "default".into()));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub async fn start_run(
        &self,
        project: &str,
        name: &str,
        device: Option<&str>,
    ) -> Result<ScreenshotRun, ScreenshotError> {
        let project_dir = path_component(project)
            .ok_or_else(|| ScreenshotError::InvalidRequest("project is required".into()))?;
        let name = path_component(name)
            .ok_or_else(|| ScreenshotError::InvalidRequest("name is required".into()))?;

        let started_at = Utc::now();
        let mut dir_name = name;
        if let Some(device) = device.and_then(path_component) {
            dir_name.push('-');
            dir_name.push_str(&device);
        }
        dir_name.push('-');
        dir_name.push_str(&started_at.format("%Y%m%d-%H%M%S").to_string());

        let path = self.root.join(project_dir).join(dir_name);
        fs::create_dir_all(&path)?;

        let run = ScreenshotRun {
            run_id: uuid::Uuid::new_v4().to_string(),
            project: project.to_string(),
            path,
            started_at,
        };
        self.runs
            .write()
            .await
            .insert(run.run_id.clone(), run.clone());

        info!(run_id = %run.run_id, path = %run.path.display(), "Screenshot run started");
        Ok(run)
    }

    pub async fn complete_run(&self, run_id: &str) -> Result<ScreenshotRun, ScreenshotError> {
        let run = self
            .runs
            .write()
            .await
            .remove(run_id)
            .ok_or_else(|| ScreenshotError::UnknownRun(run_id.to_string()))?;
        debug!(run_id, "Screenshot run completed");
        Ok(run)
    }

    pub async fn open_runs(&self) -> usize {
        self.runs.read().await.len()
    }
}

/// Reduce caller input to a single safe path component.
fn path_component(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '-',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    (!cleaned.is_empty()).then_some(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_path_component() {
        assert_eq!(path_component("my-app").as_deref(), Some("my-app"));
        assert_eq!(path_component("../etc").as_deref(), Some("-etc"));
        assert_eq!(path_component("  "), None);
        assert_eq!(path_component(".."), None);
    }

    #[test]
    fn test_location_creates_project_dir() {
        let dir = TempDir::new().unwrap();
        let runs = ScreenshotRuns::new(dir.path());

        let path = runs.location("my-app").unwrap();

        assert_eq!(path, dir.path().join("my-app"));
        assert!(path.is_dir());
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let dir = TempDir::new().unwrap();
        let runs = ScreenshotRuns::new(dir.path());

        let run = runs.start_run("my-app", "checkout", Some("iphone")).await.unwrap();
        let dir_name = run.path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(dir_name.starts_with("checkout-iphone-"));
        assert!(run.path.is_dir());
        assert_eq!(runs.open_runs().await, 1);

        let completed = runs.complete_run(&run.run_id).await.unwrap();
        assert_eq!(completed.path, run.path);
        assert_eq!(runs.open_runs().await, 0);
        assert!(matches!(
            runs.complete_run(&run.run_id).await,
            Err(ScreenshotError::UnknownRun(_))
        ));
    }

    #[tokio::test]
    async fn test_run_requires_name() {
        let dir = TempDir::new().unwrap();
        let runs = ScreenshotRuns::new(dir.path());
        assert!(matches!(
            runs.start_run("my-app", "", None).await,
            Err(ScreenshotError::InvalidRequest(_))
        ));
    }
}
