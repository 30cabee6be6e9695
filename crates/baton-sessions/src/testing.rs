//! In-memory collaborators for exercising the correlator without `lsof`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::correlator::OpenFilesProbe;
use crate::error::CorrelationError;

/// Scripted [`OpenFilesProbe`].
///
/// Every pid is alive unless [`kill`](Self::kill)ed, and holds no files
/// until [`set_open_files`](Self::set_open_files) says otherwise.
#[derive(Default)]
pub struct FakeOpenFilesProbe {
    open_files: Mutex<HashMap<u32, Vec<PathBuf>>>,
    dead: Mutex<HashSet<u32>>,
    failing: Mutex<bool>,
    probe_count: AtomicUsize,
}

impl FakeOpenFilesProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_open_files(&self, pid: u32, files: Vec<PathBuf>) {
        self.open_files.lock().unwrap().insert(pid, files);
    }

    pub fn kill(&self, pid: u32) {
        self.dead.lock().unwrap().insert(pid);
    }

    /// Make every probe fail until called again with `false`.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn probe_count(&self) -> usize {
        self.probe_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OpenFilesProbe for FakeOpenFilesProbe {
    async fn open_files(&self, pid: u32) -> Result<Vec<PathBuf>, CorrelationError> {
        self.probe_count.fetch_add(1, Ordering::SeqCst);
        if *self.failing.lock().unwrap() {
            return Err(CorrelationError::ProbeFailed("scripted failure".to_string()));
        }
        Ok(self
            .open_files
            .lock()
            .unwrap()
            .get(&pid)
            .cloned()
            .unwrap_or_default())
    }

    async fn is_alive(&self, pid: u32) -> bool {
        !self.dead.lock().unwrap().contains(&pid)
    }
}
