//! In-memory [`TerminalHost`] for tests of the orchestration layers.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::TerminalError;
use crate::host::{TerminalHost, TerminalTarget};

#[derive(Default)]
struct FakeState {
    targets: Vec<TerminalTarget>,
    sent: Vec<(String, String)>,
    focused: Vec<String>,
    outputs: HashMap<String, VecDeque<String>>,
    send_failures: VecDeque<TerminalError>,
    capture_failures: usize,
    next_id: u32,
}

pub struct FakeTerminalHost {
    state: Mutex<FakeState>,
    created: AtomicUsize,
    captures: AtomicUsize,
}

impl FakeTerminalHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_id: 1,
                ..Default::default()
            }),
            created: AtomicUsize::new(0),
            captures: AtomicUsize::new(0),
        }
    }

    /// Register an existing target, as if opened by hand.
    pub fn add_target(&self, title: &str, subtitle: &str) -> TerminalTarget {
        let mut state = self.state.lock().unwrap();
        let target = next_target(&mut state, title, subtitle);
        state.targets.push(target.clone());
        target
    }

    pub fn remove_target(&self, target_id: &str) {
        self.state
            .lock()
            .unwrap()
            .targets
            .retain(|t| t.id != target_id);
    }

    /// Queue visible output; the last queued value stays visible.
    pub fn push_output(&self, target_id: &str, output: &str) {
        self.state
            .lock()
            .unwrap()
            .outputs
            .entry(target_id.to_string())
            .or_default()
            .push_back(output.to_string());
    }

    pub fn fail_next_send(&self, error: TerminalError) {
        self.state.lock().unwrap().send_failures.push_back(error);
    }

    pub fn fail_next_captures(&self, count: usize) {
        self.state.lock().unwrap().capture_failures = count;
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn focused(&self) -> Vec<String> {
        self.state.lock().unwrap().focused.clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

impl Default for FakeTerminalHost {
    fn default() -> Self {
        Self::new()
    }
}

fn next_target(state: &mut FakeState, title: &str, subtitle: &str) -> TerminalTarget {
    let id = state.next_id;
    state.next_id += 1;
    TerminalTarget {
        id: format!("%{}", id),
        title: title.to_string(),
        subtitle: subtitle.to_string(),
        pid: Some(10_000 + id),
    }
}

#[async_trait]
impl TerminalHost for FakeTerminalHost {
    async fn list_targets(&self) -> Result<Vec<TerminalTarget>, TerminalError> {
        Ok(self.state.lock().unwrap().targets.clone())
    }

    async fn create_target(
        &self,
        working_dir: &Path,
        name: &str,
    ) -> Result<TerminalTarget, TerminalError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let title = format!("baton:{}", name);
        let target = next_target(&mut state, &title, &working_dir.to_string_lossy());
        state.targets.push(target.clone());
        Ok(target)
    }

    async fn focus(&self, target_id: &str) -> Result<(), TerminalError> {
        let mut state = self.state.lock().unwrap();
        if !state.targets.iter().any(|t| t.id == target_id) {
            return Err(TerminalError::TargetNotFound(target_id.to_string()));
        }
        state.focused.push(target_id.to_string());
        Ok(())
    }

    async fn send_text(&self, target_id: &str, text: &str) -> Result<(), TerminalError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.send_failures.pop_front() {
            return Err(error);
        }
        if !state.targets.iter().any(|t| t.id == target_id) {
            return Err(TerminalError::TargetNotFound(target_id.to_string()));
        }
        state.sent.push((target_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn capture(&self, target_id: &str, _lines: usize) -> Result<String, TerminalError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.capture_failures > 0 {
            state.capture_failures -= 1;
            return Err(TerminalError::CommandFailed {
                command: "capture".into(),
                stderr: "simulated".into(),
            });
        }
        let Some(queue) = state.outputs.get_mut(target_id) else {
            return Ok(String::new());
        };
        if queue.len() > 1 {
            Ok(queue.pop_front().unwrap_or_default())
        } else {
            Ok(queue.front().cloned().unwrap_or_default())
        }
    }

    async fn close(&self, target_id: &str) -> Result<(), TerminalError> {
        self.remove_target(target_id);
        Ok(())
    }
}
