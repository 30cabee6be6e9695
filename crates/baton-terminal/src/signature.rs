use baton_core::ExecutionSettings;

/// Detects whether captured output shows the agent waiting for input.
#[derive(Debug, Clone)]
pub struct ReadySignature {
    ready_patterns: Vec<String>,
    busy_patterns: Vec<String>,
}

impl ReadySignature {
    pub fn new(ready_patterns: Vec<String>, busy_patterns: Vec<String>) -> Self {
        Self {
            ready_patterns: lowercase_all(ready_patterns),
            busy_patterns: lowercase_all(busy_patterns),
        }
    }

    pub fn from_settings(settings: &ExecutionSettings) -> Self {
        Self::new(
            settings.ready_patterns.clone(),
            settings.busy_patterns.clone(),
        )
    }

    /// Ready when a ready pattern is visible and no busy pattern is.
    pub fn is_ready(&self, output: &str) -> bool {
        let output = output.to_lowercase();
        let busy = self.busy_patterns.iter().any(|p| output.contains(p));
        let ready = self.ready_patterns.iter().any(|p| output.contains(p));
        ready && !busy
    }
}

impl Default for ReadySignature {
    fn default() -> Self {
        Self::from_settings(&ExecutionSettings::default())
    }
}

fn lowercase_all(patterns: Vec<String>) -> Vec<String> {
    patterns
        .into_iter()
        .map(|p| p.to_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}
