use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main Baton configuration
///
/// Configuration is loaded from (in priority order):
/// 1. `baton.jsonc` - JSON with comments
/// 2. `baton.json` - Standard JSON
/// 3. `baton.yml` / `baton.yaml` - YAML format
///
/// Also checks hidden variants (`.baton.*`) and `~/.config/baton/` for global config.
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatonConfig {
    /// Completion webhook listener
    #[serde(default)]
    pub listener: ListenerSettings,

    /// Execution lifecycle bounds and completion detection
    #[serde(default)]
    pub execution: ExecutionSettings,

    /// Session registry bounds and persistence
    #[serde(default)]
    pub sessions: SessionSettings,

    /// Terminal host and agent bootstrap
    #[serde(default)]
    pub terminal: TerminalSettings,

    /// Session-identity correlation
    #[serde(default)]
    pub correlation: CorrelationSettings,

    /// Screenshot capture control endpoints
    #[serde(default)]
    pub screenshots: ScreenshotSettings,

    /// Logging
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

// ============================================================================
// Listener
// ============================================================================

/// Loopback HTTP listener settings
///
/// # Example
///
/// ```yaml
/// listener:
///   host: 127.0.0.1
///   port: 7391
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSettings {
    #[serde(default = "default_listener_host")]
    pub host: String,

    #[serde(default = "default_listener_port")]
    pub port: u16,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            host: default_listener_host(),
            port: default_listener_port(),
        }
    }
}

fn default_listener_host() -> String {
    "127.0.0.1".to_string()
}

fn default_listener_port() -> u16 {
    7391
}

// ============================================================================
// Execution
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Watchdog bound for the `executing` phase
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// How long `completed` stays visible before returning to `idle`
    #[serde(default = "default_completion_linger_ms")]
    pub completion_linger_ms: u64,

    /// Interval of the polling fallback prober
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Lines of visible output captured per poll
    #[serde(default = "default_capture_lines")]
    pub capture_lines: usize,

    /// Any of these present means the agent is waiting for input
    #[serde(default = "default_ready_patterns")]
    pub ready_patterns: Vec<String>,

    /// Any of these present means the agent is still working
    #[serde(default = "default_busy_patterns")]
    pub busy_patterns: Vec<String>,

    /// Consecutive ready polls required before signalling completion
    #[serde(default = "default_ready_confirmations")]
    pub ready_confirmations: u32,
}

impl ExecutionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn completion_linger(&self) -> Duration {
        Duration::from_millis(self.completion_linger_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            completion_linger_ms: default_completion_linger_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            capture_lines: default_capture_lines(),
            ready_patterns: default_ready_patterns(),
            busy_patterns: default_busy_patterns(),
            ready_confirmations: default_ready_confirmations(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_completion_linger_ms() -> u64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_capture_lines() -> usize {
    40
}

fn default_ready_patterns() -> Vec<String> {
    vec!["? for shortcuts".to_string(), "│ >".to_string()]
}

fn default_busy_patterns() -> Vec<String> {
    vec!["esc to interrupt".to_string()]
}

fn default_ready_confirmations() -> u32 {
    2
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Upper bound on concurrently open sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Sessions idle longer than this are removed by cleanup
    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: i64,

    /// Directory holding `sessions.json` (default: `~/.baton`)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl SessionSettings {
    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(crate::default_state_dir)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            stale_after_days: default_stale_after_days(),
            state_dir: None,
        }
    }
}

fn default_max_sessions() -> usize {
    4
}

fn default_stale_after_days() -> i64 {
    7
}

// ============================================================================
// Terminal
// ============================================================================

/// Terminal host settings
///
/// # Example
///
/// ```yaml
/// terminal:
///   tmux_session: baton
///   launch_command: "claude --continue"
///   startup_delay_ms: 5000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalSettings {
    /// tmux session that new windows are created in
    #[serde(default = "default_tmux_session")]
    pub tmux_session: String,

    /// Command that starts the agent inside a fresh window
    #[serde(default = "default_launch_command")]
    pub launch_command: String,

    /// Wait after creating a window before typing into it
    #[serde(default = "default_init_delay_ms")]
    pub init_delay_ms: u64,

    /// Wait after launching the agent before delivering the payload
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
}

impl TerminalSettings {
    pub fn init_delay(&self) -> Duration {
        Duration::from_millis(self.init_delay_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            tmux_session: default_tmux_session(),
            launch_command: default_launch_command(),
            init_delay_ms: default_init_delay_ms(),
            startup_delay_ms: default_startup_delay_ms(),
        }
    }
}

fn default_tmux_session() -> String {
    "baton".to_string()
}

fn default_launch_command() -> String {
    "claude".to_string()
}

fn default_init_delay_ms() -> u64 {
    1000
}

fn default_startup_delay_ms() -> u64 {
    3000
}

// ============================================================================
// Correlation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationSettings {
    /// Root holding one directory per project (default: `~/.claude/projects`)
    #[serde(default)]
    pub logs_root: Option<PathBuf>,

    #[serde(default = "default_artifact_extension")]
    pub artifact_extension: String,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,

    /// Fallback only considers artifacts created this recently
    #[serde(default = "default_fallback_window_secs")]
    pub fallback_window_secs: u64,

    #[serde(default = "default_revalidate_interval_secs")]
    pub revalidate_interval_secs: u64,

    /// Startup recovery only considers artifacts modified this recently
    #[serde(default = "default_recovery_window_mins")]
    pub recovery_window_mins: u64,

    #[serde(default = "default_lsof_command")]
    pub lsof_command: String,
}

impl CorrelationSettings {
    pub fn resolved_logs_root(&self) -> PathBuf {
        self.logs_root.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".claude")
                .join("projects")
        })
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn fallback_window(&self) -> Duration {
        Duration::from_secs(self.fallback_window_secs)
    }

    pub fn revalidate_interval(&self) -> Duration {
        Duration::from_secs(self.revalidate_interval_secs)
    }

    pub fn recovery_window(&self) -> Duration {
        Duration::from_secs(self.recovery_window_mins * 60)
    }
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            logs_root: None,
            artifact_extension: default_artifact_extension(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_attempts: default_probe_attempts(),
            fallback_window_secs: default_fallback_window_secs(),
            revalidate_interval_secs: default_revalidate_interval_secs(),
            recovery_window_mins: default_recovery_window_mins(),
            lsof_command: default_lsof_command(),
        }
    }
}

fn default_artifact_extension() -> String {
    "jsonl".to_string()
}

fn default_probe_interval_ms() -> u64 {
    2000
}

fn default_probe_attempts() -> u32 {
    15
}

fn default_fallback_window_secs() -> u64 {
    60
}

fn default_revalidate_interval_secs() -> u64 {
    30
}

fn default_recovery_window_mins() -> u64 {
    30
}

fn default_lsof_command() -> String {
    "lsof".to_string()
}

// ============================================================================
// Screenshots
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScreenshotSettings {
    /// Root directory for capture runs (default: `~/.baton/screenshots`)
    #[serde(default)]
    pub root: Option<PathBuf>,
}

impl ScreenshotSettings {
    pub fn resolved_root(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| crate::default_state_dir().join("screenshots"))
    }
}

// ============================================================================
// Telemetry
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub json_output: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            json_output: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
