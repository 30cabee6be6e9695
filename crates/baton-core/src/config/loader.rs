use crate::config::schema::BatonConfig;
use anyhow::{anyhow, Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Jsonc,
    Json,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;

        match ext {
            "jsonc" => Some(Self::Jsonc),
            "json" => Some(Self::Json),
            "yml" | "yaml" => Some(Self::Yaml),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: BatonConfig,
    /// `None` when no file was found and defaults are in effect
    pub path: Option<PathBuf>,
    pub format: Option<ConfigFormat>,
}

/// Load configuration, falling back to defaults when no file exists.
///
/// An explicit `config_path` that cannot be read is an error.
pub fn load_config(config_path: Option<&Path>) -> Result<BatonConfig> {
    resolve_config(config_path).map(|r| r.config)
}

pub fn resolve_config(config_path: Option<&Path>) -> Result<ResolvedConfig> {
    if let Some(path) = config_path {
        return load_config_from_file(path);
    }

    match find_config_file() {
        Some(path) => load_config_from_file(&path),
        None => {
            tracing::debug!("No configuration file found, using defaults");
            Ok(ResolvedConfig {
                config: BatonConfig::default(),
                path: None,
                format: None,
            })
        }
    }
}

pub fn load_config_from_file(path: &Path) -> Result<ResolvedConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let format = ConfigFormat::from_path(path)
        .ok_or_else(|| anyhow!("Unknown config format for: {}", path.display()))?;

    let config = parse_config_content(&content, format)
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(ResolvedConfig {
        config: expand_env_vars(config),
        path: Some(path.to_path_buf()),
        format: Some(format),
    })
}

fn parse_config_content(content: &str, format: ConfigFormat) -> Result<BatonConfig> {
    if content.trim().is_empty() {
        return Ok(BatonConfig::default());
    }

    match format {
        ConfigFormat::Jsonc => json5::from_str(content).context("Failed to parse JSONC"),
        ConfigFormat::Json => serde_json::from_str(content).context("Failed to parse JSON"),
        ConfigFormat::Yaml => serde_yaml_ng::from_str(content).context("Failed to parse YAML"),
    }
}

const CONFIG_CANDIDATES: &[&str] = &[
    "baton.jsonc",
    "baton.json",
    "baton.yml",
    "baton.yaml",
    ".baton.jsonc",
    ".baton.json",
    ".baton.yml",
    ".baton.yaml",
];

pub fn find_config_file() -> Option<PathBuf> {
    for candidate in CONFIG_CANDIDATES {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Some(path);
        }
    }

    let home = dirs::home_dir()?;
    CONFIG_CANDIDATES
        .iter()
        .map(|candidate| home.join(".config").join("baton").join(candidate))
        .find(|path| path.exists())
}

fn expand_env_vars(mut config: BatonConfig) -> BatonConfig {
    config.listener.host = expand_env_string(&config.listener.host);
    config.terminal.launch_command = expand_env_string(&config.terminal.launch_command);
    config.correlation.lsof_command = expand_env_string(&config.correlation.lsof_command);
    config.sessions.state_dir = config.sessions.state_dir.map(|p| expand_path(&p));
    config.correlation.logs_root = config.correlation.logs_root.map(|p| expand_path(&p));
    config.screenshots.root = config.screenshots.root.map(|p| expand_path(&p));
    config
}

fn expand_path(path: &Path) -> PathBuf {
    let expanded = expand_env_string(&path.to_string_lossy());
    match expanded.strip_prefix("~/") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(expanded),
        },
        None if expanded == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(expanded)),
        None => PathBuf::from(expanded),
    }
}

fn expand_env_string(s: &str) -> String {
    let mut result = String::new();
    let mut chars = s.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }

        if chars.peek() == Some(&'{') {
            chars.next();
            let var_name: String = chars.by_ref().take_while(|&c| c != '}').collect();
            match env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    result.push_str("${");
                    result.push_str(&var_name);
                    result.push('}');
                }
            }
        } else {
            // peek so the delimiter after the name is kept
            let mut var_name = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_alphanumeric() || c == '_' {
                    var_name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if var_name.is_empty() {
                result.push('$');
            } else if let Ok(value) = env::var(&var_name) {
                result.push_str(&value);
            } else {
                result.push('$');
                result.push_str(&var_name);
            }
        }
    }

    result
}
