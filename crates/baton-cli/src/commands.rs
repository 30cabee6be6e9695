//! CLI commands

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Baton - dispatch prompts to agent sessions in the terminal
#[derive(Parser, Debug)]
#[command(name = "baton")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: baton.{jsonc,json,yml,yaml} in the
    /// current directory, then ~/.config/baton/)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the completion listener and dispatch each line read from stdin
    Serve,

    /// Dispatch one prompt and wait for it to complete
    Run {
        /// The prompt to deliver
        payload: String,

        /// Project directory for a new session
        #[arg(long)]
        path: Option<PathBuf>,

        /// Reuse a session whose label or terminal title matches
        #[arg(long)]
        label: Option<String>,

        /// Deliver to this session id
        #[arg(long)]
        session: Option<String>,

        /// Retry once against a fresh target if the first one closed
        #[arg(long)]
        retry: bool,

        /// Output the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a chain of prompts from a YAML or JSON file
    Chain {
        /// Chain definition file
        file: PathBuf,

        /// Project directory for a new session
        #[arg(long)]
        path: Option<PathBuf>,

        /// Reuse a session whose label or terminal title matches
        #[arg(long)]
        label: Option<String>,
    },

    /// Session registry management
    Sessions {
        #[command(subcommand)]
        command: SessionsCommands,
    },

    /// Report completion to a running listener (for the agent's stop hook)
    Notify {
        /// Listener URL (default: from configuration)
        #[arg(long)]
        url: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum SessionsCommands {
    /// List known sessions
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Close a session and its terminal target
    Close {
        /// Session ID
        session_id: String,
    },
    /// Remove sessions idle for longer than the configured limit
    Cleanup {
        /// Override the idle limit in days
        #[arg(long)]
        days: Option<i64>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show {
        /// Output as YAML instead of JSON
        #[arg(long)]
        yaml: bool,
    },
    /// Print the configuration file in use
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["baton", "run", "fix the build", "--label", "api", "--retry"]);
        match cli.command {
            Commands::Run {
                payload,
                label,
                retry,
                path,
                ..
            } => {
                assert_eq!(payload, "fix the build");
                assert_eq!(label.as_deref(), Some("api"));
                assert!(retry);
                assert!(path.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::parse_from(["baton", "sessions", "list", "--config", "/tmp/baton.yml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/baton.yml")));
    }
}
