//! Baton - dispatch prompts to agent sessions in the terminal

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use baton_cli::commands::{Cli, Commands, ConfigCommands, SessionsCommands};
use baton_cli::{notify, runtime, Runtime};
use baton_core::{resolve_config, BatonConfig, ExecutionResult, ResolvedConfig, SessionRecord};
use baton_execution::{
    ChainRunner, ChainSpec, ChainTarget, DispatchRequest, Dispatcher, ExecutionMachine,
    MachineSettings,
};
use clap::Parser;
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let resolved = match resolve_config(cli.config.as_deref()) {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            std::process::exit(1);
        }
    };
    baton_telemetry::init_subscriber(&resolved.config.telemetry);

    let config = &resolved.config;
    let result = match &cli.command {
        Commands::Serve => run_serve(config).await,
        Commands::Run {
            payload,
            path,
            label,
            session,
            retry,
            json,
        } => {
            let request = DispatchRequest {
                project_path: path.clone().or_else(|| std::env::current_dir().ok()),
                project_label: label.clone(),
                session_id: session.clone(),
                retry_on_closed_target: *retry,
                ..DispatchRequest::new(payload.as_str())
            };
            run_once(config, request, *json).await
        }
        Commands::Chain { file, path, label } => {
            run_chain(config, file, path.clone(), label.clone()).await
        }
        Commands::Sessions { command } => run_sessions(command, config).await,
        Commands::Notify { url } => run_notify(config, url.as_deref()).await,
        Commands::Config { command } => run_config(command, &resolved),
    };

    if let Err(e) = result {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run_serve(config: &BatonConfig) -> Result<()> {
    let runtime = Runtime::start(config).await?;
    let project_path = std::env::current_dir().ok();

    println!(
        "{} {}",
        "Listening on".cyan().bold(),
        notify::listener_url(&config.listener).yellow()
    );
    println!("{}", "Type a prompt and press enter. Ctrl-C to stop.".dimmed());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let request = DispatchRequest {
            project_path: project_path.clone(),
            ..DispatchRequest::new(line)
        };
        let outcome = tokio::select! {
            outcome = dispatch_and_wait(&runtime, request) => outcome,
            _ = tokio::signal::ctrl_c() => {
                runtime.machine.cancel().await;
                break;
            }
        };
        match outcome {
            Ok(result) => print_result(&result),
            Err(e) => eprintln!("{}: {:#}", "Error".red().bold(), e),
        }
    }

    runtime.shutdown().await;
    Ok(())
}

async fn run_once(config: &BatonConfig, request: DispatchRequest, json: bool) -> Result<()> {
    let runtime = Runtime::start(config).await?;
    if !json {
        println!("{} {}", "Dispatching:".cyan().bold(), request.payload.dimmed());
    }

    let outcome = tokio::select! {
        outcome = dispatch_and_wait(&runtime, request) => outcome,
        _ = tokio::signal::ctrl_c() => {
            runtime.machine.cancel().await;
            Ok(ExecutionResult::Cancelled)
        }
    };
    // let the completed state linger out before tearing down
    runtime.machine.wait_for_idle().await;
    runtime.shutdown().await;

    let result = outcome?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    if !result.is_success() {
        bail!("execution finished with {}", result);
    }
    Ok(())
}

async fn dispatch_and_wait(runtime: &Runtime, request: DispatchRequest) -> Result<ExecutionResult> {
    let dispatch = runtime.dispatcher.dispatch(request).await?;
    if dispatch.provisioned {
        println!(
            "{} {}",
            "Started session".green(),
            dispatch.session_id.yellow()
        );
    }
    runtime
        .machine
        .wait_for_result(dispatch.generation)
        .await
        .ok_or_else(|| anyhow!("execution machine stopped before completion"))
}

async fn run_chain(
    config: &BatonConfig,
    file: &Path,
    path: Option<PathBuf>,
    label: Option<String>,
) -> Result<()> {
    let spec = load_chain(file)?;
    if spec.steps.is_empty() {
        bail!("chain '{}' has no steps", spec.name);
    }

    let runtime = Runtime::start(config).await?;
    let runner = ChainRunner::new(runtime.dispatcher.clone());
    let target = ChainTarget {
        project_path: path.or_else(|| std::env::current_dir().ok()),
        project_label: label,
    };

    println!(
        "{} {} ({} steps)",
        "Running chain".cyan().bold(),
        spec.name.yellow(),
        spec.steps.len()
    );
    let outcome = tokio::select! {
        outcome = runner.run(&spec, target) => outcome,
        _ = tokio::signal::ctrl_c() => {
            runtime.machine.cancel().await;
            runtime.machine.wait_for_idle().await;
            runtime.shutdown().await;
            bail!("chain '{}' interrupted", spec.name);
        }
    };
    runtime.machine.wait_for_idle().await;
    runtime.shutdown().await;

    let outcome = outcome?;
    for (index, result) in outcome.results.iter().enumerate() {
        let title = spec.steps[index]
            .title
            .clone()
            .unwrap_or_else(|| format!("step {}", index + 1));
        let status = if result.is_success() {
            result.to_string().green()
        } else {
            result.to_string().red()
        };
        println!("  {} {}", title.bold(), status);
    }
    if !outcome.completed {
        bail!(
            "chain '{}' stopped after {} of {} steps",
            outcome.name,
            outcome.results.len(),
            spec.steps.len()
        );
    }
    Ok(())
}

fn load_chain(file: &Path) -> Result<ChainSpec> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read chain file: {}", file.display()))?;
    let spec = match file.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("Invalid chain file: {}", file.display()))?,
        _ => serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Invalid chain file: {}", file.display()))?,
    };
    Ok(spec)
}

async fn run_sessions(command: &SessionsCommands, config: &BatonConfig) -> Result<()> {
    match command {
        SessionsCommands::List { json } => {
            let registry = runtime::open_registry(config).await?;
            let mut sessions = registry.list().await;
            sessions.sort_by_key(|s| s.created_at);

            if *json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
                return Ok(());
            }

            println!(
                "{} ({}/{})",
                "Sessions".cyan().bold(),
                sessions.len(),
                registry.max_sessions()
            );
            println!("{}", "─".repeat(80).dimmed());
            if sessions.is_empty() {
                println!("{}", "No sessions.".dimmed());
            }
            for session in &sessions {
                print_session(session);
            }
            println!("{}", "─".repeat(80).dimmed());
        }
        SessionsCommands::Close { session_id } => {
            let dispatcher = offline_dispatcher(config).await?;
            let record = dispatcher.close_session(session_id).await?;
            println!("{} {}", "Closed session".green(), record.id.yellow());
        }
        SessionsCommands::Cleanup { days } => {
            let days = days.unwrap_or(config.sessions.stale_after_days);
            let dispatcher = offline_dispatcher(config).await?;
            let removed = dispatcher
                .cleanup_stale(chrono::Utc::now(), chrono::Duration::days(days))
                .await;
            if removed.is_empty() {
                println!("{}", format!("No sessions idle for more than {} days.", days).dimmed());
            }
            for record in &removed {
                println!("{} {}", "Removed".yellow(), record.id);
            }
        }
    }
    Ok(())
}

/// Dispatcher without a listener, for registry maintenance commands.
async fn offline_dispatcher(config: &BatonConfig) -> Result<Dispatcher> {
    let registry = runtime::open_registry(config).await?;
    let machine = ExecutionMachine::spawn(MachineSettings::from(&config.execution), None);
    Ok(Dispatcher::new(
        machine,
        registry,
        runtime::terminal_host(config),
        config.terminal.clone(),
    ))
}

async fn run_notify(config: &BatonConfig, url: Option<&str>) -> Result<()> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("Failed to read hook payload from stdin")?;

    let base_url = url
        .map(str::to_string)
        .unwrap_or_else(|| notify::listener_url(&config.listener));
    notify::send(&base_url, &notify::hook_body(&input)).await
}

fn run_config(command: &ConfigCommands, resolved: &ResolvedConfig) -> Result<()> {
    match command {
        ConfigCommands::Show { yaml } => {
            if *yaml {
                print!("{}", serde_yaml_ng::to_string(&resolved.config)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&resolved.config)?);
            }
        }
        ConfigCommands::Path => match &resolved.path {
            Some(path) => println!("{}", path.display()),
            None => println!("{}", "No configuration file found, using defaults.".dimmed()),
        },
    }
    Ok(())
}

fn print_result(result: &ExecutionResult) {
    match result {
        ExecutionResult::Success => println!("{} {}", "✓".green().bold(), "Completed".green()),
        ExecutionResult::Failure(reason) => {
            println!("{} {}", "✗".red().bold(), reason.to_string().red())
        }
        ExecutionResult::Cancelled => println!("{} {}", "−".yellow(), "Cancelled".yellow()),
    }
}

fn print_session(session: &SessionRecord) {
    let age = chrono::Utc::now()
        .signed_duration_since(session.last_activity_at)
        .num_minutes();
    let age_str = if age < 60 {
        format!("{}m ago", age)
    } else if age < 1440 {
        format!("{}h ago", age / 60)
    } else {
        format!("{}d ago", age / 1440)
    };
    let dir = session
        .working_directory
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    println!(
        "{} {} {} {} {}",
        session.id.yellow(),
        age_str.dimmed(),
        session.label.as_deref().unwrap_or("-").cyan(),
        dir,
        session
            .correlation_id
            .as_deref()
            .unwrap_or("(uncorrelated)")
            .dimmed()
    );
}
