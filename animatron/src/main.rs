//! Animatron - orchestration core for an animatronic assistant
//!
//! CLI entry point for running the assistant and talking to a running instance.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use animatron::cli::{Cli, Command, OutputFormat, build_command, get_log_path};
use animatron::config::Config;
use animatron::events::{Event, topics};
use animatron::ipc::{self, AssistantClient, IpcServer};
use animatron::runtime::Assistant;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    // Setup logging with priority: CLI > config > INFO default
    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;

    let client = AssistantClient::with_socket_path(ipc::socket_path(&config));

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Some(Command::Run) => cmd_run(config, cli.config).await,
        Some(Command::Send {
            command_type,
            action,
            fields,
            source,
        }) => cmd_send(&client, &command_type, &action, &fields, source.as_deref()).await,
        Some(Command::Snapshot { since, format }) => cmd_snapshot(&client, since, format).await,
        Some(Command::Follow { since, format }) => cmd_follow(&client, since, format).await,
        Some(Command::Status { format }) => cmd_status(&client, format).await,
        Some(Command::Ping) => cmd_ping(&client).await,
        Some(Command::Stop) => cmd_stop(&client).await,
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            println!("Logs are written to: {}", get_log_path().display());
            Ok(())
        }
    }
}

/// Run the assistant until SIGINT/SIGTERM or a Shutdown request
async fn cmd_run(config: Config, config_path: Option<PathBuf>) -> Result<()> {
    let socket_path = ipc::socket_path(&config);
    let assistant = Arc::new(Assistant::new(config, config_path).context("Failed to build assistant")?);
    assistant.enable_tracing();

    let (listener, socket_path) = ipc::create_listener_at(&socket_path)?;
    info!(?socket_path, "IPC socket listening");
    println!("Animatron running on {}", socket_path.display());

    let server = Arc::new(IpcServer::new(assistant.clone()));
    let mut shutdown_rx = server.shutdown_signal();
    let server_handle = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                tracing::error!(error = %e, "IPC server error");
            }
        })
    };

    debug!("cmd_run: setting up signal handlers");
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    info!("SIGHUP received - reloading configuration");
                    if let Err(e) = assistant.reload_config().await {
                        tracing::error!(error = %e, "Failed to reload configuration");
                    }
                }
                _ = sigint.recv() => {
                    warn!("SIGINT received");
                    break;
                }
                _ = sigterm.recv() => {
                    warn!("SIGTERM received");
                    break;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = shutdown_rx.changed() => {}
        }
    }

    info!("Animatron shutting down...");
    server.shutdown();
    let _ = server_handle.await;
    assistant.shutdown().await;
    ipc::cleanup_socket(&socket_path);
    println!("Animatron stopped");
    Ok(())
}

async fn cmd_send(
    client: &AssistantClient,
    command_type: &str,
    action: &str,
    fields: &[String],
    source: Option<&str>,
) -> Result<()> {
    let command = build_command(command_type, action, fields, source).map_err(|e| eyre::eyre!(e))?;
    match client.send_command(command).await {
        Ok(sequence_id) => {
            println!("{} {} {} (seq {})", "✓".green(), command_type, action, sequence_id);
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", "✗".red(), e);
            Err(e)
        }
    }
}

async fn cmd_snapshot(client: &AssistantClient, since: Option<u64>, format: OutputFormat) -> Result<()> {
    let events = client.snapshot(since).await?;
    for event in &events {
        print_event(event, &format)?;
    }
    if format == OutputFormat::Text && events.is_empty() {
        println!("{}", "no events".dimmed());
    }
    Ok(())
}

async fn cmd_follow(client: &AssistantClient, since: Option<u64>, format: OutputFormat) -> Result<()> {
    let mut follower = client.follow(since).await?;
    for event in &follower.backlog {
        print_event(event, &format)?;
    }
    while let Some(event) = follower.next_event().await? {
        print_event(&event, &format)?;
    }
    Ok(())
}

async fn cmd_status(client: &AssistantClient, format: OutputFormat) -> Result<()> {
    let status = client.status().await?;
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let text = |v: &Value| v.as_str().unwrap_or("-").to_string();
    println!("{:<10} {}", "Mode:".bold(), text(&status["current_mode"]).cyan());
    if let Some(transition) = status["in_flight"].as_object() {
        println!(
            "{:<10} {} -> {}",
            "Pending:".bold(),
            transition.get("from_mode").map(text).unwrap_or_default(),
            transition.get("to_mode").map(text).unwrap_or_default()
        );
    }
    let healthy = status["healthy"].as_bool().unwrap_or(false);
    println!(
        "{:<10} {}",
        "Health:".bold(),
        if healthy { "healthy".green() } else { "degraded".red() }
    );
    println!(
        "{:<10} {} (every {}s)",
        "DJ:".bold(),
        if status["dj"]["active"].as_bool().unwrap_or(false) {
            "active".green()
        } else {
            "inactive".normal()
        },
        status["dj"]["transition_duration"]
    );
    println!(
        "{:<10} {} published, {} retained, {} faults",
        "Bus:".bold(),
        status["bus"]["published"],
        status["bus"]["retained"],
        status["bus"]["handler_faults"]
    );
    if let Some(services) = status["services"].as_object()
        && !services.is_empty()
    {
        println!("{}", "Services:".bold());
        for (name, service) in services {
            let state = text(&service["state"]);
            let state = if state == "error" || state == "failed" {
                state.red()
            } else {
                state.normal()
            };
            println!("  {:<12} {}", name, state);
        }
    }
    Ok(())
}

async fn cmd_ping(client: &AssistantClient) -> Result<()> {
    match client.ping().await {
        Ok(version) => {
            println!("{} Animatron is running (version {})", "✓".green(), version);
            Ok(())
        }
        Err(e) => {
            println!("{} Animatron is not reachable: {}", "✗".red(), e);
            Err(e)
        }
    }
}

async fn cmd_stop(client: &AssistantClient) -> Result<()> {
    if !client.socket_exists() {
        println!("Animatron is not running");
        return Ok(());
    }
    client.shutdown().await?;
    println!("Animatron stopping");
    Ok(())
}

fn print_event(event: &Event, format: &OutputFormat) -> Result<()> {
    if *format == OutputFormat::Json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    let topic = match event.topic.as_str() {
        topics::HANDLER_FAULT => event.topic.as_str().red(),
        topics::MODE_TRANSITION | topics::SYSTEM_MODE_CHANGE => event.topic.as_str().cyan(),
        t if t.ends_with("_command") => event.topic.as_str().yellow(),
        _ => event.topic.as_str().normal(),
    };
    let payload = event.payload.clone();
    println!(
        "{:>6} {} {:<22} {:<18} {}",
        event.sequence_id.to_string().dimmed(),
        event.timestamp.format("%H:%M:%S%.3f"),
        topic,
        event.source,
        Value::Object(payload)
    );
    Ok(())
}
