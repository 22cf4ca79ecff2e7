use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use conductor::config::Config;
use conductor::coordinator::Coordinator;
use conductor::error::CoordinatorError;
use conductor::exec::ProcessExecutor;
use conductor::logging;
use conductor::model::{MessageType, SessionStatus};
use conductor::sender::SendPriority;
use conductor::tmux::{SystemTmuxClient, TmuxClient, TmuxError};

/// Minimum tmux version for the features we use
const MIN_TMUX: (u32, u32) = (2, 1);

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Session coordinator for parallel development workflows")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the master session for a project
    CreateMaster {
        project_id: String,

        /// Working directory for the session (default: current directory)
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Create a child session with its own worktree
    CreateChild {
        project_id: String,
        task_id: String,

        /// Repository root for the worktree (default: current directory)
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Branch name (default: task/<task_id>)
        #[arg(long)]
        branch: Option<String>,
    },

    /// Terminate a session and clean up its resources
    Terminate { session_name: String },

    /// Register a parent/child session relationship
    Register {
        parent: String,
        child: String,
        task_id: String,
        project_id: String,
    },

    /// Report a session's status (routes significant child statuses to the parent)
    ReportStatus {
        session_name: String,
        status: String,

        #[arg(default_value_t = 0)]
        progress: u8,

        #[arg(default_value = "")]
        details: String,
    },

    /// List the children of a master session with health scores
    ListChildren { parent: String },

    /// Query one session, or all sessions when no name is given
    QueryStatus { session_name: Option<String> },

    /// Enqueue a message for a session
    SendMessage {
        from: String,
        to: String,
        #[arg(long, default_value = "INSTRUCTION")]
        message_type: String,
        content: String,
    },

    /// Drain unread messages for a session
    DrainMessages { session_name: String },

    /// Deliver content to a session's terminal in two phases
    SendDelayed {
        session_name: String,
        content: String,

        /// Seconds between content and the Enter keystroke
        #[arg(long)]
        delay: Option<u64>,

        #[arg(long, default_value = "normal")]
        priority: String,

        #[arg(long)]
        window: Option<u32>,

        #[arg(long)]
        pane: Option<u32>,
    },

    /// Show registry and sender metrics
    Metrics,

    /// Run the coordinator loops until interrupted
    Serve,

    /// Write the default configuration to conductor.toml
    InitConfig,
}

/// Check that tmux is installed and recent enough
async fn check_tmux_available(config: &Config) -> Result<(), TmuxError> {
    if which::which("tmux").is_err() {
        return Err(TmuxError::NotInstalled);
    }
    let client = SystemTmuxClient::new(ProcessExecutor::new(config.command_timeout()));
    let version = client.check_available().await?;
    if !version.meets_minimum(MIN_TMUX.0, MIN_TMUX.1) {
        return Err(TmuxError::CommandFailed(format!(
            "tmux {} is older than the minimum required {}.{}",
            version.raw, MIN_TMUX.0, MIN_TMUX.1
        )));
    }
    tracing::debug!(version = %version.raw, "tmux available");
    Ok(())
}

fn print_tmux_error(err: &TmuxError) {
    eprintln!("Error: {err}");
    if matches!(err, TmuxError::NotInstalled) {
        eprintln!();
        eprintln!("tmux is required to run conductor.");
        eprintln!();
        eprintln!("Install tmux:");
        eprintln!("  macOS:         brew install tmux");
        eprintln!("  Ubuntu/Debian: sudo apt install tmux");
        eprintln!("  Fedora/RHEL:   sudo dnf install tmux");
        eprintln!("  Arch:          sudo pacman -S tmux");
    }
}

fn parse_arg<T>(kind: &str, value: &str) -> Result<T, CoordinatorError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| CoordinatorError::InvalidArgument(format!("{kind}: {e}")))
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Error: failed to encode output: {e}"),
    }
}

fn needs_tmux(command: &Commands) -> bool {
    matches!(
        command,
        Commands::CreateMaster { .. }
            | Commands::CreateChild { .. }
            | Commands::Terminate { .. }
            | Commands::SendDelayed { .. }
            | Commands::Serve
    )
}

async fn run(cli: Cli, config: Config) -> Result<(), CoordinatorError> {
    let coordinator = Coordinator::new(&config);

    match cli.command {
        Commands::CreateMaster { project_id, cwd } => {
            let record = coordinator
                .create_master_session(&project_id, cwd.as_deref())
                .await?;
            print_json(&record);
        }
        Commands::CreateChild {
            project_id,
            task_id,
            cwd,
            branch,
        } => {
            let record = coordinator
                .create_child_session(&project_id, &task_id, cwd.as_deref(), branch.as_deref())
                .await?;
            print_json(&record);
        }
        Commands::Terminate { session_name } => {
            let summary = coordinator.terminate_session(&session_name).await?;
            print_json(&summary);
        }
        Commands::Register {
            parent,
            child,
            task_id,
            project_id,
        } => {
            coordinator.register_relationship(&parent, &child, &task_id, &project_id)?;
            println!("registered {child} -> {parent}");
        }
        Commands::ReportStatus {
            session_name,
            status,
            progress,
            details,
        } => {
            let status: SessionStatus = parse_arg("status", &status)?;
            let record = coordinator.report_status(&session_name, status, progress, &details)?;
            print_json(&record);
        }
        Commands::ListChildren { parent } => {
            let children = coordinator.list_children(&parent)?;
            print_json(&children);
        }
        Commands::QueryStatus { session_name } => match session_name {
            Some(name) => print_json(&coordinator.query_status(&name)?),
            None => print_json(&coordinator.query_all()),
        },
        Commands::SendMessage {
            from,
            to,
            message_type,
            content,
        } => {
            let message_type: MessageType = parse_arg("message type", &message_type)?;
            let id = coordinator.send_message(&from, &to, message_type, &content)?;
            println!("{id}");
        }
        Commands::DrainMessages { session_name } => {
            print_json(&coordinator.drain_messages(&session_name));
        }
        Commands::SendDelayed {
            session_name,
            content,
            delay,
            priority,
            window,
            pane,
        } => {
            let priority: SendPriority = parse_arg("priority", &priority)?;
            coordinator.start();
            let id = coordinator.send_delayed(
                &session_name,
                &content,
                delay.map(Duration::from_secs),
                Some(priority),
                window,
                pane,
            )?;
            println!("{id}");
            // One-shot invocation: wait for the delivery to finish
            loop {
                match coordinator.delayed_status(&id) {
                    Some(status) if status.state.is_terminal() => {
                        print_json(&status);
                        if !matches!(status.state, conductor::sender::RequestState::Completed) {
                            coordinator.shutdown();
                            return Err(CoordinatorError::ExternalFailure(
                                status.error.unwrap_or_else(|| "delivery failed".to_string()),
                            ));
                        }
                        break;
                    }
                    _ => tokio::time::sleep(Duration::from_millis(100)).await,
                }
            }
            coordinator.shutdown();
        }
        Commands::Metrics => {
            print_json(&coordinator.get_metrics());
        }
        Commands::Serve => {
            coordinator.start();
            tracing::info!("Coordinator running, press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .map_err(|e| CoordinatorError::Internal(e.to_string()))?;
            coordinator.shutdown();
        }
        Commands::InitConfig => {
            config
                .save()
                .map_err(|e| CoordinatorError::Internal(format!("{e:#}")))?;
            println!("wrote {}", Config::default_config_path().display());
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    };

    let _logging = match logging::init_logging(&config, cli.debug) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {e:#}");
            std::process::exit(1);
        }
    };

    if needs_tmux(&cli.command) {
        if let Err(e) = check_tmux_available(&config).await {
            print_tmux_error(&e);
            std::process::exit(3);
        }
    }

    if let Err(e) = run(cli, config).await {
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}
