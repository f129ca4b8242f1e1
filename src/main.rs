//! Agent pipeline engine - main entry point
//!
//! `run` recovers in-flight work from the work-item service, starts the
//! polling scheduler and reads operator commands from stdin until EOF or a
//! shutdown signal.

use agent_pipeline::completion::ProviderFactory;
use agent_pipeline::config::EngineConfig;
use agent_pipeline::observability::{init_default_logging, metrics::metrics};
use agent_pipeline::orchestrator::{Trigger, WorkflowOrchestrator};
use agent_pipeline::services::{HttpWorkItemService, InMemoryProposalSurface, WorkItemId};
use agent_pipeline::tracking::decode;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Orchestrates AI agent pipelines over tracked work items
#[derive(Parser)]
#[command(name = "agent-pipeline")]
#[command(about = "Agent pipeline orchestration over externally tracked work items")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "AGENT_PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine and accept operator commands on stdin
    Run,
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Decode the tracking section of a work item body saved to a file
    Inspect {
        #[arg(value_name = "BODY_FILE")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let result = match cli.command {
        Commands::Inspect { file } => inspect_body(&file),
        command => match load_configuration(&cli.config) {
            Ok(config) => match command {
                Commands::Run => run_engine(config).await,
                Commands::Config { show } => handle_config_command(&config, show),
                Commands::Inspect { .. } => Ok(()),
            },
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                process::exit(1);
            }
        },
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(EngineConfig::load_from_file(path)?);
    }

    for path_str in ["pipeline.toml", "config/pipeline.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(EngineConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create pipeline.toml".into())
}

async fn run_engine(config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let section = config
        .work_items
        .as_ref()
        .ok_or("configuration has no [work_items] section")?;
    let work_items = Arc::new(HttpWorkItemService::from_section(section)?);
    let surface = Arc::new(InMemoryProposalSurface::new());

    let orchestrator = WorkflowOrchestrator::from_config(&config, work_items, surface.clone())?;

    let report = orchestrator.recover().await?;
    info!(
        registered = report.registered,
        resubmitted = report.resubmitted,
        proposals = report.proposals,
        "Recovered in-flight work"
    );

    orchestrator
        .start_polling(orchestrator.default_poll_interval())
        .await;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    info!("Engine running; commands: enter <item>, status <item>, proposals, confirm <id>, reject <id>, metrics");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => handle_console_line(&orchestrator, &surface, line.trim()).await,
                    None => {
                        info!("Input closed, shutting down");
                        break;
                    }
                }
            }
        }
    }

    orchestrator.stop_polling().await;
    info!("Engine stopped");
    Ok(())
}

async fn handle_console_line(
    orchestrator: &WorkflowOrchestrator,
    surface: &InMemoryProposalSurface,
    line: &str,
) {
    let mut parts = line.split_whitespace();
    let (Some(command), argument) = (parts.next(), parts.next()) else {
        return;
    };

    match (command, argument) {
        ("enter", Some(item)) => {
            match orchestrator
                .submit_trigger(&WorkItemId::new(item), Trigger::Enter)
                .await
            {
                Ok(block) => println!("{item}: {}", block.status),
                Err(e) => warn!(work_item = %item, error = %e, "Enter failed"),
            }
        }
        ("status", Some(item)) => match orchestrator.get_pipeline_status(&WorkItemId::new(item)).await {
            Ok(block) => print_json(&block),
            Err(e) => warn!(work_item = %item, error = %e, "Status lookup failed"),
        },
        ("proposals", _) => {
            for proposal in surface.pending() {
                println!("{} {} {}", proposal.id, proposal.work_item, proposal.summary());
            }
        }
        ("confirm", Some(id)) | ("reject", Some(id)) => {
            let Ok(id) = Uuid::parse_str(id) else {
                warn!(id = %id, "Not a proposal id");
                return;
            };
            let result = if command == "confirm" {
                surface.confirm(id)
            } else {
                surface.reject(id)
            };
            if let Err(e) = result {
                warn!(proposal_id = %id, error = %e, "Decision not recorded");
            }
        }
        ("metrics", _) => print_json(&metrics().snapshot()),
        _ => warn!(command = %line, "Unknown command"),
    }
}

fn handle_config_command(
    config: &EngineConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let factory = ProviderFactory::from_config(config);
    for pipeline in &config.pipelines {
        factory.resolve_pipeline(pipeline.clone())?;
    }
    info!("Configuration is valid");

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    } else {
        for pipeline in &config.pipelines {
            let agents: Vec<&str> = pipeline.agents.iter().map(|a| a.name.as_str()).collect();
            println!("{}: {}", pipeline.project, agents.join(" -> "));
        }
    }

    Ok(())
}

fn inspect_body(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let body = std::fs::read_to_string(path)?;
    let block = decode(&body)?;
    print_json(&block);
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => error!("Failed to render output: {}", e),
    }
}
