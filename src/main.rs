use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use laborc::config::OrchestratorConfig;
use laborc::logging;
use laborc::orchestrator::{Orchestrator, SpawnRequest};
use laborc::reaper::Reaper;
use laborc::runtime::DockerRuntime;

#[derive(Parser)]
#[command(name = "laborc")]
#[command(about = "Lab container orchestrator", long_about = None)]
struct Cli {
    /// Docker socket path (defaults to the standard socket)
    #[arg(long, env = "LABORC_DOCKER_SOCKET")]
    socket: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator with the background reaper until ctrl-c
    Serve,

    /// Spawn a lab instance for an owner
    Spawn {
        /// Owner (user) identifier
        #[arg(long)]
        owner: String,

        /// Image to launch
        #[arg(long)]
        image: String,

        /// Lab content reference
        #[arg(long)]
        lab: Option<String>,

        /// Soft lifetime in minutes
        #[arg(long)]
        timeout: Option<i64>,

        /// Port exposed inside the container
        #[arg(long)]
        container_port: Option<u16>,
    },

    /// Stop and remove an owner's instances
    Kill {
        #[arg(long)]
        owner: String,

        /// Kill immediately instead of graceful stop
        #[arg(long)]
        force: bool,
    },

    /// Show an owner's active instance
    Status {
        #[arg(long)]
        owner: String,
    },

    /// Run a command inside an owner's active instance
    Exec {
        #[arg(long)]
        owner: String,

        command: String,
    },

    /// Extend an owner's lab lifetime
    Extend {
        #[arg(long)]
        owner: String,

        /// Extra minutes to grant
        #[arg(long, default_value = "60")]
        minutes: i64,
    },

    /// Fetch recent logs from an owner's active instance
    Logs {
        #[arg(long)]
        owner: String,

        #[arg(long, default_value = "100")]
        tail: usize,
    },

    /// Run both reclamation sweeps once, on demand
    Sweep,

    /// List all running lab instances
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = logging::init_logging("./logs", "laborc");

    let cli = Cli::parse();

    let config = OrchestratorConfig::from_env();
    let runtime = Arc::new(DockerRuntime::connect(cli.socket.as_deref())?);
    let orchestrator = Arc::new(Orchestrator::new(runtime, config));

    match cli.command {
        Commands::Serve => {
            let sweep_interval = orchestrator.config().sweep_interval;
            let reaper = Reaper::new(orchestrator.clone(), sweep_interval).start();

            info!("Orchestrator running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;

            info!("Shutting down");
            reaper.shutdown().await;
        }

        Commands::Spawn {
            owner,
            image,
            lab,
            timeout,
            container_port,
        } => {
            let req = SpawnRequest {
                owner_id: owner,
                image,
                lab_ref: lab,
                container_port,
                timeout_minutes: timeout,
                env: Vec::new(),
                memory_limit: None,
                cpu_limit: None,
            };
            report(orchestrator.spawn(req).await);
        }

        Commands::Kill { owner, force } => {
            report(orchestrator.kill(&owner, force).await);
        }

        Commands::Status { owner } => match orchestrator.status(&owner).await {
            Ok(Some(info)) => {
                println!(
                    "{}",
                    serde_json::json!({ "active": true, "instance": info })
                );
            }
            Ok(None) => println!("{}", serde_json::json!({ "active": false })),
            Err(e) => print_error(&e),
        },

        Commands::Exec { owner, command } => {
            report(orchestrator.exec(&owner, &command).await);
        }

        Commands::Extend { owner, minutes } => match orchestrator.extend(&owner, minutes).await {
            Ok(new_expires_at) => {
                println!("{}", serde_json::json!({ "new_expires_at": new_expires_at }));
            }
            Err(e) => print_error(&e),
        },

        Commands::Logs { owner, tail } => match orchestrator.logs(&owner, tail).await {
            Ok(logs) => print!("{logs}"),
            Err(e) => print_error(&e),
        },

        Commands::Sweep => {
            report(orchestrator.sweep_expired().await);
            report(orchestrator.sweep_stale().await);
        }

        Commands::List => {
            report(orchestrator.list_active().await);
        }
    }

    Ok(())
}

fn report<T: serde::Serialize>(result: laborc::Result<T>) {
    match result {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("failed to serialize response: {e}"),
        },
        Err(e) => print_error(&e),
    }
}

fn print_error(err: &laborc::Error) {
    println!(
        "{}",
        serde_json::json!({
            "success": false,
            "error_code": err.code(),
            "message": err.user_message(),
        })
    );
    tracing::error!("{}", err);
}
