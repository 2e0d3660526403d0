//! Thin demo binary (SPEC_FULL §6.4): `serve` runs the coordinator's
//! tick loop until Ctrl-C; `status` prints a snapshot of `state.json`.
//! All real logic lives in the library; this binary is the adapter
//! §1 describes as out of scope for the core.

use anyhow::Result;
use clap::Parser;
use fleet_coordinator::cli::{Cli, Commands};
use fleet_coordinator::{init_telemetry, shutdown_telemetry, Coordinator, CoordinatorConfig};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = init_telemetry() {
        eprintln!("warning: failed to initialize telemetry: {e}");
    }
    let _ = CoordinatorConfig::load_env_file();

    let cli = Cli::parse();
    let project_root = fleet_coordinator::config::resolve_project_root(cli.project, &std::env::current_dir()?);

    let result = match cli.command {
        Commands::Serve => serve(project_root).await,
        Commands::Status => status(project_root).await,
    };

    shutdown_telemetry();
    result
}

async fn serve(project_root: std::path::PathBuf) -> Result<()> {
    let config = CoordinatorConfig::load(&project_root.join(".agent-coordinator").join("config.json"))?;
    let coordinator = Arc::new(Coordinator::new(project_root, config)?);
    coordinator.initialize().await?;
    coordinator.start_watching().await;

    info!("coordinator serving, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, stopping tick loop");
    coordinator.stop_watching().await;
    Ok(())
}

async fn status(project_root: std::path::PathBuf) -> Result<()> {
    let config = CoordinatorConfig::load(&project_root.join(".agent-coordinator").join("config.json"))?;
    let coordinator = Coordinator::new(project_root, config)?;
    match coordinator.get_state().await {
        Some(state) => {
            println!("project: {}", state.project_path);
            println!("agents: {}", state.agents.len());
            for agent in state.agents.values() {
                println!(
                    "  {} ({}) status={:?} current_task={:?}",
                    agent.name, agent.id, agent.status, agent.current_task
                );
            }
            println!("tasks: {} ({} pending)", state.tasks.len(), state.task_queue.len());
            for task in state.tasks.values() {
                println!("  {} [{}] {:?} priority={:?}", task.id, task.title, task.status, task.priority);
            }
            let locks = coordinator.get_locks().await;
            println!("locks: {}", locks.len());
            for lock in locks {
                println!("  {} held by {} ({:?})", lock.path, lock.agent_id, lock.lock_type);
            }
        }
        None => println!("no state.json found under {}", coordinator.paths().coordinator_dir.display()),
    }
    Ok(())
}
