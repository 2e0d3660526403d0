//! Thin CLI surface (§1, §6.3 "thin adapters").
//!
//! The core library never parses arguments itself; `fleet-coordinatorctl`
//! is the one demo binary that does, deferring everything else to
//! [`crate::broker::Coordinator`] and [`crate::agent_runtime::AgentHandle`].

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "fleet-coordinatorctl")]
#[command(about = "File-based coordinator for a fleet of agent processes")]
pub struct Cli {
    /// Project root to operate on (defaults to the current directory,
    /// walking upward to find an existing coordinator dir or VCS/manifest marker).
    #[arg(long, global = true)]
    pub project: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the coordinator layout and run the tick loop until Ctrl-C.
    Serve,
    /// Print a snapshot of agents, tasks, and locks from `state.json`.
    Status,
}
