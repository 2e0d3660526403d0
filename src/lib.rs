//! fleet-coordinator: a file-based multi-process task broker.
//!
//! Coordinates a fleet of independent agent processes that mutate a
//! shared working tree: agent liveness tracking, priority + dependency
//! aware task scheduling, lease-based file locking, and typed
//! message exchange through a shared on-disk directory, with
//! crash-safe state persistence. See `SPEC_FULL.md` for the full
//! component breakdown (C1-C7).

pub mod agent_runtime;
pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod locks;
pub mod message;
pub mod model;
pub mod paths;
pub mod queue;
pub mod state;
pub mod telemetry;

pub use agent_runtime::AgentHandle;
pub use broker::{Coordinator, CoordinatorEvent};
pub use config::CoordinatorConfig;
pub use error::{CoordinatorError, Result};
pub use message::{Message, MessagePayload};
pub use model::{
    AgentInfo, AgentStatus, FileLock, LockType, NewTask, Priority, ServerState, Task, TaskResult, TaskStatus,
};
pub use paths::CoordinatorPaths;
pub use telemetry::{generate_correlation_id, init_telemetry, shutdown_telemetry};
