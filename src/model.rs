//! Core data model (§3): `AgentInfo`, `Task`, `TaskResult`, `FileLock`,
//! `ServerState`, and their supporting enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Task priority, ordered `critical < high < normal < low` per §4.6's
/// explicit ordering table. Lower discriminant sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Blocked,
    Error,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Read,
    Write,
    Exclusive,
}

impl LockType {
    /// Compatibility matrix from §4.5: the only compatible pairing is
    /// `read` held against a `read` request.
    pub fn compatible_with(self, requested: LockType) -> bool {
        matches!((self, requested), (LockType::Read, LockType::Read))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub status: AgentStatus,
    pub current_task: Option<String>,
    pub working_branch: Option<String>,
    pub working_directory: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AgentInfo {
    pub fn new(id: String, name: String, working_directory: String, capabilities: BTreeSet<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            status: AgentStatus::Idle,
            current_task: None,
            working_branch: None,
            working_directory,
            started_at: now,
            last_heartbeat: now,
            completed_tasks: 0,
            failed_tasks: 0,
            capabilities,
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle && self.current_task.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub summary: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub files_deleted: Vec<String>,
    #[serde(default)]
    pub tests_passed: Option<u32>,
    #[serde(default)]
    pub tests_failed: Option<u32>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub assigned_agent: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub target_files: Vec<String>,
    #[serde(default)]
    pub target_directories: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    pub branch: Option<String>,
    pub base_branch: Option<String>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

/// Parameters accepted by `Coordinator::create_task`.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub target_files: Vec<String>,
    pub target_directories: Vec<String>,
    pub depends_on: Vec<String>,
    pub max_attempts: Option<u32>,
    pub base_branch: Option<String>,
    pub tags: BTreeSet<String>,
}

impl Task {
    pub fn from_new(id: String, new: NewTask) -> Self {
        let now = Utc::now();
        let blocked_by = new.depends_on.clone();
        Self {
            id,
            title: new.title,
            description: new.description,
            priority: new.priority,
            status: TaskStatus::Pending,
            assigned_agent: None,
            assigned_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            attempts: 0,
            max_attempts: new.max_attempts.unwrap_or(3),
            target_files: new.target_files,
            target_directories: new.target_directories,
            depends_on: new.depends_on,
            blocked_by,
            branch: None,
            base_branch: new.base_branch,
            result: None,
            error: None,
            tags: new.tags,
        }
    }

    pub fn is_blocked(&self) -> bool {
        !self.blocked_by.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLock {
    pub path: String,
    pub agent_id: String,
    pub task_id: Option<String>,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub lock_type: LockType,
}

impl FileLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerState {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub project_path: String,
    pub agents: BTreeMap<String, AgentInfo>,
    pub tasks: BTreeMap<String, Task>,
    pub task_queue: Vec<String>,
    #[serde(default)]
    pub completed_history: Vec<String>,
    pub config: crate::config::CoordinatorConfig,
}

impl ServerState {
    pub fn new(project_path: String, config: crate::config::CoordinatorConfig) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Utc::now(),
            project_path,
            agents: BTreeMap::new(),
            tasks: BTreeMap::new(),
            task_queue: Vec::new(),
            completed_history: Vec::new(),
            config,
        }
    }
}

pub const CURRENT_STATE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_critical_first() {
        let mut v = vec![Priority::Low, Priority::Normal, Priority::Critical, Priority::High];
        v.sort();
        assert_eq!(v, vec![Priority::Critical, Priority::High, Priority::Normal, Priority::Low]);
    }

    #[test]
    fn lock_compatibility_matrix() {
        assert!(LockType::Read.compatible_with(LockType::Read));
        assert!(!LockType::Read.compatible_with(LockType::Write));
        assert!(!LockType::Write.compatible_with(LockType::Read));
        assert!(!LockType::Write.compatible_with(LockType::Write));
        assert!(!LockType::Exclusive.compatible_with(LockType::Exclusive));
    }

    #[test]
    fn new_task_computes_blocked_by_from_depends_on() {
        let new = NewTask {
            title: "t".into(),
            depends_on: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        let task = Task::from_new("t1".into(), new);
        assert_eq!(task.blocked_by, vec!["a".to_string(), "b".to_string()]);
        assert!(task.is_blocked());
    }
}
