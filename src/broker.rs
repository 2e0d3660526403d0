//! Task Broker / Coordinator (C6, §4.6).
//!
//! Runs in one process, owns the authoritative `ServerState`, and
//! drives the periodic tick: drain outboxes, check heartbeats, sweep
//! timed-out tasks, then auto-assign pending work to idle agents.

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::locks::LockManager;
use crate::message::{LockRequest, Message, MessagePayload};
use crate::model::{AgentInfo, AgentStatus, FileLock, LockType, NewTask, ServerState, Task, TaskStatus};
use crate::paths::CoordinatorPaths;
use crate::queue::{FileMessageQueue, SeenIds};
use crate::state::StateStore;
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn};

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    AgentRegistered { agent_id: String },
    AgentDisconnected { agent_id: String },
    AgentStatusChanged { agent_id: String, status: AgentStatus },
    TaskCreated { task_id: String },
    TaskAssigned { task_id: String, agent_id: String },
    TaskStarted { task_id: String },
    TaskProgress { task_id: String },
    TaskCompleted { task_id: String },
    TaskFailed { task_id: String, error: String },
    TaskRetryExhausted { task_id: String },
    TaskUnassigned { task_id: String },
    LockAcquired { agent_id: String },
    LockReleased { agent_id: String },
    LockConflict { agent_id: String },
    Error { message: String },
}

type EventHandler = Box<dyn Fn(CoordinatorEvent) + Send + Sync>;

pub struct Coordinator {
    paths: Arc<CoordinatorPaths>,
    config: CoordinatorConfig,
    state_store: StateStore,
    queue: FileMessageQueue,
    locks: LockManager,
    seen_ids: SeenIds,
    event_handlers: Mutex<Vec<EventHandler>>,
    watch_handle: Mutex<Option<JoinHandle<()>>>,
    tick_counter: AtomicU64,
}

impl Coordinator {
    pub fn new(project_root: impl Into<PathBuf>, config: CoordinatorConfig) -> Result<Self> {
        let paths = Arc::new(CoordinatorPaths::new(project_root));
        let state_store = StateStore::new(paths.clone(), &config);
        let queue = FileMessageQueue::new(paths.clone());
        let locks = LockManager::new(paths.clone(), config.lock_timeout_ms);
        Ok(Self {
            paths,
            config,
            state_store,
            queue,
            locks,
            seen_ids: SeenIds::new(),
            event_handlers: Mutex::new(Vec::new()),
            watch_handle: Mutex::new(None),
            tick_counter: AtomicU64::new(0),
        })
    }

    /// Create the on-disk layout, write a default `config.json` if
    /// absent, and reload any non-expired locks (§4.1, §4.5).
    pub async fn initialize(&self) -> Result<()> {
        self.paths.ensure_layout().await?;
        if !self.paths.config_file().exists() {
            self.config.save_to_file(&self.paths.config_file())?;
        }
        self.locks.load().await?;
        Ok(())
    }

    /// Start the periodic tick loop at `heartbeatInterval` (§4.6).
    pub async fn start_watching(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = coordinator.tick().await {
                    warn!(error = %e, "coordinator tick aborted");
                }
            }
        });
        *self.watch_handle.lock().await = Some(handle);
    }

    pub async fn stop_watching(&self) {
        if let Some(handle) = self.watch_handle.lock().await.take() {
            handle.abort();
        }
    }

    pub async fn on_event<F>(&self, handler: F)
    where
        F: Fn(CoordinatorEvent) + Send + Sync + 'static,
    {
        self.event_handlers.lock().await.push(Box::new(handler));
    }

    async fn emit(&self, event: CoordinatorEvent) {
        for handler in self.event_handlers.lock().await.iter() {
            handler(event.clone());
        }
    }

    /// One pass: drain outboxes, reap dead agents, sweep timed-out
    /// tasks, auto-assign. Each stage degrades gracefully — a failure
    /// is logged and emitted as an event rather than aborting the
    /// remaining stages, to preserve liveness (§7).
    pub async fn tick(&self) -> Result<()> {
        let tick_id = self.tick_counter.fetch_add(1, Ordering::Relaxed);
        let _entered = info_span!("coordinator_tick", tick_id).entered();

        if let Err(e) = self.drain_outboxes().await {
            warn!(error = %e, "drain_outboxes failed");
            self.emit(CoordinatorEvent::Error { message: e.to_string() }).await;
        }
        if let Err(e) = self.sweep_heartbeats().await {
            warn!(error = %e, "heartbeat sweep failed");
            self.emit(CoordinatorEvent::Error { message: e.to_string() }).await;
        }
        if let Err(e) = self.sweep_task_timeouts().await {
            warn!(error = %e, "task timeout sweep failed");
            self.emit(CoordinatorEvent::Error { message: e.to_string() }).await;
        }
        if self.config.auto_assign {
            if let Err(e) = self.auto_assign().await {
                warn!(error = %e, "auto-assign failed");
                self.emit(CoordinatorEvent::Error { message: e.to_string() }).await;
            }
        }
        // Sweeping every delivered file on every tick would be wasteful
        // at a 5s heartbeat cadence; once every 60 ticks is often enough
        // to keep the message directories from growing unbounded (§4.3).
        if tick_id % 60 == 0 {
            let retention = chrono::Duration::milliseconds(self.config.message_retention_ms as i64);
            if let Err(e) = self.queue.clean_old_messages(retention).await {
                warn!(error = %e, "clean_old_messages failed");
            }
        }
        Ok(())
    }

    async fn drain_outboxes(&self) -> Result<()> {
        let agents_dir = self.paths.agents_dir();
        if !agents_dir.exists() {
            return Ok(());
        }
        let mut entries = tokio::fs::read_dir(&agents_dir).await?;
        let mut agent_ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                agent_ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        for agent_id in agent_ids {
            for msg in self.queue.read_outbox(&agent_id, true).await {
                if self.seen_ids.observe(&msg.id) {
                    if let Err(e) = self.dispatch_message(msg).await {
                        warn!(error = %e, agent = %agent_id, "failed to dispatch outbox message");
                    }
                }
            }
        }
        Ok(())
    }

    async fn dispatch_message(&self, msg: Message) -> Result<()> {
        let agent_id = msg.source.clone();
        match msg.payload {
            MessagePayload::AgentRegister { .. } => {
                self.emit(CoordinatorEvent::AgentRegistered { agent_id }).await;
            }
            MessagePayload::AgentHeartbeat { status, current_task, progress, message } => {
                let _ = progress;
                let _ = message;
                self.update_heartbeat(&agent_id, Some(status), current_task).await?;
            }
            MessagePayload::AgentDisconnect { agent_id: disconnecting } => {
                self.unregister_agent(&disconnecting).await?;
            }
            MessagePayload::TaskRequest { agent_id: requester } => {
                if self.config.auto_assign {
                    self.try_assign_to_agent(&requester).await?;
                }
            }
            MessagePayload::TaskUpdate { task_id, status, progress, message } => {
                let _ = progress;
                let _ = message;
                if status == Some(TaskStatus::InProgress) {
                    self.start_task(&task_id, &agent_id).await?;
                }
                self.emit(CoordinatorEvent::TaskProgress { task_id }).await;
            }
            MessagePayload::TaskComplete { task_id, result } => {
                self.complete_task(&task_id, &agent_id, result).await?;
            }
            MessagePayload::TaskFailed { task_id, error } => {
                self.fail_task(&task_id, &agent_id, error).await?;
            }
            MessagePayload::LockRequestMsg(req) => {
                let result = self.locks.acquire_locks(&req).await?;
                let response = Message::new("coordinator", MessagePayload::LockResponse(result.clone()))
                    .with_target(req.agent_id.clone())
                    .with_correlation_id(msg.id.clone());
                self.queue.send_to_agent(&req.agent_id, &response).await?;
                if result.success {
                    self.emit(CoordinatorEvent::LockAcquired { agent_id: req.agent_id }).await;
                } else {
                    self.emit(CoordinatorEvent::LockConflict { agent_id: req.agent_id }).await;
                }
            }
            MessagePayload::LockRelease { paths } => {
                self.locks.release_locks(&agent_id, &paths).await?;
                self.emit(CoordinatorEvent::LockReleased { agent_id }).await;
            }
            MessagePayload::TaskAssign { .. } | MessagePayload::LockResponse(_) => {
                debug!(from = %agent_id, "ignoring coordinator-originated message seen in outbox");
            }
            MessagePayload::Sync { .. } | MessagePayload::Broadcast { .. } => {
                debug!(from = %agent_id, "ignoring sync/broadcast payload in broker dispatch");
            }
        }
        Ok(())
    }

    fn has_conflicting_lock(&self, task: &Task, agent_id: &str, locks: &[FileLock]) -> bool {
        task.target_files.iter().any(|f| {
            let canon = self.paths.canonicalize_lock_path(f);
            locks
                .iter()
                .any(|l| l.path == canon && l.agent_id != agent_id && !l.lock_type.compatible_with(LockType::Write))
        })
    }

    async fn try_assign_to_agent(&self, agent_id: &str) -> Result<()> {
        let Some(state) = self.state_store.read().await else { return Ok(()) };
        if !state.agents.get(agent_id).map(|a| a.is_idle()).unwrap_or(false) {
            return Ok(());
        }
        let locks_snapshot = self.locks.list().await;
        let mut candidates: Vec<&Task> = state
            .task_queue
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| !t.is_blocked())
            .collect();
        candidates.sort_by_key(|t| t.priority);
        let chosen = candidates
            .into_iter()
            .find(|t| !self.has_conflicting_lock(t, agent_id, &locks_snapshot))
            .map(|t| t.id.clone());
        if let Some(task_id) = chosen {
            self.assign_task(&task_id, agent_id).await?;
        }
        Ok(())
    }

    /// For each idle agent, in registration order (`AgentInfo.started_at`
    /// ascending), assign the highest-priority unblocked pending task
    /// whose target files are free of conflicting locks (§4.6).
    async fn auto_assign(&self) -> Result<()> {
        let Some(state) = self.state_store.read().await else { return Ok(()) };
        let mut idle_agents: Vec<&AgentInfo> = state.agents.values().filter(|a| a.is_idle()).collect();
        idle_agents.sort_by_key(|a| a.started_at);
        let idle_agents: Vec<String> = idle_agents.into_iter().map(|a| a.id.clone()).collect();

        for agent_id in idle_agents {
            let Some(state) = self.state_store.read().await else { break };
            let locks_snapshot = self.locks.list().await;
            let mut candidates: Vec<&Task> = state
                .task_queue
                .iter()
                .filter_map(|id| state.tasks.get(id))
                .filter(|t| !t.is_blocked())
                .collect();
            candidates.sort_by_key(|t| t.priority);
            let chosen = candidates
                .into_iter()
                .find(|t| !self.has_conflicting_lock(t, &agent_id, &locks_snapshot))
                .map(|t| t.id.clone());
            if let Some(task_id) = chosen {
                if let Err(e) = self.assign_task(&task_id, &agent_id).await {
                    debug!(error = %e, task_id, agent_id, "assignment attempt declined");
                }
            }
        }
        Ok(())
    }

    async fn sweep_heartbeats(&self) -> Result<()> {
        let Some(state) = self.state_store.read().await else { return Ok(()) };
        let now = Utc::now();
        let heartbeat_timeout = chrono::Duration::milliseconds(self.config.heartbeat_timeout_ms as i64);
        let reap_after = chrono::Duration::milliseconds(self.config.agent_reap_after_ms as i64);

        let mut to_offline = Vec::new();
        let mut to_reap = Vec::new();
        for agent in state.agents.values() {
            let silence = now - agent.last_heartbeat;
            if silence > reap_after {
                to_reap.push(agent.id.clone());
            } else if silence > heartbeat_timeout && agent.status != AgentStatus::Offline {
                to_offline.push(agent.id.clone());
            }
        }

        for agent_id in to_offline {
            let current_task = state.agents.get(&agent_id).and_then(|a| a.current_task.clone());
            if let Some(task_id) = current_task {
                self.unassign_task(&task_id).await?;
            }
            self.locks.release_all_for_agent(&agent_id).await?;
            self.state_store
                .update_state(|s| {
                    if let Some(agent) = s.agents.get_mut(&agent_id) {
                        agent.status = AgentStatus::Offline;
                    }
                    Ok(())
                })
                .await?;
            self.emit(CoordinatorEvent::AgentStatusChanged { agent_id, status: AgentStatus::Offline }).await;
        }

        for agent_id in to_reap {
            let current_task = state.agents.get(&agent_id).and_then(|a| a.current_task.clone());
            if let Some(task_id) = current_task {
                self.unassign_task(&task_id).await?;
            }
            self.locks.release_all_for_agent(&agent_id).await?;
            self.state_store
                .update_state(|s| {
                    s.agents.remove(&agent_id);
                    Ok(())
                })
                .await?;
            self.emit(CoordinatorEvent::AgentDisconnected { agent_id }).await;
        }
        Ok(())
    }

    /// Fail any `{assigned, in_progress}` task whose reference
    /// timestamp is older than `taskTimeout` (§4.6 ambient addition,
    /// resolving §9 open question 3).
    async fn sweep_task_timeouts(&self) -> Result<()> {
        let Some(state) = self.state_store.read().await else { return Ok(()) };
        let timeout = chrono::Duration::milliseconds(self.config.task_timeout_ms as i64);
        let now = Utc::now();
        let mut timed_out = Vec::new();
        for task in state.tasks.values() {
            if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
                continue;
            }
            let reference = task.started_at.or(task.assigned_at);
            if let Some(reference) = reference {
                if now - reference > timeout {
                    if let Some(agent_id) = task.assigned_agent.clone() {
                        timed_out.push((task.id.clone(), agent_id));
                    }
                }
            }
        }
        for (task_id, agent_id) in timed_out {
            self.fail_task(&task_id, &agent_id, "task timed out".to_string()).await?;
        }
        Ok(())
    }

    pub async fn register_agent(
        &self,
        name: String,
        working_directory: String,
        capabilities: BTreeSet<String>,
    ) -> Result<AgentInfo> {
        let id = uuid::Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(self.paths.agent_inbox(&id)).await?;
        tokio::fs::create_dir_all(self.paths.agent_outbox(&id)).await?;
        let agent = AgentInfo::new(id.clone(), name, working_directory, capabilities);
        self.state_store
            .update_state(|s| {
                s.agents.insert(id.clone(), agent.clone());
                Ok(())
            })
            .await?;
        self.emit(CoordinatorEvent::AgentRegistered { agent_id: id.clone() }).await;
        Ok(agent)
    }

    pub async fn unregister_agent(&self, agent_id: &str) -> Result<()> {
        let current_task = self
            .state_store
            .read()
            .await
            .and_then(|s| s.agents.get(agent_id).and_then(|a| a.current_task.clone()));
        if let Some(task_id) = current_task {
            self.unassign_task(&task_id).await?;
        }
        self.locks.release_all_for_agent(agent_id).await?;
        self.state_store
            .update_state(|s| {
                s.agents.remove(agent_id);
                Ok(())
            })
            .await?;
        self.emit(CoordinatorEvent::AgentDisconnected { agent_id: agent_id.to_string() }).await;
        Ok(())
    }

    pub async fn update_heartbeat(
        &self,
        agent_id: &str,
        status: Option<AgentStatus>,
        current_task: Option<String>,
    ) -> Result<()> {
        let agent_id_owned = agent_id.to_string();
        self.state_store
            .update_state(move |s| {
                let agent = s
                    .agents
                    .get_mut(&agent_id_owned)
                    .ok_or_else(|| CoordinatorError::AgentNotFound(agent_id_owned.clone()))?;
                agent.last_heartbeat = Utc::now();
                if let Some(status) = status {
                    agent.status = status;
                }
                if current_task.is_some() {
                    agent.current_task = current_task;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn create_task(&self, new_task: NewTask) -> Result<Task> {
        let id = uuid::Uuid::new_v4().to_string();
        let id_for_closure = id.clone();
        let updated = self
            .state_store
            .update_state(move |s| {
                let completed: BTreeSet<String> = s.completed_history.iter().cloned().collect();
                let mut task = Task::from_new(id_for_closure.clone(), new_task);
                task.blocked_by.retain(|dep| !completed.contains(dep));
                s.tasks.insert(id_for_closure.clone(), task);
                s.task_queue.push(id_for_closure);
                Ok(())
            })
            .await?;
        self.emit(CoordinatorEvent::TaskCreated { task_id: id.clone() }).await;
        Ok(updated.tasks.get(&id).cloned().expect("task exists after creation"))
    }

    /// Attempt to assign `task_id` to `agent_id`, acquiring write
    /// locks over its target files first. Locks partially acquired
    /// during a failed attempt are released so the assignment rolls
    /// back cleanly (§4.6).
    pub async fn assign_task(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let state = self
            .state_store
            .read()
            .await
            .ok_or_else(|| CoordinatorError::TaskNotFound(task_id.to_string()))?;
        let task = state
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::TaskNotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Pending {
            return Err(CoordinatorError::IllegalTransition {
                reason: format!("task {task_id} is not pending"),
            });
        }
        if task.is_blocked() {
            return Err(CoordinatorError::IllegalTransition {
                reason: format!("task {task_id} is blocked by {:?}", task.blocked_by),
            });
        }
        let agent = state
            .agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::AgentNotFound(agent_id.to_string()))?;
        if !agent.is_idle() {
            return Err(CoordinatorError::IllegalTransition {
                reason: format!("agent {agent_id} is not idle"),
            });
        }

        let lock_request = LockRequest {
            paths: task.target_files.clone(),
            lock_type: LockType::Write,
            agent_id: agent_id.to_string(),
            task_id: Some(task_id.to_string()),
            timeout_ms: None,
        };
        let lock_result = self.locks.acquire_locks(&lock_request).await?;
        if !lock_result.success {
            self.locks.release_locks(agent_id, &lock_result.acquired).await?;
            self.emit(CoordinatorEvent::LockConflict { agent_id: agent_id.to_string() }).await;
            return Err(CoordinatorError::IllegalTransition {
                reason: format!("task {task_id} target files are locked by another agent"),
            });
        }

        let task_id_owned = task_id.to_string();
        let agent_id_owned = agent_id.to_string();
        let git_integration = self.config.git_integration;
        let branch_prefix = self.config.branch_prefix.clone();
        let updated = self
            .state_store
            .update_state(move |s| {
                let task = s
                    .tasks
                    .get_mut(&task_id_owned)
                    .ok_or_else(|| CoordinatorError::TaskNotFound(task_id_owned.clone()))?;
                task.status = TaskStatus::Assigned;
                task.assigned_agent = Some(agent_id_owned.clone());
                task.assigned_at = Some(Utc::now());
                task.attempts += 1;
                let branch = if git_integration {
                    let branch = format!("{branch_prefix}{agent_id_owned}/{task_id_owned}");
                    task.branch = Some(branch.clone());
                    Some(branch)
                } else {
                    None
                };
                s.task_queue.retain(|id| id != &task_id_owned);
                if let Some(agent) = s.agents.get_mut(&agent_id_owned) {
                    agent.status = AgentStatus::Working;
                    agent.current_task = Some(task_id_owned.clone());
                    if branch.is_some() {
                        agent.working_branch = branch;
                    }
                }
                Ok(())
            })
            .await?;

        let assigned = updated.tasks.get(task_id).cloned().expect("task exists after assignment");
        self.queue
            .send_to_agent(agent_id, &Message::new("coordinator", MessagePayload::TaskAssign { task: assigned.clone() }))
            .await?;
        self.emit(CoordinatorEvent::TaskAssigned { task_id: task_id.to_string(), agent_id: agent_id.to_string() })
            .await;
        Ok(assigned)
    }

    pub async fn start_task(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let task_id_owned = task_id.to_string();
        let agent_id_owned = agent_id.to_string();
        let updated = self
            .state_store
            .update_state(move |s| {
                let task = s
                    .tasks
                    .get_mut(&task_id_owned)
                    .ok_or_else(|| CoordinatorError::TaskNotFound(task_id_owned.clone()))?;
                if task.assigned_agent.as_deref() != Some(agent_id_owned.as_str()) {
                    return Err(CoordinatorError::IllegalTransition {
                        reason: format!("task {task_id_owned} is not assigned to {agent_id_owned}"),
                    });
                }
                task.status = TaskStatus::InProgress;
                task.started_at = Some(Utc::now());
                Ok(())
            })
            .await?;
        self.emit(CoordinatorEvent::TaskStarted { task_id: task_id.to_string() }).await;
        Ok(updated.tasks.get(task_id).cloned().expect("task exists after start"))
    }

    pub async fn complete_task(&self, task_id: &str, agent_id: &str, result: crate::model::TaskResult) -> Result<Task> {
        let task_id_owned = task_id.to_string();
        let agent_id_owned = agent_id.to_string();
        let updated = self
            .state_store
            .update_state(move |s| {
                let task = s
                    .tasks
                    .get_mut(&task_id_owned)
                    .ok_or_else(|| CoordinatorError::TaskNotFound(task_id_owned.clone()))?;
                if task.assigned_agent.as_deref() != Some(agent_id_owned.as_str()) {
                    return Err(CoordinatorError::IllegalTransition {
                        reason: format!("task {task_id_owned} is not assigned to {agent_id_owned}"),
                    });
                }
                if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
                    return Err(CoordinatorError::IllegalTransition {
                        reason: format!("task {task_id_owned} cannot complete from {:?}", task.status),
                    });
                }
                task.status = TaskStatus::Completed;
                task.completed_at = Some(Utc::now());
                task.result = Some(result);
                task.branch = None;
                let completed_id = task.id.clone();
                if let Some(agent) = s.agents.get_mut(&agent_id_owned) {
                    agent.current_task = None;
                    agent.working_branch = None;
                    agent.status = AgentStatus::Idle;
                    agent.completed_tasks += 1;
                }
                s.completed_history.push(completed_id.clone());
                for other in s.tasks.values_mut() {
                    other.blocked_by.retain(|id| id != &completed_id);
                }
                Ok(())
            })
            .await?;
        self.locks.release_task_locks(task_id).await?;
        self.emit(CoordinatorEvent::TaskCompleted { task_id: task_id.to_string() }).await;
        Ok(updated.tasks.get(task_id).cloned().expect("task exists after completion"))
    }

    pub async fn fail_task(&self, task_id: &str, agent_id: &str, error: String) -> Result<Task> {
        let task_id_owned = task_id.to_string();
        let agent_id_owned = agent_id.to_string();
        let error_owned = error.clone();
        let updated = self
            .state_store
            .update_state(move |s| {
                let task = s
                    .tasks
                    .get_mut(&task_id_owned)
                    .ok_or_else(|| CoordinatorError::TaskNotFound(task_id_owned.clone()))?;
                if task.assigned_agent.as_deref() != Some(agent_id_owned.as_str()) {
                    return Err(CoordinatorError::IllegalTransition {
                        reason: format!("task {task_id_owned} is not assigned to {agent_id_owned}"),
                    });
                }
                if task.status == TaskStatus::Failed {
                    return Err(CoordinatorError::TaskRetryExhausted {
                        task_id: task_id_owned.clone(),
                        max_attempts: task.max_attempts,
                        last_error: task.error.clone().unwrap_or_default(),
                    });
                }
                if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
                    return Err(CoordinatorError::IllegalTransition {
                        reason: format!("task {task_id_owned} cannot fail from {:?}", task.status),
                    });
                }
                task.error = Some(error_owned);
                task.branch = None;
                if let Some(agent) = s.agents.get_mut(&agent_id_owned) {
                    agent.current_task = None;
                    agent.working_branch = None;
                    agent.status = AgentStatus::Idle;
                    agent.failed_tasks += 1;
                }
                if task.attempts < task.max_attempts {
                    task.status = TaskStatus::Pending;
                    task.assigned_agent = None;
                    task.assigned_at = None;
                    task.started_at = None;
                    if !s.task_queue.contains(&task.id) {
                        s.task_queue.insert(0, task.id.clone());
                    }
                } else {
                    task.status = TaskStatus::Failed;
                    task.completed_at = Some(Utc::now());
                    s.task_queue.retain(|id| id != &task.id);
                }
                Ok(())
            })
            .await?;
        self.locks.release_task_locks(task_id).await?;
        let task = updated.tasks.get(task_id).cloned().expect("task exists after failure handling");
        if task.status == TaskStatus::Failed {
            self.emit(CoordinatorEvent::TaskRetryExhausted { task_id: task_id.to_string() }).await;
        } else {
            self.emit(CoordinatorEvent::TaskFailed { task_id: task_id.to_string(), error }).await;
        }
        Ok(task)
    }

    /// System-initiated return of a task to the queue — agent died or
    /// voluntarily relinquished it (§4.6).
    pub async fn unassign_task(&self, task_id: &str) -> Result<Task> {
        let task_id_owned = task_id.to_string();
        let updated = self
            .state_store
            .update_state(move |s| {
                let task = s
                    .tasks
                    .get_mut(&task_id_owned)
                    .ok_or_else(|| CoordinatorError::TaskNotFound(task_id_owned.clone()))?;
                if let Some(agent_id) = task.assigned_agent.take() {
                    if let Some(agent) = s.agents.get_mut(&agent_id) {
                        agent.current_task = None;
                        agent.working_branch = None;
                        if agent.status != AgentStatus::Offline {
                            agent.status = AgentStatus::Idle;
                        }
                    }
                }
                task.status = TaskStatus::Pending;
                task.assigned_at = None;
                task.started_at = None;
                task.branch = None;
                if !s.task_queue.contains(&task.id) {
                    s.task_queue.insert(0, task.id.clone());
                }
                Ok(())
            })
            .await?;
        self.locks.release_task_locks(task_id).await?;
        self.emit(CoordinatorEvent::TaskUnassigned { task_id: task_id.to_string() }).await;
        Ok(updated.tasks.get(task_id).cloned().expect("task exists after unassign"))
    }

    pub async fn get_pending_tasks(&self) -> Vec<Task> {
        self.state_store
            .read()
            .await
            .map(|s| s.task_queue.iter().filter_map(|id| s.tasks.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub async fn get_tasks(&self) -> Vec<Task> {
        self.state_store.read().await.map(|s| s.tasks.values().cloned().collect()).unwrap_or_default()
    }

    pub async fn get_locks(&self) -> Vec<FileLock> {
        self.locks.list().await
    }

    pub async fn get_state(&self) -> Option<ServerState> {
        self.state_store.read().await
    }

    pub fn paths(&self) -> &CoordinatorPaths {
        &self.paths
    }
}
