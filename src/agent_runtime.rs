//! Agent Runtime (C7, §4.7).
//!
//! The worker-side half of the protocol: registration, heartbeating,
//! inbox polling, task acceptance, and lock requests. The runtime's
//! own idle/working transition is modeled with `statig` as ephemeral,
//! process-local state — it is never itself serialized, only the
//! resulting `AgentInfo.status` snapshot written through `updateState`
//! is (§4.7 ambient addition).

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::message::{LockRequest, LockResult, Message, MessagePayload};
use crate::model::{AgentInfo, AgentStatus, LockType, Task, TaskResult, TaskStatus};
use crate::paths::CoordinatorPaths;
use crate::queue::{FileMessageQueue, SeenIds};
use crate::state::StateStore;
use statig::prelude::*;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEvent {
    TaskAssigned,
    TaskFinished,
}

/// Ephemeral idle/working substate, mirroring the coordinator-side
/// `AgentStatus` but owned entirely by this process.
#[derive(Default)]
pub struct AgentSubstate;

#[state_machine(initial = "State::idle()")]
impl AgentSubstate {
    #[state]
    fn idle(event: &RuntimeEvent) -> Response<State> {
        match event {
            RuntimeEvent::TaskAssigned => Transition(State::working()),
            RuntimeEvent::TaskFinished => Handled,
        }
    }

    #[state]
    fn working(event: &RuntimeEvent) -> Response<State> {
        match event {
            RuntimeEvent::TaskFinished => Transition(State::idle()),
            RuntimeEvent::TaskAssigned => Handled,
        }
    }
}

type TaskCallback = Box<dyn Fn(Task) -> std::result::Result<TaskResult, String> + Send + Sync>;
type MessageHandler = Box<dyn Fn(Message) + Send + Sync>;

pub struct AgentHandle {
    id: String,
    name: String,
    paths: Arc<CoordinatorPaths>,
    config: CoordinatorConfig,
    queue: FileMessageQueue,
    state_store: StateStore,
    seen_ids: SeenIds,
    substate: Mutex<StateMachine<AgentSubstate>>,
    status: Mutex<AgentStatus>,
    current_task: Mutex<Option<Task>>,
    callback: Mutex<Option<TaskCallback>>,
    message_handler: Mutex<Option<MessageHandler>>,
    auto_accept: bool,
    inbox_mutex: Mutex<()>,
    heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl AgentHandle {
    pub fn new(project_root: impl Into<PathBuf>, agent_name: String) -> Result<Self> {
        let paths = Arc::new(CoordinatorPaths::new(project_root));
        let config = CoordinatorConfig::load(&paths.config_file()).unwrap_or_default();
        let state_store = StateStore::new(paths.clone(), &config);
        let queue = FileMessageQueue::new(paths.clone());
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: agent_name,
            paths,
            config,
            queue,
            state_store,
            seen_ids: SeenIds::new(),
            substate: Mutex::new(AgentSubstate::default().state_machine()),
            status: Mutex::new(AgentStatus::Idle),
            current_task: Mutex::new(None),
            callback: Mutex::new(None),
            message_handler: Mutex::new(None),
            auto_accept: true,
            inbox_mutex: Mutex::new(()),
            heartbeat_handle: Mutex::new(None),
            poll_handle: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Ensure inbox/outbox directories, write this agent's `AgentInfo`
    /// into state via the RMW update, and announce over the outbox
    /// (§4.7).
    pub async fn register(&self, capabilities: Option<BTreeSet<String>>) -> Result<AgentInfo> {
        tokio::fs::create_dir_all(self.paths.agent_inbox(&self.id)).await?;
        tokio::fs::create_dir_all(self.paths.agent_outbox(&self.id)).await?;
        let mut agent = AgentInfo::new(
            self.id.clone(),
            self.name.clone(),
            self.paths.project_root.to_string_lossy().to_string(),
            capabilities.unwrap_or_default(),
        );
        if let Ok(host) = hostname::get() {
            agent.metadata.insert("hostname".to_string(), host.to_string_lossy().to_string());
        }
        let agent_for_state = agent.clone();
        self.state_store
            .update_state(move |s| {
                s.agents.insert(agent_for_state.id.clone(), agent_for_state);
                Ok(())
            })
            .await?;
        self.queue
            .post_to_outbox(&self.id, &Message::new(self.id.clone(), MessagePayload::AgentRegister { agent: agent.clone() }))
            .await?;
        Ok(agent)
    }

    /// Begin the heartbeat ticker and the inbox poller. `callback`, if
    /// given, is invoked automatically when a `TASK_ASSIGN` arrives
    /// and no task is already in progress (§4.7).
    pub async fn start(self: &Arc<Self>, callback: Option<TaskCallback>) {
        *self.callback.lock().await = callback;

        let heartbeat_self = Arc::clone(self);
        let heartbeat_interval = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = heartbeat_self.send_heartbeat().await {
                    warn!(error = %e, "failed to send heartbeat");
                }
            }
        });
        *self.heartbeat_handle.lock().await = Some(heartbeat_handle);

        let poll_self = Arc::clone(self);
        let poll_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if let Err(e) = poll_self.drain_inbox().await {
                    warn!(error = %e, "failed to drain inbox");
                }
            }
        });
        *self.poll_handle.lock().await = Some(poll_handle);
    }

    pub async fn stop(&self) -> Result<()> {
        self.queue
            .post_to_outbox(&self.id, &Message::new(self.id.clone(), MessagePayload::AgentDisconnect { agent_id: self.id.clone() }))
            .await?;
        if let Some(handle) = self.heartbeat_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.poll_handle.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }

    async fn transition(&self, event: RuntimeEvent) {
        self.substate.lock().await.handle(&event);
    }

    async fn send_heartbeat(&self) -> Result<()> {
        let status = *self.status.lock().await;
        let current_task_id = self.current_task.lock().await.as_ref().map(|t| t.id.clone());
        let id = self.id.clone();
        let status_for_state = status;
        let current_task_for_state = current_task_id.clone();
        self.state_store
            .update_state(move |s| {
                if let Some(agent) = s.agents.get_mut(&id) {
                    agent.last_heartbeat = chrono::Utc::now();
                    agent.status = status_for_state;
                    agent.current_task = current_task_for_state;
                }
                Ok(())
            })
            .await?;
        let msg = Message::new(
            self.id.clone(),
            MessagePayload::AgentHeartbeat { status, current_task: current_task_id, progress: None, message: None },
        );
        self.queue.post_to_outbox(&self.id, &msg).await?;
        Ok(())
    }

    async fn poll_inbox_once(&self) -> Vec<Message> {
        let _guard = self.inbox_mutex.lock().await;
        self.queue.read_inbox(&self.id, true).await
    }

    async fn drain_inbox(&self) -> Result<()> {
        for msg in self.poll_inbox_once().await {
            if self.seen_ids.observe(&msg.id) {
                self.dispatch_inbox_message(msg).await;
            }
        }
        Ok(())
    }

    async fn dispatch_inbox_message(&self, msg: Message) {
        if let MessagePayload::TaskAssign { task } = &msg.payload {
            self.handle_task_assign(task.clone()).await;
        }
        if let Some(handler) = self.message_handler.lock().await.as_ref() {
            handler(msg.clone());
        }
    }

    async fn handle_task_assign(&self, task: Task) {
        if !self.auto_accept {
            return;
        }
        {
            let current = self.current_task.lock().await;
            if current.is_some() {
                return;
            }
        }
        *self.current_task.lock().await = Some(task.clone());
        self.transition(RuntimeEvent::TaskAssigned).await;
        *self.status.lock().await = AgentStatus::Working;
        let _ = self
            .queue
            .post_to_outbox(
                &self.id,
                &Message::new(
                    self.id.clone(),
                    MessagePayload::TaskUpdate { task_id: task.id.clone(), status: Some(TaskStatus::InProgress), progress: None, message: None },
                ),
            )
            .await;

        let outcome = {
            let callback_guard = self.callback.lock().await;
            match callback_guard.as_ref() {
                Some(callback) => Some(callback(task.clone())),
                None => None,
            }
        };

        match outcome {
            Some(Ok(result)) => {
                let _ = self.complete_task_internal(&task.id, result).await;
            }
            Some(Err(error)) => {
                let _ = self.fail_task_internal(&task.id, error).await;
            }
            None => {}
        }
    }

    /// Manual-accept path for callers not using the `start(callback)`
    /// auto-accept flow (§6.3 `acceptTask`).
    pub async fn accept_task(&self, task: Task) -> Result<()> {
        {
            let current = self.current_task.lock().await;
            if current.is_some() {
                return Err(CoordinatorError::IllegalTransition { reason: "agent already has a current task".into() });
            }
        }
        *self.current_task.lock().await = Some(task.clone());
        self.transition(RuntimeEvent::TaskAssigned).await;
        *self.status.lock().await = AgentStatus::Working;
        self.queue
            .post_to_outbox(
                &self.id,
                &Message::new(
                    self.id.clone(),
                    MessagePayload::TaskUpdate { task_id: task.id.clone(), status: Some(TaskStatus::InProgress), progress: None, message: None },
                ),
            )
            .await?;
        Ok(())
    }

    pub async fn request_task(&self) -> Result<()> {
        self.queue
            .post_to_outbox(&self.id, &Message::new(self.id.clone(), MessagePayload::TaskRequest { agent_id: self.id.clone() }))
            .await?;
        Ok(())
    }

    pub async fn complete_task(&self, result: TaskResult) -> Result<()> {
        let task_id = self
            .current_task
            .lock()
            .await
            .as_ref()
            .map(|t| t.id.clone())
            .ok_or_else(|| CoordinatorError::IllegalTransition { reason: "no current task".into() })?;
        self.complete_task_internal(&task_id, result).await
    }

    async fn complete_task_internal(&self, task_id: &str, result: TaskResult) -> Result<()> {
        self.queue
            .post_to_outbox(&self.id, &Message::new(self.id.clone(), MessagePayload::TaskComplete { task_id: task_id.to_string(), result }))
            .await?;
        *self.current_task.lock().await = None;
        self.transition(RuntimeEvent::TaskFinished).await;
        *self.status.lock().await = AgentStatus::Idle;
        Ok(())
    }

    pub async fn fail_task(&self, error: String) -> Result<()> {
        let task_id = self
            .current_task
            .lock()
            .await
            .as_ref()
            .map(|t| t.id.clone())
            .ok_or_else(|| CoordinatorError::IllegalTransition { reason: "no current task".into() })?;
        self.fail_task_internal(&task_id, error).await
    }

    async fn fail_task_internal(&self, task_id: &str, error: String) -> Result<()> {
        self.queue
            .post_to_outbox(&self.id, &Message::new(self.id.clone(), MessagePayload::TaskFailed { task_id: task_id.to_string(), error }))
            .await?;
        *self.current_task.lock().await = None;
        self.transition(RuntimeEvent::TaskFinished).await;
        *self.status.lock().await = AgentStatus::Idle;
        Ok(())
    }

    pub async fn report_progress(&self, progress: f32, message: Option<String>) -> Result<()> {
        let task_id = self
            .current_task
            .lock()
            .await
            .as_ref()
            .map(|t| t.id.clone())
            .ok_or_else(|| CoordinatorError::IllegalTransition { reason: "no current task".into() })?;
        self.queue
            .post_to_outbox(
                &self.id,
                &Message::new(self.id.clone(), MessagePayload::TaskUpdate { task_id, status: None, progress: Some(progress), message }),
            )
            .await?;
        Ok(())
    }

    /// Post a `LOCK_REQUEST` and poll the inbox for up to 5s for the
    /// matching `LOCK_RESPONSE` by correlation id; other messages seen
    /// in the meantime are dispatched normally, never dropped (§4.7).
    pub async fn request_locks(&self, paths: Vec<String>, lock_type: Option<LockType>) -> Result<LockResult> {
        let task_id = self.current_task.lock().await.as_ref().map(|t| t.id.clone());
        let request = LockRequest {
            paths,
            lock_type: lock_type.unwrap_or(LockType::Write),
            agent_id: self.id.clone(),
            task_id,
            timeout_ms: None,
        };
        let msg = Message::new(self.id.clone(), MessagePayload::LockRequestMsg(request));
        let request_id = msg.id.clone();
        self.queue.post_to_outbox(&self.id, &msg).await?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            for received in self.poll_inbox_once().await {
                if !self.seen_ids.observe(&received.id) {
                    continue;
                }
                if received.correlation_id.as_deref() == Some(request_id.as_str()) {
                    if let MessagePayload::LockResponse(result) = received.payload {
                        return Ok(result);
                    }
                }
                self.dispatch_inbox_message(received).await;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoordinatorError::ContendedState { waited_ms: 5_000 });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn release_locks(&self, paths: Vec<String>) -> Result<()> {
        self.queue
            .post_to_outbox(&self.id, &Message::new(self.id.clone(), MessagePayload::LockRelease { paths }))
            .await?;
        Ok(())
    }

    pub async fn on_message<F>(&self, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        *self.message_handler.lock().await = Some(Box::new(handler));
    }

    pub async fn get_state(&self) -> Option<AgentInfo> {
        self.state_store.read().await.and_then(|s| s.agents.get(&self.id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewTask;
    use std::sync::Arc;

    fn handle(project_root: &std::path::Path) -> Arc<AgentHandle> {
        Arc::new(AgentHandle::new(project_root, "worker-1".to_string()).unwrap())
    }

    #[tokio::test]
    async fn register_writes_agent_info_and_announces() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join(".agent-coordinator")).await.unwrap();
        let agent = handle(dir.path());
        let info = agent.register(None).await.unwrap();
        assert_eq!(info.id, agent.id());

        let state = agent.state_store.read().await.unwrap();
        assert!(state.agents.contains_key(agent.id()));

        let outbox = agent.queue.read_outbox(agent.id(), false).await;
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].payload.type_name(), "AGENT_REGISTER");
    }

    #[tokio::test]
    async fn accept_then_complete_posts_messages_and_resets_substate() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join(".agent-coordinator")).await.unwrap();
        let agent = handle(dir.path());
        agent.register(None).await.unwrap();

        let task = Task::from_new("t1".into(), NewTask { title: "x".into(), ..Default::default() });
        agent.accept_task(task.clone()).await.unwrap();
        assert!(agent.accept_task(task.clone()).await.is_err());

        agent.complete_task(TaskResult { success: true, summary: "done".into(), ..Default::default() }).await.unwrap();
        assert!(agent.current_task.lock().await.is_none());

        let outbox = agent.queue.read_outbox(agent.id(), false).await;
        let kinds: Vec<&str> = outbox.iter().map(|m| m.payload.type_name()).collect();
        assert!(kinds.contains(&"TASK_UPDATE"));
        assert!(kinds.contains(&"TASK_COMPLETE"));
    }
}
