//! Message Envelope (C2, §4.2, §6.2).
//!
//! Envelope ids are built from the current wall-clock millisecond plus
//! a random suffix — unique enough for filesystem naming, never a
//! substitute for a real ordering guarantee (§4.2, §5).

use crate::model::{AgentInfo, LockType, Task, TaskResult};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub paths: Vec<String>,
    pub lock_type: LockType,
    pub agent_id: String,
    pub task_id: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConflict {
    pub path: String,
    pub held_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockResult {
    pub success: bool,
    pub acquired: Vec<String>,
    pub failed: Vec<String>,
    pub conflicts: Vec<LockConflict>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum MessagePayload {
    AgentRegister { agent: AgentInfo },
    AgentHeartbeat {
        status: crate::model::AgentStatus,
        current_task: Option<String>,
        progress: Option<f32>,
        message: Option<String>,
    },
    AgentDisconnect { agent_id: String },
    TaskRequest { agent_id: String },
    TaskAssign { task: Task },
    TaskUpdate {
        task_id: String,
        status: Option<crate::model::TaskStatus>,
        progress: Option<f32>,
        message: Option<String>,
    },
    TaskComplete { task_id: String, result: TaskResult },
    TaskFailed { task_id: String, error: String },
    LockRequestMsg(LockRequest),
    LockResponse(LockResult),
    LockRelease { paths: Vec<String> },
    Sync { data: serde_json::Value },
    Broadcast { data: serde_json::Value },
}

impl MessagePayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            MessagePayload::AgentRegister { .. } => "AGENT_REGISTER",
            MessagePayload::AgentHeartbeat { .. } => "AGENT_HEARTBEAT",
            MessagePayload::AgentDisconnect { .. } => "AGENT_DISCONNECT",
            MessagePayload::TaskRequest { .. } => "TASK_REQUEST",
            MessagePayload::TaskAssign { .. } => "TASK_ASSIGN",
            MessagePayload::TaskUpdate { .. } => "TASK_UPDATE",
            MessagePayload::TaskComplete { .. } => "TASK_COMPLETE",
            MessagePayload::TaskFailed { .. } => "TASK_FAILED",
            MessagePayload::LockRequestMsg(_) => "LOCK_REQUEST",
            MessagePayload::LockResponse(_) => "LOCK_RESPONSE",
            MessagePayload::LockRelease { .. } => "LOCK_RELEASE",
            MessagePayload::Sync { .. } => "SYNC_STATE",
            MessagePayload::Broadcast { .. } => "BROADCAST",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub target: Option<String>,
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub payload: MessagePayload,
}

impl Message {
    pub fn new(source: impl Into<String>, payload: MessagePayload) -> Self {
        Self {
            id: generate_envelope_id(),
            timestamp: Utc::now(),
            source: source.into(),
            target: None,
            correlation_id: None,
            payload,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// File name for this envelope: `<timestamp_millis>-<id>.json`, so
    /// a lexicographic directory listing yields chronological order
    /// within one producer (§4.3).
    pub fn file_name(&self) -> String {
        format!("{}-{}.json", self.timestamp.timestamp_millis(), self.id)
    }
}

/// `{millis_since_epoch}-{8 random hex chars}` per SPEC_FULL §4.2.
pub fn generate_envelope_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix: u32 = rand::rng().random();
    format!("{millis:x}-{suffix:08x}")
}
