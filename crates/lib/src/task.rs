//! Relay task: one forwarding attempt of one message under one rule snapshot.

use crate::decoder::InboundMessage;
use crate::rules::ForwardingRule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Unique task identifier (opaque string).
pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Pending,
    InFlight,
    Delivered,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Delivered | TaskState::Failed)
    }
}

/// A message on its way to the rule's target. The rule is captured at creation and never refreshed.
#[derive(Debug, Clone)]
pub struct RelayTask {
    pub id: TaskId,
    pub message: InboundMessage,
    pub rule: Arc<ForwardingRule>,
    /// Retries performed so far (0 on the first attempt).
    pub attempt_count: u32,
    pub state: TaskState,
}

impl RelayTask {
    pub fn new(message: InboundMessage, rule: Arc<ForwardingRule>) -> Self {
        Self {
            id: format!("task-{}", uuid::Uuid::new_v4()),
            message,
            rule,
            attempt_count: 0,
            state: TaskState::Pending,
        }
    }

    pub fn sender(&self) -> &str {
        &self.message.sender
    }

    pub fn target(&self) -> &str {
        &self.rule.target
    }

    pub fn rule_version(&self) -> u64 {
        self.rule.version
    }
}

/// Read-only view of a task for inspection by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub sender: String,
    pub raw_id: String,
    pub target: String,
    pub rule_version: u64,
    pub attempt_count: u32,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}
