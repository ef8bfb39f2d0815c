//! Relay events published to the host (log, UI, WebSocket clients).

use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelayEventKind {
    Skipped,
    Delivered,
    Failed,
    Retrying,
}

/// Why a message produced no delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// Forwarding is switched off.
    Disabled,
    /// No target configured.
    NoTarget,
    /// Same message id already accepted inside the dedup window.
    Duplicate,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::Disabled => "disabled",
            SkipReason::NoTarget => "no target",
            SkipReason::Duplicate => "duplicate",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEvent {
    pub kind: RelayEventKind,
    /// None for skipped messages that never became a task.
    pub task_id: Option<TaskId>,
    pub sender: String,
    pub target: Option<String>,
    /// Retries performed so far.
    pub attempt: u32,
    /// Retry delay, only for `Retrying`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

impl RelayEvent {
    pub fn new(kind: RelayEventKind, sender: impl Into<String>) -> Self {
        Self {
            kind,
            task_id: None,
            sender: sender.into(),
            target: None,
            attempt: 0,
            delay_ms: None,
            reason: None,
            at: Utc::now(),
        }
    }

    pub fn task(mut self, id: impl Into<TaskId>, target: impl Into<String>, attempt: u32) -> Self {
        self.task_id = Some(id.into());
        self.target = Some(target.into());
        self.attempt = attempt;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.delay_ms = Some(ms);
        self
    }

    /// Log the event through the `log` facade at a level matching its kind.
    pub fn log(&self) {
        let id = self.task_id.as_deref().unwrap_or("-");
        let reason = self.reason.as_deref().unwrap_or("");
        match self.kind {
            RelayEventKind::Delivered => log::info!(
                "relay: delivered task {} from {} to {} after {} retries",
                id,
                self.sender,
                self.target.as_deref().unwrap_or(""),
                self.attempt
            ),
            RelayEventKind::Failed => log::warn!(
                "relay: task {} from {} failed after {} retries: {}",
                id,
                self.sender,
                self.attempt,
                reason
            ),
            RelayEventKind::Retrying => log::debug!(
                "relay: retry {} for task {} in {}ms: {}",
                self.attempt,
                id,
                self.delay_ms.unwrap_or(0),
                reason
            ),
            RelayEventKind::Skipped => {
                log::debug!("relay: skipped message from {}: {}", self.sender, reason)
            }
        }
    }
}
