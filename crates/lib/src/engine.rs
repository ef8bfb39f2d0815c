//! Relay engine: decides whether and where each inbound message goes, and drives
//! delivery through the queue with retries.
//!
//! Task lifecycle: `Pending -> InFlight -> Delivered | Pending (retry) | Failed`.
//! Workers never sleep on a retry; the task is handed to a timer that puts it back at
//! the head of its sender's lane once the backoff delay has passed.

use crate::config::RelayConfig;
use crate::decoder::{self, DecodeError, InboundMessage, TransportMeta};
use crate::dispatcher::{DispatchError, Dispatcher, ErrorClassifier, FailureClass};
use crate::events::{RelayEvent, RelayEventKind, SkipReason};
use crate::queue::{DeliveryQueue, QueueError};
use crate::rules::{ConfigError, ForwardingRule, RuleStore};
use crate::task::{RelayTask, TaskId, TaskSnapshot, TaskState};
use crate::transport::Transport;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("queue full for sender {sender}; task {task_id} failed")]
    QueueFull { sender: String, task_id: TaskId },
    #[error("relay is shutting down")]
    ShuttingDown,
}

/// Outcome of handing a message to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Queued(TaskId),
    Skipped(SkipReason),
    /// Same raw id already accepted as `original` inside the dedup window.
    Duplicate { original: TaskId },
}

/// Retry schedule, bounds and timeouts used by the engine.
#[derive(Debug, Clone)]
pub struct RelayPolicy {
    pub workers: usize,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub per_sender_capacity: usize,
    pub dedup_window: Duration,
    pub failed_retention: Duration,
    pub send_timeout: Duration,
    pub shutdown_grace: Duration,
    pub error_classes: HashMap<String, FailureClass>,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for RelayPolicy {
    fn from(c: &RelayConfig) -> Self {
        Self {
            workers: c.workers.max(1),
            max_attempts: c.max_attempts,
            base_delay: c.base_delay(),
            max_delay: c.max_delay(),
            per_sender_capacity: c.per_sender_capacity,
            dedup_window: c.dedup_window(),
            failed_retention: c.failed_retention(),
            send_timeout: c.send_timeout(),
            shutdown_grace: c.shutdown_grace(),
            error_classes: c.error_classes.clone(),
        }
    }
}

impl RelayPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Task counts by state plus current queue depth.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub pending: usize,
    pub in_flight: usize,
    pub delivered: usize,
    pub failed: usize,
    pub queued: usize,
}

struct TaskRecord {
    seq: u64,
    snapshot: TaskSnapshot,
    finished_at: Option<Instant>,
}

/// Task bookkeeping and the dedup index. Guarded by one lock so that the duplicate
/// check and the task insert happen atomically.
#[derive(Default)]
struct Ledger {
    next_seq: u64,
    tasks: HashMap<TaskId, TaskRecord>,
    /// raw_id -> (task that claimed it, first seen)
    seen: HashMap<String, (TaskId, Instant)>,
    last_sweep: Option<Instant>,
}

impl Ledger {
    fn insert(&mut self, task: &RelayTask, now: Instant) {
        self.next_seq += 1;
        let snapshot = TaskSnapshot {
            id: task.id.clone(),
            sender: task.message.sender.clone(),
            raw_id: task.message.raw_id.clone(),
            target: task.rule.target.clone(),
            rule_version: task.rule_version(),
            attempt_count: task.attempt_count,
            state: task.state,
            last_error: None,
            updated_at: Utc::now(),
        };
        self.tasks.insert(
            task.id.clone(),
            TaskRecord {
                seq: self.next_seq,
                snapshot,
                finished_at: None,
            },
        );
        self.seen
            .insert(task.message.raw_id.clone(), (task.id.clone(), now));
    }

    /// Returns false when the record is missing or already terminal.
    fn set_state(
        &mut self,
        id: &str,
        state: TaskState,
        attempt_count: u32,
        last_error: Option<String>,
    ) -> bool {
        let Some(rec) = self.tasks.get_mut(id) else {
            return false;
        };
        if rec.snapshot.state.is_terminal() {
            return false;
        }
        rec.snapshot.state = state;
        rec.snapshot.attempt_count = attempt_count;
        if last_error.is_some() {
            rec.snapshot.last_error = last_error;
        }
        rec.snapshot.updated_at = Utc::now();
        if state.is_terminal() {
            rec.finished_at = Some(Instant::now());
        }
        true
    }

    fn duplicate_of(&self, raw_id: &str, now: Instant, window: Duration) -> Option<TaskId> {
        let (task_id, seen_at) = self.seen.get(raw_id)?;
        if now.saturating_duration_since(*seen_at) >= window {
            return None;
        }
        // a failed delivery may be attempted again
        match self.tasks.get(task_id) {
            Some(rec) if rec.snapshot.state != TaskState::Failed => Some(task_id.clone()),
            _ => None,
        }
    }

    fn sweep(&mut self, now: Instant, policy: &RelayPolicy) {
        if let Some(last) = self.last_sweep {
            if now.saturating_duration_since(last) < SWEEP_INTERVAL {
                return;
            }
        }
        self.last_sweep = Some(now);
        self.seen
            .retain(|_, (_, seen_at)| now.saturating_duration_since(*seen_at) < policy.dedup_window);
        self.tasks.retain(|_, rec| {
            let Some(done) = rec.finished_at else {
                return true;
            };
            let keep_for = match rec.snapshot.state {
                TaskState::Failed => policy.failed_retention,
                _ => policy.dedup_window,
            };
            now.saturating_duration_since(done) < keep_for
        });
    }

    /// Ids of every task not yet delivered or failed.
    fn unfinished(&self) -> Vec<(TaskId, TaskSnapshot)> {
        self.tasks
            .iter()
            .filter(|(_, r)| !r.snapshot.state.is_terminal())
            .map(|(id, r)| (id.clone(), r.snapshot.clone()))
            .collect()
    }
}

struct Inner {
    rules: Arc<RuleStore>,
    queue: DeliveryQueue,
    dispatcher: Dispatcher,
    policy: RelayPolicy,
    ledger: Mutex<Ledger>,
    events: broadcast::Sender<RelayEvent>,
    shutdown: watch::Sender<bool>,
}

impl Inner {
    fn emit(&self, event: RelayEvent) {
        event.log();
        let _ = self.events.send(event);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Mark a task failed and release its sender lane.
    async fn fail(&self, task: &RelayTask, reason: String) {
        let updated = self.ledger.lock().await.set_state(
            &task.id,
            TaskState::Failed,
            task.attempt_count,
            Some(reason.clone()),
        );
        if updated {
            self.emit(
                RelayEvent::new(RelayEventKind::Failed, task.sender())
                    .task(task.id.clone(), task.target(), task.attempt_count)
                    .reason(reason),
            );
        }
        self.queue.complete(task.sender()).await;
    }

    async fn process(self: &Arc<Self>, mut task: RelayTask) {
        task.state = TaskState::InFlight;
        let started = self.ledger.lock().await.set_state(
            &task.id,
            TaskState::InFlight,
            task.attempt_count,
            None,
        );
        if !started {
            // already failed (e.g. shutdown sweep) while waiting
            self.queue.complete(task.sender()).await;
            return;
        }
        let body = task.rule.render(&task.message);
        let result = self
            .dispatcher
            .send(task.target(), &body, self.policy.send_timeout)
            .await;
        match result {
            Ok(()) => {
                task.state = TaskState::Delivered;
                let updated = self.ledger.lock().await.set_state(
                    &task.id,
                    TaskState::Delivered,
                    task.attempt_count,
                    None,
                );
                if updated {
                    self.emit(
                        RelayEvent::new(RelayEventKind::Delivered, task.sender()).task(
                            task.id.clone(),
                            task.target(),
                            task.attempt_count,
                        ),
                    );
                }
                self.queue.complete(task.sender()).await;
            }
            Err(DispatchError::Permanent(reason)) => {
                task.state = TaskState::Failed;
                self.fail(&task, reason).await;
            }
            Err(DispatchError::Transient(reason)) => {
                task.attempt_count += 1;
                if task.attempt_count > self.policy.max_attempts {
                    task.attempt_count = self.policy.max_attempts;
                    task.state = TaskState::Failed;
                    self.fail(&task, format!("retries exhausted: {}", reason))
                        .await;
                    return;
                }
                let delay = self.policy.backoff_delay(task.attempt_count);
                task.state = TaskState::Pending;
                self.ledger.lock().await.set_state(
                    &task.id,
                    TaskState::Pending,
                    task.attempt_count,
                    Some(reason.clone()),
                );
                self.emit(
                    RelayEvent::new(RelayEventKind::Retrying, task.sender())
                        .task(task.id.clone(), task.target(), task.attempt_count)
                        .delay_ms(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
                        .reason(reason),
                );
                self.schedule_retry(task, delay);
            }
        }
    }

    /// Put the task back at the head of its lane after `delay`. The lane stays held meanwhile.
    fn schedule_retry(self: &Arc<Self>, task: RelayTask, delay: Duration) {
        let inner = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let id = task.id.clone();
                    let sender = task.sender().to_string();
                    let target = task.target().to_string();
                    let attempt = task.attempt_count;
                    if inner.queue.requeue_front(task).await.is_err() {
                        let updated = inner.ledger.lock().await.set_state(
                            &id,
                            TaskState::Failed,
                            attempt,
                            Some("shutdown".to_string()),
                        );
                        if updated {
                            inner.emit(
                                RelayEvent::new(RelayEventKind::Failed, sender)
                                    .task(id, target, attempt)
                                    .reason("shutdown"),
                            );
                        }
                    }
                }
                _ = async {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                } => {
                    // the shutdown sweep fails every unfinished task
                }
            }
        });
    }
}

/// The relay core. Cheap to share behind an `Arc`; all methods take `&self`.
pub struct RelayEngine {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayEngine {
    pub fn new(rules: Arc<RuleStore>, transport: Arc<dyn Transport>, policy: RelayPolicy) -> Self {
        let classifier = ErrorClassifier::with_overrides(&policy.error_classes);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                rules,
                queue: DeliveryQueue::new(policy.per_sender_capacity),
                dispatcher: Dispatcher::new(transport, classifier),
                policy,
                ledger: Mutex::new(Ledger::default()),
                events,
                shutdown,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(
        config: &RelayConfig,
        rules: Arc<RuleStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::new(rules, transport, RelayPolicy::from(config))
    }

    /// Spawn the worker pool. Calling it again while workers run does nothing.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() || self.inner.is_shutting_down() {
            return;
        }
        for n in 0..self.inner.policy.workers {
            let inner = self.inner.clone();
            workers.push(tokio::spawn(async move {
                while let Some(task) = inner.queue.dequeue().await {
                    inner.process(task).await;
                }
                log::debug!("relay worker {} stopped", n);
            }));
        }
        log::info!(
            "relay started with {} worker(s) via transport {}",
            self.inner.policy.workers,
            self.inner.dispatcher.transport_id()
        );
    }

    /// Inbound entry point: decode the raw payload and admit the message. Safe to call concurrently.
    pub async fn on_message_received(
        &self,
        raw: &[u8],
        meta: TransportMeta,
    ) -> Result<Admission, RelayError> {
        if self.inner.is_shutting_down() {
            return Err(RelayError::ShuttingDown);
        }
        let message = decoder::decode(raw, &meta)?;
        self.admit(message).await
    }

    /// Admit an already decoded message: apply the rule, dedup, create and enqueue a task.
    pub async fn admit(&self, message: InboundMessage) -> Result<Admission, RelayError> {
        let inner = &self.inner;
        if inner.is_shutting_down() {
            return Err(RelayError::ShuttingDown);
        }
        let rule = inner.rules.snapshot();
        let skip = if rule.is_active() {
            None
        } else if !rule.enabled {
            Some(SkipReason::Disabled)
        } else {
            Some(SkipReason::NoTarget)
        };
        if let Some(reason) = skip {
            inner.emit(
                RelayEvent::new(RelayEventKind::Skipped, message.sender.as_str())
                    .reason(reason.to_string()),
            );
            return Ok(Admission::Skipped(reason));
        }

        let now = Instant::now();
        let mut ledger = inner.ledger.lock().await;
        ledger.sweep(now, &inner.policy);
        if let Some(original) = ledger.duplicate_of(&message.raw_id, now, inner.policy.dedup_window)
        {
            drop(ledger);
            inner.emit(
                RelayEvent::new(RelayEventKind::Skipped, message.sender.as_str())
                    .reason(format!("{} of {}", SkipReason::Duplicate, original)),
            );
            return Ok(Admission::Duplicate { original });
        }

        let task = RelayTask::new(message, rule);
        ledger.insert(&task, now);
        let id = task.id.clone();
        let sender = task.sender().to_string();
        let target = task.target().to_string();
        // enqueue under the ledger lock so arrival order matches queue order
        let queued = inner.queue.enqueue(task).await;
        let (err, reason) = match queued {
            Ok(()) => return Ok(Admission::Queued(id)),
            Err(QueueError::Full { .. }) => (
                RelayError::QueueFull {
                    sender: sender.clone(),
                    task_id: id.clone(),
                },
                "queue full".to_string(),
            ),
            Err(QueueError::Closed) => (RelayError::ShuttingDown, "shutdown".to_string()),
        };
        ledger.set_state(&id, TaskState::Failed, 0, Some(reason.clone()));
        drop(ledger);
        inner.emit(
            RelayEvent::new(RelayEventKind::Failed, sender)
                .task(id, target, 0)
                .reason(reason),
        );
        Err(err)
    }

    pub fn get_rule(&self) -> ForwardingRule {
        self.inner.rules.get()
    }

    pub fn set_rule(
        &self,
        target: &str,
        enabled: bool,
        template: Option<String>,
    ) -> Result<ForwardingRule, RelayError> {
        Ok(self.inner.rules.update(target, enabled, template)?)
    }

    /// Subscribe to relay events. Slow subscribers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    pub async fn task(&self, id: &str) -> Option<TaskSnapshot> {
        self.inner
            .ledger
            .lock()
            .await
            .tasks
            .get(id)
            .map(|r| r.snapshot.clone())
    }

    /// All retained tasks in creation order.
    pub async fn tasks(&self) -> Vec<TaskSnapshot> {
        let ledger = self.inner.ledger.lock().await;
        let mut recs: Vec<&TaskRecord> = ledger.tasks.values().collect();
        recs.sort_by_key(|r| r.seq);
        recs.into_iter().map(|r| r.snapshot.clone()).collect()
    }

    pub async fn failed_tasks(&self) -> Vec<TaskSnapshot> {
        self.tasks()
            .await
            .into_iter()
            .filter(|t| t.state == TaskState::Failed)
            .collect()
    }

    pub async fn stats(&self) -> RelayStats {
        let mut stats = RelayStats::default();
        {
            let ledger = self.inner.ledger.lock().await;
            for rec in ledger.tasks.values() {
                match rec.snapshot.state {
                    TaskState::Pending => stats.pending += 1,
                    TaskState::InFlight => stats.in_flight += 1,
                    TaskState::Delivered => stats.delivered += 1,
                    TaskState::Failed => stats.failed += 1,
                }
            }
        }
        stats.queued = self.inner.queue.len().await;
        stats
    }

    /// Stop taking work, give in-flight sends `shutdown_grace` to finish, then fail whatever is left.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        log::info!("relay shutting down");
        self.inner.queue.close().await;
        let handles = std::mem::take(&mut *self.workers.lock().await);
        let deadline = Instant::now() + self.inner.policy.shutdown_grace;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                log::warn!("relay worker did not finish within grace period, aborting");
                handle.abort();
            }
        }
        let leftover = self.inner.queue.drain().await;
        if !leftover.is_empty() {
            log::debug!("relay dropping {} queued task(s) on shutdown", leftover.len());
        }
        let unfinished = {
            let mut ledger = self.inner.ledger.lock().await;
            let unfinished = ledger.unfinished();
            for (id, snap) in &unfinished {
                ledger.set_state(
                    id,
                    TaskState::Failed,
                    snap.attempt_count,
                    Some("shutdown".to_string()),
                );
            }
            unfinished
        };
        for (id, snap) in unfinished {
            self.inner.emit(
                RelayEvent::new(RelayEventKind::Failed, snap.sender)
                    .task(id, snap.target, snap.attempt_count)
                    .reason("shutdown"),
            );
        }
        log::info!("relay stopped");
    }
}
