//! Delivery queue: FIFO per sender, round-robin across senders, bounded per sender.
//!
//! A dequeued task holds its sender's lane until the worker reports back with
//! [`DeliveryQueue::complete`] or [`DeliveryQueue::requeue_front`]. While a lane is held
//! no other task from that sender is handed out, so a retried message is never
//! overtaken by a later one from the same sender.

use crate::task::RelayTask;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue for sender {sender} is full ({capacity} tasks)")]
    Full { sender: String, capacity: usize },
    #[error("queue is closed")]
    Closed,
}

#[derive(Default)]
struct Lane {
    tasks: VecDeque<RelayTask>,
    held: bool,
}

#[derive(Default)]
struct QueueState {
    lanes: HashMap<String, Lane>,
    /// Sender keys in service order.
    ring: VecDeque<String>,
    closed: bool,
}

impl QueueState {
    fn pop_next(&mut self) -> Option<RelayTask> {
        for _ in 0..self.ring.len() {
            let key = self.ring.pop_front()?;
            let Some(lane) = self.lanes.get_mut(&key) else {
                continue;
            };
            if lane.held {
                self.ring.push_back(key);
                continue;
            }
            match lane.tasks.pop_front() {
                Some(task) => {
                    lane.held = true;
                    self.ring.push_back(key);
                    return Some(task);
                }
                None => {
                    self.lanes.remove(&key);
                }
            }
        }
        None
    }

    fn lane_entry(&mut self, sender: &str) -> &mut Lane {
        if !self.lanes.contains_key(sender) {
            self.ring.push_back(sender.to_string());
        }
        self.lanes.entry(sender.to_string()).or_default()
    }
}

pub struct DeliveryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl DeliveryQueue {
    /// Queue allowing `capacity` waiting tasks per sender.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Append a task to its sender's lane. Fails when the lane is full or the queue is closed.
    pub async fn enqueue(&self, task: RelayTask) -> Result<(), QueueError> {
        {
            let mut st = self.state.lock().await;
            if st.closed {
                return Err(QueueError::Closed);
            }
            let capacity = self.capacity;
            let lane = st.lane_entry(task.sender());
            if lane.tasks.len() >= capacity {
                return Err(QueueError::Full {
                    sender: task.sender().to_string(),
                    capacity,
                });
            }
            lane.tasks.push_back(task);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next task whose lane is free. Returns None once the queue is closed.
    pub async fn dequeue(&self) -> Option<RelayTask> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock().await;
                if st.closed {
                    return None;
                }
                if let Some(task) = st.pop_next() {
                    return Some(task);
                }
            }
            notified.await;
        }
    }

    /// Next available task without waiting.
    pub async fn try_dequeue(&self) -> Option<RelayTask> {
        let mut st = self.state.lock().await;
        if st.closed {
            return None;
        }
        st.pop_next()
    }

    /// Release the sender's lane after its task was delivered or failed.
    pub async fn complete(&self, sender: &str) {
        {
            let mut st = self.state.lock().await;
            let Some(lane) = st.lanes.get_mut(sender) else {
                return;
            };
            lane.held = false;
            if lane.tasks.is_empty() {
                st.lanes.remove(sender);
                st.ring.retain(|k| k != sender);
                return;
            }
        }
        self.notify.notify_one();
    }

    /// Put a task back at the head of its lane and release the lane. Capacity is not checked.
    pub async fn requeue_front(&self, task: RelayTask) -> Result<(), QueueError> {
        {
            let mut st = self.state.lock().await;
            if st.closed {
                return Err(QueueError::Closed);
            }
            let lane = st.lane_entry(task.sender());
            lane.held = false;
            lane.tasks.push_front(task);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Stop handing out tasks; wakes every waiting worker. Queued tasks stay until drained.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Remove and return every queued task.
    pub async fn drain(&self) -> Vec<RelayTask> {
        let mut st = self.state.lock().await;
        let mut out = Vec::new();
        for key in std::mem::take(&mut st.ring) {
            if let Some(lane) = st.lanes.remove(&key) {
                out.extend(lane.tasks);
            }
        }
        st.lanes.clear();
        out
    }

    /// Total queued tasks (not counting ones currently handed out).
    pub async fn len(&self) -> usize {
        self.state
            .lock()
            .await
            .lanes
            .values()
            .map(|l| l.tasks.len())
            .sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Queued tasks for one sender.
    pub async fn lane_len(&self, sender: &str) -> usize {
        self.state
            .lock()
            .await
            .lanes
            .get(sender)
            .map(|l| l.tasks.len())
            .unwrap_or(0)
    }
}
