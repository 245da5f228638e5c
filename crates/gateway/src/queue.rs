//! Task queue collaborator — the contract between the scheduler loop and
//! workers.
//!
//! Broker requirements: at-least-once delivery, per-message priority 1..10,
//! distinct `reports` and `notifications` queues, ack-after-success.
//! `MemoryQueue` is the in-process broker used by single-binary deployments
//! and tests; an external broker binds behind [`TaskQueue`].

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use courier_domain::model::EmailDeliveryConfig;

pub const DEFAULT_PRIORITY: u8 = 5;

/// Everything a worker needs to execute one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: Uuid,
    pub tenant_id: Uuid,
    /// Empty for manual runs.
    pub schedule_id: Option<Uuid>,
    pub report_definition_id: Uuid,
    pub email_delivery_config: Option<EmailDeliveryConfig>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Reports,
    Notifications,
}

impl QueueName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reports => "reports",
            Self::Notifications => "notifications",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("queue broker unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Publish a descriptor. Priority 1..10, higher first.
    async fn publish(
        &self,
        queue: QueueName,
        priority: u8,
        task: TaskDescriptor,
    ) -> Result<(), QueueError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-process broker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Queued {
    priority: u8,
    /// Publish sequence; breaks priority ties FIFO.
    seq: u64,
    task: TaskDescriptor,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Queued {}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<QueueName, BinaryHeap<Queued>>>,
    notify: Notify,
    seq: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn pop(&self, queue: QueueName) -> Option<TaskDescriptor> {
        let mut queues = self.queues.lock();
        queues.get_mut(&queue).and_then(|heap| heap.pop()).map(|q| q.task)
    }

    /// Dequeue the highest-priority descriptor, waiting for one if empty.
    pub async fn recv(&self, queue: QueueName) -> TaskDescriptor {
        loop {
            let notified = self.notify.notified();
            if let Some(task) = self.pop(queue) {
                return task;
            }
            notified.await;
        }
    }

    /// Non-blocking dequeue.
    pub fn try_recv(&self, queue: QueueName) -> Option<TaskDescriptor> {
        self.pop(queue)
    }

    pub fn len(&self, queue: QueueName) -> usize {
        self.queues.lock().get(&queue).map_or(0, |h| h.len())
    }

    pub fn is_empty(&self, queue: QueueName) -> bool {
        self.len(queue) == 0
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn publish(
        &self,
        queue: QueueName,
        priority: u8,
        task: TaskDescriptor,
    ) -> Result<(), QueueError> {
        let priority = priority.clamp(1, 10);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            queue = queue.as_str(),
            priority,
            task_id = %task.task_id,
            "enqueued task"
        );
        self.queues.lock().entry(queue).or_default().push(Queued {
            priority,
            seq,
            task,
        });
        self.notify.notify_waiters();
        Ok(())
    }
}
