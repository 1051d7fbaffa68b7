use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use inferoute_types::{RouterError, RouterResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Target value that fans a message out to every agent in the workflow.
pub const BROADCAST_TARGET: &str = "*";

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// Per-agent queue bound; overflow drops the oldest undelivered message.
    pub max_queue_size: usize,
    /// Upper bound on a message payload in serialized bytes.
    pub max_message_size: usize,
    pub default_poll_timeout: Duration,
    pub max_poll_timeout: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_message_size: 1_048_576,
            default_poll_timeout: Duration::from_secs(5),
            max_poll_timeout: Duration::from_secs(60),
        }
    }
}

/// One A2A message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: uuid::Uuid,
    pub workflow_id: String,
    pub source_agent: String,
    pub target_agent: String,
    pub kind: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

/// Result of a post: the assigned id and how many queues accepted the
/// message (broadcasts count each recipient).
#[derive(Debug, Clone, Serialize)]
pub struct PostOutcome {
    pub id: uuid::Uuid,
    pub delivered_to: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentQueueStats {
    pub agent_id: String,
    pub queued: usize,
    pub dropped: u64,
    pub expired: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowQueueStats {
    pub workflow_id: String,
    pub agents: Vec<AgentQueueStats>,
    pub total_queued: usize,
    pub total_dropped: u64,
    pub total_expired: u64,
}

struct Queued {
    message: Message,
    expires_at: Instant,
}

struct AgentQueue {
    queue: Mutex<VecDeque<Queued>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    expired: AtomicU64,
}

impl AgentQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Drop expired messages from the front-most positions.
    fn prune_expired(&self, queue: &mut VecDeque<Queued>) {
        let now = Instant::now();
        let before = queue.len();
        queue.retain(|q| q.expires_at > now);
        let removed = before - queue.len();
        if removed > 0 {
            self.expired.fetch_add(removed as u64, Ordering::AcqRel);
        }
    }
}

/// The process-wide A2A message bus.
pub struct MessageBus {
    config: MessagingConfig,
    queues: DashMap<(String, String), Arc<AgentQueue>>,
}

impl MessageBus {
    pub fn new(config: MessagingConfig) -> Self {
        Self {
            config,
            queues: DashMap::new(),
        }
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    fn queue(&self, workflow_id: &str, agent_id: &str) -> Arc<AgentQueue> {
        self.queues
            .entry((workflow_id.to_string(), agent_id.to_string()))
            .or_insert_with(|| Arc::new(AgentQueue::new()))
            .clone()
    }

    /// Post a message. Broadcast (`target_agent == "*"`) expands to the
    /// agents known in the workflow at post time, excluding the source;
    /// agents that join later see nothing. Payloads over the size limit are
    /// rejected; queue overflow is absorbed by dropping the oldest message
    /// and never fails the producer.
    #[allow(clippy::too_many_arguments)]
    pub fn post(
        &self,
        workflow_id: &str,
        source_agent: &str,
        target_agent: &str,
        kind: &str,
        payload: Value,
        ttl_seconds: u64,
        known_agents: &[String],
    ) -> RouterResult<PostOutcome> {
        let size = serde_json::to_vec(&payload)
            .map(|b| b.len())
            .unwrap_or(usize::MAX);
        if size > self.config.max_message_size {
            return Err(RouterError::MessageTooLarge {
                size,
                limit: self.config.max_message_size,
            });
        }

        let message = Message {
            id: uuid::Uuid::new_v4(),
            workflow_id: workflow_id.to_string(),
            source_agent: source_agent.to_string(),
            target_agent: target_agent.to_string(),
            kind: kind.to_string(),
            payload,
            created_at: Utc::now(),
            ttl_seconds,
        };

        let targets: Vec<&str> = if target_agent == BROADCAST_TARGET {
            known_agents
                .iter()
                .map(String::as_str)
                .filter(|a| *a != source_agent)
                .collect()
        } else {
            vec![target_agent]
        };

        let expires_at = Instant::now() + Duration::from_secs(ttl_seconds);
        let mut delivered_to = 0usize;
        for target in targets {
            let queue = self.queue(workflow_id, target);
            let mut q = queue.queue.lock().expect("message queue lock poisoned");
            q.push_back(Queued {
                message: message.clone(),
                expires_at,
            });
            while q.len() > self.config.max_queue_size {
                q.pop_front();
                queue.dropped.fetch_add(1, Ordering::AcqRel);
            }
            drop(q);
            queue.notify.notify_one();
            delivered_to += 1;
        }

        debug!(
            workflow_id,
            source_agent, target_agent, delivered_to, "message posted"
        );
        Ok(PostOutcome {
            id: message.id,
            delivered_to,
        })
    }

    /// Long-poll for messages. Returns immediately when the queue is
    /// non-empty, otherwise suspends until a message arrives, the deadline
    /// elapses (empty result), or the workflow is destroyed
    /// (`UnknownWorkflow`). Returned messages are removed from the queue in
    /// FIFO order.
    pub async fn poll(
        &self,
        workflow_id: &str,
        agent_id: &str,
        max_messages: usize,
        timeout: Option<Duration>,
    ) -> RouterResult<Vec<Message>> {
        let timeout = timeout
            .unwrap_or(self.config.default_poll_timeout)
            .min(self.config.max_poll_timeout);
        let deadline = Instant::now() + timeout;
        let max_messages = max_messages.max(1);
        let queue = self.queue(workflow_id, agent_id);

        loop {
            if queue.closed.load(Ordering::Acquire) {
                return Err(RouterError::unknown_workflow(workflow_id));
            }

            let drained = self.drain(&queue, max_messages);
            if !drained.is_empty() {
                return Ok(drained);
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = queue.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Ok(self.drain(&queue, max_messages));
                }
            }
        }
    }

    fn drain(&self, queue: &AgentQueue, max_messages: usize) -> Vec<Message> {
        let mut q = queue.queue.lock().expect("message queue lock poisoned");
        queue.prune_expired(&mut q);
        let take = q.len().min(max_messages);
        q.drain(..take).map(|entry| entry.message).collect()
    }

    pub fn stats(&self, workflow_id: &str) -> WorkflowQueueStats {
        let mut agents = Vec::new();
        for entry in self.queues.iter() {
            let (wf, agent) = entry.key();
            if wf != workflow_id {
                continue;
            }
            let queue = entry.value();
            let mut q = queue.queue.lock().expect("message queue lock poisoned");
            queue.prune_expired(&mut q);
            agents.push(AgentQueueStats {
                agent_id: agent.clone(),
                queued: q.len(),
                dropped: queue.dropped.load(Ordering::Acquire),
                expired: queue.expired.load(Ordering::Acquire),
            });
        }
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        WorkflowQueueStats {
            workflow_id: workflow_id.to_string(),
            total_queued: agents.iter().map(|a| a.queued).sum(),
            total_dropped: agents.iter().map(|a| a.dropped).sum(),
            total_expired: agents.iter().map(|a| a.expired).sum(),
            agents,
        }
    }

    /// Queue depths across all workflows, for the metrics exporter.
    pub fn queue_depths(&self) -> Vec<(String, String, usize)> {
        self.queues
            .iter()
            .map(|entry| {
                let (wf, agent) = entry.key();
                let len = entry
                    .value()
                    .queue
                    .lock()
                    .expect("message queue lock poisoned")
                    .len();
                (wf.clone(), agent.clone(), len)
            })
            .collect()
    }

    pub fn total_dropped(&self) -> u64 {
        self.queues
            .iter()
            .map(|e| e.value().dropped.load(Ordering::Acquire))
            .sum()
    }

    /// Tear down every queue of a workflow and wake its pollers, which then
    /// observe `UnknownWorkflow`.
    pub fn destroy_workflow(&self, workflow_id: &str) {
        let keys: Vec<(String, String)> = self
            .queues
            .iter()
            .filter(|e| e.key().0 == workflow_id)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, queue)) = self.queues.remove(&key) {
                queue.closed.store(true, Ordering::Release);
                queue.notify.notify_waiters();
            }
        }
    }

    /// One TTL sweep over all queues.
    pub fn sweep(&self) {
        for entry in self.queues.iter() {
            let queue = entry.value();
            let mut q = queue.queue.lock().expect("message queue lock poisoned");
            queue.prune_expired(&mut q);
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                bus.sweep();
            }
        })
    }
}
