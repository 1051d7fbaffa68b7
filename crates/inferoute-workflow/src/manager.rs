use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

/// How often the sweeper scans for expired and over-limit workflows.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Idle lifetime; a workflow untouched for longer is gone.
    pub ttl: Duration,
    /// Upper bound on live workflows; LRU beyond this.
    pub max_workflows: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_workflows: 1000,
        }
    }
}

/// Notified when a workflow is evicted or destroyed, so dependent state
/// (message queues) can be released and pending pollers woken.
pub trait EvictionListener: Send + Sync {
    fn on_workflow_evicted(&self, workflow_id: &str);
}

struct WorkflowEntry {
    created_at: DateTime<Utc>,
    last_access: Instant,
    last_access_at: DateTime<Utc>,
    assigned_endpoint_url: Option<String>,
    agents: BTreeSet<String>,
    request_count: u64,
    cache_hit_count: u64,
    total_tokens: u64,
}

impl WorkflowEntry {
    fn new() -> Self {
        Self {
            created_at: Utc::now(),
            last_access: Instant::now(),
            last_access_at: Utc::now(),
            assigned_endpoint_url: None,
            agents: BTreeSet::new(),
            request_count: 0,
            cache_hit_count: 0,
            total_tokens: 0,
        }
    }

    fn touch(&mut self, agent_id: Option<&str>) {
        self.last_access = Instant::now();
        self.last_access_at = Utc::now();
        if let Some(agent) = agent_id {
            self.agents.insert(agent.to_string());
        }
    }

    fn expired(&self, ttl: Duration) -> bool {
        self.last_access.elapsed() > ttl
    }
}

/// Externally visible workflow state, served by `GET /v1/workflows/:id/status`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatus {
    pub workflow_id: String,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub assigned_endpoint_url: Option<String>,
    pub agents: Vec<String>,
    pub request_count: u64,
    pub cache_hit_count: u64,
    pub total_tokens: u64,
    pub cache_hit_rate: f64,
}

/// Process-wide workflow context manager.
///
/// All operations take the per-key dashmap shard lock only; there is no
/// global lock on the request path. Expiry is checked inline on every read
/// so an expired workflow is never returned even before the sweeper runs.
pub struct WorkflowManager {
    config: WorkflowConfig,
    contexts: DashMap<String, WorkflowEntry>,
    listeners: RwLock<Vec<Arc<dyn EvictionListener>>>,
}

impl WorkflowManager {
    pub fn new(config: WorkflowConfig) -> Self {
        Self {
            config,
            contexts: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe_evictions(&self, listener: Arc<dyn EvictionListener>) {
        self.listeners
            .write()
            .expect("eviction listener lock poisoned")
            .push(listener);
    }

    /// Create or refresh the workflow, registering the agent if given.
    pub fn get_or_create(&self, workflow_id: &str, agent_id: Option<&str>) {
        let mut entry = self
            .contexts
            .entry(workflow_id.to_string())
            .or_insert_with(WorkflowEntry::new);
        if entry.expired(self.config.ttl) {
            *entry = WorkflowEntry::new();
        }
        entry.touch(agent_id);
    }

    /// Refresh last-access without creating.
    pub fn touch(&self, workflow_id: &str, agent_id: Option<&str>) {
        if let Some(mut entry) = self.contexts.get_mut(workflow_id) {
            if !entry.expired(self.config.ttl) {
                entry.touch(agent_id);
            }
        }
    }

    /// Atomically bind the workflow to `url` if it has no live binding, and
    /// return the binding in force after the call. This is the only place a
    /// binding is ever established; re-binding happens solely here, after
    /// the previous endpoint was un-registered (which cleared the binding).
    pub fn assign_if_absent(&self, workflow_id: &str, url: &str) -> String {
        let mut entry = self
            .contexts
            .entry(workflow_id.to_string())
            .or_insert_with(WorkflowEntry::new);
        if entry.expired(self.config.ttl) {
            *entry = WorkflowEntry::new();
        }
        entry.touch(None);
        match &entry.assigned_endpoint_url {
            Some(bound) => bound.clone(),
            None => {
                debug!(workflow_id, url, "workflow bound to endpoint");
                entry.assigned_endpoint_url = Some(url.to_string());
                url.to_string()
            }
        }
    }

    /// Current binding, if the workflow is live and bound.
    pub fn binding(&self, workflow_id: &str) -> Option<String> {
        self.contexts.get(workflow_id).and_then(|entry| {
            if entry.expired(self.config.ttl) {
                None
            } else {
                entry.assigned_endpoint_url.clone()
            }
        })
    }

    /// Terminal accounting for a routed request that carried this workflow.
    /// Updates for workflows that expired mid-request are silently dropped.
    pub fn on_request_complete(
        &self,
        workflow_id: &str,
        success: bool,
        tokens_out: u64,
        cache_hit: bool,
    ) {
        let Some(mut entry) = self.contexts.get_mut(workflow_id) else {
            return;
        };
        if entry.expired(self.config.ttl) {
            return;
        }
        entry.touch(None);
        entry.request_count += 1;
        if success {
            entry.total_tokens += tokens_out;
        }
        if cache_hit {
            entry.cache_hit_count += 1;
        }
    }

    /// Clear bindings to a removed endpoint. Affected workflows stay alive
    /// and become re-bindable on their next request.
    pub fn unbind_endpoint(&self, url: &str) {
        let mut unbound = 0usize;
        for mut entry in self.contexts.iter_mut() {
            if entry.assigned_endpoint_url.as_deref() == Some(url) {
                entry.assigned_endpoint_url = None;
                unbound += 1;
            }
        }
        if unbound > 0 {
            info!(url, unbound, "cleared workflow bindings to removed endpoint");
        }
    }

    pub fn status(&self, workflow_id: &str) -> Option<WorkflowStatus> {
        let entry = self.contexts.get(workflow_id)?;
        if entry.expired(self.config.ttl) {
            return None;
        }
        Some(WorkflowStatus {
            workflow_id: workflow_id.to_string(),
            created_at: entry.created_at,
            last_access_at: entry.last_access_at,
            assigned_endpoint_url: entry.assigned_endpoint_url.clone(),
            agents: entry.agents.iter().cloned().collect(),
            request_count: entry.request_count,
            cache_hit_count: entry.cache_hit_count,
            total_tokens: entry.total_tokens,
            cache_hit_rate: if entry.request_count == 0 {
                0.0
            } else {
                entry.cache_hit_count as f64 / entry.request_count as f64
            },
        })
    }

    /// Agents currently known in the workflow (broadcast fan-out set).
    pub fn agents(&self, workflow_id: &str) -> Option<Vec<String>> {
        let entry = self.contexts.get(workflow_id)?;
        if entry.expired(self.config.ttl) {
            return None;
        }
        Some(entry.agents.iter().cloned().collect())
    }

    /// Status of every live workflow, for the metrics exporter.
    pub fn statuses(&self) -> Vec<WorkflowStatus> {
        let ids: Vec<String> = self.contexts.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter_map(|id| self.status(id)).collect()
    }

    pub fn contains(&self, workflow_id: &str) -> bool {
        self.contexts
            .get(workflow_id)
            .map(|e| !e.expired(self.config.ttl))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Explicitly destroy a workflow, notifying listeners.
    pub fn destroy(&self, workflow_id: &str) -> bool {
        let removed = self.contexts.remove(workflow_id).is_some();
        if removed {
            self.notify_evicted(workflow_id);
        }
        removed
    }

    /// One sweep pass: drop expired workflows, then LRU-trim to the limit.
    /// In-flight requests are untouched; their post-completion updates will
    /// simply find no context.
    pub fn sweep(&self) {
        let expired: Vec<String> = self
            .contexts
            .iter()
            .filter(|e| e.expired(self.config.ttl))
            .map(|e| e.key().clone())
            .collect();
        for id in &expired {
            if self.contexts.remove(id).is_some() {
                debug!(workflow_id = %id, "workflow expired");
                self.notify_evicted(id);
            }
        }

        let over = self.contexts.len().saturating_sub(self.config.max_workflows);
        if over > 0 {
            let mut by_age: Vec<(String, Instant)> = self
                .contexts
                .iter()
                .map(|e| (e.key().clone(), e.last_access))
                .collect();
            by_age.sort_by_key(|(_, at)| *at);
            for (id, _) in by_age.into_iter().take(over) {
                if self.contexts.remove(&id).is_some() {
                    debug!(workflow_id = %id, "workflow evicted (over limit)");
                    self.notify_evicted(&id);
                }
            }
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.sweep();
            }
        })
    }

    fn notify_evicted(&self, workflow_id: &str) {
        let listeners = self
            .listeners
            .read()
            .expect("eviction listener lock poisoned");
        for listener in listeners.iter() {
            listener.on_workflow_evicted(workflow_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(ttl_secs: u64, max: usize) -> WorkflowManager {
        WorkflowManager::new(WorkflowConfig {
            ttl: Duration::from_secs(ttl_secs),
            max_workflows: max,
        })
    }

    #[test]
    fn binding_is_first_writer_wins() {
        let m = manager(3600, 10);
        m.get_or_create("wf-1", Some("a"));
        assert_eq!(m.assign_if_absent("wf-1", "http://a:8000"), "http://a:8000");
        assert_eq!(m.assign_if_absent("wf-1", "http://b:8000"), "http://a:8000");
        assert_eq!(m.binding("wf-1").as_deref(), Some("http://a:8000"));
    }

    #[test]
    fn unbind_endpoint_allows_rebinding() {
        let m = manager(3600, 10);
        m.assign_if_absent("wf-1", "http://a:8000");
        m.unbind_endpoint("http://a:8000");
        assert_eq!(m.binding("wf-1"), None);
        assert_eq!(m.assign_if_absent("wf-1", "http://b:8000"), "http://b:8000");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_workflow_not_returned() {
        let m = manager(5, 10);
        m.get_or_create("wf-1", None);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(m.status("wf-1").is_none());
        assert!(m.binding("wf-1").is_none());
        assert!(!m.contains("wf-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_expired_and_notifies() {
        use std::sync::Mutex;
        struct Recorder(Mutex<Vec<String>>);
        impl EvictionListener for Recorder {
            fn on_workflow_evicted(&self, id: &str) {
                self.0.lock().unwrap().push(id.to_string());
            }
        }

        let m = Arc::new(manager(5, 10));
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        m.subscribe_evictions(recorder.clone());

        m.get_or_create("wf-1", None);
        tokio::time::advance(Duration::from_secs(6)).await;
        m.sweep();
        assert_eq!(*recorder.0.lock().unwrap(), vec!["wf-1"]);
        assert!(m.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lru_eviction_beyond_limit() {
        let m = manager(3600, 2);
        m.get_or_create("wf-old", None);
        tokio::time::advance(Duration::from_secs(1)).await;
        m.get_or_create("wf-mid", None);
        tokio::time::advance(Duration::from_secs(1)).await;
        m.get_or_create("wf-new", None);
        m.sweep();
        assert_eq!(m.len(), 2);
        assert!(!m.contains("wf-old"));
        assert!(m.contains("wf-mid"));
        assert!(m.contains("wf-new"));
    }

    #[test]
    fn completion_accounting() {
        let m = manager(3600, 10);
        m.get_or_create("wf-1", Some("planner"));
        m.on_request_complete("wf-1", true, 120, true);
        m.on_request_complete("wf-1", true, 30, false);
        m.on_request_complete("wf-1", false, 99, false);

        let status = m.status("wf-1").unwrap();
        assert_eq!(status.request_count, 3);
        assert_eq!(status.total_tokens, 150);
        assert_eq!(status.cache_hit_count, 1);
        assert!((status.cache_hit_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn completion_for_unknown_workflow_is_dropped() {
        let m = manager(3600, 10);
        m.on_request_complete("wf-gone", true, 10, false);
        assert!(m.is_empty());
    }
}
