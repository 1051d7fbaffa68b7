use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use inferoute_discovery::{EndpointRegistry, RemovalListener};
use inferoute_messaging::{MessageBus, MessagingConfig};
use inferoute_routing::{build_strategy, RoutingStrategy, StrategyContext};
use inferoute_stats::{EngineStatsPoller, EngineStatsRegistry, RequestStatsRegistry};
use inferoute_types::{DiscoveryKind, DynamicConfig, RouterResult};
use inferoute_workflow::{EvictionListener, WorkflowConfig, WorkflowManager};
use tracing::{info, warn};

use crate::metrics::RouterMetrics;
use crate::tracks::TrackStore;

/// Holder for the strategy trait object so it can live in an `ArcSwap`.
pub struct StrategyCell {
    pub strategy: Arc<dyn RoutingStrategy>,
}

/// Process-level knobs that are fixed at startup (unlike the dynamic config,
/// which can be swapped at runtime).
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub engine_stats_interval: Duration,
    pub request_stats_window: Duration,
    pub request_timeout: Duration,
    pub drain_timeout: Duration,
    /// Path of the watched document for dynamic discovery.
    pub dynamic_config_path: Option<PathBuf>,
    pub log_stats: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            engine_stats_interval: Duration::from_secs(10),
            request_stats_window: Duration::from_secs(60),
            request_timeout: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(30),
            dynamic_config_path: None,
            log_stats: false,
        }
    }
}

struct AppStateInner {
    registry: Arc<EndpointRegistry>,
    engine_stats: Arc<EngineStatsRegistry>,
    request_stats: Arc<RequestStatsRegistry>,
    workflows: Arc<WorkflowManager>,
    messages: Arc<MessageBus>,
    strategy: ArcSwap<StrategyCell>,
    config: ArcSwap<DynamicConfig>,
    metrics: RouterMetrics,
    http: reqwest::Client,
    tracks: Arc<TrackStore>,
    settings: RuntimeSettings,
    started_at: Instant,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Shared application state: every handler gets a cheap clone.
///
/// The endpoint snapshot, the active strategy and the dynamic config are all
/// read through atomic pointer loads; nothing on the request path takes a
/// global lock.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

/// Releases per-endpoint state when discovery removes an endpoint.
struct RemovalFanout {
    engine_stats: Arc<EngineStatsRegistry>,
    request_stats: Arc<RequestStatsRegistry>,
    workflows: Arc<WorkflowManager>,
}

impl RemovalListener for RemovalFanout {
    fn on_endpoint_removed(&self, url: &str) {
        self.engine_stats.forget(url);
        self.request_stats.forget(url);
        self.workflows.unbind_endpoint(url);
    }
}

/// Tears down a workflow's message queues when the workflow dies.
struct WorkflowTeardown {
    messages: Arc<MessageBus>,
}

impl EvictionListener for WorkflowTeardown {
    fn on_workflow_evicted(&self, workflow_id: &str) {
        self.messages.destroy_workflow(workflow_id);
    }
}

impl AppState {
    pub fn new(config: DynamicConfig, settings: RuntimeSettings) -> RouterResult<Self> {
        config.validate()?;

        let registry = Arc::new(EndpointRegistry::new());
        let engine_stats = Arc::new(EngineStatsRegistry::new());
        let request_stats = Arc::new(RequestStatsRegistry::new(settings.request_stats_window));
        let workflows = Arc::new(WorkflowManager::new(WorkflowConfig {
            ttl: Duration::from_secs(config.workflow_ttl),
            max_workflows: config.max_workflows,
        }));
        let messages = Arc::new(MessageBus::new(MessagingConfig {
            max_queue_size: config.max_message_queue_size,
            max_message_size: config.max_message_size,
            ..MessagingConfig::default()
        }));
        let metrics = RouterMetrics::new()
            .map_err(|e| inferoute_types::RouterError::config_invalid(e.to_string()))?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| inferoute_types::RouterError::config_invalid(e.to_string()))?;

        registry.subscribe_removals(Arc::new(RemovalFanout {
            engine_stats: Arc::clone(&engine_stats),
            request_stats: Arc::clone(&request_stats),
            workflows: Arc::clone(&workflows),
        }));
        workflows.subscribe_evictions(Arc::new(WorkflowTeardown {
            messages: Arc::clone(&messages),
        }));

        let strategy = build_strategy(
            &config,
            &StrategyContext {
                workflows: Arc::clone(&workflows),
                http: http.clone(),
            },
        );

        let state = Self {
            inner: Arc::new(AppStateInner {
                registry,
                engine_stats,
                request_stats,
                workflows,
                messages,
                strategy: ArcSwap::from_pointee(StrategyCell { strategy }),
                config: ArcSwap::from_pointee(config),
                metrics,
                http,
                tracks: Arc::new(TrackStore::new()),
                settings,
                started_at: Instant::now(),
                background: Mutex::new(Vec::new()),
            }),
        };

        // Static discovery resolves once, right here.
        let config = state.config();
        if config.service_discovery == DiscoveryKind::Static {
            state
                .registry()
                .replace(inferoute_discovery::static_endpoints(&config)?);
        }

        Ok(state)
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.inner.registry
    }

    pub fn engine_stats(&self) -> &Arc<EngineStatsRegistry> {
        &self.inner.engine_stats
    }

    pub fn request_stats(&self) -> &Arc<RequestStatsRegistry> {
        &self.inner.request_stats
    }

    pub fn workflows(&self) -> &Arc<WorkflowManager> {
        &self.inner.workflows
    }

    pub fn messages(&self) -> &Arc<MessageBus> {
        &self.inner.messages
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.inner.metrics
    }

    pub fn tracks(&self) -> &Arc<TrackStore> {
        &self.inner.tracks
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.inner.settings
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    /// The active strategy. Callers hold the returned `Arc` for the whole
    /// request so a concurrent reconfigure cannot change a request's
    /// strategy mid-flight; the old strategy is released with its last
    /// holder.
    pub fn strategy(&self) -> Arc<dyn RoutingStrategy> {
        self.inner.strategy.load().strategy.clone()
    }

    pub fn config(&self) -> Arc<DynamicConfig> {
        self.inner.config.load_full()
    }

    /// Apply a new dynamic configuration: build the new strategy, refresh
    /// static endpoints when the document carries them, then swap both
    /// pointers. Requests already admitted keep the strategy they loaded.
    pub fn apply_config(&self, config: DynamicConfig) -> RouterResult<()> {
        config.validate()?;

        let strategy = build_strategy(
            &config,
            &StrategyContext {
                workflows: Arc::clone(&self.inner.workflows),
                http: self.inner.http.clone(),
            },
        );

        if config.static_backends.is_some() {
            self.inner
                .registry
                .replace(inferoute_discovery::static_endpoints(&config)?);
        }
        if config.service_discovery == DiscoveryKind::Cluster
            && self.config().service_discovery != DiscoveryKind::Cluster
        {
            warn!("switching to cluster discovery requires a restart; keeping current discovery");
        }

        info!(
            routing_logic = config.routing_logic.as_str(),
            service_discovery = config.service_discovery.as_str(),
            "configuration applied"
        );
        self.inner.strategy.store(Arc::new(StrategyCell { strategy }));
        self.inner.config.store(Arc::new(config));
        Ok(())
    }

    /// Spawn the long-lived background tasks (stats poller, sweepers,
    /// metrics refresh). Called once after construction.
    pub fn start_background_tasks(&self) {
        let mut handles = self.inner.background.lock().expect("task list poisoned");

        handles.push(
            EngineStatsPoller::new(
                Arc::clone(&self.inner.registry),
                Arc::clone(&self.inner.engine_stats),
                self.inner.http.clone(),
                self.inner.settings.engine_stats_interval,
            )
            .spawn(),
        );
        handles.push(self.inner.workflows.spawn_sweeper());
        handles.push(self.inner.messages.spawn_sweeper());
        handles.push(self.inner.tracks.spawn_sweeper());
        handles.push(self.spawn_metrics_refresh());
        if self.inner.settings.log_stats {
            handles.push(self.spawn_stats_logger());
        }
    }

    /// Refresh the gauge families that mirror polled state.
    fn spawn_metrics_refresh(&self) -> tokio::task::JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                state.refresh_gauges();
            }
        })
    }

    pub fn refresh_gauges(&self) {
        let metrics = &self.inner.metrics;
        for (url, stats) in self.inner.engine_stats.snapshot() {
            metrics
                .num_requests_waiting
                .with_label_values(&[&url])
                .set(stats.queue_len);
        }
        for status in self.inner.workflows.statuses() {
            metrics
                .workflow_cache_hit_rate
                .with_label_values(&[&status.workflow_id])
                .set(status.cache_hit_rate);
        }
        for (workflow_id, agent_id, depth) in self.inner.messages.queue_depths() {
            metrics
                .agent_message_queue_size
                .with_label_values(&[&workflow_id, &agent_id])
                .set(depth as i64);
        }
        for stats in self
            .inner
            .workflows
            .statuses()
            .iter()
            .map(|s| self.inner.messages.stats(&s.workflow_id))
        {
            metrics
                .messages_dropped_total
                .with_label_values(&[&stats.workflow_id])
                .set(stats.total_dropped as i64);
        }
    }

    fn spawn_stats_logger(&self) -> tokio::task::JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let snapshot = state.registry().snapshot();
                for ep in snapshot.iter() {
                    let req = state.request_stats().view(&ep.url);
                    let engine = state.engine_stats().get(&ep.url).unwrap_or_default();
                    info!(
                        url = %ep.url,
                        qps = format!("{:.2}", req.qps),
                        in_flight = req.in_flight,
                        queue_len = engine.queue_len,
                        ttft_ewma = format!("{:.3}", req.ttft_ewma),
                        "endpoint stats"
                    );
                }
            }
        })
    }

    /// Wait for in-flight requests to finish, bounded by `drain_timeout`,
    /// then stop background tasks.
    pub async fn shutdown(&self) {
        let deadline = Instant::now() + self.inner.settings.drain_timeout;
        loop {
            let in_flight = self.inner.request_stats.total_in_flight();
            if in_flight == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(in_flight, "drain timeout reached, closing with requests in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let handles = {
            let mut guard = self.inner.background.lock().expect("task list poisoned");
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            handle.abort();
        }
        info!("background tasks stopped");
    }
}
