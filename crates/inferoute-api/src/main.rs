use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use inferoute_api::{build_router, AppState, RuntimeSettings};
use inferoute_discovery::FileDiscovery;
use inferoute_types::{DiscoveryKind, DynamicConfig, RouterError};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "inferoute-api")]
#[command(about = "Inferoute - request router for LLM serving fleets")]
#[command(version)]
struct Args {
    #[arg(long, default_value = "0.0.0.0", env = "INFEROUTE_HOST")]
    host: String,

    #[arg(long, default_value_t = 8080, env = "INFEROUTE_PORT")]
    port: u16,

    /// Discovery variant: static, dynamic or cluster.
    #[arg(long, default_value = "static", env = "INFEROUTE_SERVICE_DISCOVERY")]
    service_discovery: String,

    /// Comma-separated engine URLs for static discovery.
    #[arg(long, env = "INFEROUTE_STATIC_BACKENDS")]
    static_backends: Option<String>,

    /// Comma-separated model labels, parallel to --static-backends.
    #[arg(long, env = "INFEROUTE_STATIC_MODELS")]
    static_models: Option<String>,

    /// Comma-separated model types (chat, transcription, ...), parallel to
    /// --static-backends; stored as endpoint tags.
    #[arg(long, env = "INFEROUTE_STATIC_MODEL_TYPES")]
    static_model_types: Option<String>,

    /// Path of the dynamic-config document watched under dynamic discovery.
    #[arg(long, env = "INFEROUTE_DYNAMIC_CONFIG")]
    dynamic_config: Option<PathBuf>,

    /// Pod label selector for cluster discovery.
    #[arg(long, env = "INFEROUTE_POD_LABEL_SELECTOR")]
    pod_label_selector: Option<String>,

    #[arg(long, default_value = "roundrobin", env = "INFEROUTE_ROUTING_LOGIC")]
    routing_logic: String,

    /// Header whose value keys session-sticky hashing.
    #[arg(long, default_value = "x-user-id", env = "INFEROUTE_SESSION_KEY")]
    session_key: String,

    /// Prompt-token count below which KV-aware routing skips the oracle.
    #[arg(long, default_value_t = 2000, env = "INFEROUTE_KV_AWARE_THRESHOLD")]
    kv_aware_threshold: usize,

    /// Base URL of the KV-cache oracle service.
    #[arg(long, env = "INFEROUTE_KV_ORACLE_URL")]
    kv_oracle_url: Option<String>,

    /// Workflow idle lifetime in seconds.
    #[arg(long, default_value_t = 3600, env = "INFEROUTE_WORKFLOW_TTL")]
    workflow_ttl: u64,

    #[arg(long, default_value_t = 1000, env = "INFEROUTE_MAX_WORKFLOWS")]
    max_workflows: usize,

    /// Stickiness weight for new workflow placement, 0.0..=1.0.
    #[arg(long, default_value_t = 0.8, env = "INFEROUTE_BATCHING_PREFERENCE")]
    batching_preference: f64,

    #[arg(long, default_value_t = 1000, env = "INFEROUTE_MAX_MESSAGE_QUEUE_SIZE")]
    max_message_queue_size: usize,

    /// Maximum A2A payload size in bytes.
    #[arg(long, default_value_t = 1_048_576, env = "INFEROUTE_MAX_MESSAGE_SIZE")]
    max_message_size: usize,

    #[arg(long, default_value = "x-request-priority", env = "INFEROUTE_PRIORITY_HEADER")]
    priority_header: String,

    #[arg(
        long,
        default_value = "x-expected-output-tokens",
        env = "INFEROUTE_EXPECTED_OUTPUT_LEN_HEADER"
    )]
    expected_output_len_header: String,

    #[arg(long, default_value = "x-sla-target-ms", env = "INFEROUTE_SLA_HEADER")]
    sla_header: String,

    #[arg(long, default_value = "prefill", env = "INFEROUTE_PREFILL_TAG")]
    prefill_tag: String,

    #[arg(long, default_value = "decoding", env = "INFEROUTE_DECODING_TAG")]
    decoding_tag: String,

    /// Engine /metrics scrape interval in seconds.
    #[arg(long, default_value_t = 10, env = "INFEROUTE_ENGINE_STATS_INTERVAL")]
    engine_stats_interval: u64,

    /// Sliding window for request statistics in seconds.
    #[arg(long, default_value_t = 60, env = "INFEROUTE_REQUEST_STATS_WINDOW")]
    request_stats_window: u64,

    /// Upstream request timeout in seconds.
    #[arg(long, default_value_t = 300, env = "INFEROUTE_REQUEST_TIMEOUT")]
    request_timeout: u64,

    /// How long shutdown waits for in-flight requests, in seconds.
    #[arg(long, default_value_t = 30, env = "INFEROUTE_DRAIN_TIMEOUT")]
    drain_timeout: u64,

    /// Periodically log per-endpoint stats.
    #[arg(long, default_value_t = false, env = "INFEROUTE_LOG_STATS")]
    log_stats: bool,

    /// Require this API key on the /v1/* surface.
    #[arg(long, env = "INFEROUTE_API_KEY")]
    api_key: Option<String>,
}

impl Args {
    fn to_config(&self) -> Result<DynamicConfig, RouterError> {
        Ok(DynamicConfig {
            service_discovery: self.service_discovery.parse()?,
            routing_logic: self.routing_logic.parse()?,
            static_backends: self.static_backends.clone(),
            static_models: self.static_models.clone(),
            static_model_types: self.static_model_types.clone(),
            session_key: self.session_key.clone(),
            kv_aware_threshold: self.kv_aware_threshold,
            kv_oracle_url: self.kv_oracle_url.clone(),
            workflow_ttl: self.workflow_ttl,
            max_workflows: self.max_workflows,
            batching_preference: self.batching_preference,
            max_message_queue_size: self.max_message_queue_size,
            max_message_size: self.max_message_size,
            priority_header: self.priority_header.clone(),
            expected_output_len_header: self.expected_output_len_header.clone(),
            sla_header: self.sla_header.clone(),
            prefill_tag: self.prefill_tag.clone(),
            decoding_tag: self.decoding_tag.clone(),
            pod_label_selector: self.pod_label_selector.clone(),
            api_key: self.api_key.clone(),
        })
    }

    fn to_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            engine_stats_interval: Duration::from_secs(self.engine_stats_interval),
            request_stats_window: Duration::from_secs(self.request_stats_window),
            request_timeout: Duration::from_secs(self.request_timeout),
            drain_timeout: Duration::from_secs(self.drain_timeout),
            dynamic_config_path: self.dynamic_config.clone(),
            log_stats: self.log_stats,
        }
    }
}

/// Exit code 2 is reserved for configuration errors, 1 for startup
/// failures, 0 for a clean drain-and-exit.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = match args.to_config().and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };
    if config.service_discovery == DiscoveryKind::Dynamic && args.dynamic_config.is_none() {
        error!("dynamic discovery requires --dynamic-config");
        std::process::exit(2);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %args.host,
        port = args.port,
        routing_logic = config.routing_logic.as_str(),
        service_discovery = config.service_discovery.as_str(),
        "starting inferoute"
    );

    let settings = args.to_settings();
    let state = match AppState::new(config.clone(), settings.clone()) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "failed to initialize router state");
            std::process::exit(2);
        }
    };
    state.start_background_tasks();

    // Discovery variants with a background component.
    let mut file_watch = None;
    match config.service_discovery {
        DiscoveryKind::Static => {}
        DiscoveryKind::Dynamic => {
            // Presence was checked right after argument parsing.
            let Some(path) = settings.dynamic_config_path.clone() else {
                std::process::exit(2);
            };
            let apply_state = state.clone();
            let watcher = FileDiscovery::new(
                path,
                Arc::new(move |config: DynamicConfig| {
                    if let Err(e) = apply_state.apply_config(config) {
                        error!(error = %e, "rejecting configuration file update");
                    }
                }),
            );
            match watcher.spawn() {
                Ok(handle) => file_watch = Some(handle),
                Err(e) => {
                    error!(error = %e, "failed to start dynamic config watcher");
                    std::process::exit(2);
                }
            }
        }
        DiscoveryKind::Cluster => {
            #[cfg(feature = "kube-discovery")]
            {
                let selector = config
                    .pod_label_selector
                    .clone()
                    .unwrap_or_else(|| "app=inferoute-engine".to_string());
                let discovery = inferoute_discovery::PodDiscovery::new(
                    Arc::clone(state.registry()),
                    selector,
                );
                if let Err(e) = discovery.spawn().await {
                    error!(error = %e, "failed to start pod discovery");
                    std::process::exit(1);
                }
            }
            #[cfg(not(feature = "kube-discovery"))]
            {
                error!("cluster discovery requires the kube-discovery feature");
                std::process::exit(2);
            }
        }
    }

    let app = build_router(state.clone());
    let addr: SocketAddr = match format!("{}:{}", args.host, args.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "invalid bind address");
            std::process::exit(2);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %addr, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr = %addr, "inferoute listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("draining in-flight requests");
    state.shutdown().await;
    if let Some(handle) = file_watch {
        handle.shutdown();
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
