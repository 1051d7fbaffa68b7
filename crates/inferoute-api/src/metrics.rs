use anyhow::Result;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Prometheus series the router exports. Names are a stable contract with
/// the autoscaler; the `vllm`-prefixed ones mirror what engine-side scrapers
/// already alert on.
///
/// The struct owns its registry and is dependency-injected wherever needed,
/// never a process global.
pub struct RouterMetrics {
    registry: Registry,

    /// Last scraped engine queue depth, per endpoint.
    pub num_requests_waiting: GaugeVec,
    /// Requests routed to an endpoint since startup.
    pub num_incoming_requests_total: IntCounterVec,
    /// Completed requests per endpoint and outcome.
    pub requests_total: IntCounterVec,
    /// Requests accounted to a workflow.
    pub workflow_requests_total: IntCounterVec,
    pub workflow_cache_hit_rate: GaugeVec,
    pub agent_message_queue_size: IntGaugeVec,
    /// Messages dropped by queue overflow, per workflow (monotone, exported
    /// from the bus's drop counters).
    pub messages_dropped_total: IntGaugeVec,
    pub request_duration_seconds: HistogramVec,
    pub ttft_seconds: HistogramVec,
}

impl RouterMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let num_requests_waiting = GaugeVec::new(
            Opts::new(
                "vllm:num_requests_waiting",
                "Engine-reported queue depth at last scrape",
            ),
            &["url"],
        )?;
        let num_incoming_requests_total = IntCounterVec::new(
            Opts::new(
                "vllm:num_incoming_requests_total",
                "Requests routed to this endpoint",
            ),
            &["url"],
        )?;
        let requests_total = IntCounterVec::new(
            Opts::new("inferoute_requests_total", "Completed requests by outcome"),
            &["url", "outcome"],
        )?;
        let workflow_requests_total = IntCounterVec::new(
            Opts::new(
                "vllm_workflow_requests_total",
                "Requests accounted to a workflow",
            ),
            &["workflow_id"],
        )?;
        let workflow_cache_hit_rate = GaugeVec::new(
            Opts::new(
                "vllm_workflow_cache_hit_rate",
                "Prefix-cache hit rate observed for a workflow",
            ),
            &["workflow_id"],
        )?;
        let agent_message_queue_size = IntGaugeVec::new(
            Opts::new(
                "vllm_agent_message_queue_size",
                "Messages waiting per agent queue",
            ),
            &["workflow_id", "agent_id"],
        )?;
        let messages_dropped_total = IntGaugeVec::new(
            Opts::new(
                "vllm_agent_messages_dropped_total",
                "Messages dropped by queue overflow",
            ),
            &["workflow_id"],
        )?;
        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "inferoute_request_duration_seconds",
                "End-to-end proxied request duration",
            )
            .buckets(vec![
                0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
            ]),
            &["url"],
        )?;
        let ttft_seconds = HistogramVec::new(
            HistogramOpts::new("inferoute_ttft_seconds", "Time to first response byte")
                .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["url"],
        )?;

        registry.register(Box::new(num_requests_waiting.clone()))?;
        registry.register(Box::new(num_incoming_requests_total.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(workflow_requests_total.clone()))?;
        registry.register(Box::new(workflow_cache_hit_rate.clone()))?;
        registry.register(Box::new(agent_message_queue_size.clone()))?;
        registry.register(Box::new(messages_dropped_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(ttft_seconds.clone()))?;

        Ok(Self {
            registry,
            num_requests_waiting,
            num_incoming_requests_total,
            requests_total,
            workflow_requests_total,
            workflow_cache_hit_rate,
            agent_message_queue_size,
            messages_dropped_total,
            request_duration_seconds,
            ttft_seconds,
        })
    }

    /// Render the exposition text for `GET /metrics`.
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
