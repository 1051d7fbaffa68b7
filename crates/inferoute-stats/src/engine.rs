use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use inferoute_discovery::EndpointRegistry;
use tracing::{debug, warn};

const SCRAPE_TIMEOUT: Duration = Duration::from_secs(5);

/// Last-known engine-side state for one endpoint.
///
/// A freshly discovered endpoint starts unknown (`last_scrape_at == None`)
/// and stays unselectable by stats-driven strategies until its first
/// successful scrape or dispatch. Scrape failures keep the previous values;
/// they never remove the endpoint.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub queue_len: f64,
    pub running: f64,
    pub gpu_cache_hit_rate: f64,
    pub gpu_mem_util: f64,
    pub last_scrape_at: Option<Instant>,
    pub last_scrape_ok: bool,
    pub scrape_failures: u64,
}

impl EngineStats {
    pub fn is_known(&self) -> bool {
        self.last_scrape_at.is_some()
    }
}

/// Values parsed out of one `/metrics` scrape.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScrapedStats {
    pub queue_len: f64,
    pub running: f64,
    pub gpu_cache_hit_rate: f64,
    pub gpu_mem_util: f64,
}

/// Atomically readable map of engine stats, swapped at sample granularity.
pub struct EngineStatsRegistry {
    inner: DashMap<String, EngineStats>,
}

impl EngineStatsRegistry {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    pub fn get(&self, url: &str) -> Option<EngineStats> {
        self.inner.get(url).map(|e| e.clone())
    }

    pub fn queue_len(&self, url: &str) -> Option<f64> {
        self.inner
            .get(url)
            .filter(|e| e.is_known())
            .map(|e| e.queue_len)
    }

    pub fn record_success(&self, url: &str, scraped: ScrapedStats) {
        let mut entry = self.inner.entry(url.to_string()).or_default();
        entry.queue_len = scraped.queue_len;
        entry.running = scraped.running;
        entry.gpu_cache_hit_rate = scraped.gpu_cache_hit_rate;
        entry.gpu_mem_util = scraped.gpu_mem_util;
        entry.last_scrape_at = Some(Instant::now());
        entry.last_scrape_ok = true;
    }

    pub fn record_failure(&self, url: &str) {
        let mut entry = self.inner.entry(url.to_string()).or_default();
        entry.last_scrape_ok = false;
        entry.scrape_failures += 1;
    }

    pub fn forget(&self, url: &str) {
        self.inner.remove(url);
    }

    pub fn snapshot(&self) -> Vec<(String, EngineStats)> {
        self.inner
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

impl Default for EngineStatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the vLLM gauges out of a Prometheus text exposition. Series are
/// summed across label sets so per-model breakdowns still aggregate to one
/// engine-level number.
pub fn parse_engine_metrics(text: &str) -> ScrapedStats {
    let mut scraped = ScrapedStats::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let name_end = line
            .find(|c: char| c == '{' || c.is_whitespace())
            .unwrap_or(line.len());
        let name = &line[..name_end];
        let slot = match name {
            "vllm:num_requests_waiting" => &mut scraped.queue_len,
            "vllm:num_requests_running" => &mut scraped.running,
            "vllm:gpu_prefix_cache_hit_rate" => &mut scraped.gpu_cache_hit_rate,
            "vllm:gpu_cache_usage_perc" => &mut scraped.gpu_mem_util,
            _ => continue,
        };
        if let Some(value) = line
            .rsplit(|c: char| c.is_whitespace())
            .next()
            .and_then(|v| v.parse::<f64>().ok())
        {
            *slot += value;
        }
    }
    scraped
}

/// Background task scraping `/metrics` from every registered endpoint at
/// `engine_stats_interval`.
pub struct EngineStatsPoller {
    registry: Arc<EndpointRegistry>,
    stats: Arc<EngineStatsRegistry>,
    client: reqwest::Client,
    interval: Duration,
}

impl EngineStatsPoller {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        stats: Arc<EngineStatsRegistry>,
        client: reqwest::Client,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            stats,
            client,
            interval,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.poll_once().await;
            }
        })
    }

    pub async fn poll_once(&self) {
        let snapshot = self.registry.snapshot();
        let scrapes = snapshot.iter().map(|ep| {
            let client = self.client.clone();
            let url = ep.url.clone();
            async move {
                let result = client
                    .get(format!("{}/metrics", url.trim_end_matches('/')))
                    .timeout(SCRAPE_TIMEOUT)
                    .send()
                    .await;
                match result {
                    Ok(resp) if resp.status().is_success() => match resp.text().await {
                        Ok(body) => (url, Some(parse_engine_metrics(&body))),
                        Err(e) => {
                            debug!(url = %url, error = %e, "engine metrics body read failed");
                            (url, None)
                        }
                    },
                    Ok(resp) => {
                        debug!(url = %url, status = %resp.status(), "engine metrics scrape rejected");
                        (url, None)
                    }
                    Err(e) => {
                        debug!(url = %url, error = %e, "engine metrics scrape failed");
                        (url, None)
                    }
                }
            }
        });

        let mut failures = 0usize;
        for (url, scraped) in futures::future::join_all(scrapes).await {
            match scraped {
                Some(scraped) => self.stats.record_success(&url, scraped),
                None => {
                    failures += 1;
                    self.stats.record_failure(&url);
                }
            }
        }
        if failures > 0 {
            warn!(failures, total = snapshot.len(), "engine stats poll had failures");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inferoute_types::EndpointInfo;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parses_vllm_gauges() {
        let text = "\
# HELP vllm:num_requests_waiting Number of requests waiting\n\
# TYPE vllm:num_requests_waiting gauge\n\
vllm:num_requests_waiting{model_name=\"llama\"} 3.0\n\
vllm:num_requests_running{model_name=\"llama\"} 2.0\n\
vllm:gpu_cache_usage_perc{model_name=\"llama\"} 0.41\n\
vllm:gpu_prefix_cache_hit_rate{model_name=\"llama\"} 0.85\n\
some_other_metric 99\n";
        let scraped = parse_engine_metrics(text);
        assert_eq!(scraped.queue_len, 3.0);
        assert_eq!(scraped.running, 2.0);
        assert_eq!(scraped.gpu_mem_util, 0.41);
        assert_eq!(scraped.gpu_cache_hit_rate, 0.85);
    }

    #[test]
    fn sums_across_label_sets() {
        let text = "\
vllm:num_requests_waiting{model_name=\"a\"} 1\n\
vllm:num_requests_waiting{model_name=\"b\"} 2\n";
        assert_eq!(parse_engine_metrics(text).queue_len, 3.0);
    }

    #[test]
    fn endpoint_unknown_until_first_scrape() {
        let stats = EngineStatsRegistry::new();
        assert!(stats.queue_len("http://a:8000").is_none());
        stats.record_failure("http://a:8000");
        // A failed scrape still does not make the endpoint known.
        assert!(stats.queue_len("http://a:8000").is_none());
        stats.record_success("http://a:8000", ScrapedStats::default());
        assert_eq!(stats.queue_len("http://a:8000"), Some(0.0));
    }

    #[test]
    fn failure_keeps_last_known_values() {
        let stats = EngineStatsRegistry::new();
        stats.record_success(
            "http://a:8000",
            ScrapedStats {
                queue_len: 7.0,
                ..Default::default()
            },
        );
        stats.record_failure("http://a:8000");
        let entry = stats.get("http://a:8000").unwrap();
        assert_eq!(entry.queue_len, 7.0);
        assert!(!entry.last_scrape_ok);
        assert_eq!(entry.scrape_failures, 1);
    }

    #[tokio::test]
    async fn poll_scrapes_all_registered_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metrics"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("vllm:num_requests_waiting 4\n"),
            )
            .mount(&server)
            .await;

        let registry = Arc::new(EndpointRegistry::new());
        registry.replace(vec![EndpointInfo::new(server.uri(), "llama")]);

        let stats = Arc::new(EngineStatsRegistry::new());
        let poller = EngineStatsPoller::new(
            registry,
            stats.clone(),
            reqwest::Client::new(),
            Duration::from_secs(10),
        );
        poller.poll_once().await;

        assert_eq!(stats.queue_len(&server.uri()), Some(4.0));
    }

    #[tokio::test]
    async fn scrape_failure_marks_not_ok_but_keeps_endpoint() {
        let registry = Arc::new(EndpointRegistry::new());
        registry.replace(vec![EndpointInfo::new("http://127.0.0.1:1", "llama")]);

        let stats = Arc::new(EngineStatsRegistry::new());
        let poller = EngineStatsPoller::new(
            registry,
            stats.clone(),
            reqwest::Client::new(),
            Duration::from_secs(10),
        );
        poller.poll_once().await;

        let entry = stats.get("http://127.0.0.1:1").unwrap();
        assert!(!entry.last_scrape_ok);
        assert!(entry.scrape_failures >= 1);
    }
}
