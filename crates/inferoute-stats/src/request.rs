use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
// tokio's Instant so the sliding windows follow the test clock under
// `tokio::time::pause`.
use tokio::time::Instant;

/// Smoothing factor for the EWMA fast path.
const EWMA_ALPHA: f64 = 0.3;

/// Count-bounded window of completion durations used by time-tracking
/// scoring, independent of the time window.
const RECENT_DURATIONS: usize = 100;

/// Live request statistics for one endpoint over a sliding time window.
///
/// Updated by the dispatcher at dispatch start, first token, each chunk, and
/// termination. Samples older than the window are pruned lazily on access.
#[derive(Default)]
struct Windows {
    starts: VecDeque<Instant>,
    ttft: VecDeque<(Instant, f64)>,
    itl: VecDeque<(Instant, f64)>,
    durations: VecDeque<(Instant, f64)>,
    throughput: VecDeque<(Instant, f64)>,
    recent_durations: VecDeque<f64>,
    ttft_ewma: Option<f64>,
    completion_ewma: Option<f64>,
    completed: u64,
    dispatched: u64,
}

struct EndpointRequestStats {
    in_flight: AtomicI64,
    windows: Mutex<Windows>,
}

impl EndpointRequestStats {
    fn new() -> Self {
        Self {
            in_flight: AtomicI64::new(0),
            windows: Mutex::new(Windows::default()),
        }
    }
}

/// Read-only view of an endpoint's request stats, cheap to copy into
/// strategy scoring.
#[derive(Debug, Clone, Default)]
pub struct RequestStatsView {
    /// False until the endpoint has seen its first dispatch; strategies that
    /// score by latency treat unknown endpoints as score 0 to explore them.
    pub known: bool,
    pub qps: f64,
    pub in_flight: i64,
    pub ttft_ewma: f64,
    pub ttft_mean: f64,
    pub itl_mean: f64,
    pub mean_completion: f64,
    pub ewma_completion: f64,
    pub stddev_completion: f64,
    pub tokens_per_second: f64,
    pub completed: u64,
}

/// Per-endpoint request statistics registry.
pub struct RequestStatsRegistry {
    window: Duration,
    inner: DashMap<String, Arc<EndpointRequestStats>>,
}

impl RequestStatsRegistry {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: DashMap::new(),
        }
    }

    fn entry(&self, url: &str) -> Arc<EndpointRequestStats> {
        self.inner
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(EndpointRequestStats::new()))
            .clone()
    }

    /// Called at dispatch. Increments in-flight; the matching decrement
    /// happens exactly once in [`complete`](Self::complete).
    pub fn begin(&self, url: &str) {
        let entry = self.entry(url);
        entry.in_flight.fetch_add(1, Ordering::AcqRel);
        let mut w = entry.windows.lock().expect("stats lock poisoned");
        w.starts.push_back(Instant::now());
        w.dispatched += 1;
        prune(&mut w, self.window);
    }

    pub fn record_ttft(&self, url: &str, seconds: f64) {
        let entry = self.entry(url);
        let mut w = entry.windows.lock().expect("stats lock poisoned");
        w.ttft.push_back((Instant::now(), seconds));
        w.ttft_ewma = Some(match w.ttft_ewma {
            Some(prev) => EWMA_ALPHA * seconds + (1.0 - EWMA_ALPHA) * prev,
            None => seconds,
        });
        prune(&mut w, self.window);
    }

    pub fn record_itl(&self, url: &str, seconds: f64) {
        let entry = self.entry(url);
        let mut w = entry.windows.lock().expect("stats lock poisoned");
        w.itl.push_back((Instant::now(), seconds));
        prune(&mut w, self.window);
    }

    /// Terminal accounting for one request, success or not. Decrements
    /// in-flight; failed requests still contribute their duration so a
    /// struggling endpoint does not look idle.
    pub fn complete(&self, url: &str, duration: Duration, tokens_out: u64, _success: bool) {
        let entry = self.entry(url);
        let prev = entry.in_flight.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            entry.in_flight.fetch_add(1, Ordering::AcqRel);
        }

        let secs = duration.as_secs_f64();
        let now = Instant::now();
        let mut w = entry.windows.lock().expect("stats lock poisoned");
        w.durations.push_back((now, secs));
        w.recent_durations.push_back(secs);
        while w.recent_durations.len() > RECENT_DURATIONS {
            w.recent_durations.pop_front();
        }
        if secs > 0.0 && tokens_out > 0 {
            w.throughput.push_back((now, tokens_out as f64 / secs));
        }
        w.completion_ewma = Some(match w.completion_ewma {
            Some(prev) => EWMA_ALPHA * secs + (1.0 - EWMA_ALPHA) * prev,
            None => secs,
        });
        w.completed += 1;
        prune(&mut w, self.window);
    }

    pub fn in_flight(&self, url: &str) -> i64 {
        self.inner
            .get(url)
            .map(|e| e.in_flight.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn view(&self, url: &str) -> RequestStatsView {
        let Some(entry) = self.inner.get(url).map(|e| e.clone()) else {
            return RequestStatsView::default();
        };
        let in_flight = entry.in_flight.load(Ordering::Acquire);
        let mut w = entry.windows.lock().expect("stats lock poisoned");
        prune(&mut w, self.window);

        let (mean_completion, stddev_completion) = mean_stddev(w.durations.iter().map(|s| s.1));
        RequestStatsView {
            known: w.dispatched > 0,
            qps: w.starts.len() as f64 / self.window.as_secs_f64().max(f64::EPSILON),
            in_flight,
            ttft_ewma: w.ttft_ewma.unwrap_or(0.0),
            ttft_mean: mean(w.ttft.iter().map(|s| s.1)),
            itl_mean: mean(w.itl.iter().map(|s| s.1)),
            mean_completion,
            ewma_completion: w.completion_ewma.unwrap_or(0.0),
            stddev_completion,
            tokens_per_second: mean(w.throughput.iter().map(|s| s.1)),
            completed: w.completed,
        }
    }

    /// Mean and stddev over the last `n` completion durations regardless of
    /// the time window. Returns `None` until at least one completion exists.
    pub fn completion_stats_last(&self, url: &str, n: usize) -> Option<(f64, f64)> {
        let entry = self.inner.get(url)?.clone();
        let w = entry.windows.lock().expect("stats lock poisoned");
        if w.recent_durations.is_empty() {
            return None;
        }
        let tail = w.recent_durations.len().min(n);
        let start = w.recent_durations.len() - tail;
        Some(mean_stddev(
            w.recent_durations.iter().skip(start).copied(),
        ))
    }

    pub fn forget(&self, url: &str) {
        self.inner.remove(url);
    }

    /// Requests currently in flight across all endpoints; zero means the
    /// process is drained.
    pub fn total_in_flight(&self) -> i64 {
        self.inner
            .iter()
            .map(|e| e.in_flight.load(Ordering::Acquire))
            .sum()
    }

    pub fn urls(&self) -> Vec<String> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }
}

fn prune(w: &mut Windows, window: Duration) {
    let Some(cutoff) = Instant::now().checked_sub(window) else {
        return;
    };
    while w.starts.front().is_some_and(|t| *t < cutoff) {
        w.starts.pop_front();
    }
    for deque in [&mut w.ttft, &mut w.itl, &mut w.durations, &mut w.throughput] {
        while deque.front().is_some_and(|(t, _)| *t < cutoff) {
            deque.pop_front();
        }
    }
}

fn mean(samples: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for s in samples {
        sum += s;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn mean_stddev(samples: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let m = mean(samples.clone());
    let mut sq = 0.0;
    let mut count = 0usize;
    for s in samples {
        sq += (s - m) * (s - m);
        count += 1;
    }
    if count == 0 {
        (0.0, 0.0)
    } else {
        (m, (sq / count as f64).sqrt())
    }
}
