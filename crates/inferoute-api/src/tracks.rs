use std::time::Duration;

use dashmap::DashMap;
use inferoute_types::RequestTrack;

/// Terminal tracks are kept this long so a decode request can still find its
/// parent's prefill endpoint for the `x-prefill-by` header.
const RETENTION: Duration = Duration::from_secs(300);

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// In-memory store of per-request tracking records.
pub struct TrackStore {
    inner: DashMap<String, RequestTrack>,
}

impl TrackStore {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    pub fn insert(&self, track: RequestTrack) {
        self.inner.insert(track.request_id.clone(), track);
    }

    /// Mutate a track in place under its shard lock.
    pub fn with_mut(&self, request_id: &str, f: impl FnOnce(&mut RequestTrack)) {
        if let Some(mut entry) = self.inner.get_mut(request_id) {
            f(&mut entry);
        }
    }

    pub fn get(&self, request_id: &str) -> Option<RequestTrack> {
        self.inner.get(request_id).map(|t| t.clone())
    }

    /// The prefill endpoint a decode request inherits from its parent.
    pub fn prefill_endpoint_of(&self, parent_request_id: &str) -> Option<String> {
        self.inner
            .get(parent_request_id)
            .and_then(|track| track.prefill_endpoint.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drop terminal tracks past retention.
    pub fn sweep(&self) {
        self.inner.retain(|_, track| {
            !(track.state.is_terminal()
                && track
                    .finished_at
                    .is_some_and(|at| at.elapsed() > RETENTION))
        });
    }

    pub fn spawn_sweeper(self: &std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep();
            }
        })
    }
}

impl Default for TrackStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inferoute_types::{RequestPhase, RequestState};

    #[test]
    fn parent_prefill_endpoint_lookup() {
        let store = TrackStore::new();
        let mut parent = RequestTrack::new("req-1", RequestPhase::Prefill);
        parent.prefill_endpoint = Some("http://p1:8000".to_string());
        store.insert(parent);

        assert_eq!(
            store.prefill_endpoint_of("req-1").as_deref(),
            Some("http://p1:8000")
        );
        assert!(store.prefill_endpoint_of("req-unknown").is_none());
    }

    #[test]
    fn sweep_keeps_live_tracks() {
        let store = TrackStore::new();
        let mut live = RequestTrack::new("req-live", RequestPhase::Prefill);
        live.advance(RequestState::Routed);
        store.insert(live);
        store.sweep();
        assert_eq!(store.len(), 1);
    }
}
