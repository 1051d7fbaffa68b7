use std::sync::Arc;
use std::sync::RwLock;

use arc_swap::ArcSwap;
use inferoute_types::{EndpointInfo, EndpointSnapshot};
use tracing::info;

/// Notified when an endpoint disappears from the registry so dependent state
/// (engine stats, workflow bindings) can be released.
pub trait RemovalListener: Send + Sync {
    fn on_endpoint_removed(&self, url: &str);
}

/// The current set of engine endpoints, readable without locks.
///
/// Discovery calls [`replace`](Self::replace) with the full new set; readers
/// hold an `Arc<EndpointSnapshot>` and never observe partial updates.
/// Listeners are registered once at startup, before any discovery runs.
pub struct EndpointRegistry {
    snapshot: ArcSwap<EndpointSnapshot>,
    listeners: RwLock<Vec<Arc<dyn RemovalListener>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(EndpointSnapshot::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> Arc<EndpointSnapshot> {
        self.snapshot.load_full()
    }

    pub fn subscribe_removals(&self, listener: Arc<dyn RemovalListener>) {
        self.listeners
            .write()
            .expect("removal listener lock poisoned")
            .push(listener);
    }

    /// Swap in a new endpoint set and notify listeners for every URL that
    /// was present before and is gone now. In-flight requests to removed
    /// endpoints are unaffected; they finish against the connection they
    /// already hold.
    pub fn replace(&self, endpoints: Vec<EndpointInfo>) {
        let next = Arc::new(EndpointSnapshot::new(endpoints));
        let prev = self.snapshot.swap(next.clone());

        let removed: Vec<&str> = prev.urls().filter(|url| !next.contains(url)).collect();
        let added = next.urls().filter(|url| !prev.contains(url)).count();

        if added > 0 || !removed.is_empty() {
            info!(
                total = next.len(),
                added,
                removed = removed.len(),
                "endpoint snapshot replaced"
            );
        }

        if !removed.is_empty() {
            let listeners = self
                .listeners
                .read()
                .expect("removal listener lock poisoned");
            for url in removed {
                for listener in listeners.iter() {
                    listener.on_endpoint_removed(url);
                }
            }
        }
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}
