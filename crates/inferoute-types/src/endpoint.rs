use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single engine endpoint as produced by service discovery.
///
/// Endpoints are immutable once published: discovery replaces the whole
/// snapshot instead of mutating entries in place, so readers never observe a
/// partially updated endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Base URL of the engine, e.g. `http://10.0.0.4:8000`.
    pub url: String,
    /// Primary model label reported by discovery.
    pub model_label: String,
    /// Every model name this engine serves.
    pub model_names: BTreeSet<String>,
    /// When discovery first saw this endpoint.
    pub added_at: DateTime<Utc>,
    /// Free-form tags, e.g. `prefill`, `decoding`, `transcription`.
    pub tags: BTreeSet<String>,
    /// Opaque discovery metadata (pod name, namespace, ...).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl EndpointInfo {
    pub fn new(url: impl Into<String>, model_label: impl Into<String>) -> Self {
        let model_label = model_label.into();
        let mut model_names = BTreeSet::new();
        model_names.insert(model_label.clone());
        Self {
            url: url.into(),
            model_label,
            model_names,
            added_at: Utc::now(),
            tags: BTreeSet::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.model_names.extend(models.into_iter().map(Into::into));
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn serves_model(&self, model: &str) -> bool {
        self.model_names.contains(model)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// Immutable, sorted view of the current endpoint set.
///
/// Built once per discovery event and shared behind an `Arc`; the registry
/// swaps snapshots atomically so the hot path never takes a lock. Endpoints
/// are unique by URL (first occurrence wins) and kept in lexicographic URL
/// order, which doubles as the stable tie-break order for every routing
/// strategy.
#[derive(Debug, Default, Clone)]
pub struct EndpointSnapshot {
    endpoints: Vec<EndpointInfo>,
    fingerprint: u64,
}

impl EndpointSnapshot {
    pub fn new(mut endpoints: Vec<EndpointInfo>) -> Self {
        endpoints.sort_by(|a, b| a.url.cmp(&b.url));
        endpoints.dedup_by(|b, a| a.url == b.url);

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for ep in &endpoints {
            ep.url.hash(&mut hasher);
        }
        let fingerprint = hasher.finish();

        Self {
            endpoints,
            fingerprint,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointInfo> {
        self.endpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn get(&self, url: &str) -> Option<&EndpointInfo> {
        self.endpoints
            .binary_search_by(|ep| ep.url.as_str().cmp(url))
            .ok()
            .map(|i| &self.endpoints[i])
    }

    pub fn contains(&self, url: &str) -> bool {
        self.get(url).is_some()
    }

    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.endpoints.iter().map(|ep| ep.url.as_str())
    }

    /// Hash of the sorted URL set. Strategies that keep cursors reset them
    /// when this changes.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Union of all model names across endpoints, for `GET /v1/models`.
    pub fn model_names(&self) -> BTreeSet<&str> {
        self.endpoints
            .iter()
            .flat_map(|ep| ep.model_names.iter().map(String::as_str))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_sorts_and_dedupes_by_url() {
        let snap = EndpointSnapshot::new(vec![
            EndpointInfo::new("http://b:8000", "llama"),
            EndpointInfo::new("http://a:8000", "llama"),
            EndpointInfo::new("http://b:8000", "qwen"),
        ]);
        let urls: Vec<&str> = snap.urls().collect();
        assert_eq!(urls, vec!["http://a:8000", "http://b:8000"]);
        // First occurrence wins on duplicate URLs.
        assert!(snap.get("http://b:8000").unwrap().serves_model("llama"));
    }

    #[test]
    fn fingerprint_tracks_url_set_only() {
        let a = EndpointSnapshot::new(vec![
            EndpointInfo::new("http://a:8000", "llama"),
            EndpointInfo::new("http://b:8000", "llama"),
        ]);
        let b = EndpointSnapshot::new(vec![
            EndpointInfo::new("http://b:8000", "qwen"),
            EndpointInfo::new("http://a:8000", "qwen"),
        ]);
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = EndpointSnapshot::new(vec![EndpointInfo::new("http://a:8000", "llama")]);
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn model_union() {
        let snap = EndpointSnapshot::new(vec![
            EndpointInfo::new("http://a:8000", "llama").with_models(["vicuna"]),
            EndpointInfo::new("http://b:8000", "qwen"),
        ]);
        let models: Vec<&str> = snap.model_names().into_iter().collect();
        assert_eq!(models, vec!["llama", "qwen", "vicuna"]);
    }
}
