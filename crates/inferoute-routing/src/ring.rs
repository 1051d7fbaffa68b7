use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Virtual nodes per endpoint. More points smooth the key distribution and
/// shrink the share of keys that move when the endpoint set changes.
pub const DEFAULT_VNODES: usize = 128;

fn hash64(value: impl Hash) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Consistent-hash ring over a candidate list.
///
/// Built per routing decision from the filtered candidate set; construction
/// is deterministic, so the same URL set always yields the same ring and a
/// key keeps its endpoint until that endpoint disappears.
pub struct HashRing {
    /// (ring position, candidate index), sorted by position.
    points: Vec<(u64, usize)>,
}

impl HashRing {
    pub fn new(urls: &[&str], vnodes: usize) -> Self {
        let mut points = Vec::with_capacity(urls.len() * vnodes);
        for (index, url) in urls.iter().enumerate() {
            for vnode in 0..vnodes {
                points.push((hash64((url, vnode)), index));
            }
        }
        points.sort_unstable();
        Self { points }
    }

    /// Index of the candidate owning `key`: the first ring point at or after
    /// the key's hash, wrapping to the start.
    pub fn pick(&self, key: &str) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let h = hash64(key);
        let at = self.points.partition_point(|(p, _)| *p < h);
        let (_, index) = self.points[at % self.points.len()];
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn same_key_same_endpoint() {
        let urls = ["http://a:8000", "http://b:8000", "http://c:8000"];
        let ring = HashRing::new(&urls, DEFAULT_VNODES);
        let first = ring.pick("user-42").unwrap();
        for _ in 0..10 {
            assert_eq!(ring.pick("user-42").unwrap(), first);
        }
    }

    #[test]
    fn empty_ring_picks_nothing() {
        let ring = HashRing::new(&[], DEFAULT_VNODES);
        assert_eq!(ring.pick("anything"), None);
    }

    #[test]
    fn keys_spread_over_endpoints() {
        let urls = ["http://a:8000", "http://b:8000", "http://c:8000"];
        let ring = HashRing::new(&urls, DEFAULT_VNODES);
        let mut counts = [0usize; 3];
        for i in 0..3000 {
            counts[ring.pick(&format!("key-{i}")).unwrap()] += 1;
        }
        for count in counts {
            // With 128 vnodes the split should be roughly even; allow wide
            // slack so the test is not distribution-sensitive.
            assert!(count > 300, "unbalanced ring: {counts:?}");
        }
    }

    proptest! {
        /// Removing one endpoint only remaps the keys that were mapped to
        /// it; every other key keeps its endpoint.
        #[test]
        fn removal_only_remaps_lost_keys(
            keys in proptest::collection::vec("[a-z0-9]{1,16}", 1..200),
            removed_index in 0usize..4,
        ) {
            let urls = ["http://a:8000", "http://b:8000", "http://c:8000", "http://d:8000"];
            let full = HashRing::new(&urls, DEFAULT_VNODES);

            let survivors: Vec<&str> = urls
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != removed_index)
                .map(|(_, u)| *u)
                .collect();
            let reduced = HashRing::new(&survivors, DEFAULT_VNODES);

            let before: HashMap<&String, &str> = keys
                .iter()
                .map(|k| (k, urls[full.pick(k).unwrap()]))
                .collect();
            for key in &keys {
                let after = survivors[reduced.pick(key).unwrap()];
                let prior = before[key];
                if prior != urls[removed_index] {
                    prop_assert_eq!(after, prior, "key {} moved unnecessarily", key);
                }
            }
        }
    }
}
