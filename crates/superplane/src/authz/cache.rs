use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Request {
    subject: String,
    domain: String,
    resource: String,
    action: String,
}

/// Memoized authorization decisions.
///
/// Bounded: once `capacity` entries are held the whole cache is dropped
/// rather than tracking recency. Mutations invalidate per domain, since every
/// rule belongs to exactly one domain.
#[derive(Debug)]
pub(crate) struct DecisionCache {
    entries: DashMap<Request, bool>,
    capacity: usize,
    enabled: AtomicBool,
}

impl DecisionCache {
    pub(crate) fn new(capacity: usize, enabled: bool) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            enabled: AtomicBool::new(enabled),
        }
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.entries.clear();
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn get(&self, subject: &str, domain: &str, resource: &str, action: &str) -> Option<bool> {
        if !self.is_enabled() {
            return None;
        }
        self.entries
            .get(&request(subject, domain, resource, action))
            .map(|entry| *entry.value())
    }

    pub(crate) fn put(&self, subject: &str, domain: &str, resource: &str, action: &str, allowed: bool) {
        if !self.is_enabled() || self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.entries.clear();
        }
        self.entries
            .insert(request(subject, domain, resource, action), allowed);
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }

    pub(crate) fn invalidate_domain(&self, domain: &str) {
        self.entries.retain(|key, _| key.domain != domain);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn request(subject: &str, domain: &str, resource: &str, action: &str) -> Request {
    Request {
        subject: subject.to_string(),
        domain: domain.to_string(),
        resource: resource.to_string(),
        action: action.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidation_is_scoped_to_domain() {
        let cache = DecisionCache::new(16, true);
        cache.put("user:a", "org:1", "canvas", "read", true);
        cache.put("user:a", "org:2", "canvas", "read", false);

        cache.invalidate_domain("org:1");

        assert_eq!(cache.get("user:a", "org:1", "canvas", "read"), None);
        assert_eq!(cache.get("user:a", "org:2", "canvas", "read"), Some(false));
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = DecisionCache::new(16, false);
        cache.put("user:a", "org:1", "canvas", "read", true);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.get("user:a", "org:1", "canvas", "read"), None);
    }

    #[test]
    fn full_cache_is_reset() {
        let cache = DecisionCache::new(2, true);
        cache.put("user:a", "org:1", "x", "read", true);
        cache.put("user:b", "org:1", "x", "read", true);
        cache.put("user:c", "org:1", "x", "read", true);
        assert_eq!(cache.len(), 1);
    }
}
