//! TTL-bounded response cache for service calls.
//!
//! Keys combine method, endpoint, and the sorted query string so that two
//! requests differing only in parameter order share an entry. Expired
//! entries are dropped lazily on read; total size is governed by TTLs.

use crate::provider::{ServiceRequest, ServiceResponse};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheEntry {
    response: ServiceResponse,
    expires_at: Instant,
}

/// An in-memory response cache shared by all providers in a registry.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the cache key for a request.
    #[must_use]
    pub fn key_for(request: &ServiceRequest) -> String {
        // BTreeMap iteration is already sorted by key.
        let query: Vec<String> = request
            .params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!("{}:{}?{}", request.method, request.endpoint, query.join("&"))
    }

    /// Looks up a fresh entry, dropping it if expired.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<ServiceResponse> {
        {
            let entries = self.entries.read().expect("cache lock");
            match entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    let mut response = entry.response.clone();
                    response.from_cache = true;
                    return Some(response);
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: drop it under the write lock.
        self.entries.write().expect("cache lock").remove(key);
        None
    }

    /// Stores a response under the key for `ttl`.
    pub fn put(&self, key: impl Into<String>, response: ServiceResponse, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let entry = CacheEntry {
            response,
            expires_at: Instant::now() + ttl,
        };
        self.entries
            .write()
            .expect("cache lock")
            .insert(key.into(), entry);
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.write().expect("cache lock").clear();
    }

    /// Returns the number of live and expired entries still held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock").len()
    }

    /// Returns true when no entries are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().expect("cache lock").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response() -> ServiceResponse {
        ServiceResponse {
            status: 200,
            body: json!({"ok": true}),
            headers: HashMap::new(),
            duration: Duration::from_millis(5),
            from_cache: false,
        }
    }

    #[test]
    fn key_sorts_params() {
        let a = ServiceRequest::new("s", "https://api", "GET")
            .with_param("b", "2")
            .with_param("a", "1");
        let b = ServiceRequest::new("s", "https://api", "GET")
            .with_param("a", "1")
            .with_param("b", "2");
        assert_eq!(ResponseCache::key_for(&a), ResponseCache::key_for(&b));
        assert_eq!(ResponseCache::key_for(&a), "GET:https://api?a=1&b=2");
    }

    #[test]
    fn hit_marks_from_cache() {
        let cache = ResponseCache::new();
        cache.put("k", response(), Duration::from_secs(60));

        let hit = cache.get("k").expect("hit");
        assert!(hit.from_cache);
        assert_eq!(hit.status, 200);
    }

    #[test]
    fn expired_entries_drop_on_read() {
        let cache = ResponseCache::new();
        cache.put("k", response(), Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(10));

        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_ttl_is_not_stored() {
        let cache = ResponseCache::new();
        cache.put("k", response(), Duration::ZERO);
        assert!(cache.is_empty());
    }
}
