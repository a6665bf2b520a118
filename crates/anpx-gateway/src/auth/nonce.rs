//! One-shot nonce cache for DID-WBA replay protection.
//!
//! A nonce may be presented once within the sliding window; entries expire
//! after the window plus a small grace and the cache is bounded.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Extra lifetime beyond the window before a used nonce is forgotten.
const EXPIRY_GRACE: Duration = Duration::from_secs(30);

/// Bounded map of used nonces.
#[derive(Debug)]
pub struct NonceCache {
    entries: Mutex<HashMap<String, Instant>>,
    window: Duration,
    max_entries: usize,
}

impl NonceCache {
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            window,
            max_entries,
        }
    }

    /// Mark a nonce as used. Returns `false` when it was already used
    /// within the window.
    pub fn try_use(&self, nonce: &str) -> bool {
        let mut entries = self.entries.lock().expect("nonce lock");
        let now = Instant::now();
        let ttl = self.window + EXPIRY_GRACE;

        if let Some(&used_at) = entries.get(nonce) {
            if now.duration_since(used_at) <= ttl {
                return false;
            }
        }

        if entries.len() >= self.max_entries {
            entries.retain(|_, used_at| now.duration_since(*used_at) <= ttl);
            // Still saturated after expiry: drop the oldest entries to
            // stay bounded.
            while entries.len() >= self.max_entries {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, used_at)| **used_at)
                    .map(|(n, _)| n.clone())
                {
                    entries.remove(&oldest);
                } else {
                    break;
                }
            }
        }

        entries.insert(nonce.to_string(), now);
        true
    }

    /// Drop expired entries.
    pub fn sweep(&self) {
        let mut entries = self.entries.lock().expect("nonce lock");
        let before = entries.len();
        let now = Instant::now();
        let ttl = self.window + EXPIRY_GRACE;
        entries.retain(|_, used_at| now.duration_since(*used_at) <= ttl);
        if entries.len() < before {
            debug!(removed = before - entries.len(), "swept expired nonces");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("nonce lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_single_use() {
        let cache = NonceCache::new(Duration::from_secs(300), 1000);
        assert!(cache.try_use("n1"));
        assert!(!cache.try_use("n1"));
        assert!(cache.try_use("n2"));
    }

    #[test]
    fn cache_stays_bounded() {
        let cache = NonceCache::new(Duration::from_secs(300), 4);
        for i in 0..20 {
            assert!(cache.try_use(&format!("n{i}")));
        }
        assert!(cache.len() <= 4);
    }

    #[test]
    fn sweep_with_zero_window_is_harmless() {
        let cache = NonceCache::new(Duration::from_secs(300), 100);
        cache.try_use("n1");
        cache.sweep();
        assert_eq!(cache.len(), 1);
    }
}
