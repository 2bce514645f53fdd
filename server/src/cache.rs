use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Cache key for a statement answered by one instance.
pub fn fingerprint(instance_id: &str, statement: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(instance_id.as_bytes());
    hasher.update(b":");
    hasher.update(statement.as_bytes());
    format!("{:x}", hasher.finalize())
}

struct CacheEntry {
    value: String,
    stored_at: Instant,
    last_used: u64,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    tick: u64,
}

/// Bounded LRU memo of generated answers with a fixed TTL.
pub struct ResponseCache {
    capacity: usize,
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            state: Mutex::new(CacheState { entries: HashMap::new(), tick: 0 }),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut state = self.state.lock();
        let expired = match state.entries.get(key) {
            None => return None,
            Some(entry) => entry.stored_at.elapsed() > self.ttl,
        };
        if expired {
            state.entries.remove(key);
            return None;
        }
        state.tick += 1;
        let tick = state.tick;
        let entry = state.entries.get_mut(key)?;
        entry.last_used = tick;
        Some(entry.value.clone())
    }

    pub fn put(&self, key: &str, value: String) {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        state
            .entries
            .insert(key.to_string(), CacheEntry { value, stored_at: Instant::now(), last_used: tick });
        while state.entries.len() > self.capacity {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    state.entries.remove(&k);
                }
                None => break,
            }
        }
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len();
        let ttl = self.ttl;
        state.entries.retain(|_, e| e.stored_at.elapsed() <= ttl);
        before - state.entries.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }
}

/// Per-(user, instance) rate limit on answered statements.
pub struct Cooldowns {
    window: Duration,
    last_seen: Mutex<HashMap<(String, String), Instant>>,
}

impl Cooldowns {
    pub fn new(window: Duration) -> Self {
        Self { window, last_seen: Mutex::new(HashMap::new()) }
    }

    /// True when the user may proceed; the attempt is recorded.
    pub fn try_acquire(&self, user_id: &str, instance_id: &str) -> bool {
        let now = Instant::now();
        let mut map = self.last_seen.lock();
        let key = (user_id.to_string(), instance_id.to_string());
        if let Some(last) = map.get(&key) {
            if now.duration_since(*last) < self.window {
                return false;
            }
        }
        map.insert(key, now);
        true
    }

    pub fn forget_instance(&self, instance_id: &str) {
        self.last_seen.lock().retain(|(_, inst), _| inst != instance_id);
    }

    pub fn prune(&self) {
        let window = self.window;
        self.last_seen.lock().retain(|_, last| last.elapsed() < window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_scoped_to_instance() {
        let a = fingerprint("I1", "is fire hot?");
        assert_eq!(a, fingerprint("I1", "is fire hot?"));
        assert_ne!(a, fingerprint("I2", "is fire hot?"));
        assert_eq!(a.len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_gone() {
        let cache = ResponseCache::new(10, Duration::from_secs(300));
        cache.put("k", "v".into());
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_only_expired() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        cache.put("old", "1".into());
        tokio::time::advance(Duration::from_secs(45)).await;
        cache.put("new", "2".into());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.prune(), 1);
        assert_eq!(cache.get("new").as_deref(), Some("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_least_recently_used() {
        let cache = ResponseCache::new(2, Duration::from_secs(300));
        cache.put("a", "1".into());
        cache.put("b", "2".into());
        assert!(cache.get("a").is_some());
        cache.put("c", "3".into());
        assert_eq!(cache.len(), 2);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_blocks_until_window_passes() {
        let cooldowns = Cooldowns::new(Duration::from_secs(5));
        assert!(cooldowns.try_acquire("u1", "I1"));
        assert!(!cooldowns.try_acquire("u1", "I1"));
        assert!(cooldowns.try_acquire("u1", "I2"));
        assert!(cooldowns.try_acquire("u2", "I1"));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cooldowns.try_acquire("u1", "I1"));
    }
}
