//! In-memory idempotency cache for Confirm.
//!
//! Keyed by `(teamSlug, idempotencyKey)`, holding the exact serialized
//! response of the first successful call so replays are byte-equal.
//! Sharded to keep lock contention away from the hot path; entries expire
//! after the configured TTL (24 h by default).

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

const SHARD_COUNT: usize = 16;
const SHARD_CLEANUP_WATERMARK: usize = 10_000;

type Shard = RwLock<HashMap<(String, String), (String, Instant)>>;

pub struct IdempotencyCache {
    shards: Vec<Shard>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        IdempotencyCache {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            ttl,
        }
    }

    fn shard(&self, key: &(String, String)) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    pub fn get(&self, team_slug: &str, idempotency_key: &str) -> Option<String> {
        let key = (s!(team_slug), s!(idempotency_key));
        let shard = self.shard(&key);
        {
            let map = shard.read();
            match map.get(&key) {
                Some((response, stored_at)) if stored_at.elapsed() < self.ttl => {
                    return Some(response.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // stale entry: drop it on the slow path
        shard.write().remove(&key);
        None
    }

    pub fn put(&self, team_slug: &str, idempotency_key: &str, response: String) {
        let key = (s!(team_slug), s!(idempotency_key));
        let shard = self.shard(&key);
        let mut map = shard.write();
        if map.len() > SHARD_CLEANUP_WATERMARK {
            let ttl = self.ttl;
            map.retain(|_, (_, stored_at)| stored_at.elapsed() < ttl);
        }
        map.insert(key, (response, Instant::now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn replay_returns_the_stored_bytes() {
        let cache = IdempotencyCache::new(Duration::from_secs(60));
        let body = s!(r#"{"success":true,"paymentId":"1"}"#);
        cache.put("demo-team", "key-1", body.clone());
        assert_eq!(cache.get("demo-team", "key-1"), Some(body));
        assert_eq!(cache.get("demo-team", "key-2"), None);
        assert_eq!(cache.get("other-team", "key-1"), None);
    }

    #[test]
    fn entries_expire() {
        let cache = IdempotencyCache::new(Duration::from_millis(10));
        cache.put("demo-team", "key-1", s!("cached"));
        sleep(Duration::from_millis(25));
        assert_eq!(cache.get("demo-team", "key-1"), None);
    }

    #[test]
    fn overwrite_keeps_the_latest_response() {
        let cache = IdempotencyCache::new(Duration::from_secs(60));
        cache.put("demo-team", "key-1", s!("first"));
        cache.put("demo-team", "key-1", s!("second"));
        assert_eq!(cache.get("demo-team", "key-1"), Some(s!("second")));
    }
}
