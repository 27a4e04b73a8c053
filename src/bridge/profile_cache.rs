//! Bounded, time-aware memoization of resolved ghost user profiles.
//!
//! Entries expire a fixed time after insertion no matter how often they are
//! read; reads only refresh their position in the least-recently-used order.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedProfile {
    pub matrix_user_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

struct CacheEntry {
    profile: CachedProfile,
    inserted_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.inserted_at) >= ttl
    }
}

pub struct ProfileCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
}

impl ProfileCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, remote_user_id: &str) -> Option<CachedProfile> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get(remote_user_id) {
            Some(entry) if !entry.is_expired(now, self.ttl) => return Some(entry.profile.clone()),
            Some(_) => {}
            None => return None,
        }

        entries.pop(remote_user_id);
        None
    }

    pub fn insert(&self, remote_user_id: &str, profile: CachedProfile) {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        while entries
            .peek_lru()
            .is_some_and(|(_, entry)| entry.is_expired(now, self.ttl))
        {
            entries.pop_lru();
        }

        entries.put(
            remote_user_id.to_string(),
            CacheEntry {
                profile,
                inserted_at: now,
            },
        );
    }

    pub fn invalidate(&self, remote_user_id: &str) {
        self.entries.lock().pop(remote_user_id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
