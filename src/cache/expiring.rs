//! A concurrent key/value store with per-entry expiry.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Time-to-live of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// The entry never expires.
    Infinite,
    /// The entry expires once this much time has passed since insertion.
    Finite(Duration),
}

impl Ttl {
    fn expiry_from(self, now: Instant) -> Option<Instant> {
        match self {
            Self::Infinite => None,
            // Out-of-range durations are as good as infinite.
            Self::Finite(ttl) => now.checked_add(ttl),
        }
    }
}

impl From<Duration> for Ttl {
    fn from(ttl: Duration) -> Self {
        Self::Finite(ttl)
    }
}

/// Operations shared by every cache in the crate.
///
/// No operation fails: a missing or expired key is simply absent.
pub trait Cache<K, V>: Send + Sync {
    /// Insert or overwrite `key`, expiring after `ttl`.
    fn put(&self, key: K, value: V, ttl: Ttl);

    /// Insert with the key's TTL override, or the cache-wide default.
    fn put_default(&self, key: K, value: V);

    /// Set the TTL [`Cache::put_default`] uses for one key.
    fn set_default_ttl(&self, key: K, ttl: Ttl);

    /// The live value for `key`. Reading an expired entry removes it.
    fn get(&self, key: &K) -> Option<V>;

    /// Whether `key` holds a live value.
    fn contains(&self, key: &K) -> bool;

    /// Remove `key`, expired or not. Returns whether it was present.
    fn remove(&self, key: &K) -> bool;

    /// Drop every entry.
    fn clear(&self);

    /// Drop every expired entry, returning how many were dropped.
    fn clean(&self) -> usize;

    /// Number of entries, counting expired ones not yet swept.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expiry| now < expiry)
    }
}

/// In-memory [`Cache`] guarded by `parking_lot` locks.
///
/// Reads take the shared lock; only an expired read escalates to the
/// exclusive lock to evict the entry.
#[derive(Debug)]
pub struct ExpiringCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    overrides: RwLock<HashMap<K, Ttl>>,
    default_ttl: Ttl,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(default_ttl: Ttl) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            overrides: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Live entries with their expiry instant, `None` meaning never.
    pub fn entries(&self) -> Vec<(K, V, Option<Instant>)> {
        let now = Instant::now();
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone(), entry.expires_at))
            .collect()
    }
}

impl<K, V> Cache<K, V> for ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn put(&self, key: K, value: V, ttl: Ttl) {
        let expires_at = ttl.expiry_from(Instant::now());
        self.entries.write().insert(key, Entry { value, expires_at });
    }

    fn put_default(&self, key: K, value: V) {
        let ttl = self
            .overrides
            .read()
            .get(&key)
            .copied()
            .unwrap_or(self.default_ttl);
        self.put(key, value, ttl);
    }

    fn set_default_ttl(&self, key: K, ttl: Ttl) {
        self.overrides.write().insert(key, ttl);
    }

    fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return None,
                Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }

        // Re-check under the write lock: a concurrent put may have refreshed it.
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    fn remove(&self, key: &K) -> bool {
        self.entries.write().remove(key).is_some()
    }

    fn clear(&self) {
        self.entries.write().clear();
    }

    fn clean(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}
