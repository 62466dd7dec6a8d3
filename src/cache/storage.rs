//! Cache storage trait and in-memory implementation.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::key::CacheKey;

/// A stored payload with its write metadata.
#[derive(Debug, Clone)]
struct CacheEntry {
  value: Arc<Value>,
  stored_at: Instant,
  cached_at: DateTime<Utc>,
  ttl: Duration,
}

impl CacheEntry {
  fn is_valid(&self, now: Instant) -> bool {
    now.saturating_duration_since(self.stored_at) <= self.ttl
  }
}

/// A value returned from the cache.
#[derive(Debug, Clone)]
pub struct CachedValue {
  pub value: Arc<Value>,
  /// Wall-clock time the value was written
  pub cached_at: DateTime<Utc>,
}

/// Result of a storage lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
  Hit(CachedValue),
  /// An entry existed but had outlived its TTL and was removed
  Expired,
  Miss,
}

impl Lookup {
  pub fn into_hit(self) -> Option<CachedValue> {
    match self {
      Lookup::Hit(v) => Some(v),
      _ => None,
    }
  }
}

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync + 'static {
  /// Look up a key, removing it if it has expired.
  fn lookup(&self, key: &CacheKey) -> Lookup;

  /// Store a value, overwriting any previous entry for the key.
  fn set(&self, key: &CacheKey, value: Arc<Value>, ttl: Duration);

  /// Remove one key. No-op if absent.
  fn invalidate(&self, key: &CacheKey);

  /// Remove every key matching `pattern`. Returns how many were removed.
  fn invalidate_matching(&self, pattern: &Regex) -> usize;

  /// Remove all entries.
  fn clear(&self);

  /// Number of stored entries, expired ones included until they are read.
  fn len(&self) -> usize;

  fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Get a valid value, or `None` if missing or expired.
  fn get(&self, key: &CacheKey) -> Option<CachedValue> {
    self.lookup(key).into_hit()
  }
}

impl<S: CacheStorage + ?Sized> CacheStorage for Box<S> {
  fn lookup(&self, key: &CacheKey) -> Lookup {
    (**self).lookup(key)
  }

  fn set(&self, key: &CacheKey, value: Arc<Value>, ttl: Duration) {
    (**self).set(key, value, ttl)
  }

  fn invalidate(&self, key: &CacheKey) {
    (**self).invalidate(key)
  }

  fn invalidate_matching(&self, pattern: &Regex) -> usize {
    (**self).invalidate_matching(pattern)
  }

  fn clear(&self) {
    (**self).clear()
  }

  fn len(&self) -> usize {
    (**self).len()
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn lookup(&self, _key: &CacheKey) -> Lookup {
    Lookup::Miss
  }

  fn set(&self, _key: &CacheKey, _value: Arc<Value>, _ttl: Duration) {}

  fn invalidate(&self, _key: &CacheKey) {}

  fn invalidate_matching(&self, _pattern: &Regex) -> usize {
    0
  }

  fn clear(&self) {}

  fn len(&self) -> usize {
    0
  }
}

/// In-memory storage with lazy expiry.
///
/// Entries are only checked for staleness when read; nothing sweeps them in
/// the background.
#[derive(Default)]
pub struct MemoryStorage {
  entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStorage for MemoryStorage {
  fn lookup(&self, key: &CacheKey) -> Lookup {
    let mut entries = self.entries.lock();

    match entries.get(key) {
      Some(entry) if entry.is_valid(Instant::now()) => {
        return Lookup::Hit(CachedValue {
          value: Arc::clone(&entry.value),
          cached_at: entry.cached_at,
        });
      }
      Some(_) => {}
      None => return Lookup::Miss,
    }

    entries.remove(key);
    Lookup::Expired
  }

  fn set(&self, key: &CacheKey, value: Arc<Value>, ttl: Duration) {
    let entry = CacheEntry {
      value,
      stored_at: Instant::now(),
      cached_at: Utc::now(),
      ttl,
    };
    self.entries.lock().insert(key.clone(), entry);
  }

  fn invalidate(&self, key: &CacheKey) {
    self.entries.lock().remove(key);
  }

  fn invalidate_matching(&self, pattern: &Regex) -> usize {
    let mut entries = self.entries.lock();
    let before = entries.len();
    entries.retain(|key, _| !pattern.is_match(key.as_str()));
    before - entries.len()
  }

  fn clear(&self) {
    self.entries.lock().clear();
  }

  fn len(&self) -> usize {
    self.entries.lock().len()
  }
}
