//! Counters for cache activity.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of cache activity since the layer was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  /// Reads served from a fresh entry
  pub hits: u64,
  /// Reads that found no fresh entry
  pub misses: u64,
  /// Misses that joined a call already in flight
  pub coalesced: u64,
  /// Network calls started
  pub network_calls: u64,
  /// Network calls that settled with an error
  pub failures: u64,
  /// Entries found expired on read
  pub expirations: u64,
}

impl CacheStats {
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
  hits: AtomicU64,
  misses: AtomicU64,
  coalesced: AtomicU64,
  network_calls: AtomicU64,
  failures: AtomicU64,
  expirations: AtomicU64,
}

impl Counters {
  pub fn hit(&self) {
    self.hits.fetch_add(1, Ordering::Relaxed);
  }

  pub fn miss(&self) {
    self.misses.fetch_add(1, Ordering::Relaxed);
  }

  pub fn coalesced(&self) {
    self.coalesced.fetch_add(1, Ordering::Relaxed);
  }

  pub fn network_call(&self) {
    self.network_calls.fetch_add(1, Ordering::Relaxed);
  }

  pub fn failure(&self) {
    self.failures.fetch_add(1, Ordering::Relaxed);
  }

  pub fn expiration(&self) {
    self.expirations.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> CacheStats {
    CacheStats {
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      coalesced: self.coalesced.load(Ordering::Relaxed),
      network_calls: self.network_calls.load(Ordering::Relaxed),
      failures: self.failures.load(Ordering::Relaxed),
      expirations: self.expirations.load(Ordering::Relaxed),
    }
  }
}
