//! Core types describing the outcome of a cached read.

use chrono::{DateTime, Utc};

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Data from a network call this caller started.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Data from a network call another caller had already started.
  pub fn coalesced(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Coalesced,
      cached_at: None,
    }
  }

  /// Data served from a fresh cache entry.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Transform the data, keeping the metadata. Errors from `f` pass through.
  pub fn try_map<U, E, F: FnOnce(T) -> Result<U, E>>(self, f: F) -> Result<CacheResult<U>, E> {
    Ok(CacheResult {
      data: f(self.data)?,
      source: self.source,
      cached_at: self.cached_at,
    })
  }
}

/// Indicates where data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from a network call started by this read
  Network,
  /// Fresh data from a call that was already in flight for the same key
  Coalesced,
  /// Data from a cache entry still within its TTL
  Cache,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let label = match self {
      CacheSource::Network => "network",
      CacheSource::Coalesced => "coalesced",
      CacheSource::Cache => "cache",
    };
    f.write_str(label)
  }
}
