//! Cached API client that wraps a transport with transparent caching.

use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::cache::{
  build_key, CacheKey, CacheLayer, CacheResult, CacheStats, CacheStorage, MemoryStorage,
  NoopStorage, Params, PolicyTable,
};
use crate::config::Config;
use crate::error::FetchError;

use super::retry::RetryPolicy;
use super::transport::{HttpTransport, RawResponse, Transport};

/// Longest error body kept in [`FetchError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Client built from configuration: HTTP transport, storage picked at runtime.
pub type HttpClient = CachedClient<HttpTransport, Box<dyn CacheStorage>>;

/// API client with transparent caching for idempotent reads.
///
/// Construct one per process and share clones; clones use the same cache
/// and in-flight registry. Writes must go around this client and call one
/// of the `invalidate*` methods afterwards.
pub struct CachedClient<T: Transport, S: CacheStorage = MemoryStorage> {
  transport: Arc<T>,
  cache: CacheLayer<S>,
  policy: Arc<PolicyTable>,
  retry: RetryPolicy,
}

impl<T: Transport> CachedClient<T, MemoryStorage> {
  /// Client with in-memory storage, the storefront policy table and the
  /// default retry policy.
  pub fn new(transport: T) -> Self {
    Self::with_storage(transport, MemoryStorage::new())
  }
}

impl<T: Transport, S: CacheStorage> CachedClient<T, S> {
  pub fn with_storage(transport: T, storage: S) -> Self {
    Self {
      transport: Arc::new(transport),
      cache: CacheLayer::new(storage),
      policy: Arc::new(PolicyTable::storefront()),
      retry: RetryPolicy::default(),
    }
  }

  pub fn with_policy(mut self, policy: PolicyTable) -> Self {
    self.policy = Arc::new(policy);
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  /// Read `path` and decode the JSON payload into `R`.
  pub async fn read<R: DeserializeOwned>(
    &self,
    path: &str,
    params: Option<&Params>,
  ) -> Result<R, FetchError> {
    Ok(self.read_with_source(path, params).await?.data)
  }

  /// Like [`read`](Self::read), but also reports where the data came from.
  pub async fn read_with_source<R: DeserializeOwned>(
    &self,
    path: &str,
    params: Option<&Params>,
  ) -> Result<CacheResult<R>, FetchError> {
    self
      .read_value(path, params)
      .await?
      .try_map(|value| R::deserialize(&*value).map_err(|e| FetchError::Decode(e.to_string())))
  }

  /// Read `path` without decoding; the payload is shared with the cache.
  pub async fn read_value(
    &self,
    path: &str,
    params: Option<&Params>,
  ) -> Result<CacheResult<Arc<Value>>, FetchError> {
    let key = build_key(path, params);
    let ttl = self.policy.ttl_for(path);

    self
      .cache
      .fetch(key, ttl, || {
        let transport = Arc::clone(&self.transport);
        let retry = self.retry;
        let path = path.to_string();
        let params = params.cloned().unwrap_or_default();
        async move {
          let raw = retry.run(|| transport.perform(&path, &params)).await?;
          decode_body(raw)
        }
      })
      .await
  }

  /// The key a read of `path` with `params` is cached under.
  pub fn key_for(&self, path: &str, params: Option<&Params>) -> CacheKey {
    build_key(path, params)
  }

  /// TTL the policy table assigns to `path`.
  pub fn ttl_for(&self, path: &str) -> Duration {
    self.policy.ttl_for(path)
  }

  /// Drop the cached read for one key.
  pub fn invalidate(&self, key: &CacheKey) {
    self.cache.invalidate(key);
  }

  /// Drop every cached read whose key matches `pattern`.
  pub fn invalidate_matching(&self, pattern: &Regex) -> usize {
    self.cache.invalidate_matching(pattern)
  }

  /// Drop every cached read of `path` and of paths below it, with any
  /// parameters. `/products` covers `/products` and `/products/42`.
  pub fn invalidate_resource(&self, path: &str) -> usize {
    let path = path.trim_end_matches('/');
    match Regex::new(&format!("^{}[/:]", regex::escape(path))) {
      Ok(pattern) => self.cache.invalidate_matching(&pattern),
      Err(_) => 0,
    }
  }

  /// Drop everything, e.g. on logout or account switch.
  pub fn clear(&self) {
    self.cache.clear();
  }

  pub fn stats(&self) -> CacheStats {
    self.cache.stats()
  }

  /// Number of cached reads.
  pub fn len(&self) -> usize {
    self.cache.len()
  }

  pub fn is_empty(&self) -> bool {
    self.cache.is_empty()
  }

  pub fn policy(&self) -> &PolicyTable {
    &self.policy
  }
}

impl HttpClient {
  /// Create a client from configuration.
  pub fn from_config(config: &Config) -> Result<Self> {
    let transport = HttpTransport::new(&config.api.base_url, config.api.timeout())
      .map_err(|e| eyre!("Failed to create API client: {}", e))?;

    let storage: Box<dyn CacheStorage> = if config.cache.enabled {
      Box::new(MemoryStorage::new())
    } else {
      Box::new(NoopStorage)
    };

    info!(
      base_url = %config.api.base_url,
      caching = config.cache.enabled,
      "created API client"
    );

    Ok(
      Self::with_storage(transport, storage)
        .with_policy(config.cache.policy()?)
        .with_retry(config.cache.retry()),
    )
  }
}

impl<T: Transport, S: CacheStorage> Clone for CachedClient<T, S> {
  fn clone(&self) -> Self {
    Self {
      transport: Arc::clone(&self.transport),
      cache: self.cache.clone(),
      policy: Arc::clone(&self.policy),
      retry: self.retry,
    }
  }
}

/// Turn a raw response into a JSON payload.
///
/// Non-2xx statuses and unparseable bodies are errors. An empty 2xx body
/// decodes as `null`.
fn decode_body(raw: RawResponse) -> Result<Value, FetchError> {
  if !raw.is_success() {
    let mut body = String::from_utf8_lossy(&raw.body).into_owned();
    if body.len() > MAX_ERROR_BODY {
      let mut cut = MAX_ERROR_BODY;
      while !body.is_char_boundary(cut) {
        cut -= 1;
      }
      body.truncate(cut);
    }
    return Err(FetchError::Status {
      status: raw.status,
      body,
    });
  }

  if raw.body.iter().all(u8::is_ascii_whitespace) {
    return Ok(Value::Null);
  }

  serde_json::from_slice(&raw.body).map_err(|e| FetchError::Malformed(e.to_string()))
}
