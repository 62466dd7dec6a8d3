//! Client-side response cache for the storefront API.
//!
//! Reads go through a [`CachedClient`](api::CachedClient), which serves
//! fresh cached payloads, merges concurrent reads of the same resource onto
//! one network call, and stores successful responses for a TTL chosen by
//! resource path.
//!
//! ```ignore
//! let client = CachedClient::new(HttpTransport::new(base_url, timeout)?);
//! let params = Params::new().with("category", "brakes");
//! let products: Vec<Product> = client.read("/products", Some(&params)).await?;
//!
//! // after a write to the catalog
//! client.invalidate_resource("/products");
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod error;

pub use api::{CachedClient, HttpClient, HttpTransport, RetryPolicy, Transport};
pub use cache::{build_key, CacheKey, CacheResult, CacheSource, Params, PolicyTable};
pub use config::Config;
pub use error::{FetchError, TransportError};
