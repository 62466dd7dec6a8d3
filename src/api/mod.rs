//! Storefront API access: transport, retry and the cached client.

mod cached_client;
mod retry;
mod transport;

pub use cached_client::{CachedClient, HttpClient};
pub use retry::RetryPolicy;
pub use transport::{HttpTransport, RawResponse, Transport};
