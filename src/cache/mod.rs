//! Response caching with in-flight request coalescing.
//!
//! This module is transport-agnostic:
//! - Builds canonical keys from a resource path and its query parameters
//! - Stores payloads with a per-entry TTL and expires them lazily on read
//! - Maps resource paths to TTLs through an ordered policy table
//! - Merges concurrent reads of the same key onto one network call

mod key;
mod layer;
mod policy;
mod stats;
mod storage;
mod traits;

pub use key::{build_key, CacheKey, ParamValue, Params};
pub use layer::CacheLayer;
pub use policy::{PathMatcher, PolicyRule, PolicyTable, DEFAULT_TTL};
pub use stats::CacheStats;
pub use storage::{CacheStorage, CachedValue, Lookup, MemoryStorage, NoopStorage};
pub use traits::{CacheResult, CacheSource};
