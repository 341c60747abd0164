//! Response caching: policy, records, store contract, and the manager.
//!
//! The cache stores raw wire responses keyed by canonical
//! [`RequestKey`](crate::key::RequestKey)s. Persistence is delegated to a
//! [`CacheStore`]; this module owns policy, safety rules, TTLs, and
//! eviction.

pub mod manager;
pub mod policy;
pub mod record;
pub mod store;

pub use manager::CacheManager;
pub use policy::{CacheConfig, CachePolicy};
pub use record::{RecordError, WireCacheRecord};
pub use store::{CacheStore, MemoryStore, StoreError};
