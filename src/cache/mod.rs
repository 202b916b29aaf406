//! Fathom Cache System
//!
//! Two-tier cache for derived analytical results:
//!
//! - **Local tier**: process-local LRU, sub-millisecond, lost on restart
//! - **Networked tier**: shared across processes through [`RemoteTier`]
//!
//! Entries carry dependency tags. [`CacheCoordinator::invalidate_by_tag`] is
//! the invalidation primitive for derived data; key names are an
//! implementation detail of whoever writes them.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! local_capacity = 1000
//! default_ttl_seconds = 300
//! compression_threshold_bytes = 1024
//! # ... see config.rs for all options
//! ```
//!
//! [`RemoteTier`]: crate::infra::RemoteTier

mod codec;
mod config;
mod coordinator;
mod epoch;
mod error;
mod keys;
pub(crate) mod lock;
mod memo;
mod registry;
mod stats;
mod store;

pub use config::CacheConfig;
pub use coordinator::{CacheCoordinator, SetOptions, SetOutcome};
pub use error::CacheError;
pub use keys::{CacheKey, Tag};
pub use memo::with_cache;
pub use registry::DependencyIndex;
pub use stats::{CacheStatistics, TierSizes};
pub use store::{CacheEntry, LocalPut, LocalTier};
