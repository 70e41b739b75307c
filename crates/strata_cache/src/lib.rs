//! # STRATA Cache
//!
//! Byte-budgeted retention for precomputed artifacts.
//!
//! ## Components
//!
//! - [`BudgetManager`]: named groups sharing one byte ceiling, evicted
//!   approximately least-recently-used on the caller's thread
//! - [`CombinedBudgetCoordinator`]: one ceiling across several managers
//! - [`CacheBackend`] implementations used for slice caching
//!
//! ## Example
//!
//! ```rust
//! use strata_cache::BudgetManager;
//! use strata_core::CacheConfig;
//!
//! let config = CacheConfig { max_bytes: 1_000, ..CacheConfig::default() };
//! let budget: BudgetManager<u64> = BudgetManager::new("meshes", &config);
//! let group = budget.register("near", 128, 0, |_key| true);
//!
//! budget.record_put(group, 1, 600, true);
//! budget.record_put(group, 2, 600, true);
//! assert_eq!(budget.total_bytes(), 600);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod backend;
pub mod budget;
pub mod combined;
pub mod error;

pub use backend::{
    CacheBackend, DiskCacheBackend, MemoryCacheBackend, PutOptions, TieredCacheBackend,
};
pub use budget::{BudgetManager, BudgetPool, BudgetStats, Evictor, GroupHandle, GroupStats};
pub use combined::CombinedBudgetCoordinator;
pub use error::{CacheError, CacheResult};
