//! # Cache Backends
//!
//! Key/value storage for slice results and generated artifacts.
//!
//! | Backend    | Storage               | Expiry              | Bound          |
//! |------------|-----------------------|---------------------|----------------|
//! | `Memory`   | per-namespace map     | TTL at read         | max entries + byte budget |
//! | `Disk`     | one file per key, LZ4 | expiry in header    | max entries (oldest first) |
//! | `Tiered`   | memory front + disk   | both                | both           |

mod disk;
mod memory;
mod tiered;

use std::time::Duration;

pub use disk::DiskCacheBackend;
pub use memory::MemoryCacheBackend;
pub use tiered::TieredCacheBackend;

use crate::error::CacheResult;

/// How a value is stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutOptions {
    /// Lifetime of the entry. `Duration::ZERO` never expires.
    pub ttl: Duration,
    /// Entries kept per namespace. 0 is unbounded.
    pub max_entries: usize,
    /// Survive process restarts.
    pub persistent: bool,
    /// Compress persistent entries.
    pub compressed: bool,
}

impl PutOptions {
    /// In-memory entry.
    #[must_use]
    pub const fn memory(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            persistent: false,
            compressed: false,
        }
    }

    /// Compressed persistent entry.
    #[must_use]
    pub const fn persistent(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            persistent: true,
            compressed: true,
        }
    }
}

impl Default for PutOptions {
    fn default() -> Self {
        Self::memory(Duration::from_secs(30), 0)
    }
}

/// Namespaced key/value store.
pub trait CacheBackend: Send + Sync {
    /// Returns the live value for `key`, if any.
    ///
    /// # Errors
    ///
    /// Storage failures other than a plain miss.
    fn get(&self, namespace: &str, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Stores `value`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Storage failures or unstorable keys.
    fn put(&self, namespace: &str, key: &str, value: Vec<u8>, options: &PutOptions)
        -> CacheResult<()>;

    /// Removes `key`. Returns true if something was removed.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn remove(&self, namespace: &str, key: &str) -> CacheResult<bool>;
}

/// Expiry timestamp for a TTL starting at `now_ms`.
pub(crate) fn expiry_ms(now_ms: u64, ttl: Duration) -> u64 {
    if ttl.is_zero() {
        return u64::MAX;
    }
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    now_ms.saturating_add(ttl_ms.max(1))
}
