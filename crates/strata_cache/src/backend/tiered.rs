//! Memory front with an optional disk tier.

use super::{CacheBackend, DiskCacheBackend, MemoryCacheBackend, PutOptions};
use crate::error::CacheResult;

/// Routes persistent puts to disk (and the memory front), everything else to
/// memory only. Reads try memory first.
#[derive(Clone, Debug)]
pub struct TieredCacheBackend {
    memory: MemoryCacheBackend,
    disk: Option<DiskCacheBackend>,
}

impl TieredCacheBackend {
    /// Creates a tiered backend. Without a disk tier persistent puts stay in memory.
    #[must_use]
    pub const fn new(memory: MemoryCacheBackend, disk: Option<DiskCacheBackend>) -> Self {
        Self { memory, disk }
    }

    /// The memory front.
    #[must_use]
    pub const fn memory(&self) -> &MemoryCacheBackend {
        &self.memory
    }

    /// The disk tier, if configured.
    #[must_use]
    pub const fn disk(&self) -> Option<&DiskCacheBackend> {
        self.disk.as_ref()
    }
}

impl CacheBackend for TieredCacheBackend {
    fn get(&self, namespace: &str, key: &str) -> CacheResult<Option<Vec<u8>>> {
        if let Some(value) = self.memory.get(namespace, key)? {
            return Ok(Some(value));
        }
        match &self.disk {
            Some(disk) => disk.get(namespace, key),
            None => Ok(None),
        }
    }

    fn put(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        options: &PutOptions,
    ) -> CacheResult<()> {
        if options.persistent {
            if let Some(disk) = &self.disk {
                disk.put(namespace, key, value.clone(), options)?;
            }
        }
        self.memory.put(namespace, key, value, options)
    }

    fn remove(&self, namespace: &str, key: &str) -> CacheResult<bool> {
        let in_memory = self.memory.remove(namespace, key)?;
        let on_disk = match &self.disk {
            Some(disk) => disk.remove(namespace, key)?,
            None => false,
        };
        Ok(in_memory || on_disk)
    }
}
