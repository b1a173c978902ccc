//! Write-back sector cache.
//!
//! Every mounted volume owns one [`BlockCacheManager`]. Cached sectors
//! are shared through `Arc<RwLock<..>>`, so a sector being used by one
//! stream is never reloaded for another. The manager is bounded: when
//! full it evicts the least-recently-used sector nobody else holds, and
//! if every cached sector is pinned it grows instead of failing, so a
//! flush under memory pressure always makes progress.

use alloc::{sync::Arc, vec};

use lru::LruCache;
use spin::RwLock;

use crate::device::BlockDevice;
use crate::Result;

/// Default number of cached sectors per volume.
pub const BLOCK_CACHE_LIMIT: usize = 64;

pub struct BlockCache {
    cache: alloc::vec::Vec<u8>,
    // the sector id on the device, not within any cluster
    block_id: usize,
    device: Arc<dyn BlockDevice>,
    modified: bool,
}

impl BlockCache {
    /// Load one sector from the device.
    pub fn new(block_id: usize, sector_size: usize, device: Arc<dyn BlockDevice>) -> Result<Self> {
        let mut cache = vec![0u8; sector_size];
        device.read_blocks(&mut cache, block_id * sector_size, 1)?;
        Ok(Self {
            cache,
            block_id,
            device,
            modified: false,
        })
    }

    /// The read-only mapper to the cached sector.
    pub fn read<V>(&self, f: impl FnOnce(&[u8]) -> V) -> V {
        f(&self.cache)
    }

    /// The mutable mapper to the cached sector; marks it dirty.
    pub fn modify<V>(&mut self, f: impl FnOnce(&mut [u8]) -> V) -> V {
        self.modified = true;
        f(&mut self.cache)
    }

    // write the content back to the device
    pub fn sync(&mut self) -> Result<()> {
        if self.modified {
            self.modified = false;
            self.device
                .write_blocks(&self.cache, self.block_id * self.cache.len(), 1)?;
        }
        Ok(())
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        // Last-chance write-back; errors here have nowhere to go.
        let _ = self.sync();
    }
}

pub struct BlockCacheManager {
    device: Arc<dyn BlockDevice>,
    sector_size: usize,
    limit: usize,
    lru: LruCache<usize, Arc<RwLock<BlockCache>>>,
}

impl BlockCacheManager {
    pub fn new(device: Arc<dyn BlockDevice>, sector_size: usize) -> Self {
        Self {
            device,
            sector_size,
            limit: BLOCK_CACHE_LIMIT,
            lru: LruCache::unbounded(),
        }
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Get the cache entry of a sector, loading it on a miss.
    pub fn get(&mut self, block_id: usize) -> Result<Arc<RwLock<BlockCache>>> {
        if let Some(pair) = self.lru.get(&block_id) {
            return Ok(Arc::clone(pair));
        }

        if self.limit <= self.lru.len() {
            // Evict the oldest sector nobody holds. When everything is
            // pinned the cache grows past its limit instead.
            let victim = self
                .lru
                .iter()
                .rev()
                .find(|(_, cache)| Arc::strong_count(cache) == 1)
                .map(|(id, _)| *id);
            if let Some(id) = victim {
                if let Some(cache) = self.lru.pop(&id) {
                    cache.write().sync()?;
                }
            }
        }

        let cache = Arc::new(RwLock::new(BlockCache::new(
            block_id,
            self.sector_size,
            Arc::clone(&self.device),
        )?));
        self.lru.put(block_id, Arc::clone(&cache));
        Ok(cache)
    }

    /// Byte-granular read through the cache, spanning sectors.
    pub fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done;
            let block_id = pos / self.sector_size;
            let in_block = pos % self.sector_size;
            let len = (self.sector_size - in_block).min(buf.len() - done);
            let cache = self.get(block_id)?;
            cache.read().read(|sector| {
                buf[done..done + len].copy_from_slice(&sector[in_block..in_block + len]);
            });
            done += len;
        }
        Ok(())
    }

    /// Byte-granular write through the cache, spanning sectors.
    pub fn write_at(&mut self, offset: usize, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done;
            let block_id = pos / self.sector_size;
            let in_block = pos % self.sector_size;
            let len = (self.sector_size - in_block).min(buf.len() - done);
            let cache = self.get(block_id)?;
            cache.write().modify(|sector| {
                sector[in_block..in_block + len].copy_from_slice(&buf[done..done + len]);
            });
            done += len;
        }
        Ok(())
    }

    /// Write one dirty sector straight back to the device.
    pub fn sync_block(&mut self, block_id: usize) -> Result<()> {
        if let Some(cache) = self.lru.get(&block_id) {
            cache.write().sync()?;
        }
        Ok(())
    }

    pub fn sync_all(&mut self) -> Result<()> {
        let mut result = Ok(());
        for (_, cache) in self.lru.iter() {
            if let Err(err) = cache.write().sync() {
                result = Err(err);
            }
        }
        result
    }

    /// Drop everything without writing back.
    pub fn invalidate(&mut self) {
        while let Some((_, cache)) = self.lru.pop_lru() {
            // Disarm the drop-time sync.
            cache.write().modified = false;
        }
    }
}
