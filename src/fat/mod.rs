//! FAT12/16/32 volume engine.
//!
//! [`FatVolume::mount`] verifies the boot sector, classifies the
//! variant by cluster count, adopts the FAT32 FSInfo free-space hints
//! when their signatures hold, and runs the clean-shutdown protocol: a
//! volume that was not dismounted gracefully gets its free-space state
//! recomputed from the FAT. [`FatVolume::dismount`] drains the stream
//! table, persists the hints, and sets the clean flag again.
//!
//! The volume keeps one stream object per on-disk directory entry. The
//! identity table maps `(dir_clus, offset)` to the live object; the
//! stand-by list keeps recently released objects alive so a new lookup
//! reattaches instead of rebuilding.

pub mod bpb;
pub mod check;
pub mod dir;
pub mod entry;
pub mod format;
pub mod name;
pub mod stream;
pub mod table;

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec;

use lru::LruCache;
use spin::Mutex;

use crate::cache::BlockCacheManager;
use crate::datetime::{Clock, DateTime};
use crate::device::BlockDevice;
use crate::{Error, Result, ATTR_DIRECTORY};

pub use bpb::{BiosParameterBlock, FatVariant, FsInfo};
pub use dir::FatIterator;
pub use entry::ShortDirEntry;
pub use stream::FatStream;
pub use table::FatTable;

use stream::StreamId;

/// Released streams kept alive for reattachment.
const STANDBY_LIMIT: usize = 16;

struct StreamTable {
    hash: BTreeMap<StreamId, Weak<FatStream>>,
    standby: LruCache<StreamId, Arc<FatStream>>,
}

pub struct FatVolume {
    pub(crate) device: Arc<dyn BlockDevice>,
    clock: Arc<dyn Clock>,
    pub(crate) bpb: BiosParameterBlock,
    pub(crate) cache: Arc<Mutex<BlockCacheManager>>,
    pub(crate) table: FatTable,
    streams: Mutex<StreamTable>,
    root: Mutex<Option<Arc<FatStream>>>,
    fsinfo: Mutex<Option<alloc::vec::Vec<u8>>>,
}

impl FatVolume {
    /// Mount a FAT volume from `device`.
    pub fn mount(device: Arc<dyn BlockDevice>, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        let mut sector = [0u8; 512];
        device.read_blocks(&mut sector, 0, 1)?;
        let bpb = BiosParameterBlock::parse(&sector)?;

        log::debug!(
            "mounting FAT: {} bytes/sector, {} sectors/cluster, {} reserved, {} FATs, {} clusters",
            bpb.bytes_per_sector,
            bpb.sectors_per_cluster,
            bpb.reserved_sectors,
            bpb.fat_count,
            bpb.count_of_clusters,
        );

        let cache = Arc::new(Mutex::new(BlockCacheManager::new(
            Arc::clone(&device),
            bpb.bytes_per_sector as usize,
        )));
        let table = FatTable::new(bpb.clone(), Arc::clone(&cache));

        let vol = Arc::new(Self {
            device,
            clock,
            bpb,
            cache,
            table,
            streams: Mutex::new(StreamTable {
                hash: BTreeMap::new(),
                standby: LruCache::unbounded(),
            }),
            root: Mutex::new(None),
            fsinfo: Mutex::new(None),
        });

        // FAT32 persists the free-space hints in FSInfo; adopt them
        // only when all three signatures check out.
        if vol.bpb.is_fat32() && vol.bpb.fsinfo_sector != 0 {
            let bps = vol.bpb.bytes_per_sector as usize;
            let mut image = vec![0u8; bps];
            vol.cache
                .lock()
                .read_at(vol.bpb.fsinfo_sector as usize * bps, &mut image)?;
            match FsInfo::parse(&image) {
                Some(hints) => {
                    log::debug!(
                        "FSInfo: free {}, next free {}",
                        hints.free_count,
                        hints.next_free
                    );
                    vol.table.set_hints(hints.free_count, hints.next_free);
                }
                None => log::debug!("FSInfo signatures missing"),
            }
            *vol.fsinfo.lock() = Some(image);
        }

        // Clean-shutdown protocol: a dirty volume gets no credit for
        // its persisted hints.
        if !vol.table.is_clean()? {
            log::warn!("volume was not dismounted the last time it was mounted");
            vol.table.set_hints(0xFFFF_FFFF, 0xFFFF_FFFF);
        } else {
            vol.table.set_clean(false)?;
        }
        if vol.table.hints_unknown() {
            vol.table.recompute_free()?;
        }
        log::debug!(
            "free clusters: {} ({} KiB), next free: {}",
            vol.table.free_count(),
            vol.table.free_count() as u64 * vol.bpb.bytes_per_cluster as u64 / 1024,
            vol.table.next_free(),
        );

        // The root node: a chained stream on FAT32, the fixed region
        // on FAT12/16.
        let mut fcb = ShortDirEntry::empty();
        fcb.attr = ATTR_DIRECTORY;
        if vol.bpb.is_fat32() {
            fcb.set_first_cluster(vol.bpb.root_cluster);
        }
        let root = FatStream::new(Arc::clone(&vol), None, 0, 0, fcb)?;
        *vol.root.lock() = Some(root);

        Ok(vol)
    }

    /// Flush everything, persist the FSInfo hints, set the clean flag,
    /// and release the stream table.
    pub fn dismount(&self) -> Result<()> {
        let root = self.root.lock().take();
        let root = match root {
            Some(r) => r,
            None => return Ok(()),
        };
        root.flush()?;
        drop(root);

        loop {
            let next = {
                let mut t = self.streams.lock();
                t.standby.pop_lru().map(|(_, s)| s)
            };
            match next {
                Some(s) => {
                    if Arc::strong_count(&s) == 1 {
                        let _ = s.flush();
                    }
                }
                None => break,
            }
        }

        if let Some(image) = self.fsinfo.lock().as_mut() {
            let hints = FsInfo {
                free_count: self.table.free_count(),
                next_free: self.table.next_free(),
            };
            hints.update(image);
            let bps = self.bpb.bytes_per_sector as usize;
            self.cache
                .lock()
                .write_at(self.bpb.fsinfo_sector as usize * bps, image)?;
        }

        self.table.set_clean(true)?;
        self.cache.lock().sync_all()?;
        self.device.sync()?;
        Ok(())
    }

    /// The root directory stream.
    pub fn root(&self) -> Result<Arc<FatStream>> {
        self.root.lock().clone().ok_or(Error::InvalidArgument)
    }

    pub fn variant(&self) -> FatVariant {
        self.bpb.variant()
    }

    pub fn free_space(&self) -> u64 {
        self.table.free_count() as u64 * self.bpb.bytes_per_cluster as u64
    }

    pub fn total_space(&self) -> u64 {
        self.bpb.count_of_clusters as u64 * self.bpb.bytes_per_cluster as u64
    }

    pub fn free_clusters(&self) -> u32 {
        self.table.free_count()
    }

    pub fn total_clusters(&self) -> u32 {
        self.bpb.count_of_clusters
    }

    /// The 11-byte volume label recorded in the boot sector.
    pub fn volume_label(&self) -> [u8; 11] {
        self.bpb.volume_label
    }

    pub fn volume_serial(&self) -> u32 {
        self.bpb.volume_id
    }

    /// Interface parity; this driver does not relocate clusters.
    pub fn defrag(&self) -> Result<()> {
        Ok(())
    }

    pub(crate) fn now(&self) -> DateTime {
        self.clock.now()
    }

    /// Read from cluster `clus` at `offset`, extending across
    /// sequentially numbered successors so one call covers as much as
    /// the chain permits. `clus == 0` addresses the FAT12/16 root
    /// region, with `offset` relative to its start.
    pub(crate) fn read_cluster(&self, clus: u32, offset: usize, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.table.is_eof(clus) {
            return Ok(0);
        }
        let bps = self.bpb.bytes_per_sector as usize;
        let bpc = self.bpb.bytes_per_cluster as usize;

        if clus == 0 {
            let size = self.bpb.root_dir_bytes() as usize;
            if size <= offset {
                return Ok(0);
            }
            let count = buf.len().min(size - offset);
            let disk = self.bpb.first_root_dir_sector as usize * bps + offset;
            self.cache.lock().read_at(disk, &mut buf[..count])?;
            return Ok(count);
        }

        if bpc <= offset {
            return Ok(0);
        }
        let mut avail = bpc - offset;
        let mut run = clus;
        while avail < buf.len() {
            let next = self.table.read_entry(run)?;
            if next != run + 1 {
                break;
            }
            run = next;
            avail += bpc;
        }
        let count = buf.len().min(avail);
        let disk = self.bpb.cluster_offset(clus) + offset;
        self.cache.lock().read_at(disk, &mut buf[..count])?;
        Ok(count)
    }

    /// Write counterpart of [`Self::read_cluster`].
    pub(crate) fn write_cluster(&self, clus: u32, offset: usize, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() || self.table.is_eof(clus) {
            return Ok(0);
        }
        let bps = self.bpb.bytes_per_sector as usize;
        let bpc = self.bpb.bytes_per_cluster as usize;

        if clus == 0 {
            let size = self.bpb.root_dir_bytes() as usize;
            if size <= offset {
                return Ok(0);
            }
            let count = buf.len().min(size - offset);
            let disk = self.bpb.first_root_dir_sector as usize * bps + offset;
            self.cache.lock().write_at(disk, &buf[..count])?;
            return Ok(count);
        }

        if bpc <= offset {
            return Ok(0);
        }
        let mut avail = bpc - offset;
        let mut run = clus;
        while avail < buf.len() {
            let next = self.table.read_entry(run)?;
            if next != run + 1 {
                break;
            }
            run = next;
            avail += bpc;
        }
        let count = buf.len().min(avail);
        let disk = self.bpb.cluster_offset(clus) + offset;
        self.cache.lock().write_at(disk, &buf[..count])?;
        Ok(count)
    }

    /// Absolute byte position of the FCB at `(dir_clus, offset)`,
    /// resolved through the directory's chain without touching any
    /// stream lock.
    pub(crate) fn entry_disk_offset(&self, dir_clus: u32, offset: u32) -> Result<usize> {
        let bps = self.bpb.bytes_per_sector as usize;
        if dir_clus == 0 {
            return Ok(self.bpb.first_root_dir_sector as usize * bps + offset as usize);
        }
        let bpc = self.bpb.bytes_per_cluster;
        let mut clus = dir_clus;
        let mut hops = offset / bpc;
        while 0 < hops {
            clus = self.table.read_entry(clus)?;
            if self.table.is_eof(clus) {
                return Err(Error::InvalidArgument);
            }
            hops -= 1;
        }
        Ok(self.bpb.cluster_offset(clus) + (offset % bpc) as usize)
    }

    /// The identity table: at most one live stream per directory entry.
    /// A hit is promoted in the stand-by list; a miss builds the stream
    /// from the FCB the caller just read.
    pub(crate) fn get_or_create(
        self: &Arc<Self>,
        dir_clus: u32,
        offset: u32,
        parent: Arc<FatStream>,
        sde: ShortDirEntry,
    ) -> Result<Arc<FatStream>> {
        let id = (dir_clus, offset);
        let (hit, evicted) = {
            let mut t = self.streams.lock();
            let existing = t.hash.get(&id).and_then(|w| w.upgrade());
            match existing {
                Some(s) => {
                    t.standby.put(id, Arc::clone(&s));
                    let evicted = trim_standby(&mut t);
                    (Some(s), evicted)
                }
                None => {
                    t.hash.remove(&id);
                    (None, None)
                }
            }
        };
        retire(evicted);
        if let Some(s) = hit {
            if !s.is_removed() {
                return Ok(s);
            }
        }
        FatStream::new(Arc::clone(self), Some(parent), dir_clus, offset, sde)
    }

    pub(crate) fn register(&self, stream: &Arc<FatStream>) {
        if stream.parent().is_none() {
            return; // the root is pinned by the volume itself
        }
        let id = stream.id();
        let evicted = {
            let mut t = self.streams.lock();
            t.hash.insert(id, Arc::downgrade(stream));
            t.standby.put(id, Arc::clone(stream));
            trim_standby(&mut t)
        };
        retire(evicted);
    }

    pub(crate) fn reregister(&self, stream: &Arc<FatStream>) {
        self.register(stream);
    }

    pub(crate) fn unregister(&self, id: StreamId) {
        let dropped = {
            let mut t = self.streams.lock();
            t.hash.remove(&id);
            t.standby.pop(&id)
        };
        drop(dropped);
    }
}

fn trim_standby(t: &mut StreamTable) -> Option<Arc<FatStream>> {
    if STANDBY_LIMIT < t.standby.len() {
        t.standby.pop_lru().map(|(_, s)| s)
    } else {
        None
    }
}

/// Flush a stream falling off the stand-by list when nothing else holds
/// it; its pending FCB update would otherwise only surface at dismount.
fn retire(evicted: Option<Arc<FatStream>>) {
    if let Some(s) = evicted {
        if Arc::strong_count(&s) == 1 {
            let _ = s.flush();
        }
    }
}
