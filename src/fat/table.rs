//! FAT entry access and cluster allocation.
//!
//! Given any valid cluster number N, the entry for that cluster lives at
//! `FATOffset` bytes into the FAT region:
//!
//! - FAT12: `N + N / 2` -- two bytes hold three nibbles, so the 12-bit
//!   entry is extracted by the parity of N and written read-modify-write.
//!   Only FAT12 entries can straddle a sector boundary.
//! - FAT16: `N * 2`
//! - FAT32: `N * 4` -- only the low 28 bits are the entry; the high four
//!   are reserved and preserved on write.
//!
//! Writes are mirrored into every FAT copy and the touched sectors are
//! flushed immediately so the clean-flag protocol stays truthful across
//! a crash; that trade is deliberate.

use alloc::sync::Arc;
use alloc::vec;

use spin::Mutex;

use crate::cache::BlockCacheManager;
use crate::fat::bpb::{BiosParameterBlock, FatVariant};
use crate::{
    Error, Result, FAT16_CLN_SHUT_BIT_MASK, FAT32_CLN_SHUT_BIT_MASK, FREE_CLUSTER,
};

struct FatState {
    free_count: u32,
    nxt_free: u32,
}

/// The FAT region of one volume plus the in-memory free-space state.
/// The interior lock is the volume's FAT monitor: it serialises entry
/// read-modify-write sequences and guards `free_count`/`nxt_free`.
pub struct FatTable {
    bpb: BiosParameterBlock,
    cache: Arc<Mutex<BlockCacheManager>>,
    state: Mutex<FatState>,
}

impl FatTable {
    pub fn new(bpb: BiosParameterBlock, cache: Arc<Mutex<BlockCacheManager>>) -> Self {
        Self {
            bpb,
            cache,
            state: Mutex::new(FatState {
                free_count: 0xFFFF_FFFF,
                nxt_free: 0xFFFF_FFFF,
            }),
        }
    }

    fn entry_offset(&self, n: u32) -> usize {
        let fat_offset = match self.bpb.variant() {
            FatVariant::Fat12 => n as usize + n as usize / 2,
            FatVariant::Fat16 => n as usize * 2,
            FatVariant::Fat32 => n as usize * 4,
        };
        self.bpb.reserved_sectors as usize * self.bpb.bytes_per_sector as usize + fat_offset
    }

    fn read_entry_raw(&self, n: u32) -> Result<u32> {
        let offset = self.entry_offset(n);
        let mut cache = self.cache.lock();
        match self.bpb.variant() {
            FatVariant::Fat12 => {
                let mut buf = [0u8; 2];
                cache.read_at(offset, &mut buf)?;
                let val = u16::from_le_bytes(buf) as u32;
                Ok(if n & 1 != 0 { val >> 4 } else { val & 0x0FFF })
            }
            FatVariant::Fat16 => {
                let mut buf = [0u8; 2];
                cache.read_at(offset, &mut buf)?;
                Ok(u16::from_le_bytes(buf) as u32)
            }
            FatVariant::Fat32 => {
                let mut buf = [0u8; 4];
                cache.read_at(offset, &mut buf)?;
                Ok(u32::from_le_bytes(buf) & 0x0FFF_FFFF)
            }
        }
    }

    fn write_entry_raw(&self, n: u32, v: u32) -> Result<()> {
        let offset = self.entry_offset(n);
        let fat_bytes = self.bpb.fat_size as usize * self.bpb.bytes_per_sector as usize;
        let mut cache = self.cache.lock();

        let (buf, len): ([u8; 4], usize) = match self.bpb.variant() {
            FatVariant::Fat12 => {
                let mut old = [0u8; 2];
                cache.read_at(offset, &mut old)?;
                let mut val = u16::from_le_bytes(old) as u32;
                if n & 1 != 0 {
                    val = (val & 0x000F) | ((v & 0x0FFF) << 4);
                } else {
                    val = (val & 0xF000) | (v & 0x0FFF);
                }
                let b = (val as u16).to_le_bytes();
                ([b[0], b[1], 0, 0], 2)
            }
            FatVariant::Fat16 => {
                let b = (v as u16).to_le_bytes();
                ([b[0], b[1], 0, 0], 2)
            }
            FatVariant::Fat32 => {
                let mut old = [0u8; 4];
                cache.read_at(offset, &mut old)?;
                let merged = (v & 0x0FFF_FFFF) | (u32::from_le_bytes(old) & 0xF000_0000);
                (merged.to_le_bytes(), 4)
            }
        };

        // Mirror into every FAT copy and flush each touched sector.
        let sector_size = cache.sector_size();
        let mut copy_offset = offset;
        for _ in 0..self.bpb.fat_count {
            cache.write_at(copy_offset, &buf[..len])?;
            cache.sync_block(copy_offset / sector_size)?;
            cache.sync_block((copy_offset + len - 1) / sector_size)?;
            copy_offset += fat_bytes;
        }
        Ok(())
    }

    /// The value of entry `n`, masked to the variant's entry width.
    pub fn read_entry(&self, n: u32) -> Result<u32> {
        let _fat = self.state.lock();
        self.read_entry_raw(n)
    }

    /// Store `v` into entry `n` of every FAT copy.
    pub fn write_entry(&self, n: u32, v: u32) -> Result<()> {
        let _fat = self.state.lock();
        debug_assert!(!self.bpb.is_eof(n));
        self.write_entry_raw(n, v)
    }

    pub fn is_eof(&self, clus: u32) -> bool {
        self.bpb.is_eof(clus)
    }

    pub fn free_count(&self) -> u32 {
        self.state.lock().free_count
    }

    pub fn next_free(&self) -> u32 {
        self.state.lock().nxt_free
    }

    /// Adopt persisted hints (from FSInfo); out-of-range values mean
    /// "unknown" and force a recomputation.
    pub fn set_hints(&self, free_count: u32, nxt_free: u32) {
        let mut st = self.state.lock();
        st.free_count = free_count;
        st.nxt_free = nxt_free;
    }

    pub fn hints_unknown(&self) -> bool {
        let st = self.state.lock();
        self.bpb.is_eof(st.free_count) || self.bpb.is_eof(st.nxt_free)
    }

    /// Walk the whole FAT counting free entries; sets `free_count` and
    /// the lowest free cluster as `nxt_free`.
    pub fn recompute_free(&self) -> Result<()> {
        let mut st = self.state.lock();
        let mut free_count = 0;
        let mut nxt_free = 0xFFFF_FFFF;
        for n in 2..self.bpb.count_of_clusters + 2 {
            if self.read_entry_raw(n)? == FREE_CLUSTER {
                free_count += 1;
                if self.bpb.is_eof(nxt_free) {
                    nxt_free = n;
                }
            }
        }
        st.free_count = free_count;
        st.nxt_free = nxt_free;
        Ok(())
    }

    /// Allocate a chain of `n` clusters, preferring the run after
    /// `nxt_free` and wrapping to cluster 2. Directory callers pass
    /// `zero` so a fresh cluster carries a valid end-of-directory marker
    /// before it is ever linked. A full unproductive cycle frees the
    /// partial chain and yields `NoSpace`.
    pub fn alloc_chain(&self, n: u32, zero: bool) -> Result<u32> {
        let mut st = self.state.lock();

        if n == 0 || st.free_count < n {
            return Err(Error::NoSpace);
        }

        let mut want = n;
        let mut first = 0u32;
        let mut prev = 0u32;
        let mut cycle = 0u32;
        while 0 < want {
            if self.bpb.is_eof(st.nxt_free) || st.nxt_free < 2 {
                st.nxt_free = 2;
            }
            if self.read_entry_raw(st.nxt_free)? == FREE_CLUSTER {
                self.write_entry_raw(st.nxt_free, self.bpb.end_of_chain())?;
                st.free_count -= 1;
                if zero {
                    self.zero_cluster(st.nxt_free)?;
                }
                if prev != 0 {
                    self.write_entry_raw(prev, st.nxt_free)?;
                } else {
                    first = st.nxt_free;
                }
                prev = st.nxt_free;
                want -= 1;
            }
            cycle += 1;
            if self.bpb.count_of_clusters < cycle && 0 < want {
                self.free_chain_locked(&mut *st, first)?;
                return Err(Error::NoSpace);
            }
            st.nxt_free += 1;
        }
        Ok(first)
    }

    /// Free the chain starting at `clus`, stopping at end-of-chain (a
    /// bad-cluster sentinel is past the cluster range and stops the walk
    /// the same way, so bad clusters are never freed).
    pub fn free_chain(&self, clus: u32) -> Result<()> {
        let mut st = self.state.lock();
        self.free_chain_locked(&mut *st, clus)
    }

    fn free_chain_locked(&self, st: &mut FatState, clus: u32) -> Result<()> {
        let mut clus = clus;
        if 2 <= clus {
            while !self.bpb.is_eof(clus) && 2 <= clus {
                let next = self.read_entry_raw(clus)?;
                self.write_entry_raw(clus, FREE_CLUSTER)?;
                st.free_count += 1;
                clus = next;
            }
        }
        Ok(())
    }

    fn zero_cluster(&self, clus: u32) -> Result<()> {
        let zero = vec![0u8; self.bpb.bytes_per_cluster as usize];
        let mut cache = self.cache.lock();
        cache.write_at(self.bpb.cluster_offset(clus), &zero)
    }

    /// Length in bytes of the chain starting at `clus`; `clus == 0`
    /// yields the fixed FAT12/16 root size. Chains past [`crate::DIR_LIMIT`]
    /// are cut off, as only directories are sized this way.
    pub fn calc_size(&self, clus: u32) -> Result<u32> {
        let mut clus = clus;
        if clus == 0 {
            if !self.bpb.is_fat32() {
                return Ok(self.bpb.root_dir_bytes());
            }
            clus = self.bpb.root_cluster;
        }

        let mut size = 0u32;
        while !self.bpb.is_eof(clus) {
            if clus < 2
                || self.bpb.is_bad_cluster(clus)
                || self.bpb.count_of_clusters + 2 <= clus
            {
                break;
            }
            size += self.bpb.bytes_per_cluster;
            clus = self.read_entry(clus)?;
            if crate::DIR_LIMIT < size {
                break;
            }
        }
        Ok(size)
    }

    /// FAT16 keeps the clean-shutdown flag in bit 15 of entry 1, FAT32
    /// in bit 27. FAT12 has none and always reads clean.
    pub fn is_clean(&self) -> Result<bool> {
        match self.bpb.variant() {
            FatVariant::Fat12 => Ok(true),
            FatVariant::Fat16 => Ok(self.read_entry(1)? & FAT16_CLN_SHUT_BIT_MASK != 0),
            FatVariant::Fat32 => Ok(self.read_entry(1)? & FAT32_CLN_SHUT_BIT_MASK != 0),
        }
    }

    pub fn set_clean(&self, clean: bool) -> Result<()> {
        let mask = match self.bpb.variant() {
            FatVariant::Fat12 => return Ok(()),
            FatVariant::Fat16 => FAT16_CLN_SHUT_BIT_MASK,
            FatVariant::Fat32 => FAT32_CLN_SHUT_BIT_MASK,
        };
        let val = self.read_entry(1)?;
        let val = if clean { val | mask } else { val & !mask };
        self.write_entry(1, val)
    }
}
