//! One open FAT file or directory.
//!
//! A stream's identity is `(dir_clus, offset)`: the first cluster of the
//! directory containing its FCB (zero when that directory is the
//! FAT12/16 root region) and the byte offset of the short entry inside
//! it. The volume's stream table guarantees at most one live stream per
//! identity.
//!
//! Byte positions translate to clusters through [`FatStream::read_at`]'s
//! chain walk; the last `(position, cluster)` pair is memoized so
//! sequential access walks forward instead of restarting from the first
//! cluster. A stream whose `fst_clus` is zero and which has no parent is
//! the fixed FAT12/16 root region and maps positions directly.

use alloc::string::String;
use alloc::sync::Arc;

use spin::{Mutex, MutexGuard};

use crate::datetime::DateTime;
use crate::fat::entry::ShortDirEntry;
use crate::fat::FatVolume;
use crate::{Error, Result, ATTR_ARCHIVE, DIR_LIMIT};

pub(crate) const FLAG_REMOVED: u8 = 0x01;
pub(crate) const FLAG_UPDATED: u8 = 0x02;

pub(crate) type StreamId = (u32, u32);

pub(crate) struct StreamState {
    pub parent: Option<Arc<FatStream>>,
    pub dir_clus: u32,
    pub offset: u32,
    pub fst_clus: u32,
    pub size: u32,
    pub fcb: ShortDirEntry,
    pub flags: u8,
    // clus_num() acceleration
    pub last_position: u32,
    pub last_clus: u32,
}

pub struct FatStream {
    pub(crate) vol: Arc<FatVolume>,
    pub(crate) state: Mutex<StreamState>,
}

impl core::fmt::Debug for FatStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FatStream").finish()
    }
}

impl FatStream {
    /// `dir_clus` is the containing directory's first cluster; the
    /// caller already has it in hand, and passing it avoids touching the
    /// parent's lock from inside a parent-locked section.
    pub(crate) fn new(
        vol: Arc<FatVolume>,
        parent: Option<Arc<FatStream>>,
        dir_clus: u32,
        offset: u32,
        fcb: ShortDirEntry,
    ) -> Result<Arc<Self>> {
        let fst_clus = fcb.first_cluster();
        let size = if fcb.is_directory() {
            vol.table.calc_size(fst_clus)?
        } else {
            fcb.file_size
        };

        let stream = Arc::new(Self {
            vol: Arc::clone(&vol),
            state: Mutex::new(StreamState {
                parent,
                dir_clus,
                offset,
                fst_clus,
                size,
                fcb,
                flags: 0,
                last_position: 0,
                last_clus: fst_clus,
            }),
        });
        vol.register(&stream);
        Ok(stream)
    }

    pub(crate) fn with_state<V>(&self, f: impl FnOnce(&mut StreamState) -> V) -> V {
        let mut st = self.state.lock();
        f(&mut st)
    }

    pub(crate) fn id(&self) -> StreamId {
        let st = self.state.lock();
        (st.dir_clus, st.offset)
    }

    pub fn parent(&self) -> Option<Arc<FatStream>> {
        self.state.lock().parent.clone()
    }

    pub fn is_root(&self) -> bool {
        self.state.lock().parent.is_none()
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().flags & FLAG_REMOVED != 0
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size as u64
    }

    /// First cluster of the stream's chain; zero for an empty file and
    /// for the FAT12/16 root region.
    pub fn first_cluster(&self) -> u32 {
        self.state.lock().fst_clus
    }

    pub fn is_directory(&self) -> bool {
        self.state.lock().fcb.is_directory()
    }

    pub fn is_file(&self) -> bool {
        self.state.lock().fcb.is_file()
    }

    pub fn is_hidden(&self) -> bool {
        self.state.lock().fcb.is_hidden()
    }

    pub fn can_read(&self) -> bool {
        self.state.lock().fcb.can_read()
    }

    pub fn can_write(&self) -> bool {
        self.state.lock().fcb.can_write()
    }

    pub fn attributes(&self) -> u8 {
        self.state.lock().fcb.attributes()
    }

    /// Replace the four writable attribute bits (read-only, hidden,
    /// system, archive).
    pub fn set_attributes(&self, attributes: u8) -> Result<()> {
        let mut st = self.state.lock();
        st.fcb.set_attributes(attributes);
        st.flags |= FLAG_UPDATED;
        self.flush_locked(&mut st)
    }

    pub fn creation_time(&self) -> DateTime {
        self.state.lock().fcb.creation_time()
    }

    pub fn last_access_time(&self) -> DateTime {
        self.state.lock().fcb.last_access_time()
    }

    pub fn last_write_time(&self) -> DateTime {
        self.state.lock().fcb.last_write_time()
    }

    pub fn set_creation_time(&self, d: DateTime) -> Result<()> {
        let mut st = self.state.lock();
        st.fcb.set_creation(d);
        st.flags |= FLAG_UPDATED;
        self.flush_locked(&mut st)
    }

    pub fn set_last_access_time(&self, d: DateTime) -> Result<()> {
        let mut st = self.state.lock();
        st.fcb.set_last_access(d);
        st.flags |= FLAG_UPDATED;
        self.flush_locked(&mut st)
    }

    pub fn set_last_write_time(&self, d: DateTime) -> Result<()> {
        let mut st = self.state.lock();
        st.fcb.set_last_write(d);
        st.flags |= FLAG_UPDATED;
        self.flush_locked(&mut st)
    }

    /// Translate a byte position to its cluster number. Monotonic
    /// positions continue from the memoized pair; anything else restarts
    /// at the first cluster. The FAT12/16 root maps through cluster 0.
    pub(crate) fn clus_num_locked(&self, st: &mut StreamState, position: u32) -> Result<u32> {
        if st.fst_clus == 0 {
            // The root directory region of a FAT12/16 volume.
            return Ok(0);
        }

        let bpc = self.vol.bpb.bytes_per_cluster;
        let position = position & !(bpc - 1);

        let (mut clus, mut hops) =
            if position < st.last_position || st.last_clus == 0 || self.vol.table.is_eof(st.last_clus) {
                (st.fst_clus, position / bpc)
            } else {
                (st.last_clus, (position - st.last_position) / bpc)
            };

        while 0 < hops {
            clus = self.vol.table.read_entry(clus)?;
            if self.vol.table.is_eof(clus) {
                break;
            }
            hops -= 1;
        }

        st.last_position = position;
        st.last_clus = clus;
        Ok(clus)
    }

    pub(crate) fn read_at_locked(
        &self,
        st: &mut StreamState,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize> {
        let size = st.size as usize;
        if size < offset {
            return Err(Error::InvalidArgument);
        }
        let count = buf.len().min(size - offset);
        if count == 0 {
            return Ok(0);
        }

        let bpc = self.vol.bpb.bytes_per_cluster as usize;
        let mut len = 0;
        let mut pos = offset;
        while len < count {
            let clus = self.clus_num_locked(st, pos as u32)?;
            let in_clus = if clus != 0 { pos % bpc } else { pos };
            let n = self.vol.read_cluster(clus, in_clus, &mut buf[len..count])?;
            if n == 0 {
                break;
            }
            len += n;
            pos += n;
        }
        Ok(len)
    }

    pub(crate) fn write_at_locked(
        &self,
        st: &mut StreamState,
        offset: usize,
        buf: &[u8],
    ) -> Result<usize> {
        let size = st.size as usize;
        if size < offset {
            return Err(Error::InvalidArgument);
        }
        // Writes never extend the stream; grow with set_size first.
        let count = buf.len().min(size - offset);
        if count == 0 {
            return Ok(0);
        }

        let bpc = self.vol.bpb.bytes_per_cluster as usize;
        let mut len = 0;
        let mut pos = offset;
        while len < count {
            let clus = self.clus_num_locked(st, pos as u32)?;
            let in_clus = if clus != 0 { pos % bpc } else { pos };
            let n = self.vol.write_cluster(clus, in_clus, &buf[len..count])?;
            if n == 0 {
                break;
            }
            len += n;
            pos += n;
        }
        Ok(len)
    }

    /// Read up to `buf.len()` bytes at `offset`, clamped to the current
    /// size. Reading past the end yields `InvalidArgument`; reading at
    /// the end yields zero bytes.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.state.lock();
        let len = self.read_at_locked(&mut st, offset, buf)?;
        if 0 < len && !st.fcb.is_directory() {
            let now = self.vol.now();
            st.fcb.set_last_access(now);
            st.flags |= FLAG_UPDATED;
        }
        Ok(len)
    }

    /// Write within the current size (see `set_size`).
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize> {
        if !self.can_write() {
            return Err(Error::AccessDenied);
        }
        let mut st = self.state.lock();
        let len = self.write_at_locked(&mut st, offset, buf)?;
        if 0 < len && !st.fcb.is_directory() {
            let now = self.vol.now();
            st.fcb.set_last_write(now);
            st.fcb.set_last_access(now);
            st.flags |= FLAG_UPDATED;
        }
        Ok(len)
    }

    pub(crate) fn set_size_locked(&self, st: &mut StreamState, new_size: u64) -> Result<()> {
        if 0xFFFF_FFFF < new_size {
            return Err(Error::InvalidArgument);
        }
        let bpc = self.vol.bpb.bytes_per_cluster as u64;
        let mut new_size = new_size;

        if st.fcb.is_directory() {
            new_size = (new_size + bpc - 1) & !(bpc - 1);
            if (DIR_LIMIT as u64) < new_size
                || (!self.vol.bpb.is_fat32() && st.parent.is_none())
            {
                return Err(Error::InvalidArgument);
            }
        }
        let new_size = new_size as u32;

        if st.size == new_size {
            return Ok(());
        }

        let now = self.vol.now();
        if st.size < new_size {
            let old_clusters = (st.size as u64 + bpc - 1) / bpc;
            let new_clusters = (new_size as u64 + bpc - 1) / bpc;
            let n = (new_clusters - old_clusters) as u32;
            if 0 < n {
                // A directory's new cluster is zero-filled before it is
                // linked, so a concurrent listing never sees stale
                // entries.
                let clus = self.vol.table.alloc_chain(n, st.fcb.is_directory())?;
                if st.size != 0 {
                    let last = self.clus_num_locked(st, st.size - 1)?;
                    self.vol.table.write_entry(last, clus)?;
                } else {
                    st.fst_clus = clus;
                    st.last_clus = clus;
                    st.fcb.set_first_cluster(clus);
                }
            }
            st.fcb.file_size = new_size;
            st.fcb.set_last_write(now);
            st.fcb.set_last_access(now);
            st.flags |= FLAG_UPDATED;
            st.size = new_size;
            self.flush_locked(st)?;
        } else {
            st.fcb.file_size = new_size;
            st.fcb.set_last_write(now);
            st.fcb.set_last_access(now);
            st.flags |= FLAG_UPDATED;

            if new_size == 0 {
                let clus = st.fst_clus;
                st.fst_clus = 0;
                st.fcb.set_first_cluster(0);
                st.size = new_size;
                self.flush_locked(st)?;
                self.vol.table.free_chain(clus)?;
            } else {
                self.flush_locked(st)?;
                let clus = self.clus_num_locked(st, new_size - 1)?;
                st.size = new_size;
                let next = self.vol.table.read_entry(clus)?;
                self.vol.table.write_entry(clus, self.vol.bpb.end_of_chain())?;
                self.vol.table.free_chain(next)?;
            }

            // Reset the position memoization either way.
            st.last_position = 0;
            st.last_clus = st.fst_clus;
        }
        Ok(())
    }

    /// Grow or shrink the stream. Sizes above `u32::MAX` are rejected;
    /// directory sizes round up to a cluster multiple, stay under 2 MiB,
    /// and the FAT12/16 root cannot be resized at all.
    pub fn set_size(&self, new_size: u64) -> Result<()> {
        let mut st = self.state.lock();
        self.set_size_locked(&mut st, new_size)
    }

    /// Write the FCB back into the containing directory and push the
    /// volume cache down to the device.
    pub fn flush(&self) -> Result<()> {
        let mut st = self.state.lock();
        self.flush_locked(&mut st)?;
        self.vol.cache.lock().sync_all()
    }

    pub(crate) fn flush_locked(&self, st: &mut StreamState) -> Result<()> {
        if st.flags & FLAG_UPDATED != 0 {
            st.flags &= !FLAG_UPDATED;
            if st.flags & FLAG_REMOVED == 0 && st.parent.is_some() {
                st.fcb.attr |= ATTR_ARCHIVE;
                let disk = self.vol.entry_disk_offset(st.dir_clus, st.offset)?;
                let bytes = st.fcb.to_bytes();
                self.vol.cache.lock().write_at(disk, &bytes)?;
            }
        }
        Ok(())
    }

    /// The stream's preferred name: the long name when one exists, the
    /// OEM name otherwise. The root answers `/`.
    pub fn name(&self) -> Result<String> {
        self.preferred_name()
    }
}

impl Drop for FatStream {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if st.flags & FLAG_REMOVED != 0 {
            // The on-disk entry is gone; now that the last handle is
            // gone too, the chain goes back to the free pool.
            if 0 < st.fst_clus {
                if self.vol.table.free_chain(st.fst_clus).is_err() {
                    log::warn!("leaked cluster chain at {}", st.fst_clus);
                }
            }
        } else if st.flags & FLAG_UPDATED != 0 && st.parent.is_some() {
            st.fcb.attr |= ATTR_ARCHIVE;
            let bytes = st.fcb.to_bytes();
            if let Ok(disk) = self.vol.entry_disk_offset(st.dir_clus, st.offset) {
                let _ = self.vol.cache.lock().write_at(disk, &bytes);
            }
        }
    }
}

/// Keep a guard-taking helper out of the public surface but available to
/// the directory engine.
pub(crate) fn lock_two<'a>(
    a: &'a FatStream,
    b: &'a FatStream,
) -> (MutexGuard<'a, StreamState>, MutexGuard<'a, StreamState>) {
    // Address order, to keep cross-directory operations deadlock-free.
    let pa = a as *const FatStream as usize;
    let pb = b as *const FatStream as usize;
    if pa < pb {
        let ga = a.state.lock();
        let gb = b.state.lock();
        (ga, gb)
    } else {
        let gb = b.state.lock();
        let ga = a.state.lock();
        (ga, gb)
    }
}
