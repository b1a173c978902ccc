//! FAT directory operations.
//!
//! Directory layout on disk, low address to high:
//!
//! ```text
//! fileA_lfn_n .. fileA_lfn_1 fileA_fcb fileB_lfn_n .. fileB_fcb ...
//! ```
//!
//! A long-name run is strictly numbered downward, tagged with the short
//! entry's checksum, and immediately precedes its FCB. Runs that break
//! either rule are orphans and are skipped. The first-byte sentinels
//! `0xE5` (free) and `0x00` (free, and end of directory) shape every
//! scan.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::fat::entry::{LongDirEntry, ShortDirEntry, NAME_DOT, NAME_DOTDOT};
use crate::fat::name;
use crate::fat::stream::{FatStream, StreamState, FLAG_REMOVED, FLAG_UPDATED};
use crate::{
    Error, Result, ATTR_ARCHIVE, ATTR_DIRECTORY, DIRENT_SIZE, DIR_ENTRY_LAST_AND_UNUSED,
    DIR_ENTRY_UNUSED, DIR_LIMIT, LAST_LONG_ENTRY, LONG_NAME_UNITS,
};

/// Longest long-name run: 20 entries of 13 units cover 255 characters.
const MAX_LONG_ORD: u8 = 20;

/// A run of adjacent free entries, tracked while scanning.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FreeRun {
    pub offset: u32,
    pub size: u32,
}

impl FatStream {
    /// Advance from `cursor` to the next live entry, reassembling any
    /// long-name run in front of it. While scanning, track the first
    /// free run of at least `free_required` bytes; when the directory
    /// ends short of one, grow it so the run exists (the cursor rules
    /// match the shipped driver byte for byte, including the `pos - 32`
    /// accounting after the terminal entry).
    pub(crate) fn find_next_locked(
        &self,
        st: &mut StreamState,
        cursor: &mut u32,
        free_required: u32,
    ) -> Result<(Option<(ShortDirEntry, Vec<u16>)>, FreeRun)> {
        let mut free = FreeRun::default();
        let mut acc: Vec<u16> = Vec::new();
        let mut ord: i32 = -1;
        let mut sum: u8 = 0;
        let mut pos = *cursor;
        let mut buf = [0u8; DIRENT_SIZE];

        loop {
            let n = self.read_at_locked(st, pos as usize, &mut buf)?;
            if n < DIRENT_SIZE {
                break;
            }
            pos += DIRENT_SIZE as u32;
            *cursor = pos;

            let first = buf[0];
            if first == DIR_ENTRY_UNUSED || first == DIR_ENTRY_LAST_AND_UNUSED {
                if free.offset + free.size == pos - DIRENT_SIZE as u32 {
                    free.size += DIRENT_SIZE as u32;
                } else if free.size < free_required {
                    free.offset = pos - DIRENT_SIZE as u32;
                    free.size = DIRENT_SIZE as u32;
                }
                ord = -1;
                if first == DIR_ENTRY_LAST_AND_UNUSED {
                    break;
                }
                continue;
            }

            let sde = ShortDirEntry::from_bytes(&buf);
            if sde.is_long_name_component() {
                let lde = LongDirEntry::from_bytes(&buf);
                if lde.is_last_in_set() {
                    let o = lde.ordinal();
                    if 0 < o && o <= MAX_LONG_ORD {
                        sum = lde.checksum;
                        acc.clear();
                        acc.extend_from_slice(lde.name_units());
                        ord = o as i32 - 1;
                    } else {
                        ord = -1; // orphan
                    }
                } else if 0 < ord && ord == lde.ordinal() as i32 && sum == lde.checksum {
                    let mut joined = lde.units.to_vec();
                    joined.extend_from_slice(&acc);
                    acc = joined;
                    ord -= 1;
                } else {
                    ord = -1; // orphan
                }
            } else if !sde.is_volume_id() {
                let long_name = if ord == 0 && sum == sde.checksum() {
                    core::mem::take(&mut acc)
                } else {
                    Vec::new()
                };
                return Ok((Some((sde, long_name)), free));
            } else {
                ord = -1;
            }
        }

        if free.size < free_required {
            if free.offset + free.size != pos {
                free.offset = pos;
                free.size = 0;
            }
            let wanted = free.offset as u64 + free_required as u64;
            if (st.size as u64) < wanted {
                match self.set_size_locked(st, wanted) {
                    Ok(()) => {}
                    // A directory that cannot grow (the fixed FAT12/16
                    // root, or the 2 MiB ceiling) simply has no run to
                    // offer; the caller sees the shortfall.
                    Err(Error::InvalidArgument) | Err(Error::NoSpace) => {
                        return Ok((None, free));
                    }
                    Err(e) => return Err(e),
                }
            }
            free.size = free_required;
        }
        Ok((None, free))
    }

    pub(crate) fn is_empty_locked(&self, st: &mut StreamState) -> Result<bool> {
        // Skip dot and dotdot.
        let mut cursor = if st.parent.is_some() {
            2 * DIRENT_SIZE as u32
        } else {
            0
        };
        let (item, _) = self.find_next_locked(st, &mut cursor, 0)?;
        Ok(item.is_none())
    }

    /// Resolve a `/`- or `\`-separated path relative to this directory.
    /// `.` stays put and `..` follows the parent link without touching
    /// the directory data. A miss anywhere yields `Ok(None)`.
    pub fn lookup(self: &Arc<Self>, path: &str) -> Result<Option<Arc<FatStream>>> {
        let mut stream = Arc::clone(self);
        for comp in name::components(path) {
            if comp == "." {
                continue;
            }
            if comp == ".." {
                if let Some(p) = stream.parent() {
                    stream = p;
                }
                continue;
            }
            if !stream.is_directory() {
                return Ok(None);
            }
            let want = name::utf8_to_utf16(comp)?;

            let found = {
                let mut st = stream.state.lock();
                let mut cursor = 0u32;
                let mut hit = None;
                loop {
                    let (item, _) = stream.find_next_locked(&mut st, &mut cursor, 0)?;
                    match item {
                        None => break,
                        Some((sde, long_name)) => {
                            if name::is_equal(&want, &long_name, &sde) {
                                hit = Some((sde, cursor - DIRENT_SIZE as u32, st.fst_clus));
                                break;
                            }
                        }
                    }
                }
                hit
            };

            match found {
                None => return Ok(None),
                Some((sde, offset, dir_clus)) => {
                    if sde.name == NAME_DOT {
                        continue;
                    }
                    if sde.name == NAME_DOTDOT {
                        if let Some(p) = stream.parent() {
                            stream = p;
                        }
                        continue;
                    }
                    let parent = Arc::clone(&stream);
                    stream = stream.vol.get_or_create(dir_clus, offset, parent, sde)?;
                }
            }
        }
        Ok(Some(stream))
    }

    /// Create `name` in this directory, returning the fresh stream.
    /// Collisions yield `Already`; a directory with no room for the
    /// entry run yields `NoSpace`.
    pub fn create(self: &Arc<Self>, name_str: &str, attr: u8) -> Result<Arc<FatStream>> {
        if !self.is_directory() {
            return Err(Error::NotPermitted);
        }
        if self.is_removed() {
            return Err(Error::InvalidArgument);
        }
        if !self.can_write() {
            return Err(Error::AccessDenied);
        }

        let file_name = name::utf8_to_utf16(name_str)?;
        if file_name.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let mut oem = name::utf16_to_oem(&file_name)?;
        if oem.name == NAME_DOT || oem.name == NAME_DOTDOT {
            return Err(Error::InvalidArgument);
        }

        // Each long entry carries up to 13 units; a non-lossy name needs
        // only the FCB itself.
        let lfn_entries = (file_name.len() + LONG_NAME_UNITS - 1) / LONG_NAME_UNITS;
        let required: u32 = DIRENT_SIZE as u32
            + if oem.lossy {
                (DIRENT_SIZE * lfn_entries) as u32
            } else {
                0
            };

        let mut st = self.state.lock();
        let dir_clus = st.fst_clus;

        // One pass per 32-wide numeric-tail window: find a fitting free
        // run, reject name collisions, and collect the tails in use.
        let mut off: u32 = DIR_LIMIT;
        let mut want = required;
        let mut trail: u32 = 0;
        let mut base: u32 = 1;
        loop {
            let mut map: u32 = 0;
            let mut cursor = 0u32;
            loop {
                let (item, free) = self.find_next_locked(&mut st, &mut cursor, want)?;
                if 0 < want && want <= free.size {
                    want = 0;
                    off = free.offset;
                }
                let (sde, long_name) = match item {
                    Some(found) => found,
                    None => break,
                };
                if name::is_equal(&file_name, &long_name, &sde) {
                    return Err(Error::Already);
                }
                if oem.lossy {
                    let t = name::matching_trail(&oem.name, &sde.name);
                    if base <= t && t - base < 32 {
                        map |= 0x8000_0000u32 >> (t - base);
                        if map == 0xFFFF_FFFF {
                            break;
                        }
                    }
                }
            }
            if !oem.lossy || map != 0xFFFF_FFFF {
                if oem.lossy {
                    trail = base + (!map).leading_zeros();
                }
                break;
            }
            base += 32;
            if 1_000_000 <= base {
                break;
            }
        }
        if DIR_LIMIT <= off {
            return Err(Error::NoSpace);
        }
        if oem.lossy {
            name::set_numeric_trail(&mut oem.name, trail);
        }

        // Prepare the new FCB.
        let now = self.vol.now();
        let mut fcb = ShortDirEntry::empty();
        fcb.name = oem.name;
        fcb.nt_res = oem.nt_res;
        fcb.attr = if attr & ATTR_DIRECTORY != 0 {
            ATTR_ARCHIVE | ATTR_DIRECTORY
        } else {
            ATTR_ARCHIVE
        };
        fcb.set_creation(now);
        fcb.set_last_write(now);
        fcb.set_last_access(now);

        let clus = if attr & ATTR_DIRECTORY != 0 {
            self.vol.table.alloc_chain(1, true)?
        } else {
            0
        };
        fcb.set_first_cluster(clus);

        let offset = off + required - DIRENT_SIZE as u32;
        let stream = match FatStream::new(
            Arc::clone(&self.vol),
            Some(Arc::clone(self)),
            dir_clus,
            offset,
            fcb,
        ) {
            Ok(s) => s,
            Err(e) => {
                if clus != 0 {
                    let _ = self.vol.table.free_chain(clus);
                }
                return Err(e);
            }
        };

        if let Err(e) = self.write_new_entries(&mut st, off, required, &file_name, &stream) {
            // Roll the allocation back; the entries written so far stay
            // behind the unchanged terminal marker or get reclaimed by
            // the checker.
            stream.with_state(|cst| cst.flags |= FLAG_REMOVED);
            self.vol.unregister((dir_clus, offset));
            return Err(e);
        }
        drop(st);

        // Nothing of the new file is visible until the run is complete;
        // only then flush the directory.
        self.vol.cache.lock().sync_all()?;
        Ok(stream)
    }

    fn write_new_entries(
        self: &Arc<Self>,
        st: &mut StreamState,
        off: u32,
        required: u32,
        file_name: &[u16],
        stream: &Arc<FatStream>,
    ) -> Result<()> {
        let (fcb, clus) = stream.with_state(|cst| (cst.fcb, cst.fst_clus));

        if fcb.is_directory() {
            // Dot and dotdot come first in any new directory; dotdot
            // carries the parent's first cluster, zero when the parent
            // is the root.
            let mut dot = fcb;
            dot.name = NAME_DOT;
            dot.attr = ATTR_DIRECTORY;
            dot.nt_res = 0;
            dot.set_first_cluster(clus);
            let mut dotdot = dot;
            dotdot.name = NAME_DOTDOT;
            dotdot.set_first_cluster(if st.parent.is_none() { 0 } else { st.fst_clus });
            stream.with_state(|cst| -> Result<()> {
                stream.write_at_locked(cst, 0, &dot.to_bytes())?;
                stream.write_at_locked(cst, DIRENT_SIZE, &dotdot.to_bytes())?;
                Ok(())
            })?;
        }

        // Long-name run in descending ordinal order, then the FCB.
        let mut pos = off;
        if DIRENT_SIZE as u32 * 2 <= required {
            let count = (required / DIRENT_SIZE as u32 - 1) as u8;
            let sum = fcb.checksum();
            let mut ord = count | LAST_LONG_ENTRY;
            loop {
                let raw = LongDirEntry::fill(file_name, ord, sum);
                if self.write_at_locked(st, pos as usize, &raw)? != DIRENT_SIZE {
                    return Err(Error::NoSpace);
                }
                pos += DIRENT_SIZE as u32;
                ord &= !LAST_LONG_ENTRY;
                ord -= 1;
                if ord == 0 {
                    break;
                }
            }
        }
        if self.write_at_locked(st, pos as usize, &fcb.to_bytes())? != DIRENT_SIZE {
            return Err(Error::NoSpace);
        }
        Ok(())
    }

    /// Remove this stream's directory entry. Directories must be empty.
    /// The stream object stays usable through outstanding handles; its
    /// chain is freed when the last one drops.
    pub fn remove(self: &Arc<Self>) -> Result<()> {
        let parent = match self.parent() {
            Some(p) => p,
            None => return Err(Error::NotPermitted),
        };

        let mut pst = parent.state.lock();
        let mut st = self.state.lock();

        if st.flags & FLAG_REMOVED != 0 {
            return Ok(());
        }
        if st.fcb.is_directory() && !self.is_empty_locked(&mut st)? {
            return Err(Error::NotPermitted);
        }

        self.vol.unregister((st.dir_clus, st.offset));
        st.flags |= FLAG_REMOVED;

        // Mark the FCB and every long entry chained to it free.
        let offset = st.offset;
        let mut pos = 0u32;
        let mut buf = [0u8; DIRENT_SIZE];
        loop {
            let n = parent.read_at_locked(&mut pst, pos as usize, &mut buf)?;
            if n < DIRENT_SIZE || buf[0] == DIR_ENTRY_LAST_AND_UNUSED {
                break;
            }
            pos += DIRENT_SIZE as u32;
            if buf[0] == DIR_ENTRY_UNUSED {
                continue;
            }
            let sde = ShortDirEntry::from_bytes(&buf);
            if sde.is_long_name_component() {
                let ord = (buf[0] & !LAST_LONG_ENTRY) as u32;
                if 0 < ord && pos + DIRENT_SIZE as u32 * (ord - 1) == offset {
                    parent.write_at_locked(
                        &mut pst,
                        (pos - DIRENT_SIZE as u32) as usize,
                        &[DIR_ENTRY_UNUSED],
                    )?;
                }
            } else if !sde.is_volume_id() && pos - DIRENT_SIZE as u32 == offset {
                parent.write_at_locked(
                    &mut pst,
                    (pos - DIRENT_SIZE as u32) as usize,
                    &[DIR_ENTRY_UNUSED],
                )?;
                break;
            }
        }

        drop(st);
        drop(pst);
        self.vol.cache.lock().sync_all()
    }

    /// Move/rename `old_name` to `new_name` (a path relative to this
    /// directory). Implemented as create-placeholder, identity swap,
    /// remove-placeholder; the dotdot entry of a directory moved across
    /// parents is rewritten to its new parent.
    pub fn rename(self: &Arc<Self>, old_name: &str, new_name: &str) -> Result<()> {
        if !self.can_write() {
            return Err(Error::AccessDenied);
        }
        let old = self.lookup(old_name)?.ok_or(Error::InvalidArgument)?;
        if old.is_root() {
            return Err(Error::InvalidArgument);
        }
        let old_parent = old.parent().ok_or(Error::InvalidArgument)?;

        let (target_dir, base) = match new_name.rfind(name::is_delimiter) {
            Some(i) => {
                let dir = self.lookup(&new_name[..i])?.ok_or(Error::InvalidArgument)?;
                (dir, &new_name[i + 1..])
            }
            None => (Arc::clone(self), new_name),
        };
        if base.is_empty() || !target_dir.is_directory() {
            return Err(Error::InvalidArgument);
        }

        let attr = if old.is_directory() { ATTR_DIRECTORY } else { 0 };
        let placeholder = target_dir.create(base, attr)?;

        // Swap identity and the slot-bound FCB prefix (name, attribute,
        // case flags) between the two stream objects, so `old` now lives
        // in the new slot and the placeholder in the old one.
        self.vol.unregister(old.id());
        self.vol.unregister(placeholder.id());
        {
            let (mut a, mut b) = crate::fat::stream::lock_two(&old, &placeholder);
            core::mem::swap(&mut a.parent, &mut b.parent);
            core::mem::swap(&mut a.dir_clus, &mut b.dir_clus);
            core::mem::swap(&mut a.offset, &mut b.offset);
            core::mem::swap(&mut a.fcb.name, &mut b.fcb.name);
            core::mem::swap(&mut a.fcb.attr, &mut b.fcb.attr);
            core::mem::swap(&mut a.fcb.nt_res, &mut b.fcb.nt_res);
            a.flags |= FLAG_UPDATED;
            b.flags |= FLAG_UPDATED;
        }
        self.vol.reregister(&old);
        self.vol.reregister(&placeholder);

        // A directory that changed parents points its dotdot entry at
        // the new parent (zero when that parent is the root).
        if !Arc::ptr_eq(&old_parent, &target_dir) && old.is_directory() {
            let parent_clus = if target_dir.is_root() {
                0
            } else {
                target_dir.first_cluster()
            };
            let mut buf = [0u8; DIRENT_SIZE];
            if old.read_at(DIRENT_SIZE, &mut buf)? == DIRENT_SIZE {
                let mut dotdot = ShortDirEntry::from_bytes(&buf);
                dotdot.set_first_cluster(parent_clus);
                old.write_at(DIRENT_SIZE, &dotdot.to_bytes())?;
            }
        }

        old.flush()?;
        placeholder.remove()
    }

    /// Create a regular file.
    pub fn bind(self: &Arc<Self>, name_str: &str) -> Result<Arc<FatStream>> {
        self.create(name_str, 0)
    }

    /// Create a subdirectory.
    pub fn create_subcontext(self: &Arc<Self>, name_str: &str) -> Result<Arc<FatStream>> {
        self.create(name_str, ATTR_DIRECTORY)
    }

    /// Remove an empty subdirectory by name.
    pub fn destroy_subcontext(self: &Arc<Self>, name_str: &str) -> Result<()> {
        let stream = self.lookup(name_str)?.ok_or(Error::InvalidArgument)?;
        if !stream.is_directory() {
            return Err(Error::InvalidArgument);
        }
        stream.remove()
    }

    /// Remove a file by name.
    pub fn unbind(self: &Arc<Self>, name_str: &str) -> Result<()> {
        let stream = self.lookup(name_str)?.ok_or(Error::InvalidArgument)?;
        if stream.is_directory() {
            return Err(Error::InvalidArgument);
        }
        stream.remove()
    }

    /// Iterate the entries of this directory, dot and dotdot excluded.
    pub fn list(self: &Arc<Self>) -> Result<FatIterator> {
        FatIterator::new(Arc::clone(self))
    }

    /// The names in this directory, in entry order.
    pub fn list_names(self: &Arc<Self>) -> Result<Vec<String>> {
        let mut iter = self.list()?;
        let mut names = Vec::new();
        while let Some((entry_name, _)) = iter.next_entry()? {
            names.push(entry_name);
        }
        Ok(names)
    }

    pub(crate) fn preferred_name(&self) -> Result<String> {
        let parent = match self.parent() {
            Some(p) => p,
            None => return Ok(String::from("/")),
        };
        let my_offset = self.state.lock().offset;

        let mut pst = parent.state.lock();
        let mut cursor = 0u32;
        loop {
            let (item, _) = parent.find_next_locked(&mut pst, &mut cursor, 0)?;
            match item {
                None => return Err(Error::InvalidArgument),
                Some((sde, long_name)) => {
                    if cursor - DIRENT_SIZE as u32 != my_offset {
                        continue;
                    }
                    if !long_name.is_empty() {
                        return Ok(name::utf16_to_string(&long_name));
                    }
                    return Ok(match name::oem_to_utf16(&sde.name, sde.nt_res) {
                        Some(units) => name::utf16_to_string(&units),
                        None => String::new(),
                    });
                }
            }
        }
    }
}

/// Walks a directory, yielding one stream per entry past dot/dotdot.
pub struct FatIterator {
    stream: Arc<FatStream>,
    cursor: u32,
}

impl FatIterator {
    pub fn new(stream: Arc<FatStream>) -> Result<Self> {
        if !stream.is_directory() {
            return Err(Error::NotPermitted);
        }
        let cursor = if stream.is_root() {
            0
        } else {
            2 * DIRENT_SIZE as u32
        };
        Ok(Self { stream, cursor })
    }

    pub fn has_next(&mut self) -> Result<bool> {
        let mut st = self.stream.state.lock();
        let mut probe = self.cursor;
        let (item, _) = self
            .stream
            .find_next_locked(&mut st, &mut probe, 0)?;
        Ok(item.is_some())
    }

    /// The next entry as `(preferred name, stream)`.
    pub fn next_entry(&mut self) -> Result<Option<(String, Arc<FatStream>)>> {
        let found = {
            let mut st = self.stream.state.lock();
            loop {
                let (item, _) =
                    self.stream
                        .find_next_locked(&mut st, &mut self.cursor, 0)?;
                match item {
                    None => break None,
                    Some((sde, long_name)) => {
                        if sde.name == NAME_DOT || sde.name == NAME_DOTDOT {
                            continue;
                        }
                        break Some((sde, long_name, st.fst_clus, self.cursor - DIRENT_SIZE as u32));
                    }
                }
            }
        };

        let (sde, long_name, dir_clus, offset) = match found {
            Some(f) => f,
            None => return Ok(None),
        };
        let entry_name = if long_name.is_empty() {
            match name::oem_to_utf16(&sde.name, sde.nt_res) {
                Some(units) => name::utf16_to_string(&units),
                None => String::new(),
            }
        } else {
            name::utf16_to_string(&long_name)
        };
        let stream = self
            .stream
            .vol
            .get_or_create(dir_clus, offset, Arc::clone(&self.stream), sde)?;
        Ok(Some((entry_name, stream)))
    }

    /// Remove the next entry instead of yielding it.
    pub fn remove(&mut self) -> Result<()> {
        if let Some((_, stream)) = self.next_entry()? {
            stream.remove()?;
        }
        Ok(())
    }
}
