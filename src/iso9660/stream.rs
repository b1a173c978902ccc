//! ISO 9660 streams: one per directory record, read-only.
//!
//! Identity follows the FAT discipline: `(dir_location, offset)` keyed
//! in the volume's stream table. Every mutator fails with
//! [`Error::ReadOnlyFs`], timestamps included.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::datetime::DateTime;
use crate::fat::name::{components, utf16_eq_ignore_case, utf16_to_string, utf8_to_utf16};
use crate::iso9660::record::{DirRecord, DR_FILE_IDENTIFIER, DR_LENGTH};
use crate::iso9660::IsoVolume;
use crate::{Error, Result};

pub struct IsoStream {
    pub(crate) vol: Arc<IsoVolume>,
    parent: Option<Arc<IsoStream>>,
    dir_location: u32,
    offset: u32,
    /// Absolute byte position of the extent, extended-attribute records
    /// included.
    location: u32,
    size: u32,
    flags: u8,
    datetime: DateTime,
}

impl core::fmt::Debug for IsoStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IsoStream")
            .field("dir_location", &self.dir_location)
            .field("offset", &self.offset)
            .field("location", &self.location)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("datetime", &self.datetime)
            .finish()
    }
}

impl IsoStream {
    pub(crate) fn new(
        vol: Arc<IsoVolume>,
        parent: Option<Arc<IsoStream>>,
        offset: u32,
        rec: &DirRecord,
    ) -> Arc<Self> {
        let dir_location = parent.as_ref().map_or(0, |p| p.location);
        let location = (rec.location + rec.ext_attr_len as u32) * vol.block_size;
        let stream = Arc::new(Self {
            vol: Arc::clone(&vol),
            parent,
            dir_location,
            offset,
            location,
            size: rec.data_length,
            flags: rec.flags,
            datetime: rec.datetime,
        });
        vol.register(&stream);
        stream
    }

    pub(crate) fn id(&self) -> (u32, u32) {
        (self.dir_location, self.offset)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn parent(&self) -> Option<Arc<IsoStream>> {
        self.parent.clone()
    }

    pub fn is_directory(&self) -> bool {
        self.flags & crate::iso9660::record::FF_DIRECTORY != 0
    }

    pub fn is_file(&self) -> bool {
        !self.is_directory()
    }

    pub fn is_hidden(&self) -> bool {
        self.flags & crate::iso9660::record::FF_EXISTENCE != 0
    }

    pub fn can_read(&self) -> bool {
        true
    }

    pub fn can_write(&self) -> bool {
        false
    }

    pub fn size(&self) -> u64 {
        self.size as u64
    }

    /// The recording timestamp, shared by all three accessors.
    pub fn creation_time(&self) -> DateTime {
        self.datetime
    }

    pub fn last_access_time(&self) -> DateTime {
        self.datetime
    }

    pub fn last_write_time(&self) -> DateTime {
        self.datetime
    }

    pub fn set_creation_time(&self, _d: DateTime) -> Result<()> {
        Err(Error::ReadOnlyFs)
    }

    pub fn set_last_access_time(&self, _d: DateTime) -> Result<()> {
        Err(Error::ReadOnlyFs)
    }

    pub fn set_last_write_time(&self, _d: DateTime) -> Result<()> {
        Err(Error::ReadOnlyFs)
    }

    pub fn set_attributes(&self, _attributes: u8) -> Result<()> {
        Err(Error::ReadOnlyFs)
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let size = self.size as usize;
        if size <= offset || buf.is_empty() {
            return Ok(0);
        }
        let count = buf.len().min(size - offset);
        self.vol
            .cache
            .lock()
            .read_at(self.location as usize + offset, &mut buf[..count])?;
        Ok(count)
    }

    pub fn write_at(&self, _offset: usize, _buf: &[u8]) -> Result<usize> {
        Err(Error::ReadOnlyFs)
    }

    pub fn set_size(&self, _new_size: u64) -> Result<()> {
        Err(Error::ReadOnlyFs)
    }

    pub fn flush(&self) -> Result<()> {
        Ok(())
    }

    pub fn create(&self, _name: &str, _attr: u8) -> Result<Arc<IsoStream>> {
        Err(Error::ReadOnlyFs)
    }

    pub fn remove(&self) -> Result<()> {
        Err(Error::ReadOnlyFs)
    }

    pub fn rename(&self, _old_name: &str, _new_name: &str) -> Result<()> {
        Err(Error::ReadOnlyFs)
    }

    pub fn unbind(&self, _name: &str) -> Result<()> {
        Err(Error::ReadOnlyFs)
    }

    /// Walk the records of this directory. A zero length byte ends the
    /// record sequence of the current logical block; records never
    /// straddle blocks, so the walk resumes at the next one.
    pub(crate) fn find_next(&self, cursor: &mut u32) -> Result<Option<(DirRecord, u32)>> {
        debug_assert!(self.is_directory());
        let block = self.vol.block_size;
        let mut head = [0u8; DR_FILE_IDENTIFIER];
        loop {
            if self.size <= *cursor {
                return Ok(None);
            }
            if self.read_at(*cursor as usize, &mut head[..1])? < 1 {
                return Ok(None);
            }
            let len = head[DR_LENGTH] as u32;
            if len == 0 {
                let next = (*cursor / block + 1) * block;
                if next <= *cursor || self.size <= next {
                    return Ok(None);
                }
                *cursor = next;
                continue;
            }
            if len < DR_FILE_IDENTIFIER as u32 {
                return Ok(None);
            }
            let mut raw = alloc::vec![0u8; len as usize];
            if (self.read_at(*cursor as usize, &mut raw)? as u32) < len {
                return Ok(None);
            }
            let offset = *cursor;
            *cursor += len;

            let rec = DirRecord::parse(&raw)?;
            if rec.identifier.is_empty() {
                return Ok(None);
            }
            if rec.is_dot_or_dotdot() {
                continue;
            }
            return Ok(Some((rec, offset)));
        }
    }

    fn matches(&self, want: &[u16], rec: &DirRecord) -> bool {
        if self.vol.escape_sequence.is_some() {
            let units = rec.identifier_ucs2();
            if units.len() < want.len() {
                return false;
            }
            if !utf16_eq_ignore_case(want, &units[..want.len()]) {
                return false;
            }
            // The identifier may extend with a version tail.
            want.len() == units.len()
                || units[want.len()] == 0x00
                || units[want.len()] == b';' as u16
        } else {
            let id = rec.identifier_ascii();
            want.len() == id.len()
                && want
                    .iter()
                    .zip(id.iter())
                    .all(|(&w, &b)| {
                        w < 0x80 && (w as u8).eq_ignore_ascii_case(&b)
                    })
        }
    }

    /// Resolve a path relative to this directory, case-insensitively in
    /// both flavours. `.` stays, `..` follows the parent link. A miss
    /// yields `Ok(None)`.
    pub fn lookup(self: &Arc<Self>, path: &str) -> Result<Option<Arc<IsoStream>>> {
        let mut stream = Arc::clone(self);
        for comp in components(path) {
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
            let want = utf8_to_utf16(comp)?;

            let mut cursor = 0u32;
            let mut next = None;
            while let Some((rec, offset)) = stream.find_next(&mut cursor)? {
                if stream.matches(&want, &rec) {
                    next = Some(self.vol.get_or_create(
                        stream.location,
                        offset,
                        Arc::clone(&stream),
                        &rec,
                    ));
                    break;
                }
            }
            match next {
                Some(s) => stream = s,
                None => return Ok(None),
            }
        }
        Ok(Some(stream))
    }

    /// The preferred name: UCS-2 on a Joliet volume, the short
    /// identifier up to `;` otherwise. The root answers `/`.
    pub fn name(&self) -> Result<String> {
        let parent = match &self.parent {
            Some(p) => p,
            None => return Ok(String::from("/")),
        };
        let mut cursor = self.offset;
        let (rec, _) = parent
            .find_next(&mut cursor)?
            .ok_or(Error::InvalidArgument)?;
        Ok(display_name(&self.vol, &rec))
    }

    pub fn list(self: &Arc<Self>) -> Result<IsoIterator> {
        if !self.is_directory() {
            return Err(Error::NotPermitted);
        }
        Ok(IsoIterator {
            stream: Arc::clone(self),
            cursor: 0,
        })
    }

    pub fn list_names(self: &Arc<Self>) -> Result<Vec<String>> {
        let mut iter = self.list()?;
        let mut names = Vec::new();
        while let Some((entry_name, _)) = iter.next_entry()? {
            names.push(entry_name);
        }
        Ok(names)
    }
}

fn display_name(vol: &IsoVolume, rec: &DirRecord) -> String {
    if vol.escape_sequence.is_some() {
        let units = rec.identifier_ucs2();
        let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
        utf16_to_string(&units[..end])
    } else {
        String::from_utf8_lossy(rec.identifier_ascii()).into_owned()
    }
}

/// Walks a directory, yielding one stream per record past the self and
/// parent records.
pub struct IsoIterator {
    stream: Arc<IsoStream>,
    cursor: u32,
}

impl IsoIterator {
    pub fn has_next(&self) -> Result<bool> {
        let mut probe = self.cursor;
        Ok(self.stream.find_next(&mut probe)?.is_some())
    }

    pub fn next_entry(&mut self) -> Result<Option<(String, Arc<IsoStream>)>> {
        match self.stream.find_next(&mut self.cursor)? {
            None => Ok(None),
            Some((rec, offset)) => {
                let entry_name = display_name(&self.stream.vol, &rec);
                let child = self.stream.vol.get_or_create(
                    self.stream.location,
                    offset,
                    Arc::clone(&self.stream),
                    &rec,
                );
                Ok(Some((entry_name, child)))
            }
        }
    }
}
