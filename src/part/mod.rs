//! MBR/EPBR disk partition manager.
//!
//! Applies to any disk the block-device trait can describe, so it lives
//! apart from the disk drivers. The MBR's four entries yield primary
//! partitions and at most one extended partition; the extended
//! partition heads a chain of EPBRs, each contributing one logical
//! partition and, optionally, a link whose starting sector is relative
//! to the first EPBR.
//!
//! In the partition list,
//! (1) the extended partition precedes every logical partition,
//! (2) logical partitions appear in numerical order, and
//! (3) primary partitions precede the extended partition.
//! The order matters when partitions are removed: only the tail of the
//! extended/logical chain may go.

pub mod stream;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::device::{BlockDevice, DiskGeometry};
use crate::{read_le_u16, read_le_u32, write_le_u16, Error, Result, MBR_SIGNATURE};

pub use stream::{PartitionLayout, PartitionStream};

pub const MBR_PARTITION_TABLE: usize = 446;
pub const MBR_ENTRY_SIZE: usize = 16;
pub const MBR_SIGNATURE_OFFSET: usize = 510;

// Offsets within one 16-byte entry.
pub const MBR_BOOT_INDICATOR: usize = 0;
pub const MBR_STARTING_CHS: usize = 1;
pub const MBR_SYSTEM_INDICATOR: usize = 4;
pub const MBR_ENDING_CHS: usize = 5;
pub const MBR_STARTING_SECTOR: usize = 8;
pub const MBR_TOTAL_SECTORS: usize = 12;

// Partition system indicators.
pub const PT_EMPTY: u8 = 0x00;
pub const PT_FAT12: u8 = 0x01;
pub const PT_FAT16_UPTO_32MB: u8 = 0x04;
pub const PT_EXTENDED: u8 = 0x05;
pub const PT_FAT16_OVER_32MB: u8 = 0x06;
pub const PT_FAT32: u8 = 0x0B;
pub const PT_FAT32_LBA: u8 = 0x0C;
pub const PT_FAT16_LBA: u8 = 0x0E;
pub const PT_EXTENDED_LBA: u8 = 0x0F;

pub const BOOT_FLAG_INACTIVE: u8 = 0x00;
pub const BOOT_FLAG_ACTIVE: u8 = 0x80;

const MAX_CYLINDER: u32 = 1023;
const HEADS_PER_CYLINDER: u32 = 255;
const SECTORS_PER_HEAD: u32 = 63;
/// The last sector CHS addressing can express.
pub const MAX_CHS: u32 = (MAX_CYLINDER * HEADS_PER_CYLINDER + HEADS_PER_CYLINDER - 1)
    * SECTORS_PER_HEAD
    + SECTORS_PER_HEAD
    - 1;

/// Packed CHS sentinels for sectors beyond the CHS range.
pub const MAX_STARTING_CHS: u32 = 0xFFC101;
pub const MAX_STARTING_EPBR_CHS: u32 = 0xFFC100;
pub const MAX_ENDING_CHS: u32 = 0xFFFFFE;

pub const PREFIX_PRIMARY: &str = "partition";
pub const PREFIX_EXTENDED: &str = "extended";
pub const PREFIX_LOGICAL: &str = "logical";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Primary,
    Extended,
    Logical,
}

/// FAT-family system indicators.
pub fn is_fat_partition(system: u8) -> bool {
    matches!(
        system,
        PT_FAT12 | PT_FAT16_UPTO_32MB | PT_FAT16_OVER_32MB | PT_FAT32 | PT_FAT32_LBA | PT_FAT16_LBA
    )
}

/// The type a fresh partition of `size` bytes gets.
fn default_partition_type(size: u64) -> u8 {
    if size <= 4 * 1024 * 1024 {
        PT_FAT12
    } else if size < 32 * 1024 * 1024 {
        PT_FAT16_UPTO_32MB
    } else if size < 512 * 1024 * 1024 {
        PT_FAT16_OVER_32MB
    } else {
        PT_FAT32
    }
}

/// Parse `partition{0..3}`, `extended`, `logical{0..N}`.
fn parse_name(name: &str) -> Option<(PartitionKind, u32)> {
    let (kind, rest) = if let Some(rest) = name.strip_prefix(PREFIX_PRIMARY) {
        (PartitionKind::Primary, rest)
    } else if let Some(rest) = name.strip_prefix(PREFIX_EXTENDED) {
        (PartitionKind::Extended, rest)
    } else if let Some(rest) = name.strip_prefix(PREFIX_LOGICAL) {
        (PartitionKind::Logical, rest)
    } else {
        return None;
    };
    if rest.is_empty() {
        return Some((kind, 0));
    }
    if !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let id: u32 = rest.parse().ok()?;
    if 255 < id {
        return None;
    }
    Some((kind, id))
}

fn kind_name(kind: PartitionKind, id: u8) -> String {
    use core::fmt::Write;
    let mut s = String::new();
    match kind {
        PartitionKind::Primary => {
            let _ = write!(s, "{}{}", PREFIX_PRIMARY, id);
        }
        PartitionKind::Extended => s.push_str(PREFIX_EXTENDED),
        PartitionKind::Logical => {
            let _ = write!(s, "{}{}", PREFIX_LOGICAL, id);
        }
    }
    s
}

/// Pack an LBA range into starting/ending CHS triples. Ranges past the
/// CHS ceiling yield the sentinels; a starting sector that is neither a
/// track nor a cylinder boundary is rejected, as partitions start at
/// the second track of the first cylinder or at cylinder boundaries.
pub(crate) fn convert_lba_to_chs(
    geometry: &DiskGeometry,
    starting_sector: u32,
    total_sectors: u32,
) -> Result<(u32, u32)> {
    let spt = geometry.sectors_per_track;
    let heads = geometry.heads;

    if MAX_CHS < starting_sector {
        return Ok((MAX_STARTING_CHS, MAX_ENDING_CHS));
    }

    let cylinder = starting_sector / spt / heads;
    let head = (starting_sector / spt) % heads;
    let sector = starting_sector % spt + 1;
    log::debug!(
        "startingSector {:#x} <---> c {:#x}, h {:#x}, s {:#x}",
        starting_sector,
        cylinder,
        head,
        sector
    );
    if !(head == 1 && sector == 1) && !(head == 0 && sector == 1) {
        return Err(Error::InvalidArgument);
    }
    let starting_chs = (0xFF & cylinder) << 16 | (0x0300 & cylinder) << 6 | sector << 8 | head;

    let ending_sector = starting_sector + total_sectors - 1;
    let ending_chs = if ending_sector <= MAX_CHS {
        let cylinder = ending_sector / spt / heads;
        let head = (ending_sector / spt) % heads;
        let sector = ending_sector % spt + 1;
        if !(head == heads - 1 && sector == spt) {
            return Err(Error::InvalidArgument);
        }
        (0xFF & cylinder) << 16 | (0x0300 & cylinder) << 6 | sector << 8 | head
    } else {
        MAX_ENDING_CHS
    };

    Ok((starting_chs, ending_chs))
}

pub struct PartitionContext {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) parts: Mutex<Vec<Arc<PartitionStream>>>,
}

impl core::fmt::Debug for PartitionContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PartitionContext").finish()
    }
}

impl PartitionContext {
    /// Parse the MBR and the EPBR chain into a list of partition
    /// streams: primaries first, then the extended partition, then the
    /// logical partitions in chain order.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Arc<Self>> {
        let geometry = device.geometry();
        let bps = geometry.bytes_per_sector as usize;

        let mut mbr = vec![0u8; bps];
        device.read_blocks(&mut mbr, 0, 1)?;
        if read_le_u16(&mbr[MBR_SIGNATURE_OFFSET..]) != MBR_SIGNATURE {
            log::warn!("MBR not found");
            return Err(Error::InvalidArgument);
        }

        let ctx = Arc::new(Self {
            device: Arc::clone(&device),
            parts: Mutex::new(Vec::new()),
        });

        let mut parts = ctx.parts.lock();
        let mut id = 0u8;
        let mut extended: Option<(Arc<PartitionStream>, u32)> = None;
        for i in 0..4 {
            let at = MBR_PARTITION_TABLE + i * MBR_ENTRY_SIZE;
            let entry = &mbr[at..at + MBR_ENTRY_SIZE];
            log::debug!(
                "{:02x} {:06x} {:02x} {:06x} {:08x} {:08x}",
                entry[MBR_BOOT_INDICATOR],
                read_le_u32(&entry[MBR_STARTING_CHS..]) & 0xFFFFFF,
                entry[MBR_SYSTEM_INDICATOR],
                read_le_u32(&entry[MBR_ENDING_CHS..]) & 0xFFFFFF,
                read_le_u32(&entry[MBR_STARTING_SECTOR..]),
                read_le_u32(&entry[MBR_TOTAL_SECTORS..]),
            );
            match entry[MBR_SYSTEM_INDICATOR] {
                PT_EMPTY => {}
                PT_EXTENDED | PT_EXTENDED_LBA => {
                    if extended.is_some() {
                        // A disk may contain one extended partition.
                        continue;
                    }
                    let s = PartitionStream::new(
                        &ctx,
                        0,
                        PartitionKind::Extended,
                        entry,
                        i as u8,
                        0,
                        None,
                    );
                    parts.push(Arc::clone(&s));
                    extended = Some((s, read_le_u32(&entry[MBR_STARTING_SECTOR..])));
                }
                _ => {
                    let s = PartitionStream::new(
                        &ctx,
                        id,
                        PartitionKind::Primary,
                        entry,
                        i as u8,
                        0,
                        None,
                    );
                    parts.insert(0, s);
                    id += 1;
                }
            }
        }

        if let Some((ext_stream, base)) = extended {
            let mut parent = ext_stream;
            let mut epbr = base;
            let mut id = 0u8;
            loop {
                device.read_blocks(&mut mbr, epbr as usize * bps, 1)?;
                if read_le_u16(&mbr[MBR_SIGNATURE_OFFSET..]) != MBR_SIGNATURE {
                    break;
                }
                let entry = &mbr[MBR_PARTITION_TABLE..MBR_PARTITION_TABLE + MBR_ENTRY_SIZE];
                match entry[MBR_SYSTEM_INDICATOR] {
                    PT_EMPTY | PT_EXTENDED | PT_EXTENDED_LBA => {}
                    _ => {
                        let s = PartitionStream::new(
                            &ctx,
                            id,
                            PartitionKind::Logical,
                            entry,
                            0,
                            epbr as u64,
                            Some(Arc::clone(&parent)),
                        );
                        parts.push(Arc::clone(&s));
                        parent = s;
                    }
                }
                let link = &mbr
                    [MBR_PARTITION_TABLE + MBR_ENTRY_SIZE..MBR_PARTITION_TABLE + 2 * MBR_ENTRY_SIZE];
                match link[MBR_SYSTEM_INDICATOR] {
                    PT_EXTENDED | PT_EXTENDED_LBA => {
                        epbr = base + read_le_u32(&link[MBR_STARTING_SECTOR..]);
                    }
                    _ => break,
                }
                id += 1;
            }
        }
        drop(parts);

        Ok(ctx)
    }

    /// Refuse while any partition is busy; otherwise drop the list in
    /// reverse order.
    pub fn unmount(&self) -> Result<()> {
        let mut parts = self.parts.lock();
        for (i, s) in parts.iter().enumerate() {
            if !removable(s, &parts, 0) {
                log::warn!("partition {} is busy", i);
                return Err(Error::NotPermitted);
            }
        }
        while parts.pop().is_some() {}
        Ok(())
    }

    /// Stamp a fresh, empty MBR onto the disk.
    pub fn initialize(&self) -> Result<()> {
        let bps = self.geometry().bytes_per_sector as usize;
        let mut sector = vec![0u8; bps];
        write_le_u16(&mut sector[MBR_SIGNATURE_OFFSET..], MBR_SIGNATURE);
        self.device.write_blocks(&sector, 0, 1)?;
        self.device.sync()?;
        Ok(())
    }

    pub(crate) fn geometry(&self) -> DiskGeometry {
        self.device.geometry()
    }

    pub fn lookup(&self, name: &str) -> Result<Option<Arc<PartitionStream>>> {
        let (kind, id) = match parse_name(name) {
            Some(v) => v,
            None => return Ok(None),
        };
        let parts = self.parts.lock();
        Ok(find(&parts, kind, id as u8))
    }

    /// Create (or return) the named partition. Primary ids must be
    /// created in order, `extended` carries no id, and a logical id must
    /// be the successor of the current chain tail.
    pub fn bind(self: &Arc<Self>, name: &str) -> Result<Arc<PartitionStream>> {
        let (kind, id) = parse_name(name).ok_or(Error::InvalidArgument)?;
        let mut parts = self.parts.lock();
        if let Some(existing) = find(&parts, kind, id as u8) {
            return Ok(existing);
        }
        match kind {
            PartitionKind::Primary | PartitionKind::Extended => {
                self.create_partition(&mut parts, kind, id)
            }
            PartitionKind::Logical => self.create_logical(&mut parts, id),
        }
    }

    fn create_partition(
        self: &Arc<Self>,
        parts: &mut Vec<Arc<PartitionStream>>,
        kind: PartitionKind,
        id: u32,
    ) -> Result<Arc<PartitionStream>> {
        if 3 < id || (kind == PartitionKind::Extended && id != 0) {
            return Err(Error::InvalidArgument);
        }
        if kind == PartitionKind::Primary
            && 0 < id
            && find(parts, PartitionKind::Primary, id as u8 - 1).is_none()
        {
            // A primary partition must be created in numerical order.
            return Err(Error::InvalidArgument);
        }

        let geometry = self.geometry();
        let bps = geometry.bytes_per_sector as u64;

        let mut mbr = vec![0u8; bps as usize];
        self.device.read_blocks(&mut mbr, 0, 1)?;
        if read_le_u16(&mbr[MBR_SIGNATURE_OFFSET..]) != MBR_SIGNATURE {
            log::warn!("MBR not found");
            return Err(Error::InvalidArgument);
        }

        // The first empty slot in the table.
        let entry_no = (0..4)
            .find(|&i| {
                mbr[MBR_PARTITION_TABLE + i * MBR_ENTRY_SIZE + MBR_SYSTEM_INDICATOR] == PT_EMPTY
            })
            .ok_or(Error::NoSpace)?;

        let (prev_offset, prev_size) = if entry_no == 0 {
            (geometry.sectors_per_track, 0)
        } else {
            let prev = &mbr[MBR_PARTITION_TABLE + (entry_no - 1) * MBR_ENTRY_SIZE..];
            (
                read_le_u32(&prev[MBR_STARTING_SECTOR..]),
                read_le_u32(&prev[MBR_TOTAL_SECTORS..]),
            )
        };

        let at = MBR_PARTITION_TABLE + entry_no * MBR_ENTRY_SIZE;
        let stream = PartitionStream::new(
            self,
            id as u8,
            kind,
            &mbr[at..at + MBR_ENTRY_SIZE],
            entry_no as u8,
            0,
            None,
        );
        match kind {
            PartitionKind::Primary => parts.insert(0, Arc::clone(&stream)),
            _ => parts.push(Arc::clone(&stream)),
        }

        let mut layout = PartitionLayout {
            starting_offset: (prev_offset as u64 + prev_size as u64) * bps,
            partition_length: geometry.cylinder_bytes(),
            hidden_sectors: 0,
            partition_type: 0,
            boot_indicator: 0,
        };
        stream.adjust_size(&geometry, &mut layout);
        layout.partition_type = match kind {
            PartitionKind::Extended => {
                if MAX_CHS as u64
                    <= prev_offset as u64 + prev_size as u64 + layout.partition_length / bps
                {
                    PT_EXTENDED_LBA
                } else {
                    PT_EXTENDED
                }
            }
            _ => default_partition_type(layout.partition_length),
        };

        if let Err(e) = stream.set_layout_locked(self, parts, &layout) {
            parts.retain(|p| !Arc::ptr_eq(p, &stream));
            return Err(e);
        }
        Ok(stream)
    }

    fn create_logical(
        self: &Arc<Self>,
        parts: &mut Vec<Arc<PartitionStream>>,
        id: u32,
    ) -> Result<Arc<PartitionStream>> {
        let last = parts.last().cloned().ok_or(Error::InvalidArgument)?;
        let ok_id = match last.kind() {
            PartitionKind::Extended => id == 0,
            PartitionKind::Logical => id == last.id() as u32 + 1,
            PartitionKind::Primary => false,
        };
        if !ok_id {
            return Err(Error::InvalidArgument);
        }

        let geometry = self.geometry();
        let bps = geometry.bytes_per_sector as u64;
        let epbr_offset = match last.kind() {
            PartitionKind::Extended => last.offset(),
            _ => last.offset() + last.size(),
        };

        // A fresh EPBR: zeroed, signed, and on disk before its first
        // entry is filled in.
        let mut epbr = vec![0u8; bps as usize];
        write_le_u16(&mut epbr[MBR_SIGNATURE_OFFSET..], MBR_SIGNATURE);
        self.device.write_blocks(&epbr, epbr_offset as usize, 1)?;
        self.device.sync()?;

        let stream = PartitionStream::new(
            self,
            id as u8,
            PartitionKind::Logical,
            &epbr[MBR_PARTITION_TABLE..MBR_PARTITION_TABLE + MBR_ENTRY_SIZE],
            0,
            epbr_offset / bps,
            Some(last),
        );
        parts.push(Arc::clone(&stream));

        let layout = PartitionLayout {
            starting_offset: epbr_offset + geometry.sectors_per_track as u64 * bps,
            partition_length: geometry.cylinder_bytes(),
            hidden_sectors: 0,
            partition_type: default_partition_type(geometry.cylinder_bytes()),
            boot_indicator: 0,
        };

        if let Err(e) = stream.set_layout_locked(self, parts, &layout) {
            parts.retain(|p| !Arc::ptr_eq(p, &stream));
            return Err(e);
        }
        Ok(stream)
    }

    /// Remove the named partition. Extended and logical partitions are
    /// removable only as the tail of the chain; primaries go any time
    /// they are not busy.
    pub fn unbind(&self, name: &str) -> Result<()> {
        let (kind, id) = parse_name(name).ok_or(Error::InvalidArgument)?;
        let mut parts = self.parts.lock();
        let stream = find(&parts, kind, id as u8).ok_or(Error::InvalidArgument)?;

        if !removable(&stream, &parts, 1) {
            return Err(Error::NotPermitted);
        }
        if kind != PartitionKind::Primary {
            match parts.last() {
                Some(last) if Arc::ptr_eq(last, &stream) => {}
                _ => return Err(Error::NotPermitted),
            }
        }

        let zero = PartitionLayout {
            starting_offset: 0,
            partition_length: 0,
            hidden_sectors: 0,
            partition_type: 0,
            boot_indicator: 0,
        };
        stream.set_layout_locked(self, &parts, &zero)?;
        if kind == PartitionKind::Logical {
            stream.clear_parent_epbr(self, &parts)?;
        }

        parts.retain(|p| !Arc::ptr_eq(p, &stream));
        Ok(())
    }

    /// The current partitions as `(name, stream)` pairs, in list order.
    pub fn list(&self) -> Vec<(String, Arc<PartitionStream>)> {
        let parts = self.parts.lock();
        parts
            .iter()
            .map(|p| (kind_name(p.kind(), p.id()), Arc::clone(p)))
            .collect()
    }
}

fn find(
    parts: &[Arc<PartitionStream>],
    kind: PartitionKind,
    id: u8,
) -> Option<Arc<PartitionStream>> {
    parts
        .iter()
        .find(|p| p.kind() == kind && p.id() == id)
        .cloned()
}

/// A partition is removable when its reference count is exactly the
/// minimum the chain dependency requires: the list's own handle, the
/// caller's `extra` handles, and one per dependent logical partition.
fn removable(stream: &Arc<PartitionStream>, parts: &[Arc<PartitionStream>], extra: usize) -> bool {
    let dependents = parts
        .iter()
        .filter(|p| {
            p.parent()
                .map_or(false, |parent| Arc::ptr_eq(&parent, stream))
        })
        .count();
    Arc::strong_count(stream) == 1 + extra + dependents
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> DiskGeometry {
        DiskGeometry {
            heads: 255,
            cylinders: 1024,
            sectors_per_track: 63,
            bytes_per_sector: 512,
            disk_size: 255 * 63 * 512 * 1024,
        }
    }

    #[test]
    fn chs_round_trip_below_ceiling() {
        let g = geometry();
        // Track 1 of cylinder 0, one full cylinder minus the first track.
        let (start, end) = convert_lba_to_chs(&g, 63, 255 * 63 - 63).unwrap();
        assert_eq!(start & 0xFF, 1); // head 1
        assert_eq!((start >> 8) & 0xFF, 1); // sector 1
        assert_eq!(end & 0xFF, 254); // last head
        assert_eq!((end >> 8) & 0x3F, 63); // last sector
    }

    #[test]
    fn chs_sentinels_past_ceiling() {
        let g = geometry();
        let (start, end) = convert_lba_to_chs(&g, MAX_CHS + 1, 1000).unwrap();
        assert_eq!(start, MAX_STARTING_CHS);
        assert_eq!(end, MAX_ENDING_CHS);

        // In range but running past the end: only the ending collapses.
        let (start, end) = convert_lba_to_chs(&g, 63, MAX_CHS).unwrap();
        assert_ne!(start, MAX_STARTING_CHS);
        assert_eq!(end, MAX_ENDING_CHS);
    }

    #[test]
    fn names_parse_and_print() {
        assert_eq!(parse_name("partition0"), Some((PartitionKind::Primary, 0)));
        assert_eq!(parse_name("partition3"), Some((PartitionKind::Primary, 3)));
        assert_eq!(parse_name("extended"), Some((PartitionKind::Extended, 0)));
        assert_eq!(parse_name("logical12"), Some((PartitionKind::Logical, 12)));
        assert_eq!(parse_name("swap"), None);
        assert_eq!(parse_name("partitionx"), None);
        assert_eq!(kind_name(PartitionKind::Primary, 2), "partition2");
        assert_eq!(kind_name(PartitionKind::Extended, 0), "extended");
    }

    #[test]
    fn type_ladder() {
        assert_eq!(default_partition_type(4 * 1024 * 1024), PT_FAT12);
        assert_eq!(default_partition_type(16 * 1024 * 1024), PT_FAT16_UPTO_32MB);
        assert_eq!(default_partition_type(128 * 1024 * 1024), PT_FAT16_OVER_32MB);
        assert_eq!(default_partition_type(1024 * 1024 * 1024), PT_FAT32);
    }
}
