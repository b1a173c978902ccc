//! One partition exposed as a bounded block stream.
//!
//! A partition stream remembers which boot record (MBR or EPBR) carries
//! its entry and edits that sector in place on layout changes. Logical
//! partitions record their own starting sector relative to the EPBR
//! that holds them, while the link entry in the previous EPBR is
//! relative to the first EPBR; both get rewritten when a logical
//! partition moves or grows.

use alloc::sync::{Arc, Weak};
use alloc::vec;

use spin::Mutex;

use crate::device::{BlockDevice, DeviceError, DiskGeometry};
use crate::part::{
    convert_lba_to_chs, PartitionContext, PartitionKind, BOOT_FLAG_ACTIVE, BOOT_FLAG_INACTIVE,
    MAX_CHS, MAX_STARTING_CHS, MAX_STARTING_EPBR_CHS, MBR_BOOT_INDICATOR, MBR_ENDING_CHS,
    MBR_ENTRY_SIZE, MBR_PARTITION_TABLE, MBR_SIGNATURE_OFFSET, MBR_STARTING_CHS,
    MBR_STARTING_SECTOR, MBR_SYSTEM_INDICATOR, MBR_TOTAL_SECTORS, PT_EXTENDED, PT_EXTENDED_LBA,
};
use crate::{read_le_u16, read_le_u32, write_le_u32, Error, Result, MBR_SIGNATURE};

/// One partition-table entry, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLayout {
    pub starting_offset: u64,
    pub partition_length: u64,
    pub hidden_sectors: u32,
    pub partition_type: u8,
    pub boot_indicator: u8,
}

struct PartState {
    boot: u8,
    system: u8,
    offset: u64,
    size: u64,
    /// Byte position of the boot record (MBR or EPBR) carrying the
    /// entry.
    br: u64,
}

pub struct PartitionStream {
    ctx: Weak<PartitionContext>,
    id: u8,
    entry_no: u8,
    kind: PartitionKind,
    parent: Option<Arc<PartitionStream>>,
    state: Mutex<PartState>,
}

impl core::fmt::Debug for PartitionStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PartitionStream")
            .field("id", &self.id)
            .field("entry_no", &self.entry_no)
            .field("kind", &self.kind)
            .finish()
    }
}

impl PartitionStream {
    pub(crate) fn new(
        ctx: &Arc<PartitionContext>,
        id: u8,
        kind: PartitionKind,
        entry: &[u8],
        entry_no: u8,
        base_sector: u64,
        parent: Option<Arc<PartitionStream>>,
    ) -> Arc<Self> {
        let bps = ctx.geometry().bytes_per_sector as u64;
        Arc::new(Self {
            ctx: Arc::downgrade(ctx),
            id,
            entry_no,
            kind,
            parent,
            state: Mutex::new(PartState {
                boot: entry[MBR_BOOT_INDICATOR],
                system: entry[MBR_SYSTEM_INDICATOR],
                offset: bps * (base_sector + read_le_u32(&entry[MBR_STARTING_SECTOR..]) as u64),
                size: bps * read_le_u32(&entry[MBR_TOTAL_SECTORS..]) as u64,
                br: bps * base_sector,
            }),
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn kind(&self) -> PartitionKind {
        self.kind
    }

    pub fn entry_no(&self) -> u8 {
        self.entry_no
    }

    pub fn parent(&self) -> Option<Arc<PartitionStream>> {
        self.parent.clone()
    }

    pub fn is_primary(&self) -> bool {
        self.kind == PartitionKind::Primary
    }

    pub fn is_extended(&self) -> bool {
        self.kind == PartitionKind::Extended
    }

    pub fn is_logical(&self) -> bool {
        self.kind == PartitionKind::Logical
    }

    /// Absolute byte position of the partition's first sector.
    pub fn offset(&self) -> u64 {
        self.state.lock().offset
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn system_type(&self) -> u8 {
        self.state.lock().system
    }

    pub fn get_layout(&self) -> PartitionLayout {
        let st = self.state.lock();
        PartitionLayout {
            starting_offset: st.offset,
            partition_length: st.size,
            hidden_sectors: 0,
            partition_type: st.system,
            boot_indicator: st.boot,
        }
    }

    /// Re-size the partition in place. Growth that the table check
    /// rejects (past the disk, into a neighbour) silently keeps the old
    /// size, as the shipped manager did.
    pub fn set_size(&self, new_size: u64) -> Result<()> {
        let ctx = self.context()?;
        let parts = ctx.parts.lock();
        let mut layout = self.get_layout();
        layout.partition_length = new_size;
        match self.set_layout_locked(&ctx, &parts, &layout) {
            Err(Error::InvalidArgument) => Ok(()),
            other => other,
        }
    }

    pub fn set_layout(&self, layout: &PartitionLayout) -> Result<()> {
        let ctx = self.context()?;
        let parts = ctx.parts.lock();
        self.set_layout_locked(&ctx, &parts, layout)
    }

    fn context(&self) -> Result<Arc<PartitionContext>> {
        self.ctx.upgrade().ok_or(Error::InvalidArgument)
    }

    /// A partition must end at a cylinder boundary; round the length
    /// down.
    pub(crate) fn adjust_size(&self, geometry: &DiskGeometry, layout: &mut PartitionLayout) {
        let cylinder = geometry.cylinder_bytes();
        let mut end = layout.starting_offset + layout.partition_length;
        end -= end % cylinder;
        layout.partition_length = end.saturating_sub(layout.starting_offset);
    }

    fn check_layout(
        &self,
        parts: &[Arc<PartitionStream>],
        geometry: &DiskGeometry,
        layout: &PartitionLayout,
    ) -> Result<()> {
        if geometry.disk_size <= layout.starting_offset + layout.partition_length {
            return Err(Error::InvalidArgument);
        }
        if layout.partition_length % geometry.bytes_per_sector as u64 != 0
            || layout.hidden_sectors != 0
        {
            return Err(Error::InvalidArgument);
        }
        if layout.boot_indicator != BOOT_FLAG_INACTIVE && layout.boot_indicator != BOOT_FLAG_ACTIVE
        {
            return Err(Error::InvalidArgument);
        }

        // Never run into the successor partition.
        let next = if self.is_logical() {
            parts
                .iter()
                .find(|p| p.is_logical() && p.id() == self.id + 1)
        } else if self.entry_no < 3 {
            parts.iter().find(|p| p.entry_no() == self.entry_no + 1)
        } else {
            None
        };
        if let Some(next) = next {
            if next.offset() <= layout.starting_offset + layout.partition_length {
                return Err(Error::InvalidArgument);
            }
        }
        Ok(())
    }

    /// Pack `layout` into a raw table entry. For a logical partition the
    /// first entry's starting sector is relative to its own EPBR, the
    /// second entry's (the chain link's) to the first EPBR.
    fn set_entry(
        &self,
        entry: &mut [u8],
        layout: &PartitionLayout,
        geometry: &DiskGeometry,
        parts: &[Arc<PartitionStream>],
        second_entry: bool,
    ) -> Result<()> {
        let bps = geometry.bytes_per_sector as u64;
        let mut starting_sector = (layout.starting_offset / bps) as u32;
        let total_sectors = (layout.partition_length / bps) as u32;

        let (mut starting_chs, ending_chs) = if starting_sector == 0 && total_sectors == 0 {
            // initialize a partition table entry
            (0, 0)
        } else {
            convert_lba_to_chs(geometry, starting_sector, total_sectors)?
        };

        if self.is_logical() {
            if second_entry {
                if starting_chs == MAX_STARTING_CHS {
                    starting_chs = MAX_STARTING_EPBR_CHS;
                }
                let extended = parts
                    .iter()
                    .find(|p| p.is_extended())
                    .ok_or(Error::InvalidArgument)?;
                let origin = (extended.offset() / bps) as u32;
                starting_sector = starting_sector.wrapping_sub(origin);
            } else {
                let br = self.state.lock().br;
                starting_sector = starting_sector.wrapping_sub((br / bps) as u32);
            }
        }

        entry[MBR_BOOT_INDICATOR] = layout.boot_indicator;
        let packed = (read_le_u32(&entry[MBR_STARTING_CHS..]) & !0xFFFFFF) | starting_chs;
        write_le_u32(&mut entry[MBR_STARTING_CHS..], packed);
        entry[MBR_SYSTEM_INDICATOR] = layout.partition_type;
        let packed = (read_le_u32(&entry[MBR_ENDING_CHS..]) & !0xFFFFFF) | ending_chs;
        write_le_u32(&mut entry[MBR_ENDING_CHS..], packed);
        write_le_u32(&mut entry[MBR_TOTAL_SECTORS..], total_sectors);
        write_le_u32(&mut entry[MBR_STARTING_SECTOR..], starting_sector);
        Ok(())
    }

    /// Rewrite the chain-link entry in the previous EPBR. Only a
    /// logical partition whose parent is itself logical has one.
    fn set_parent_epbr(
        &self,
        ctx: &PartitionContext,
        parts: &[Arc<PartitionStream>],
        layout: &PartitionLayout,
    ) -> Result<()> {
        let parent = match &self.parent {
            Some(p) if p.is_logical() => Arc::clone(p),
            _ => return Ok(()),
        };

        let geometry = ctx.geometry();
        let bps = geometry.bytes_per_sector as usize;
        if geometry.disk_size <= layout.starting_offset + layout.partition_length
            || layout.partition_length % bps as u64 != 0
            || layout.hidden_sectors != 0
        {
            return Err(Error::InvalidArgument);
        }
        if layout.boot_indicator != BOOT_FLAG_INACTIVE && layout.boot_indicator != BOOT_FLAG_ACTIVE
        {
            return Err(Error::InvalidArgument);
        }

        let parent_br = parent.state.lock().br;
        let mut epbr = vec![0u8; bps];
        ctx.device.read_blocks(&mut epbr, parent_br as usize, 1)?;
        if read_le_u16(&epbr[MBR_SIGNATURE_OFFSET..]) != MBR_SIGNATURE {
            log::warn!("EPBR not found");
            return Err(Error::InvalidArgument);
        }

        let at = MBR_PARTITION_TABLE + MBR_ENTRY_SIZE;
        self.set_entry(
            &mut epbr[at..at + MBR_ENTRY_SIZE],
            layout,
            &geometry,
            parts,
            true,
        )?;

        ctx.device.write_blocks(&epbr, parent_br as usize, 1)?;
        ctx.device.sync()?;
        Ok(())
    }

    pub(crate) fn clear_parent_epbr(
        &self,
        ctx: &PartitionContext,
        parts: &[Arc<PartitionStream>],
    ) -> Result<()> {
        let zero = PartitionLayout {
            starting_offset: 0,
            partition_length: 0,
            hidden_sectors: 0,
            partition_type: 0,
            boot_indicator: 0,
        };
        self.set_parent_epbr(ctx, parts, &zero)
    }

    pub(crate) fn set_layout_locked(
        &self,
        ctx: &PartitionContext,
        parts: &[Arc<PartitionStream>],
        layout: &PartitionLayout,
    ) -> Result<()> {
        let geometry = ctx.geometry();
        let bps = geometry.bytes_per_sector as u64;

        let mut layout = *layout;
        self.adjust_size(&geometry, &mut layout);

        if self.is_extended()
            && (layout.partition_type == PT_EXTENDED || layout.partition_type == PT_EXTENDED_LBA)
        {
            // The extended partition's type tracks whether its end is
            // CHS-addressable.
            let end_sector = (layout.starting_offset + layout.partition_length) / bps;
            layout.partition_type = if MAX_CHS as u64 <= end_sector {
                PT_EXTENDED_LBA
            } else {
                PT_EXTENDED
            };
        }

        self.check_layout(parts, &geometry, &layout)?;

        let br = self.state.lock().br;
        let mut sector = vec![0u8; bps as usize];
        ctx.device.read_blocks(&mut sector, br as usize, 1)?;
        if read_le_u16(&sector[MBR_SIGNATURE_OFFSET..]) != MBR_SIGNATURE {
            log::warn!("boot record not found");
            return Err(Error::InvalidArgument);
        }

        let at = MBR_PARTITION_TABLE + self.entry_no as usize * MBR_ENTRY_SIZE;
        self.set_entry(
            &mut sector[at..at + MBR_ENTRY_SIZE],
            &layout,
            &geometry,
            parts,
            false,
        )?;

        // A cleared entry carries no link; clear_parent_epbr handles
        // removal separately.
        let cleared = layout.starting_offset == 0 && layout.partition_length == 0;
        if !cleared {
            if let Some(parent) = self.parent.as_ref().filter(|p| p.is_logical()) {
                // The link in the previous EPBR spans from that EPBR to
                // the end of this partition.
                let epbr_offset = parent.offset() + parent.size();
                let mut params = layout;
                params.partition_length += params.starting_offset - epbr_offset;
                params.starting_offset = epbr_offset;
                params.partition_type = PT_EXTENDED;
                self.set_parent_epbr(ctx, parts, &params)?;
            }
        }

        log::debug!(
            "[{:02x} {:06x} {:02x} {:06x} {:08x} {:08x}]",
            sector[at + MBR_BOOT_INDICATOR],
            read_le_u32(&sector[at + MBR_STARTING_CHS..]) & 0xFFFFFF,
            sector[at + MBR_SYSTEM_INDICATOR],
            read_le_u32(&sector[at + MBR_ENDING_CHS..]) & 0xFFFFFF,
            read_le_u32(&sector[at + MBR_STARTING_SECTOR..]),
            read_le_u32(&sector[at + MBR_TOTAL_SECTORS..]),
        );

        ctx.device.write_blocks(&sector, br as usize, 1)?;
        ctx.device.sync()?;

        let mut st = self.state.lock();
        st.boot = sector[at + MBR_BOOT_INDICATOR];
        st.system = sector[at + MBR_SYSTEM_INDICATOR];
        st.offset = st.br + bps * read_le_u32(&sector[at + MBR_STARTING_SECTOR..]) as u64;
        st.size = bps * read_le_u32(&sector[at + MBR_TOTAL_SECTORS..]) as u64;
        Ok(())
    }

    /// Byte-addressable read bounded by the partition. The range must
    /// stay inside the declared length.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let ctx = self.context()?;
        let (base, size) = {
            let st = self.state.lock();
            (st.offset, st.size)
        };
        if size < offset + buf.len() as u64 {
            return Err(Error::InvalidArgument);
        }
        let bps = ctx.geometry().bytes_per_sector as usize;
        ctx.device
            .read_blocks(buf, (base + offset) as usize, buf.len() / bps)?;
        Ok(buf.len())
    }

    /// Byte-addressable write bounded by the partition.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let ctx = self.context()?;
        let (base, size) = {
            let st = self.state.lock();
            (st.offset, st.size)
        };
        if size < offset + buf.len() as u64 {
            return Err(Error::InvalidArgument);
        }
        let bps = ctx.geometry().bytes_per_sector as usize;
        ctx.device
            .write_blocks(buf, (base + offset) as usize, buf.len() / bps)?;
        Ok(buf.len())
    }

    pub fn flush(&self) -> Result<()> {
        let ctx = self.context()?;
        ctx.device.sync()?;
        Ok(())
    }
}

/// A partition is itself a block device, so a filesystem engine mounts
/// directly on top of it.
impl BlockDevice for PartitionStream {
    fn read_blocks(
        &self,
        buf: &mut [u8],
        offset: usize,
        _block_cnt: usize,
    ) -> core::result::Result<(), DeviceError> {
        self.read_at(offset as u64, buf)
            .map(|_| ())
            .map_err(|_| DeviceError::ReadError)
    }

    fn write_blocks(
        &self,
        buf: &[u8],
        offset: usize,
        _block_cnt: usize,
    ) -> core::result::Result<(), DeviceError> {
        self.write_at(offset as u64, buf)
            .map(|_| ())
            .map_err(|_| DeviceError::WriteError)
    }

    fn sync(&self) -> core::result::Result<(), DeviceError> {
        self.flush().map_err(|_| DeviceError::WriteError)
    }

    fn geometry(&self) -> DiskGeometry {
        let size = self.size();
        match self.ctx.upgrade() {
            Some(ctx) => {
                let mut g = ctx.geometry();
                g.disk_size = size;
                g
            }
            None => DiskGeometry {
                heads: 0,
                cylinders: 0,
                sectors_per_track: 0,
                bytes_per_sector: 512,
                disk_size: size,
            },
        }
    }
}
