//! Block device interface

use core::any::Any;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    ReadError,
    WriteError,
}

/// Physical shape of a disk as reported by its driver. `cylinders`,
/// `heads` and `sectors_per_track` only matter to the partition
/// manager's CHS packing; the filesystems care about `bytes_per_sector`
/// and `disk_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub heads: u32,
    pub cylinders: u32,
    pub sectors_per_track: u32,
    pub bytes_per_sector: u32,
    pub disk_size: u64,
}

impl DiskGeometry {
    pub fn sectors(&self) -> u64 {
        self.disk_size / self.bytes_per_sector as u64
    }

    pub fn cylinder_bytes(&self) -> u64 {
        self.heads as u64 * self.sectors_per_track as u64 * self.bytes_per_sector as u64
    }
}

pub trait BlockDevice: Send + Sync + Any {
    /// Read whole blocks from the device.
    ///
    /// - `offset` is in bytes and must be a multiple of the sector size
    /// - `block_cnt` = `buf.len() / sector_size`
    fn read_blocks(&self, buf: &mut [u8], offset: usize, block_cnt: usize)
        -> Result<(), DeviceError>;

    /// Write whole blocks to the device.
    ///
    /// - `buf.len()` and `offset` must be multiples of the sector size
    /// - `block_cnt` = `buf.len() / sector_size`
    fn write_blocks(&self, buf: &[u8], offset: usize, block_cnt: usize)
        -> Result<(), DeviceError>;

    /// Push pending writes down to the medium.
    fn sync(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn geometry(&self) -> DiskGeometry;

    fn total_bytes(&self) -> u64 {
        self.geometry().disk_size
    }
}
