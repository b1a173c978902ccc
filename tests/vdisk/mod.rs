//! In-memory disk used by the integration suites.
//!
//! Sectors are stored sparsely so even the over-8GB scenarios fit in
//! memory; unwritten sectors read back as zeros.

use std::collections::HashMap;
use std::sync::Mutex;

use volfs::device::{BlockDevice, DeviceError, DiskGeometry};

pub const SECTOR_SIZE: usize = 512;

pub struct VDisk {
    sectors: Mutex<HashMap<usize, Vec<u8>>>,
    geometry: DiskGeometry,
}

impl VDisk {
    /// A disk of `total_bytes`, with floppy-like geometry for small
    /// media and 255/63 translation for anything bigger.
    pub fn new(total_bytes: u64) -> Self {
        let sectors = total_bytes / SECTOR_SIZE as u64;
        let (heads, sectors_per_track) = if sectors <= 2880 {
            (2, 18)
        } else {
            (255, 63)
        };
        let cylinders = (sectors / (heads as u64 * sectors_per_track as u64)).max(1) as u32;
        Self {
            sectors: Mutex::new(HashMap::new()),
            geometry: DiskGeometry {
                heads,
                cylinders,
                sectors_per_track,
                bytes_per_sector: SECTOR_SIZE as u32,
                disk_size: total_bytes,
            },
        }
    }

    /// Pre-load whole sectors, for image-building tests.
    pub fn load(&self, offset: usize, data: &[u8]) {
        assert_eq!(offset % SECTOR_SIZE, 0);
        let mut sectors = self.sectors.lock().unwrap();
        for (i, chunk) in data.chunks(SECTOR_SIZE).enumerate() {
            let mut sector = vec![0u8; SECTOR_SIZE];
            sector[..chunk.len()].copy_from_slice(chunk);
            sectors.insert(offset / SECTOR_SIZE + i, sector);
        }
    }
}

impl BlockDevice for VDisk {
    fn read_blocks(
        &self,
        buf: &mut [u8],
        offset: usize,
        _block_cnt: usize,
    ) -> Result<(), DeviceError> {
        if self.geometry.disk_size < (offset + buf.len()) as u64 {
            return Err(DeviceError::ReadError);
        }
        let sectors = self.sectors.lock().unwrap();
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done;
            let id = pos / SECTOR_SIZE;
            let in_sector = pos % SECTOR_SIZE;
            let len = (SECTOR_SIZE - in_sector).min(buf.len() - done);
            match sectors.get(&id) {
                Some(sector) => {
                    buf[done..done + len].copy_from_slice(&sector[in_sector..in_sector + len])
                }
                None => buf[done..done + len].fill(0),
            }
            done += len;
        }
        Ok(())
    }

    fn write_blocks(&self, buf: &[u8], offset: usize, _block_cnt: usize) -> Result<(), DeviceError> {
        if self.geometry.disk_size < (offset + buf.len()) as u64 {
            return Err(DeviceError::WriteError);
        }
        let mut sectors = self.sectors.lock().unwrap();
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done;
            let id = pos / SECTOR_SIZE;
            let in_sector = pos % SECTOR_SIZE;
            let len = (SECTOR_SIZE - in_sector).min(buf.len() - done);
            let sector = sectors.entry(id).or_insert_with(|| vec![0u8; SECTOR_SIZE]);
            sector[in_sector..in_sector + len].copy_from_slice(&buf[done..done + len]);
            done += len;
        }
        Ok(())
    }

    fn geometry(&self) -> DiskGeometry {
        self.geometry
    }
}
