//! FAT volume formatting.
//!
//! The variant is chosen by medium size (up to 4.2 MB becomes FAT12,
//! under 512 MB FAT16, FAT32 beyond), and the sectors-per-cluster value
//! comes from the tabulated ladders so the resulting cluster count lands
//! inside the variant's legal range. The boot sector is stamped field by
//! field; no boot code is installed.

use alloc::sync::Arc;
use alloc::vec;

use crate::device::{BlockDevice, DiskGeometry};
use crate::fat::bpb;
use crate::{
    write_le_u16, write_le_u32, Error, Result, FAT16_CLN_SHUT_BIT_MASK, FAT16_HRD_ERR_BIT_MASK,
    FAT32_CLN_SHUT_BIT_MASK, FAT32_HRD_ERR_BIT_MASK, LEAD_SIGNATURE, MBR_SIGNATURE,
    STRUCT_SIGNATURE, TRAIL_SIGNATURE,
};

struct DiskSizeToSecPerClus {
    disk_size: u32, // in sectors
    sec_per_clus: u8,
}

/// The FAT16 ladder assumes 1 reserved sector, 2 FATs and 512 root
/// entries. A zero sectors-per-cluster trips an error.
static DSK_TABLE_FAT16: [DiskSizeToSecPerClus; 8] = [
    DiskSizeToSecPerClus { disk_size: 8400, sec_per_clus: 0 },
    DiskSizeToSecPerClus { disk_size: 32680, sec_per_clus: 2 },
    DiskSizeToSecPerClus { disk_size: 262144, sec_per_clus: 4 },
    DiskSizeToSecPerClus { disk_size: 524288, sec_per_clus: 8 },
    DiskSizeToSecPerClus { disk_size: 1048576, sec_per_clus: 16 },
    DiskSizeToSecPerClus { disk_size: 2097152, sec_per_clus: 32 },
    DiskSizeToSecPerClus { disk_size: 4194304, sec_per_clus: 64 },
    DiskSizeToSecPerClus { disk_size: 0xFFFFFFFF, sec_per_clus: 0 },
];

/// The FAT32 ladder assumes 32+ reserved sectors and 2 FATs.
static DSK_TABLE_FAT32: [DiskSizeToSecPerClus; 6] = [
    DiskSizeToSecPerClus { disk_size: 66600, sec_per_clus: 0 },
    DiskSizeToSecPerClus { disk_size: 532480, sec_per_clus: 1 },
    DiskSizeToSecPerClus { disk_size: 16777216, sec_per_clus: 8 },
    DiskSizeToSecPerClus { disk_size: 33554432, sec_per_clus: 16 },
    DiskSizeToSecPerClus { disk_size: 67108864, sec_per_clus: 32 },
    DiskSizeToSecPerClus { disk_size: 0xFFFFFFFF, sec_per_clus: 64 },
];

fn pick(table: &[DiskSizeToSecPerClus], disk_sectors: u32) -> Result<u8> {
    let entry = table
        .iter()
        .find(|e| disk_sectors <= e.disk_size)
        .ok_or(Error::InvalidArgument)?;
    if entry.sec_per_clus == 0 {
        return Err(Error::InvalidArgument);
    }
    Ok(entry.sec_per_clus)
}

/// CHS values as INT 13h would report them, with the LARGE translation
/// applied for media under 8 GB.
fn adjusted_geometry(device: &Arc<dyn BlockDevice>) -> DiskGeometry {
    let mut g = device.geometry();
    if g.disk_size < (512u64 << 24) && g.sectors_per_track < (1 << 6) {
        while 1023 < g.cylinders && g.heads < 128 {
            g.cylinders /= 2;
            g.heads *= 2;
        }
        if 1023 < g.cylinders || 127 < g.heads {
            g.cylinders = g.cylinders * g.heads / 255;
            g.heads = 255;
        }
    }
    g
}

/// Format `device`, choosing the FAT variant by its size.
pub fn format(device: &Arc<dyn BlockDevice>) -> Result<()> {
    let size = device.total_bytes();
    log::debug!("formatting {} bytes", size);
    if (1u64 << 28) * 32 * 1024 < size {
        return Err(Error::InvalidArgument);
    }

    if size <= 512 * 8400 {
        format_fat12(device)
    } else if size < 512 * 1024 * 1024 {
        format_fat16(device)
    } else {
        format_fat32(device)
    }
}

struct Layout {
    geometry: DiskGeometry,
    disk_sectors: u32,
    sec_per_clus: u8,
    rsvd_sec_cnt: u32,
    num_fats: u32,
    root_ent_cnt: u32,
    fat_sz: u32,
    media: u8,
}

fn stamp_common(sector: &mut [u8], l: &Layout, fat32: bool) {
    let g = &l.geometry;
    sector[bpb::BS_JMP_BOOT] = 0xEB;
    sector[bpb::BS_JMP_BOOT + 1] = if fat32 { 0x58 } else { 0x3C };
    sector[bpb::BS_JMP_BOOT + 2] = 0x90;
    sector[bpb::BS_OEM_NAME..bpb::BS_OEM_NAME + 8].copy_from_slice(b"MSDOS5.0");
    write_le_u16(&mut sector[bpb::BPB_BYTS_PER_SEC..], g.bytes_per_sector as u16);
    sector[bpb::BPB_SEC_PER_CLUS] = l.sec_per_clus;
    write_le_u16(&mut sector[bpb::BPB_RSVD_SEC_CNT..], l.rsvd_sec_cnt as u16);
    sector[bpb::BPB_NUM_FATS] = l.num_fats as u8;
    write_le_u16(&mut sector[bpb::BPB_ROOT_ENT_CNT..], l.root_ent_cnt as u16);
    let (tot16, tot32) = if l.disk_sectors >> 16 != 0 {
        (0, l.disk_sectors)
    } else {
        (l.disk_sectors as u16, 0)
    };
    write_le_u16(&mut sector[bpb::BPB_TOT_SEC16..], tot16);
    write_le_u32(&mut sector[bpb::BPB_TOT_SEC32..], tot32);
    sector[bpb::BPB_MEDIA] = l.media;
    write_le_u16(&mut sector[bpb::BPB_SEC_PER_TRK..], g.sectors_per_track as u16);
    write_le_u16(&mut sector[bpb::BPB_NUM_HEADS..], g.heads as u16);
    write_le_u32(&mut sector[bpb::BPB_HIDD_SEC..], 0);
    write_le_u16(&mut sector[bpb::BOOT_SIGNATURE_OFFSET..], MBR_SIGNATURE);
}

fn stamp_tail(sector: &mut [u8], at: usize, drv_num: u8, fs_type: &[u8; 8]) {
    // BS_DrvNum, BS_Reserved1, BS_BootSig, BS_VolID, BS_VolLab,
    // BS_FilSysType, packed in that order.
    sector[at] = drv_num;
    sector[at + 2] = 0x29;
    write_le_u32(&mut sector[at + 3..], 0);
    sector[at + 7..at + 18].copy_from_slice(b"NO NAME    ");
    sector[at + 18..at + 26].copy_from_slice(fs_type);
}

fn write_fat_region(
    device: &Arc<dyn BlockDevice>,
    l: &Layout,
    fat_head: &[u8],
) -> Result<()> {
    let bps = l.geometry.bytes_per_sector as usize;
    let mut sector = vec![0u8; bps];
    sector[..fat_head.len()].copy_from_slice(fat_head);
    for j in 0..l.num_fats {
        let at = (l.rsvd_sec_cnt + j * l.fat_sz) as usize * bps;
        device.write_blocks(&sector, at, 1)?;
    }
    sector[..fat_head.len()].fill(0);
    for i in 1..l.fat_sz {
        for j in 0..l.num_fats {
            let at = (l.rsvd_sec_cnt + j * l.fat_sz + i) as usize * bps;
            device.write_blocks(&sector, at, 1)?;
        }
    }
    Ok(())
}

fn zero_sectors(device: &Arc<dyn BlockDevice>, bps: usize, start: u32, count: u32) -> Result<()> {
    let sector = vec![0u8; bps];
    for i in 0..count {
        device.write_blocks(&sector, (start + i) as usize * bps, 1)?;
    }
    Ok(())
}

fn format_fat12(device: &Arc<dyn BlockDevice>) -> Result<()> {
    let geometry = adjusted_geometry(device);
    if geometry.bytes_per_sector != 512 {
        return Err(Error::InvalidArgument);
    }
    let disk_sectors = (geometry.disk_size / geometry.bytes_per_sector as u64) as u32;

    // The 3.5" 2HD layout; other small media get the same parameters
    // with a computed FAT size.
    let sec_per_clus = 1u8;
    let root_ent_cnt = 224u32;
    let rsvd_sec_cnt = 1u32;
    let num_fats = 2u32;
    let media: u8 = if disk_sectors == 2880 { 0xF0 } else { 0xF8 };
    let root_dir_sectors = (root_ent_cnt * 32 + 511) / 512;

    let fat_sz = if disk_sectors == 2880 {
        9
    } else {
        // Fixed point: 1.5 bytes per cluster entry.
        let mut fat_sz = 1u32;
        loop {
            let data = disk_sectors - rsvd_sec_cnt - root_dir_sectors - num_fats * fat_sz;
            let clusters = data / sec_per_clus as u32 + 2;
            let need = (clusters * 3 / 2 + 511) / 512;
            if need <= fat_sz {
                break;
            }
            fat_sz = need;
        }
        fat_sz
    };

    let l = Layout {
        geometry,
        disk_sectors,
        sec_per_clus,
        rsvd_sec_cnt,
        num_fats,
        root_ent_cnt,
        fat_sz,
        media,
    };

    let mut sector = vec![0u8; 512];
    stamp_common(&mut sector, &l, false);
    write_le_u16(&mut sector[bpb::BPB_FAT_SZ16..], fat_sz as u16);
    stamp_tail(&mut sector, bpb::BS_DRV_NUM, 0x00, b"FAT12   ");
    device.write_blocks(&sector, 0, 1)?;

    write_fat_region(device, &l, &[media, 0x8F, 0xFF])?;
    zero_sectors(device, 512, rsvd_sec_cnt + num_fats * fat_sz, root_dir_sectors)?;
    device.sync()?;
    Ok(())
}

fn format_fat16(device: &Arc<dyn BlockDevice>) -> Result<()> {
    let geometry = adjusted_geometry(device);
    let bps = geometry.bytes_per_sector;
    let disk_sectors = (geometry.disk_size / bps as u64) as u32;
    let sec_per_clus = pick(&DSK_TABLE_FAT16, disk_sectors)?;

    let root_ent_cnt = 512u32;
    let rsvd_sec_cnt = 1u32;
    let num_fats = 2u32;
    let root_dir_sectors = (root_ent_cnt * 32 + bps - 1) / bps;
    let tmp1 = disk_sectors - (rsvd_sec_cnt + root_dir_sectors);
    let tmp2 = 256 * sec_per_clus as u32 + num_fats;
    let fat_sz = (tmp1 + 2 * sec_per_clus as u32 + tmp2 - 1) / tmp2;

    let l = Layout {
        geometry,
        disk_sectors,
        sec_per_clus,
        rsvd_sec_cnt,
        num_fats,
        root_ent_cnt,
        fat_sz,
        media: 0xF8,
    };

    let mut sector = vec![0u8; bps as usize];
    stamp_common(&mut sector, &l, false);
    write_le_u16(&mut sector[bpb::BPB_FAT_SZ16..], fat_sz as u16);
    stamp_tail(&mut sector, bpb::BS_DRV_NUM, 0x80, b"FAT16   ");
    device.write_blocks(&sector, 0, 1)?;

    let mut head = [0u8; 4];
    write_le_u16(&mut head[0..], 0xFF00 | l.media as u16);
    write_le_u16(
        &mut head[2..],
        0xFFF8 | FAT16_CLN_SHUT_BIT_MASK as u16 | FAT16_HRD_ERR_BIT_MASK as u16,
    );
    write_fat_region(device, &l, &head)?;
    zero_sectors(device, bps as usize, rsvd_sec_cnt + num_fats * fat_sz, root_dir_sectors)?;
    device.sync()?;
    Ok(())
}

fn format_fat32(device: &Arc<dyn BlockDevice>) -> Result<()> {
    let geometry = adjusted_geometry(device);
    let bps = geometry.bytes_per_sector;
    let disk_sectors = (geometry.disk_size / bps as u64) as u32;
    let sec_per_clus = pick(&DSK_TABLE_FAT32, disk_sectors)?;

    let root_ent_cnt = 0u32;
    let rsvd_sec_cnt = 36u32;
    let num_fats = 2u32;
    let tmp1 = disk_sectors - rsvd_sec_cnt;
    let tmp2 = 128 * sec_per_clus as u32 + num_fats;
    let fat_sz = (tmp1 + 2 * sec_per_clus as u32 + tmp2 - 1) / tmp2;

    let l = Layout {
        geometry,
        disk_sectors,
        sec_per_clus,
        rsvd_sec_cnt,
        num_fats,
        root_ent_cnt,
        fat_sz,
        media: 0xF8,
    };

    let mut sector = vec![0u8; bps as usize];
    stamp_common(&mut sector, &l, true);
    write_le_u16(&mut sector[bpb::BPB_FAT_SZ16..], 0);
    write_le_u32(&mut sector[bpb::BPB_FAT_SZ32..], fat_sz);
    write_le_u16(&mut sector[bpb::BPB_EXT_FLAGS..], 0);
    write_le_u16(&mut sector[bpb::BPB_FS_VER..], 0);
    write_le_u32(&mut sector[bpb::BPB_ROOT_CLUS..], 2);
    write_le_u16(&mut sector[bpb::BPB_FS_INFO..], 1);
    write_le_u16(&mut sector[bpb::BPB_BK_BOOT_SEC..], 6);
    stamp_tail(&mut sector, bpb::BS32_DRV_NUM, 0x80, b"FAT32   ");
    device.write_blocks(&sector, 0, 1)?;
    device.write_blocks(&sector, 6 * bps as usize, 1)?;

    // FSInfo: everything free but the root cluster, next search at 3.
    let mut fsinfo = vec![0u8; bps as usize];
    write_le_u32(&mut fsinfo[bpb::FSI_LEAD_SIG..], LEAD_SIGNATURE);
    write_le_u32(&mut fsinfo[bpb::FSI_STRUC_SIG..], STRUCT_SIGNATURE);
    write_le_u32(
        &mut fsinfo[bpb::FSI_FREE_COUNT..],
        (tmp1 - num_fats * fat_sz) / sec_per_clus as u32 - 1,
    );
    write_le_u32(&mut fsinfo[bpb::FSI_NXT_FREE..], 3);
    write_le_u32(&mut fsinfo[bpb::FSI_TRAIL_SIG..], TRAIL_SIGNATURE);
    device.write_blocks(&fsinfo, bps as usize, 1)?;

    let mut head = [0u8; 12];
    write_le_u32(&mut head[0..], 0x0FFF_FF00 | l.media as u32);
    write_le_u32(
        &mut head[4..],
        0x0FFF_FFF8 | FAT32_CLN_SHUT_BIT_MASK | FAT32_HRD_ERR_BIT_MASK,
    );
    write_le_u32(&mut head[8..], 0x0FFF_FFF8); // the root chain
    write_fat_region(device, &l, &head)?;

    // The root directory cluster.
    zero_sectors(
        device,
        bps as usize,
        rsvd_sec_cnt + num_fats * fat_sz,
        sec_per_clus as u32,
    )?;
    device.sync()?;
    Ok(())
}
