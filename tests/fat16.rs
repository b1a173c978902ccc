//! FAT16 variant behaviour on a 5 MB image.

mod vdisk;

use std::sync::Arc;

use vdisk::VDisk;
use volfs::datetime::{DateTime, FixedClock};
use volfs::device::BlockDevice;
use volfs::fat::{format, FatVariant, FatVolume};
use volfs::Error;

fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock(DateTime::new(2004, 6, 26, 13, 41, 0)))
}

fn mount_5mb() -> (Arc<VDisk>, Arc<FatVolume>) {
    let vdisk = Arc::new(VDisk::new(5 * 1024 * 1024));
    let disk: Arc<dyn BlockDevice> = vdisk.clone();
    format::format(&disk).unwrap();
    (vdisk, FatVolume::mount(disk, clock()).unwrap())
}

#[test]
fn five_megabytes_formats_as_fat16() {
    let (_, vol) = mount_5mb();
    assert_eq!(vol.variant(), FatVariant::Fat16);
    // 1 KiB clusters; the data region holds 5083 of them.
    assert_eq!(vol.total_space() / vol.total_clusters() as u64, 1024);
    assert_eq!(vol.total_clusters(), 5083);
    // Nothing allocated yet: the FAT16 root lives outside the data
    // region.
    assert_eq!(vol.free_clusters(), vol.total_clusters());
    vol.dismount().unwrap();
}

#[test]
fn filling_the_volume_hits_enospc() {
    let (_, vol) = mount_5mb();
    let root = vol.root().unwrap();

    let file = root.bind("big.bin").unwrap();
    let all = vol.free_space();
    file.set_size(all).unwrap();
    assert_eq!(file.size(), all);
    assert_eq!(vol.free_clusters(), 0);

    // One more byte needs one more cluster.
    assert_eq!(file.set_size(all + 1).unwrap_err(), Error::NoSpace);
    assert_eq!(file.size(), all, "failed growth leaves the size alone");

    // Another file cannot even get its first cluster.
    let other = root.bind("more.bin").unwrap();
    assert_eq!(other.set_size(1).unwrap_err(), Error::NoSpace);

    file.set_size(0).unwrap();
    assert_eq!(vol.free_clusters(), vol.total_clusters());
    assert!(vol.check_disk(false).unwrap());
    vol.dismount().unwrap();
}

#[test]
fn data_survives_remount() {
    let vdisk = Arc::new(VDisk::new(5 * 1024 * 1024));
    let disk: Arc<dyn BlockDevice> = vdisk.clone();
    format::format(&disk).unwrap();

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    {
        let vol = FatVolume::mount(disk.clone(), clock()).unwrap();
        let root = vol.root().unwrap();
        let dir = root.create_subcontext("nested").unwrap();
        let file = dir.bind("payload.bin").unwrap();
        file.set_size(payload.len() as u64).unwrap();
        assert_eq!(file.write_at(0, &payload).unwrap(), payload.len());
        vol.dismount().unwrap();
    }

    let vol = FatVolume::mount(disk, clock()).unwrap();
    let root = vol.root().unwrap();
    let file = root.lookup("nested/payload.bin").unwrap().unwrap();
    assert_eq!(file.size() as usize, payload.len());
    let mut back = vec![0u8; payload.len()];
    assert_eq!(file.read_at(0, &mut back).unwrap(), payload.len());
    assert_eq!(back, payload);
    assert!(vol.check_disk(false).unwrap());
    vol.dismount().unwrap();
}

#[test]
fn root_directory_capacity_is_bounded() {
    let (_, vol) = mount_5mb();
    let root = vol.root().unwrap();

    // 512 root entries; every 8.3 file takes exactly one. Eventually
    // the fixed region fills and creation reports no space.
    let mut made = 0;
    loop {
        let name = format!("f{}.txt", made);
        match root.bind(&name) {
            Ok(_) => made += 1,
            Err(Error::NoSpace) => break,
            Err(e) => panic!("unexpected error {:?}", e),
        }
        assert!(made <= 512, "root region should have filled by now");
    }
    assert_eq!(made, 512);
    vol.dismount().unwrap();
}
