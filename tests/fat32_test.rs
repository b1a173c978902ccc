//! FAT32 specifics: FSInfo hints and the clean-shutdown protocol.

mod vdisk;

use std::sync::Arc;

use vdisk::VDisk;
use volfs::datetime::{DateTime, FixedClock};
use volfs::device::BlockDevice;
use volfs::fat::{format, FatVariant, FatVolume};

fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock(DateTime::new(2004, 6, 26, 13, 41, 0)))
}

const DISK_BYTES: u64 = 600 * 1024 * 1024;

// FSInfo field offsets within sector 1.
const FSI_FREE_COUNT: usize = 488;

#[test]
fn formats_and_mounts_as_fat32() {
    let vdisk = Arc::new(VDisk::new(DISK_BYTES));
    let disk: Arc<dyn BlockDevice> = vdisk.clone();
    format::format(&disk).unwrap();

    let vol = FatVolume::mount(disk, clock()).unwrap();
    assert_eq!(vol.variant(), FatVariant::Fat32);
    // The root chain holds one cluster out of the pool.
    assert_eq!(vol.free_clusters(), vol.total_clusters() - 1);

    let root = vol.root().unwrap();
    let dir = root.create_subcontext("deeply").unwrap();
    let sub = dir.create_subcontext("nested").unwrap();
    let file = sub.bind("leaf.txt").unwrap();
    file.set_size(5).unwrap();
    file.write_at(0, b"hello").unwrap();

    let via_path = root.lookup("deeply/nested/leaf.txt").unwrap().unwrap();
    assert!(Arc::ptr_eq(&file, &via_path));
    assert!(vol.check_disk(false).unwrap());
    vol.dismount().unwrap();
}

#[test]
fn clean_dismount_persists_and_hints_are_adopted() {
    let vdisk = Arc::new(VDisk::new(DISK_BYTES));
    let disk: Arc<dyn BlockDevice> = vdisk.clone();
    format::format(&disk).unwrap();

    let true_free = {
        let vol = FatVolume::mount(disk.clone(), clock()).unwrap();
        let free = vol.free_clusters();
        vol.dismount().unwrap();
        free
    };

    // Tamper with the persisted hint. A clean volume adopts it as-is,
    // which is observable as a wrong free count.
    let mut fsinfo = [0u8; 512];
    vdisk.read_blocks(&mut fsinfo, 512, 1).unwrap();
    let wrong = true_free - 5;
    fsinfo[FSI_FREE_COUNT..FSI_FREE_COUNT + 4].copy_from_slice(&wrong.to_le_bytes());
    vdisk.write_blocks(&fsinfo, 512, 1).unwrap();

    let vol = FatVolume::mount(disk.clone(), clock()).unwrap();
    assert_eq!(vol.free_clusters(), wrong, "clean mount trusts FSInfo");

    // Drop without dismounting: the clean flag stays cleared on disk,
    // so the next mount distrusts the hints and recomputes.
    drop(vol);
    let vol = FatVolume::mount(disk, clock()).unwrap();
    assert_eq!(vol.free_clusters(), true_free, "dirty mount recomputes");
    assert!(vol.check_disk(false).unwrap());
    vol.dismount().unwrap();
}

#[test]
fn free_space_closure_across_operations() {
    let vdisk = Arc::new(VDisk::new(DISK_BYTES));
    let disk: Arc<dyn BlockDevice> = vdisk.clone();
    format::format(&disk).unwrap();
    let vol = FatVolume::mount(disk, clock()).unwrap();
    let root = vol.root().unwrap();
    let initial = vol.free_clusters();

    let dir = root.create_subcontext("scratch").unwrap(); // one cluster
    let file = dir.bind("blob.bin").unwrap();
    file.set_size(100 * 1024).unwrap();
    let per_cluster = vol.total_space() / vol.total_clusters() as u64;
    let used = 1 + (100 * 1024 + per_cluster - 1) / per_cluster;
    assert_eq!(vol.free_clusters() as u64, initial as u64 - used);

    file.set_size(0).unwrap();
    drop(file);
    dir.unbind("blob.bin").unwrap();
    drop(dir);
    // A removed directory's cluster returns to the pool once the last
    // handle is gone.
    root.destroy_subcontext("scratch").unwrap();
    assert_eq!(vol.free_clusters(), initial);
    assert!(vol.check_disk(false).unwrap());
    vol.dismount().unwrap();
}
