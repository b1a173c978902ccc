//! Size changes and free-space accounting.

mod vdisk;

use std::sync::Arc;

use vdisk::VDisk;
use volfs::datetime::{DateTime, FixedClock};
use volfs::device::BlockDevice;
use volfs::fat::{format, FatVolume};
use volfs::Error;

fn mount_floppy() -> Arc<FatVolume> {
    let disk: Arc<dyn BlockDevice> = Arc::new(VDisk::new(2880 * 512));
    format::format(&disk).unwrap();
    let clock = Arc::new(FixedClock(DateTime::new(2004, 6, 26, 13, 41, 0)));
    FatVolume::mount(disk, clock).unwrap()
}

#[test]
fn grow_and_shrink_keep_free_space_closed() {
    let vol = mount_floppy();
    let root = vol.root().unwrap();
    let cluster = 512u64; // one sector per cluster on the floppy
    let initial_free = vol.free_clusters();

    let file = root.bind("grow.bin").unwrap();
    assert_eq!(file.size(), 0);
    assert_eq!(file.first_cluster(), 0);

    file.set_size(3000).unwrap();
    assert_eq!(file.size(), 3000);
    assert_ne!(file.first_cluster(), 0);
    let used = (3000 + cluster - 1) / cluster;
    assert_eq!(vol.free_clusters(), initial_free - used as u32);

    // Shrinking keeps the head of the chain and frees the tail.
    file.set_size(100).unwrap();
    assert_eq!(file.size(), 100);
    assert_eq!(vol.free_clusters(), initial_free - 1);

    // Shrinking to zero detaches the chain entirely.
    file.set_size(0).unwrap();
    assert_eq!(file.size(), 0);
    assert_eq!(file.first_cluster(), 0);
    assert_eq!(vol.free_clusters(), initial_free);

    assert!(vol.check_disk(false).unwrap());
    vol.dismount().unwrap();
}

#[test]
fn write_never_extends() {
    let vol = mount_floppy();
    let root = vol.root().unwrap();

    let file = root.bind("fixed.bin").unwrap();
    file.set_size(10).unwrap();

    // A write that would run past the size is clamped, and a write
    // starting past the size is an error.
    assert_eq!(file.write_at(5, &[7u8; 10]).unwrap(), 5);
    assert_eq!(file.write_at(11, &[7u8; 1]).unwrap_err(), Error::InvalidArgument);
    assert_eq!(file.read_at(11, &mut [0u8; 1]).unwrap_err(), Error::InvalidArgument);

    vol.dismount().unwrap();
}

#[test]
fn oversize_and_root_resizes_are_rejected() {
    let vol = mount_floppy();
    let root = vol.root().unwrap();

    let file = root.bind("limits.bin").unwrap();
    assert_eq!(
        file.set_size(0x1_0000_0000).unwrap_err(),
        Error::InvalidArgument
    );

    // The FAT12/16 root directory region is fixed.
    assert_eq!(root.set_size(65536).unwrap_err(), Error::InvalidArgument);

    vol.dismount().unwrap();
}

#[test]
fn sparse_reads_after_growth_see_zeroed_directories_only() {
    let vol = mount_floppy();
    let root = vol.root().unwrap();

    // A fresh directory reads as empty: its cluster was zero-filled
    // before being linked.
    let dir = root.create_subcontext("fresh").unwrap();
    assert!(dir.list_names().unwrap().is_empty());
    assert_eq!(dir.size(), 512);

    vol.dismount().unwrap();
}

#[test]
fn timestamps_follow_the_clock() {
    let now = DateTime::new(2004, 6, 26, 13, 41, 0);
    let disk: Arc<dyn BlockDevice> = Arc::new(VDisk::new(2880 * 512));
    format::format(&disk).unwrap();
    let vol = FatVolume::mount(disk, Arc::new(FixedClock(now))).unwrap();
    let root = vol.root().unwrap();

    let file = root.bind("times.txt").unwrap();
    assert_eq!(file.creation_time(), now.clamp_dos());
    assert_eq!(file.last_write_time().year, 2004);

    // Setters clamp into the DOS range.
    file.set_last_write_time(DateTime::new(1969, 7, 20, 0, 0, 0))
        .unwrap();
    assert_eq!(file.last_write_time(), volfs::datetime::EPOCH);

    vol.dismount().unwrap();
}
