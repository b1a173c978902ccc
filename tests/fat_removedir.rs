//! Directory removal rules and renames across parents.

mod vdisk;

use std::sync::Arc;

use vdisk::VDisk;
use volfs::datetime::{DateTime, FixedClock};
use volfs::device::BlockDevice;
use volfs::fat::{format, FatVolume, ShortDirEntry};
use volfs::{Error, DIRENT_SIZE};

fn mount_floppy() -> Arc<FatVolume> {
    let disk: Arc<dyn BlockDevice> = Arc::new(VDisk::new(2880 * 512));
    format::format(&disk).unwrap();
    let clock = Arc::new(FixedClock(DateTime::new(2004, 6, 26, 13, 41, 0)));
    FatVolume::mount(disk, clock).unwrap()
}

#[test]
fn non_empty_directories_stay() {
    let vol = mount_floppy();
    let root = vol.root().unwrap();

    let dir = root.create_subcontext("busy").unwrap();
    dir.bind("inside.txt").unwrap();

    assert_eq!(
        root.destroy_subcontext("busy").unwrap_err(),
        Error::NotPermitted
    );
    assert!(root.lookup("busy").unwrap().is_some());

    dir.unbind("inside.txt").unwrap();
    root.destroy_subcontext("busy").unwrap();
    assert!(root.lookup("busy").unwrap().is_none());

    // The root itself is never removable.
    assert_eq!(root.remove().unwrap_err(), Error::NotPermitted);

    assert!(vol.check_disk(false).unwrap());
    vol.dismount().unwrap();
}

#[test]
fn unbind_and_destroy_check_the_kind() {
    let vol = mount_floppy();
    let root = vol.root().unwrap();

    root.bind("plain.txt").unwrap();
    root.create_subcontext("folder").unwrap();

    assert_eq!(
        root.destroy_subcontext("plain.txt").unwrap_err(),
        Error::InvalidArgument
    );
    assert_eq!(root.unbind("folder").unwrap_err(), Error::InvalidArgument);

    vol.dismount().unwrap();
}

#[test]
fn rename_within_a_directory() {
    let vol = mount_floppy();
    let root = vol.root().unwrap();

    let file = root.bind("old name.txt").unwrap();
    file.set_size(3).unwrap();
    file.write_at(0, b"xyz").unwrap();

    root.rename("old name.txt", "new name.txt").unwrap();
    assert!(root.lookup("old name.txt").unwrap().is_none());

    let renamed = root.lookup("new name.txt").unwrap().unwrap();
    assert!(Arc::ptr_eq(&file, &renamed), "rename keeps the object");
    assert_eq!(renamed.name().unwrap(), "new name.txt");
    let mut buf = [0u8; 3];
    renamed.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"xyz");

    // Renaming onto an existing name collides.
    root.bind("taken.txt").unwrap();
    assert_eq!(
        root.rename("new name.txt", "taken.txt").unwrap_err(),
        Error::Already
    );

    vol.dismount().unwrap();
}

#[test]
fn rename_across_parents_rewrites_dotdot() {
    let vol = mount_floppy();
    let root = vol.root().unwrap();

    let a = root.create_subcontext("a").unwrap();
    let b = root.create_subcontext("b").unwrap();
    let moved = a.create_subcontext("d").unwrap();
    moved.bind("keep.txt").unwrap();

    root.rename("a/d", "b/d2").unwrap();

    assert!(root.lookup("a/d").unwrap().is_none());
    let found = root.lookup("b/d2").unwrap().unwrap();
    assert!(Arc::ptr_eq(&moved, &found));
    assert!(found.lookup("keep.txt").unwrap().is_some());

    // The second entry of the moved directory now names its new
    // parent's first cluster on disk.
    let mut raw = [0u8; DIRENT_SIZE];
    assert_eq!(found.read_at(DIRENT_SIZE, &mut raw).unwrap(), DIRENT_SIZE);
    let dotdot = ShortDirEntry::from_bytes(&raw);
    assert_eq!(dotdot.first_cluster(), b.first_cluster());

    // Parent links follow the move.
    let back = root.lookup("b/d2/..").unwrap().unwrap();
    assert!(Arc::ptr_eq(&back, &b));

    assert!(vol.check_disk(false).unwrap());
    vol.dismount().unwrap();
}

#[test]
fn survives_remount_after_rename() {
    let disk: Arc<dyn BlockDevice> = Arc::new(VDisk::new(2880 * 512));
    format::format(&disk).unwrap();
    let clock = Arc::new(FixedClock(DateTime::new(2004, 6, 26, 13, 41, 0)));

    {
        let vol = FatVolume::mount(disk.clone(), clock.clone()).unwrap();
        let root = vol.root().unwrap();
        let dir = root.create_subcontext("src").unwrap();
        let file = dir.bind("move me.txt").unwrap();
        file.set_size(4).unwrap();
        file.write_at(0, b"data").unwrap();
        root.create_subcontext("dst").unwrap();
        root.rename("src/move me.txt", "dst/moved.txt").unwrap();
        vol.dismount().unwrap();
    }

    let vol = FatVolume::mount(disk, clock).unwrap();
    let root = vol.root().unwrap();
    assert!(root.lookup("src/move me.txt").unwrap().is_none());
    let file = root.lookup("dst/moved.txt").unwrap().unwrap();
    let mut buf = [0u8; 4];
    file.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"data");
    assert!(vol.check_disk(false).unwrap());
    vol.dismount().unwrap();
}
