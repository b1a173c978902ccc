//! Create, list, rename and remove on a freshly formatted floppy.

mod vdisk;

use std::sync::Arc;

use vdisk::VDisk;
use volfs::datetime::{DateTime, FixedClock};
use volfs::device::BlockDevice;
use volfs::fat::{format, FatVariant, FatVolume};
use volfs::Error;

fn mount_floppy() -> Arc<FatVolume> {
    let disk: Arc<dyn BlockDevice> = Arc::new(VDisk::new(2880 * 512));
    format::format(&disk).unwrap();
    let clock = Arc::new(FixedClock(DateTime::new(2004, 6, 26, 13, 41, 0)));
    FatVolume::mount(disk, clock).unwrap()
}

#[test]
fn create_list_rename_remove() {
    let vol = mount_floppy();
    assert_eq!(vol.variant(), FatVariant::Fat12);
    let root = vol.root().unwrap();

    root.bind("bar.TXT").unwrap();
    root.bind("TAR.txt").unwrap();
    root.bind("Foo.txt").unwrap();
    root.create_subcontext("Subcontext").unwrap();
    root.rename("Subcontext", "Subfolder").unwrap();

    let mut names = root.list_names().unwrap();
    names.sort();
    assert_eq!(names, ["Foo.txt", "Subfolder", "TAR.txt", "bar.TXT"]);

    // Byte I/O through the stream.
    let foo = root.lookup("Foo.txt").unwrap().unwrap();
    let data = b"0123456789\n";
    foo.set_size(data.len() as u64).unwrap();
    assert_eq!(foo.write_at(0, data).unwrap(), data.len());
    foo.flush().unwrap();
    let mut back = [0u8; 11];
    assert_eq!(foo.read_at(0, &mut back).unwrap(), data.len());
    assert_eq!(&back, data);

    root.unbind("TAR.txt").unwrap();
    root.destroy_subcontext("Subfolder").unwrap();

    let mut names = root.list_names().unwrap();
    names.sort();
    assert_eq!(names, ["Foo.txt", "bar.TXT"]);

    assert!(vol.check_disk(false).unwrap());
    vol.dismount().unwrap();
}

#[test]
fn names_round_trip() {
    let vol = mount_floppy();
    let root = vol.root().unwrap();

    // Accepted names come back byte for byte through the long name.
    for name in [
        "Foo.txt",
        "abc_defgh",
        "a.b.c",
        "a b c",
        "ﾃﾞｨﾚｸﾄﾘ",
        "ファイル",
    ] {
        let stream = root.bind(name).unwrap();
        assert_eq!(stream.name().unwrap(), name);
        let again = root.lookup(name).unwrap().unwrap();
        assert!(Arc::ptr_eq(&stream, &again));
    }

    // An 8.3-conformant name is stored without a long-name run and
    // still reads back with its case.
    let plain = root.bind("TAR.txt").unwrap();
    assert_eq!(plain.name().unwrap(), "TAR.txt");

    vol.dismount().unwrap();
}

#[test]
fn lossy_aliases_get_numeric_tails() {
    let vol = mount_floppy();
    let root = vol.root().unwrap();

    root.bind("Foo.txt").unwrap();
    root.bind("foO.txt").unwrap_err(); // collides case-insensitively

    let first = root.lookup("FOO~1.TXT").unwrap();
    assert!(first.is_some(), "lossy name reachable through its alias");
    assert_eq!(first.unwrap().name().unwrap(), "Foo.txt");

    // Two distinct long names sharing one alias base take successive
    // tails in the same window.
    root.bind("a b.txt").unwrap();
    root.bind("a  b.txt").unwrap();
    let second = root.lookup("AB~2.TXT").unwrap().unwrap();
    assert_eq!(second.name().unwrap(), "a  b.txt");

    vol.dismount().unwrap();
}

#[test]
fn collisions_and_misses() {
    let vol = mount_floppy();
    let root = vol.root().unwrap();

    root.bind("data.bin").unwrap();
    assert_eq!(root.bind("data.bin").unwrap_err(), Error::Already);
    assert_eq!(root.bind("DATA.BIN").unwrap_err(), Error::Already);

    assert!(root.lookup("absent").unwrap().is_none());
    assert!(root.lookup("data.bin/impossible").unwrap().is_none());

    // Illegal characters are refused outright.
    assert_eq!(root.bind("a*b").unwrap_err(), Error::AccessDenied);

    vol.dismount().unwrap();
}

#[test]
fn identity_is_stable_across_lookups() {
    let vol = mount_floppy();
    let root = vol.root().unwrap();

    let dir = root.create_subcontext("work").unwrap();
    let file = dir.bind("notes.txt").unwrap();

    let via_path = root.lookup("work/notes.txt").unwrap().unwrap();
    assert!(Arc::ptr_eq(&file, &via_path));
    let via_backslash = root.lookup("work\\notes.txt").unwrap().unwrap();
    assert!(Arc::ptr_eq(&file, &via_backslash));

    // Dot and dotdot resolve without new objects.
    let same_dir = root.lookup("work/.").unwrap().unwrap();
    assert!(Arc::ptr_eq(&dir, &same_dir));
    let back_up = root.lookup("work/..").unwrap().unwrap();
    assert!(Arc::ptr_eq(&root, &back_up));

    vol.dismount().unwrap();
}

#[test]
fn remove_then_lookup_misses() {
    let vol = mount_floppy();
    let root = vol.root().unwrap();

    root.bind("gone.txt").unwrap();
    assert!(root.lookup("gone.txt").unwrap().is_some());
    root.unbind("gone.txt").unwrap();
    assert!(root.lookup("gone.txt").unwrap().is_none());

    // The slot is reusable.
    root.bind("gone.txt").unwrap();
    assert!(root.lookup("gone.txt").unwrap().is_some());

    vol.dismount().unwrap();
}
