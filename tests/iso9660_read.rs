//! ISO 9660 mounting, Joliet selection, deep lookups, read-only rules.

mod vdisk;

use std::sync::Arc;

use vdisk::VDisk;
use volfs::device::BlockDevice;
use volfs::iso9660::IsoVolume;
use volfs::Error;

const BLOCK: usize = 2048;

/// Minimal image builder: one block per directory, flat extent
/// allocation, both a primary (ASCII) and optionally a Joliet
/// supplementary descriptor.
struct IsoBuilder {
    blocks: Vec<Vec<u8>>,
}

impl IsoBuilder {
    fn new() -> Self {
        // Blocks 0..16 are the system area.
        Self {
            blocks: vec![vec![0u8; BLOCK]; 16],
        }
    }

    fn push_block(&mut self, data: Vec<u8>) -> u32 {
        let mut block = data;
        block.resize(BLOCK, 0);
        self.blocks.push(block);
        (self.blocks.len() - 1) as u32
    }

    fn record(identifier: &[u8], location: u32, data_len: u32, flags: u8) -> Vec<u8> {
        let mut len = 33 + identifier.len();
        if len % 2 != 0 {
            len += 1; // records are padded to even length
        }
        let mut rec = vec![0u8; len];
        rec[0] = len as u8;
        rec[2..6].copy_from_slice(&location.to_le_bytes());
        rec[6..10].copy_from_slice(&location.to_be_bytes());
        rec[10..14].copy_from_slice(&data_len.to_le_bytes());
        rec[14..18].copy_from_slice(&data_len.to_be_bytes());
        rec[18] = 104; // 2004
        rec[19] = 6;
        rec[20] = 26;
        rec[25] = flags;
        rec[28] = 1; // volume sequence number
        rec[32] = identifier.len() as u8;
        rec[33..33 + identifier.len()].copy_from_slice(identifier);
        rec
    }

    fn dir_block(records: &[Vec<u8>]) -> Vec<u8> {
        let mut block = Vec::new();
        for rec in records {
            block.extend_from_slice(rec);
        }
        block
    }

    fn descriptor(vd_type: u8, root: &[u8], escape: Option<&[u8; 3]>) -> Vec<u8> {
        let mut vd = vec![0u8; BLOCK];
        vd[0] = vd_type;
        vd[1..6].copy_from_slice(b"CD001");
        vd[6] = 1;
        vd[80..84].copy_from_slice(&64u32.to_le_bytes()); // volume space
        vd[128..130].copy_from_slice(&(BLOCK as u16).to_le_bytes());
        if let Some(seq) = escape {
            vd[88..91].copy_from_slice(&seq[..]);
        }
        vd[156..156 + root.len()].copy_from_slice(root);
        vd
    }

    fn terminator() -> Vec<u8> {
        let mut vd = vec![0u8; BLOCK];
        vd[0] = 255;
        vd[1..6].copy_from_slice(b"CD001");
        vd[6] = 1;
        vd
    }

    fn build(self, primary_root: Vec<u8>, joliet_root: Option<Vec<u8>>) -> Arc<VDisk> {
        let total = self.blocks.len() + 3;
        let disk = Arc::new(VDisk::new((total * BLOCK) as u64));
        let mut image = Vec::new();
        for (i, block) in self.blocks.iter().enumerate() {
            if i == 16 {
                image.extend_from_slice(&Self::descriptor(1, &primary_root, None));
                match &joliet_root {
                    Some(root) => image.extend_from_slice(&Self::descriptor(2, root, Some(b"%/E"))),
                    None => image.extend_from_slice(&Self::terminator()),
                }
                image.extend_from_slice(&Self::terminator());
            }
            image.extend_from_slice(block);
        }
        disk.load(0, &image);
        disk
    }
}

fn ucs2(name: &str) -> Vec<u8> {
    name.encode_utf16().flat_map(|u| u.to_be_bytes()).collect()
}

/// An image whose Joliet tree nests level2/…/level7/level8.txt holding
/// `"test"`, alongside a minimal primary tree.
fn nested_image() -> Arc<VDisk> {
    let mut b = IsoBuilder::new();

    // Reserve descriptor block indices: blocks are appended after the
    // 16-block system area, descriptors land at 16..19 during build, so
    // data extents start at 19.
    let file_block = b.push_block(b"test".to_vec()); // 16 -> becomes 19

    // Directories, deepest first so each can point at its child.
    let file_rec = IsoBuilder::record(&ucs2("level8.txt;1"), file_block + 3, 4, 0);
    let mut child_block = b.push_block(IsoBuilder::dir_block(&[file_rec]));
    for level in (2..=7).rev() {
        let name = format!("level{}", level);
        let rec = IsoBuilder::record(&ucs2(&name), child_block + 3, BLOCK as u32, 0x02);
        child_block = b.push_block(IsoBuilder::dir_block(&[rec]));
    }

    let joliet_root = IsoBuilder::record(&[0], child_block + 3, BLOCK as u32, 0x02);
    let ascii_root_block = b.push_block(Vec::new());
    let primary_root = IsoBuilder::record(&[0], ascii_root_block + 3, BLOCK as u32, 0x02);
    b.build(primary_root, Some(joliet_root))
}

#[test]
fn joliet_lookup_across_seven_levels() {
    let disk: Arc<dyn BlockDevice> = nested_image();
    let vol = IsoVolume::mount(disk).unwrap();
    assert!(vol.is_joliet());

    let root = vol.root().unwrap();
    let file = root
        .lookup("level2/level3/level4/level5/level6/level7/level8.txt")
        .unwrap()
        .expect("nested file resolves");
    assert_eq!(file.size(), 4);

    let mut buf = [0u8; 4];
    assert_eq!(file.read_at(0, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"test");

    // Version tails never show in names, and lookups ignore case.
    assert_eq!(file.name().unwrap(), "level8.txt");
    assert!(root.lookup("LEVEL2").unwrap().is_some());

    // Components walk up and down.
    let again = root
        .lookup("level2/../level2/./level3")
        .unwrap()
        .expect("dot components resolve");
    assert!(again.is_directory());

    vol.dismount().unwrap();
}

#[test]
fn identity_is_stable() {
    let disk: Arc<dyn BlockDevice> = nested_image();
    let vol = IsoVolume::mount(disk).unwrap();
    let root = vol.root().unwrap();

    let one = root.lookup("level2").unwrap().unwrap();
    let two = root.lookup("level2").unwrap().unwrap();
    assert!(Arc::ptr_eq(&one, &two));

    vol.dismount().unwrap();
}

#[test]
fn every_mutator_reports_read_only() {
    let disk: Arc<dyn BlockDevice> = nested_image();
    let vol = IsoVolume::mount(disk).unwrap();
    let root = vol.root().unwrap();
    let file = root
        .lookup("level2/level3/level4/level5/level6/level7/level8.txt")
        .unwrap()
        .unwrap();

    assert_eq!(file.write_at(0, b"x").unwrap_err(), Error::ReadOnlyFs);
    assert_eq!(file.set_size(10).unwrap_err(), Error::ReadOnlyFs);
    assert_eq!(
        file.set_last_write_time(volfs::datetime::EPOCH).unwrap_err(),
        Error::ReadOnlyFs
    );
    assert_eq!(root.create("nope", 0).unwrap_err(), Error::ReadOnlyFs);
    assert_eq!(root.remove().unwrap_err(), Error::ReadOnlyFs);
    assert_eq!(root.rename("a", "b").unwrap_err(), Error::ReadOnlyFs);
    assert_eq!(root.unbind("level2").unwrap_err(), Error::ReadOnlyFs);

    vol.dismount().unwrap();
}

#[test]
fn ascii_tree_strips_versions() {
    let mut b = IsoBuilder::new();
    let data_block = b.push_block(b"hello".to_vec()); // lands at +3
    let file_rec = IsoBuilder::record(b"README.TXT;1", data_block + 3, 5, 0);
    let root_block = b.push_block(IsoBuilder::dir_block(&[file_rec]));
    let primary_root = IsoBuilder::record(&[0], root_block + 3, BLOCK as u32, 0x02);
    // Terminator directly after the primary: blocks shift by 3 as well.
    let disk: Arc<dyn BlockDevice> = b.build(primary_root, None);

    let vol = IsoVolume::mount(disk).unwrap();
    assert!(!vol.is_joliet());
    let root = vol.root().unwrap();

    // Case-insensitive, version-blind matching.
    let file = root.lookup("readme.txt").unwrap().expect("ascii resolves");
    let mut buf = [0u8; 5];
    assert_eq!(file.read_at(0, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
    assert_eq!(file.name().unwrap(), "README.TXT");

    assert_eq!(root.list_names().unwrap(), vec!["README.TXT"]);
    assert!(root.lookup("missing.txt").unwrap().is_none());

    vol.dismount().unwrap();
}
