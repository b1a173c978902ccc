//! Read-only ISO 9660 volume engine.
//!
//! Volume descriptors start at sector 16, one 2048-byte descriptor per
//! sector, terminated by the set terminator (type 255). The primary
//! descriptor yields the default ASCII tree; the first supplementary
//! descriptor carrying one of the Joliet escape sequences supersedes it
//! with a UCS-2 tree rooted at the supplementary root record.

pub mod record;
pub mod stream;

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec;

use lru::LruCache;
use spin::Mutex;

use crate::cache::BlockCacheManager;
use crate::device::BlockDevice;
use crate::{read_le_u16, read_le_u32, Error, Result};

pub use record::DirRecord;
pub use stream::{IsoIterator, IsoStream};

pub const ISO_BLOCK_SIZE: usize = 2048;

// Volume descriptor layout.
const VD_TYPE: usize = 0;
const VD_STANDARD_IDENTIFIER: usize = 1;
const VD_ESCAPE_SEQUENCES: usize = 88;
const VD_VOLUME_SPACE_SIZE: usize = 80;
const VD_LOGICAL_BLOCK_SIZE: usize = 128;
const VD_ROOT_DIRECTORY: usize = 156;

const VDT_BOOT_RECORD: u8 = 0;
const VDT_PRIMARY: u8 = 1;
const VDT_SUPPLEMENTARY: u8 = 2;
const VDT_PARTITION: u8 = 3;
const VDT_TERMINATOR: u8 = 255;

const STANDARD_IDENTIFIER: &[u8; 5] = b"CD001";

/// The three UCS-2 escape sequences, one per Joliet level.
pub const UCS2_ESCAPE_SEQUENCES: [&[u8; 3]; 3] = [b"%/@", b"%/C", b"%/E"];

/// Released streams kept alive for reattachment.
const STANDBY_LIMIT: usize = 16;

pub(crate) type IsoStreamId = (u32, u32);

struct IsoStreamTable {
    hash: BTreeMap<IsoStreamId, Weak<IsoStream>>,
    standby: LruCache<IsoStreamId, Arc<IsoStream>>,
}

pub struct IsoVolume {
    pub(crate) cache: Arc<Mutex<BlockCacheManager>>,
    pub(crate) block_size: u32,
    /// The matched Joliet escape sequence; `None` for a plain ASCII
    /// (level 1) tree.
    pub(crate) escape_sequence: Option<&'static [u8; 3]>,
    volume_space_blocks: u32,
    streams: Mutex<IsoStreamTable>,
    root: Mutex<Option<Arc<IsoStream>>>,
}

impl IsoVolume {
    /// Mount the image, scanning descriptors until the terminator. The
    /// first Joliet supplementary descriptor wins over the primary.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Arc<Self>> {
        let cache = Arc::new(Mutex::new(BlockCacheManager::new(
            Arc::clone(&device),
            ISO_BLOCK_SIZE,
        )));

        let mut escape_sequence: Option<&'static [u8; 3]> = None;
        let mut root_record: Option<DirRecord> = None;
        let mut block_size = ISO_BLOCK_SIZE as u32;
        let mut volume_space_blocks = 0u32;

        let mut vd = vec![0u8; ISO_BLOCK_SIZE];
        let mut sector = 16usize;
        loop {
            cache.lock().read_at(sector * ISO_BLOCK_SIZE, &mut vd)?;
            if &vd[VD_STANDARD_IDENTIFIER..VD_STANDARD_IDENTIFIER + 5] != STANDARD_IDENTIFIER {
                return Err(Error::InvalidArgument);
            }
            match vd[VD_TYPE] {
                VDT_BOOT_RECORD => log::debug!("boot record descriptor"),
                VDT_PRIMARY => {
                    log::debug!("primary volume descriptor");
                    if escape_sequence.is_none() {
                        root_record = Some(DirRecord::parse(&vd[VD_ROOT_DIRECTORY..])?);
                        block_size = read_le_u16(&vd[VD_LOGICAL_BLOCK_SIZE..]) as u32;
                        volume_space_blocks = read_le_u32(&vd[VD_VOLUME_SPACE_SIZE..]);
                    }
                }
                VDT_SUPPLEMENTARY => {
                    for seq in UCS2_ESCAPE_SEQUENCES.iter() {
                        if &vd[VD_ESCAPE_SEQUENCES..VD_ESCAPE_SEQUENCES + 3] == &seq[..]
                            && vd[VD_ESCAPE_SEQUENCES + 3] == 0
                        {
                            log::debug!("Joliet supplementary descriptor ({:?})", seq);
                            escape_sequence = Some(*seq);
                            root_record = Some(DirRecord::parse(&vd[VD_ROOT_DIRECTORY..])?);
                            block_size = read_le_u16(&vd[VD_LOGICAL_BLOCK_SIZE..]) as u32;
                            volume_space_blocks = read_le_u32(&vd[VD_VOLUME_SPACE_SIZE..]);
                            break;
                        }
                    }
                }
                VDT_PARTITION => log::debug!("volume partition descriptor"),
                VDT_TERMINATOR => break,
                other => log::debug!("unknown descriptor type {}", other),
            }
            sector += 1;
        }

        let root_record = root_record.ok_or(Error::InvalidArgument)?;
        if block_size == 0 {
            block_size = ISO_BLOCK_SIZE as u32;
        }

        let vol = Arc::new(Self {
            cache,
            block_size,
            escape_sequence,
            volume_space_blocks,
            streams: Mutex::new(IsoStreamTable {
                hash: BTreeMap::new(),
                standby: LruCache::unbounded(),
            }),
            root: Mutex::new(None),
        });

        let root = IsoStream::new(Arc::clone(&vol), None, 0, &root_record);
        *vol.root.lock() = Some(root);
        Ok(vol)
    }

    pub fn dismount(&self) -> Result<()> {
        self.root.lock().take();
        let mut t = self.streams.lock();
        t.standby.clear();
        t.hash.clear();
        Ok(())
    }

    pub fn root(&self) -> Result<Arc<IsoStream>> {
        self.root.lock().clone().ok_or(Error::InvalidArgument)
    }

    pub fn is_joliet(&self) -> bool {
        self.escape_sequence.is_some()
    }

    pub fn free_space(&self) -> u64 {
        0
    }

    pub fn total_space(&self) -> u64 {
        self.volume_space_blocks as u64 * self.block_size as u64
    }

    pub fn check_disk(&self, _fix_error: bool) -> Result<bool> {
        Ok(true)
    }

    /// Interface parity; there is nothing to defragment.
    pub fn defrag(&self) -> Result<()> {
        Ok(())
    }

    pub(crate) fn get_or_create(
        self: &Arc<Self>,
        dir_location: u32,
        offset: u32,
        parent: Arc<IsoStream>,
        rec: &DirRecord,
    ) -> Arc<IsoStream> {
        let id = (dir_location, offset);
        let hit = {
            let mut t = self.streams.lock();
            let existing = t.hash.get(&id).and_then(|w| w.upgrade());
            match existing {
                Some(s) => {
                    t.standby.put(id, Arc::clone(&s));
                    trim(&mut t);
                    Some(s)
                }
                None => {
                    t.hash.remove(&id);
                    None
                }
            }
        };
        if let Some(s) = hit {
            return s;
        }
        IsoStream::new(Arc::clone(self), Some(parent), offset, rec)
    }

    pub(crate) fn register(&self, stream: &Arc<IsoStream>) {
        if stream.is_root() {
            return;
        }
        let mut t = self.streams.lock();
        t.hash.insert(stream.id(), Arc::downgrade(stream));
        t.standby.put(stream.id(), Arc::clone(stream));
        trim(&mut t);
    }
}

fn trim(t: &mut IsoStreamTable) {
    while STANDBY_LIMIT < t.standby.len() {
        t.standby.pop_lru();
    }
}
