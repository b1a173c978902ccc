//! Process-wide filesystem registry.
//!
//! Each engine registers a probe keyed by an interface id, so hosts can
//! ask "what mounts here?" without hard-wiring the engines. The
//! defaults are installed on first use.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::device::BlockDevice;
use crate::fat::BiosParameterBlock;
use crate::part::MBR_SIGNATURE_OFFSET;
use crate::{read_le_u16, MBR_SIGNATURE};

pub const FAT_FILE_SYSTEM: &str = "fat";
pub const ISO9660_FILE_SYSTEM: &str = "iso9660";
pub const PARTITION_CONTEXT: &str = "partition";

/// Answers whether the engine behind the id can mount the device.
pub type ProbeFn = fn(&Arc<dyn BlockDevice>) -> bool;

lazy_static! {
    static ref REGISTRY: Mutex<BTreeMap<&'static str, ProbeFn>> = Mutex::new(BTreeMap::new());
}

pub fn register(id: &'static str, probe: ProbeFn) {
    REGISTRY.lock().insert(id, probe);
}

fn probe_fat(device: &Arc<dyn BlockDevice>) -> bool {
    let mut sector = [0u8; 512];
    if device.read_blocks(&mut sector, 0, 1).is_err() {
        return false;
    }
    BiosParameterBlock::parse(&sector).is_ok()
}

fn probe_iso9660(device: &Arc<dyn BlockDevice>) -> bool {
    let mut sector = [0u8; 2048];
    if device.read_blocks(&mut sector, 16 * 2048, 1).is_err() {
        return false;
    }
    &sector[1..6] == b"CD001"
}

fn probe_partition(device: &Arc<dyn BlockDevice>) -> bool {
    let mut sector = [0u8; 512];
    if device.read_blocks(&mut sector, 0, 1).is_err() {
        return false;
    }
    read_le_u16(&sector[MBR_SIGNATURE_OFFSET..]) == MBR_SIGNATURE
        && BiosParameterBlock::parse(&sector).is_err()
}

fn ensure_defaults() {
    let mut reg = REGISTRY.lock();
    reg.entry(ISO9660_FILE_SYSTEM).or_insert(probe_iso9660);
    reg.entry(FAT_FILE_SYSTEM).or_insert(probe_fat);
    reg.entry(PARTITION_CONTEXT).or_insert(probe_partition);
}

/// The id of the first registered engine whose probe accepts `device`.
/// ISO images are probed before FAT, and a bare MBR counts as a
/// partition context only when it is not also a FAT boot sector.
pub fn probe(device: &Arc<dyn BlockDevice>) -> Option<&'static str> {
    ensure_defaults();
    let reg = REGISTRY.lock();
    let preferred = [ISO9660_FILE_SYSTEM, FAT_FILE_SYSTEM, PARTITION_CONTEXT];
    for id in preferred.iter() {
        if let Some(probe) = reg.get(id) {
            if probe(device) {
                return Some(*id);
            }
        }
    }
    for (id, probe) in reg.iter() {
        if preferred.contains(id) {
            continue;
        }
        if probe(device) {
            return Some(*id);
        }
    }
    None
}
