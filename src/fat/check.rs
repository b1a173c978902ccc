//! Volume consistency check.
//!
//! Builds a per-cluster reference count (clusters 0 and 1 pre-marked
//! reserved), then walks the directory tree from the root verifying
//! that every chain is well-formed, matches the recorded size, and
//! touches each live cluster exactly once. Findings are reported
//! through the log; nothing is mutated.

use alloc::sync::Arc;
use alloc::vec;

use crate::fat::entry::{NAME_DOT, NAME_DOTDOT};
use crate::fat::{FatStream, FatVolume};
use crate::{Result, DIRENT_SIZE};

impl FatVolume {
    /// Verify the FAT and the directory tree. `fix_error` is accepted
    /// for interface parity; no repair policy lives at this layer.
    pub fn check_disk(self: &Arc<Self>, _fix_error: bool) -> Result<bool> {
        let count = self.bpb.count_of_clusters;
        let mut clus_refs = vec![0u8; count as usize + 2];
        clus_refs[0] = 1;
        clus_refs[1] = 1;

        // Free and bad entries are not reachable from any chain; mark
        // them referenced up front so live chains stand out.
        for n in 2..count + 2 {
            let next = self.table.read_entry(n)?;
            if next == 0 || self.bpb.is_bad_cluster(next) {
                clus_refs[n as usize] = clus_refs[n as usize].saturating_add(1);
            }
            if next == 1 || (!self.bpb.is_eof(next) && count + 2 <= next) {
                log::warn!("out of range: cluster {} is linked to {}", n, next);
            }
        }

        let root = self.root()?;
        check_stream(&root, &mut clus_refs)
    }
}

fn check_stream(stream: &Arc<FatStream>, clus_refs: &mut [u8]) -> Result<bool> {
    let vol = &stream.vol;
    let (fst_clus, size, is_dir, is_root, name) = stream.with_state(|st| {
        (
            st.fst_clus,
            st.size,
            st.fcb.is_directory(),
            st.parent.is_none(),
            st.fcb.name,
        )
    });
    let bpc = vol.bpb.bytes_per_cluster as u64;

    let mut chain_ok = true;
    if is_dir && fst_clus == 0 {
        if vol.bpb.is_fat32() || !is_root {
            log::warn!("empty directory: no cluster behind {:?}", &name);
            return Ok(false);
        }
        // The FAT12/16 root lives outside the data region; nothing to
        // walk.
        chain_ok = false;
    } else if fst_clus == 0 {
        if size != 0 {
            log::warn!("no cluster: none assigned to non-empty {:?}", &name);
            return Ok(false);
        }
        return Ok(true);
    }

    if chain_ok {
        let rounded = (size as u64 + bpc - 1) & !(bpc - 1);
        let mut chain_len: u64 = 0;
        let mut clus = fst_clus;
        while !vol.bpb.is_eof(clus) {
            if clus < 2
                || vol.bpb.is_bad_cluster(clus)
                || vol.bpb.count_of_clusters + 2 <= clus
            {
                log::warn!("bad chain: cluster {} found in {:?}", clus, &name);
                return Ok(false);
            }
            clus_refs[clus as usize] += 1;
            if 2 <= clus_refs[clus as usize] {
                log::warn!(
                    "bad chain: cluster {} referenced more than once from {:?}",
                    clus,
                    &name
                );
                return Ok(false);
            }
            chain_len += bpc;
            clus = vol.table.read_entry(clus)?;
            if rounded < chain_len {
                break;
            }
        }
        if rounded != chain_len {
            log::warn!(
                "size mismatch: size {} vs chain length {} in {:?}",
                size,
                chain_len,
                &name
            );
            return Ok(false);
        }
    }

    let mut result = true;
    if is_dir {
        let mut cursor = if is_root { 0 } else { 2 * DIRENT_SIZE as u32 };
        loop {
            let found = {
                let mut st = stream.state.lock();
                let (item, _) = stream.find_next_locked(&mut st, &mut cursor, 0)?;
                item.map(|(sde, _)| (sde, cursor - DIRENT_SIZE as u32, st.fst_clus))
            };
            let (sde, offset, dir_clus) = match found {
                Some(f) => f,
                None => break,
            };
            if sde.name == NAME_DOT || sde.name == NAME_DOTDOT {
                continue;
            }
            let child = vol.get_or_create(dir_clus, offset, Arc::clone(stream), sde)?;
            if !check_stream(&child, clus_refs)? {
                result = false;
            }
        }
    }
    Ok(result)
}
