//! Allocator interface the engine calls to allocate/claim/free a physical
//! range for a logical size within a transaction group (spec §4.4). The
//! core only consumes this contract; a real metaslab implementation (free
//! space maps, space-map log, on-disk committed state) is out of scope
//! (spec §1's "DMU/object layer... " exclusion covers the allocator's
//! internals, not its interface).

use crate::bam::Dva;
use crate::error::{Result, ZioError};

/// The contract `zio::Zio`'s `DVA_ALLOCATE`/`DVA_FREE`/`DVA_CLAIM` stages
/// call into (spec §4.4).
pub trait Metaslab: Send {
    /// Chooses an extent of `size` bytes on vdev `vdev` aligned to that
    /// vdev's ashift and fills in a `Dva`. Returns `ZioError::NoSpace` on
    /// exhaustion.
    fn alloc(&mut self, vdev: u32, size: u64, txg: u64) -> Result<Dva>;

    /// Returns the extent `dva` described. Idempotent with respect to the
    /// caller's own double-free prevention: the caller guarantees
    /// at-most-once, so a second call for the same extent within the same
    /// txg is a programmer error, not a silent no-op — callers that must
    /// free defensively should track what they've freed themselves.
    fn free(&mut self, dva: &Dva, txg: u64);

    /// Marks a previously-known extent as allocated (intent-log replay).
    /// `ZioError::AlreadyAllocated` if `dva` is already allocated this txg;
    /// `ZioError::NotFound` if `dva` was never handed out by `alloc`.
    fn claim(&mut self, dva: &Dva, txg: u64) -> Result<()>;

    /// Total addressable size of `vdev`, consulted by `DVA_TRANSLATE`'s
    /// offset-out-of-range bounds check (spec §7 "Translation" errors).
    fn capacity(&self, vdev: u32) -> Option<u64>;
}

/// An in-memory reference allocator sufficient to drive every scenario in
/// spec §8, including the ENOSPC-forced-gang configuration of S4. Each
/// top-level vdev is modeled as a single contiguous extent of `capacity`
/// bytes; allocation is first-fit bump allocation with a free list, which
/// is enough to exercise the pipeline's allocate/free/claim/gang paths
/// without pulling in a real space-map implementation.
/// Per-DVA bookkeeping `claim` needs to tell "freshly allocated, never
/// claimed" from "already claimed" apart (spec §8 property 3).
struct Allocation {
    asize: u64,
    claimed: bool,
}

pub struct MemMetaslab {
    ashift: u8,
    capacities: Vec<u64>,
    /// Per-vdev list of `(offset, size)` free extents, kept sorted by
    /// offset and coalesced on free.
    free_extents: Vec<Vec<(u64, u64)>>,
    /// Per-vdev set of currently-allocated (not yet freed) extents, keyed
    /// by offset, used to answer `claim`.
    allocated: Vec<std::collections::BTreeMap<u64, Allocation>>,
    /// Per-vdev map of extents freed within the current txg, keyed by
    /// offset, to the txg they were freed in. A `claim` against one of
    /// these before the txg advances yields `EAGAIN`, not `ESTALE` (spec
    /// §8 property 3, "a claim on a just-freed dva within the same txg").
    freed_this_txg: Vec<std::collections::BTreeMap<u64, u64>>,
    /// Caps any single allocation above this size to force gang
    /// fragmentation in tests (spec §8 S4's "configure allocator to
    /// refuse allocations > 64 KiB").
    pub max_alloc_size: Option<u64>,
}

impl MemMetaslab {
    pub fn new(ashift: u8, vdev_capacities: Vec<u64>) -> Self {
        let free_extents = vdev_capacities.iter().map(|&cap| vec![(0u64, cap)]).collect();
        let allocated = vdev_capacities.iter().map(|_| Default::default()).collect();
        let freed_this_txg = vdev_capacities.iter().map(|_| Default::default()).collect();
        MemMetaslab {
            ashift,
            capacities: vdev_capacities,
            free_extents,
            allocated,
            freed_this_txg,
            max_alloc_size: None,
        }
    }

    fn round_up_ashift(&self, size: u64) -> u64 {
        let unit = 1u64 << self.ashift;
        let rem = size % unit;
        if rem == 0 { size } else { size + (unit - rem) }
    }
}

impl Metaslab for MemMetaslab {
    fn capacity(&self, vdev: u32) -> Option<u64> {
        self.capacities.get(vdev as usize).copied()
    }

    fn alloc(&mut self, vdev: u32, size: u64, _txg: u64) -> Result<Dva> {
        let asize = self.round_up_ashift(size);
        if let Some(max) = self.max_alloc_size {
            if asize > max {
                return Err(ZioError::NoSpace);
            }
        }
        let vdev_idx = vdev as usize;
        let extents = self.free_extents.get_mut(vdev_idx).ok_or(ZioError::NoSuchDevice)?;

        let pos = extents.iter().position(|&(_, len)| len >= asize);
        let (offset, len) = match pos {
            Some(i) => extents.remove(i),
            None => return Err(ZioError::NoSpace),
        };

        if len > asize {
            extents.push((offset + asize, len - asize));
            extents.sort_unstable_by_key(|&(off, _)| off);
        }

        self.allocated[vdev_idx].insert(offset, Allocation { asize, claimed: false });
        self.freed_this_txg[vdev_idx].remove(&offset);

        let mut dva = Dva::new(vdev, offset, asize);
        dva.set_gang(false);
        Ok(dva)
    }

    fn free(&mut self, dva: &Dva, txg: u64) {
        let vdev_idx = dva.vdev() as usize;
        if vdev_idx >= self.free_extents.len() {
            return;
        }
        self.allocated[vdev_idx].remove(&dva.offset());
        self.freed_this_txg[vdev_idx].insert(dva.offset(), txg);

        let extents = &mut self.free_extents[vdev_idx];
        extents.push((dva.offset(), dva.asize()));
        extents.sort_unstable_by_key(|&(off, _)| off);

        // Coalesce adjacent extents.
        let mut coalesced: Vec<(u64, u64)> = Vec::with_capacity(extents.len());
        for &(off, len) in extents.iter() {
            if let Some(last) = coalesced.last_mut() {
                if last.0 + last.1 == off {
                    last.1 += len;
                    continue;
                }
            }
            coalesced.push((off, len));
        }
        *extents = coalesced;
    }

    /// Marks `dva` claimed (spec §4.4, §8 property 3). Three outcomes:
    /// a DVA this allocator handed out via `alloc` and hasn't claimed yet
    /// succeeds and becomes claimed; one already claimed, or one freed
    /// within `txg`, yields `AlreadyAllocated` (EAGAIN); anything this
    /// allocator never recorded yields `NotFound` (ESTALE).
    fn claim(&mut self, dva: &Dva, txg: u64) -> Result<()> {
        let vdev_idx = dva.vdev() as usize;
        let allocated = self.allocated.get_mut(vdev_idx).ok_or(ZioError::NoSuchDevice)?;

        if let Some(entry) = allocated.get_mut(&dva.offset()) {
            if entry.claimed {
                return Err(ZioError::AlreadyAllocated);
            }
            entry.claimed = true;
            return Ok(());
        }

        let freed = self.freed_this_txg.get(vdev_idx).ok_or(ZioError::NoSuchDevice)?;
        if freed.get(&dva.offset()) == Some(&txg) {
            return Err(ZioError::AlreadyAllocated);
        }

        Err(ZioError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_on_just_freed_dva_conflicts_within_same_txg() {
        let mut m = MemMetaslab::new(9, vec![1 << 20]);
        let dva = m.alloc(0, 4096, 1).unwrap();
        m.free(&dva, 1);
        assert_eq!(m.claim(&dva, 1), Err(ZioError::AlreadyAllocated));
    }

    #[test]
    fn claim_on_just_allocated_dva_succeeds() {
        let mut m = MemMetaslab::new(9, vec![1 << 20]);
        let dva = m.alloc(0, 4096, 1).unwrap();
        assert!(m.claim(&dva, 1).is_ok());
        assert_eq!(m.claim(&dva, 1), Err(ZioError::AlreadyAllocated));
    }

    #[test]
    fn claim_on_never_allocated_dva_is_stale() {
        let mut m = MemMetaslab::new(9, vec![1 << 20]);
        let phantom = Dva::new(0, 999_999_999, 512);
        assert_eq!(m.claim(&phantom, 1), Err(ZioError::NotFound));
    }

    #[test]
    fn enospc_when_over_capacity() {
        let mut m = MemMetaslab::new(9, vec![4096]);
        assert!(m.alloc(0, 4096, 1).is_ok());
        assert_eq!(m.alloc(0, 4096, 1), Err(ZioError::NoSpace));
    }

    #[test]
    fn asize_is_ashift_aligned() {
        let mut m = MemMetaslab::new(12, vec![1 << 20]);
        let dva = m.alloc(0, 100, 1).unwrap();
        assert_eq!(dva.offset() % (1 << 12), 0);
        assert_eq!(dva.asize() % (1 << 12), 0);
    }
}
