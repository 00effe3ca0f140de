//! Block Address Model (spec §4.1): the block pointer / DVA / gang-block
//! header value types, their bit-level invariants, and the predicates the
//! rest of the engine consults.
//!
//! Grounded on the teacher's `uberblock.rs` (packed, `FromBytes`-decoded
//! structs referencing a `BlockPtr`) and on `usr/src/uts/common/fs/zfs/zio.c`
//! for the exact field semantics (`BP_ZERO`, `BP_IS_HOLE`, `DVA_GET_GANG`,
//! `zio_set_gang_verifier`).

use crate::checksum::ChecksumId;
use crate::compress::CompressId;
use crate::from_bytes::FromBytes;

/// Minimum allocatable block size, `SPA_MINBLOCKSIZE` in the original.
pub const MIN_BLOCK_SIZE: u64 = 512;
/// Largest logical block size the engine will write, `SPA_MAXBLOCKSIZE`.
pub const MAX_BLOCK_SIZE: u64 = 128 * 1024;
/// Up to three DVAs per block pointer (primary + two ditto copies).
pub const MAX_DVAS: usize = 3;
/// Number of child block pointers a gang-block header holds,
/// `SPA_GBH_NBLKPTRS`.
pub const GBH_NBLKPTRS: usize = 3;
/// Fixed size of a gang-block header allocation, `SPA_GANGBLOCKSIZE`. The
/// original pins this to `SPA_MINBLOCKSIZE` because its C `blkptr_t` is a
/// packed bitfield; this crate's `GangBlockHeader` has no on-disk-format
/// compatibility goal (spec §1 Non-goals: "Persistent-format evolution"),
/// so the constant tracks the host layout's actual size instead of a
/// borrowed literal, keeping every ASIZE/allocation computation that
/// references it self-consistent.
pub const GANG_BLOCK_SIZE: u64 = std::mem::size_of::<GangBlockHeader>() as u64;

/// A (vdev-id, offset, asize, gang-bit) tuple: one location within a block
/// pointer. Offset and asize are both in bytes and are ashift-aligned.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct Dva {
    vdev: u32,
    gang: bool,
    offset: u64,
    asize: u64,
}

impl Dva {
    pub fn new(vdev: u32, offset: u64, asize: u64) -> Self {
        Dva { vdev, offset, asize, gang: false }
    }

    pub fn is_empty(&self) -> bool {
        self.asize == 0
    }

    pub fn vdev(&self) -> u32 {
        self.vdev
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn asize(&self) -> u64 {
        self.asize
    }

    pub fn set_asize(&mut self, asize: u64) {
        self.asize = asize;
    }

    /// Accumulates a child's `ASIZE` into a gang parent's primary DVA as
    /// each gang child reports completion (spec §3 "the sum of child
    /// ASIZEs accumulated on child completion equals the parent ASIZE").
    pub fn add_asize(&mut self, extra: u64) {
        self.asize += extra;
    }

    pub fn is_gang(&self) -> bool {
        self.gang
    }

    pub fn set_gang(&mut self, gang: bool) {
        self.gang = gang;
    }

    /// Byte offset of the first sector this DVA covers, used by the
    /// teacher's `Reader::read_dva` to seek a raw device.
    pub fn sector(&self) -> u64 {
        self.offset / MIN_BLOCK_SIZE
    }
}

/// 256-bit checksum tuple: four 64-bit words (spec §4.1).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ChecksumTuple(pub [u64; 4]);

impl ChecksumTuple {
    pub const ZERO: ChecksumTuple = ChecksumTuple([0; 4]);
}

/// A fixed-size record encoding up to `MAX_DVAS` DVAs plus metadata
/// (spec §3 "Block Pointer"). All invariants described there are enforced
/// by the constructors in `zio.rs`, not by this type itself — `BlockPtr` is
/// a plain value, mirroring the C `blkptr_t`.
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(C)]
pub struct BlockPtr {
    pub dvas: [Dva; MAX_DVAS],
    lsize: u64,
    psize: u64,
    compress: CompressId,
    checksum: ChecksumId,
    byteorder_swapped: bool,
    level: u8,
    object_type: u8,
    fill: u64,
    pub birth: u64,
    pub cksum: ChecksumTuple,
    /// Must stay zero for the lifetime of a non-repair BP; `zio_done`
    /// asserts on this in the original (`bp->blk_pad[i] == 0`).
    pad: [u64; 3],
}

impl Default for BlockPtr {
    fn default() -> Self {
        BlockPtr::zero()
    }
}

impl BlockPtr {
    /// The all-zero BP: a "hole", representing an absent block.
    pub fn zero() -> Self {
        BlockPtr {
            dvas: [Dva::default(); MAX_DVAS],
            lsize: 0,
            psize: 0,
            compress: CompressId::Off,
            checksum: ChecksumId::Off,
            byteorder_swapped: false,
            level: 0,
            object_type: 0,
            fill: 0,
            birth: 0,
            cksum: ChecksumTuple::ZERO,
            pad: [0; 3],
        }
    }

    pub fn is_hole(&self) -> bool {
        self.birth == 0 && self.dvas.iter().all(Dva::is_empty)
    }

    pub fn is_gang(&self, dva_index: usize) -> bool {
        self.dvas[dva_index].is_gang()
    }

    pub fn should_byteswap(&self) -> bool {
        self.byteorder_swapped
    }

    pub fn set_byteorder(&mut self, native: bool) {
        self.byteorder_swapped = !native;
    }

    pub fn lsize(&self) -> u64 {
        self.lsize
    }

    pub fn set_lsize(&mut self, lsize: u64) {
        self.lsize = lsize;
    }

    pub fn psize(&self) -> u64 {
        self.psize
    }

    pub fn set_psize(&mut self, psize: u64) {
        self.psize = psize;
    }

    pub fn compress(&self) -> CompressId {
        self.compress
    }

    pub fn set_compress(&mut self, compress: CompressId) {
        self.compress = compress;
    }

    pub fn checksum(&self) -> ChecksumId {
        self.checksum
    }

    pub fn set_checksum(&mut self, checksum: ChecksumId) {
        self.checksum = checksum;
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn fill(&self) -> u64 {
        self.fill
    }

    pub fn set_fill(&mut self, fill: u64) {
        self.fill = fill;
    }

    /// The DVA used by single-copy operations (§3 "DVA").
    pub fn primary_dva(&self) -> &Dva {
        &self.dvas[0]
    }

    pub fn primary_dva_mut(&mut self) -> &mut Dva {
        &mut self.dvas[0]
    }

    /// Asserted at `DONE` in the original (`ASSERT(bp->blk_pad[i] == 0)`).
    pub fn assert_padding_zero(&self) {
        assert!(self.pad.iter().all(|&w| w == 0), "block pointer padding corrupted");
    }
}

/// A fixed-size, buffer-aligned record containing up to `GBH_NBLKPTRS`
/// child block pointers plus a checksum tail (spec §3 "Gang-block header").
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct GangBlockHeader {
    pub blkptrs: [BlockPtr; GBH_NBLKPTRS],
    /// Embedded checksum tail (ZBT): the gang verifier lives here because a
    /// GBH has no containing BP of its own to hold a standalone checksum.
    pub tail_cksum: ChecksumTuple,
}

impl GangBlockHeader {
    pub fn zero() -> Self {
        GangBlockHeader {
            blkptrs: [BlockPtr::zero(); GBH_NBLKPTRS],
            tail_cksum: ChecksumTuple::ZERO,
        }
    }

    /// Non-hole children, in order. Fill counts and PSIZE sums across these
    /// must equal the parent's (spec §3 invariant).
    pub fn children(&self) -> impl Iterator<Item = &BlockPtr> {
        self.blkptrs.iter().filter(|bp| !bp.is_hole())
    }

    /// Bit-exact on-disk encoding (spec §6): the inverse of
    /// `FromBytes::from_bytes`, used when a gang parent writes its own
    /// header out.
    pub fn to_bytes(&self) -> Vec<u8> {
        let size = std::mem::size_of::<GangBlockHeader>();
        let mut out = vec![0u8; size];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self as *const GangBlockHeader as *const u8,
                out.as_mut_ptr(),
                size,
            );
        }
        out
    }
}

/// Synthetic 4-word checksum used to authenticate a GBH whose true checksum
/// cannot live in a containing BP (spec §4.1 "Gang verifier").
pub fn gang_verifier(dva: &Dva, birth: u64) -> ChecksumTuple {
    ChecksumTuple([dva.vdev() as u64, dva.offset(), birth, 0])
}

impl FromBytes for BlockPtr {}
impl FromBytes for GangBlockHeader {}
