//! The `Zio` descriptor and the pipeline engine that drives it (spec §3,
//! §4.6): a global stage table, a per-I/O bitmask of enabled stages, and
//! synchronous/asynchronous entry points dispatching onto the issue/intr
//! task queues of `taskq.rs`.
//!
//! Grounded on `zio_execute`/`zio_wait`/`zio_nowait`/`zio_notify_parent` in
//! the original `zio.c`. The child/parent tree is arena-based (spec §9
//! "Cycles / back-edges": "represent the tree as an arena of descriptor
//! slots keyed by index; the parent field is an `Option<Index>`"); the
//! teacher's own `uberblock.rs`/`from_bytes.rs` supplied the packed-struct
//! idiom used by `bam.rs`, but the pipeline itself has no teacher
//! counterpart to adapt — the teacher's `zio.c`-derived `Reader` was a
//! `File`-backed block reader with no stage machine at all, so this module
//! is built directly from the original's `zio_execute` state machine in the
//! crate's established style (bitflags, thiserror, parking_lot, crossbeam).

use crate::bam::{gang_verifier, BlockPtr, Dva, GangBlockHeader, GANG_BLOCK_SIZE};
use crate::checksum::{self, ChecksumId};
use crate::compress::{self, CompressId};
use crate::error::{Result, ZioError};
use crate::from_bytes::FromBytes;
use crate::spa::Spa;
use crate::taskq::Task;
use crate::transform::TransformStack;
use crate::vdev::{TopVdev, VdevKind, ZioIndex, VDEV_LABEL_START_SIZE};

/// I/O priority (`zio_priority_t`). Stored on every `Zio` for the task
/// queues and debug tooling to consult; this core doesn't implement
/// priority-ordered dispatch itself (spec §4.7 names worker count/priority
/// as "derived from the pool, not specified here").
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Priority {
    Now,
    SyncRead,
    SyncWrite,
    LogWrite,
    CacheFill,
    Ddt,
    Free,
    AsyncRead,
    AsyncWrite,
    Resilver,
    Scrub,
}

/// The I/O's intent (spec §3 "I/O descriptor"). Indexes the per-type
/// task-queue pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Type {
    Null,
    Read,
    Write,
    Free,
    Claim,
    IoCtl,
}

/// Number of `Type` variants; sizes the per-type task-queue array (spec
/// §4.7).
pub const NUM_TYPES: usize = 6;

impl Type {
    fn index(self) -> usize {
        match self {
            Type::Null => 0,
            Type::Read => 1,
            Type::Write => 2,
            Type::Free => 3,
            Type::Claim => 4,
            Type::IoCtl => 5,
        }
    }
}

bitflags::bitflags! {
    /// The I/O flag set (spec §6 "Flags"). Bit positions are
    /// ABI-observable only to debug tooling, which this crate doesn't
    /// implement, so they're assigned in table order rather than matching
    /// the original's numbering.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct Flags: u32 {
        /// Surface errors instead of panicking at DONE.
        const CANFAIL        = 1 << 0;
        /// Best-effort; retried sparingly.
        const SPECULATIVE    = 1 << 1;
        /// Force read through all redundancy.
        const SCRUB          = 1 << 2;
        /// Bypass label skip; raw device offset.
        const PHYSICAL       = 1 << 3;
        /// Skip vdev-level retries.
        const FAILFAST       = 1 << 4;
        /// Caller owns the config lock.
        const CONFIG_HELD    = 1 << 5;
        /// Permits writing a byteswapped payload (used by repair).
        const IO_REPAIR      = 1 << 6;
        /// Bypass any read-side cache.
        const DONT_CACHE     = 1 << 7;
        /// Do not propagate error to parent.
        const DONT_PROPAGATE = 1 << 8;
        /// Disable vdev retry.
        const DONT_RETRY     = 1 << 9;
    }
}

impl Flags {
    /// Mask of flags a vdev child inherits from its parent. Includes
    /// `CANFAIL` so an unrecoverable leaf failure propagates to the parent
    /// instead of panicking at the child's own DONE (spec §6 "CANFAIL
    /// converts what would otherwise be a DONE-time panic into a returned
    /// error" — a structural child is never itself the right place for
    /// that decision).
    pub const VDEV_INHERIT: Flags = Flags::CANFAIL
        .union(Flags::SCRUB)
        .union(Flags::FAILFAST)
        .union(Flags::DONT_RETRY)
        .union(Flags::DONT_CACHE);
    /// Mask of flags a gang child inherits from its parent.
    pub const GANG_INHERIT: Flags = Flags::CANFAIL
        .union(Flags::SPECULATIVE)
        .union(Flags::SCRUB)
        .union(Flags::FAILFAST)
        .union(Flags::DONT_RETRY);
}

/// The fixed stage ordering of spec §4.6, table rows 1-23. `next_stage`
/// walks forward through a pipeline bitmask by ordinal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    WaitChildrenReady = 0,
    WriteCompress,
    ChecksumGenerate,
    GangPipeline,
    GetGangHeader,
    RewriteGangMembers,
    FreeGangMembers,
    ClaimGangMembers,
    DvaAllocate,
    DvaFree,
    DvaClaim,
    GangChecksumGenerate,
    Ready,
    DvaTranslate,
    VdevIoSetup,
    VdevIoStart,
    VdevIoDone,
    VdevIoAssess,
    WaitChildrenDone,
    ChecksumVerify,
    ReadGangMembers,
    ReadDecompress,
    Done,
}

/// Number of stages in the fixed table.
pub const NUM_STAGES: u8 = 23;

const STAGE_TABLE: [Stage; NUM_STAGES as usize] = [
    Stage::WaitChildrenReady,
    Stage::WriteCompress,
    Stage::ChecksumGenerate,
    Stage::GangPipeline,
    Stage::GetGangHeader,
    Stage::RewriteGangMembers,
    Stage::FreeGangMembers,
    Stage::ClaimGangMembers,
    Stage::DvaAllocate,
    Stage::DvaFree,
    Stage::DvaClaim,
    Stage::GangChecksumGenerate,
    Stage::Ready,
    Stage::DvaTranslate,
    Stage::VdevIoSetup,
    Stage::VdevIoStart,
    Stage::VdevIoDone,
    Stage::VdevIoAssess,
    Stage::WaitChildrenDone,
    Stage::ChecksumVerify,
    Stage::ReadGangMembers,
    Stage::ReadDecompress,
    Stage::Done,
];

impl Stage {
    pub fn bit(self) -> u32 {
        1u32 << (self as u8)
    }

    fn ordinal(self) -> u8 {
        self as u8
    }
}

/// `zio_type` error pipeline (spec §4.6 "Advancement"): once an error is
/// set, the mask narrows to READY, the vdev-I/O stages (so a retry can
/// re-enter), WAIT_CHILDREN_DONE, and DONE.
fn error_pipeline() -> u32 {
    Stage::Ready.bit()
        | Stage::VdevIoSetup.bit()
        | Stage::VdevIoStart.bit()
        | Stage::VdevIoDone.bit()
        | Stage::VdevIoAssess.bit()
        | Stage::WaitChildrenDone.bit()
        | Stage::Done.bit()
}

/// Every stage from `VDEV_IO_SETUP` onward, used both to build
/// `async_stages` (spec §4.6: "all stages from SETUP onward are async by
/// default") and to pick the issue vs. intr task-queue family (spec §4.7).
fn stages_from_setup_onward() -> u32 {
    STAGE_TABLE
        .iter()
        .filter(|s| s.ordinal() >= Stage::VdevIoSetup.ordinal())
        .fold(0u32, |acc, s| acc | s.bit())
}

/// The unit of work (spec §3 "I/O descriptor"). Lives inside a `Spa`'s
/// arena; referred to everywhere else by `ZioIndex`.
pub struct Zio {
    pub parent: Option<ZioIndex>,
    pub(crate) children: Vec<ZioIndex>,

    pub kind: Type,
    pub priority: Priority,
    pub txg: u64,
    pub checksum: ChecksumId,
    pub compress: CompressId,

    pub data: Vec<u8>,
    pub size: u64,
    pub(crate) transform: TransformStack,

    pub bp: Option<BlockPtr>,
    /// Snapshot of the caller's BP at construction, used to detect a
    /// rewrite-in-place (spec §3 "Ownership").
    pub(crate) bp_orig: Option<BlockPtr>,
    pub vdev: Option<u32>,
    pub offset: u64,

    pub(crate) stage: Option<Stage>,
    pub(crate) pipeline: u32,
    pub(crate) async_stages: u32,
    pub(crate) stalled: Option<Stage>,

    pub(crate) children_notready: u32,
    pub(crate) children_notdone: u32,

    pub error: Option<ZioError>,
    pub retries: u32,
    pub flags: Flags,

    pub(crate) gbh: Option<GangBlockHeader>,
    pub checksum_verified: bool,
    /// Which of a BP's (up to three) DVAs this I/O addresses. Always 0:
    /// ditto-copy fan-out is deferred (spec §9 open question).
    pub dva_index: usize,

    pub(crate) waiter: bool,
    pub(crate) done: bool,
}

impl Zio {
    fn base(kind: Type, priority: Priority, txg: u64, flags: Flags) -> Zio {
        Zio {
            parent: None,
            children: Vec::new(),
            kind,
            priority,
            txg,
            checksum: ChecksumId::Off,
            compress: CompressId::Off,
            data: Vec::new(),
            size: 0,
            transform: TransformStack::new(),
            bp: None,
            bp_orig: None,
            vdev: None,
            offset: 0,
            stage: None,
            pipeline: Stage::WaitChildrenReady.bit() | Stage::WaitChildrenDone.bit() | Stage::Ready.bit() | Stage::Done.bit(),
            async_stages: stages_from_setup_onward(),
            stalled: None,
            children_notready: 0,
            children_notdone: 0,
            error: None,
            retries: 0,
            flags,
            gbh: None,
            checksum_verified: false,
            dva_index: 0,
            waiter: false,
            done: false,
        }
    }

    /// A no-op I/O, useful as a pure barrier or test vehicle.
    pub fn null(priority: Priority, flags: Flags) -> Zio {
        Zio::base(Type::Null, priority, 0, flags)
    }

    /// `zio_read`: a logical read against an existing BP, resolving its
    /// own vdev/offset via `DVA_TRANSLATE` and fanning out over gang
    /// children if the BP is a gang block.
    pub fn read(bp: BlockPtr, priority: Priority, flags: Flags) -> Zio {
        let mut zio = Zio::base(Type::Read, priority, bp.birth, flags);
        zio.size = bp.lsize();
        zio.checksum = bp.checksum();
        zio.compress = bp.compress();
        zio.bp = Some(bp);
        zio.pipeline |= Stage::GangPipeline.bit()
            | Stage::GetGangHeader.bit()
            | Stage::DvaTranslate.bit()
            | Stage::VdevIoSetup.bit()
            | Stage::VdevIoStart.bit()
            | Stage::VdevIoDone.bit()
            | Stage::VdevIoAssess.bit()
            | Stage::ChecksumVerify.bit()
            | Stage::ReadGangMembers.bit()
            | Stage::ReadDecompress.bit();
        zio
    }

    /// `zio_read_phys`: a read directly against a vdev/offset/size, no
    /// decompression — used internally to fetch gang children (spec §4.6
    /// "a read-physical goes { SETUP, START, DONE, ASSESS,
    /// WAIT_CHILDREN_DONE, VERIFY, READY, DONE }"). `bp` carries the
    /// checksum tuple `CHECKSUM_VERIFY` checks the read-back data against;
    /// pass `None` only when no verification is wanted. `offset` is still
    /// DVA-relative and gets the usual label skip at `VDEV_IO_SETUP`; pass
    /// `Flags::PHYSICAL` for a genuinely absolute offset (label/uberblock
    /// I/O, not modeled in this crate).
    pub fn read_phys(vdev: u32, offset: u64, size: u64, bp: Option<BlockPtr>, checksum: ChecksumId, priority: Priority, flags: Flags) -> Zio {
        let mut zio = Zio::base(Type::Read, priority, 0, flags);
        zio.vdev = Some(vdev);
        zio.offset = offset;
        zio.size = size;
        zio.checksum = checksum;
        zio.bp = bp;
        zio.pipeline |= Stage::VdevIoSetup.bit()
            | Stage::VdevIoStart.bit()
            | Stage::VdevIoDone.bit()
            | Stage::VdevIoAssess.bit()
            | Stage::ChecksumVerify.bit();
        zio
    }

    /// `zio_write`: a logical write of fresh data, allocating a new DVA
    /// unless compression converges on the existing PSIZE (a pure
    /// rewrite, decided at `WRITE_COMPRESS` time).
    pub fn write(data: Vec<u8>, checksum: ChecksumId, compress: CompressId, txg: u64, priority: Priority, flags: Flags) -> Zio {
        let mut zio = Zio::base(Type::Write, priority, txg, flags);
        zio.size = data.len() as u64;
        zio.checksum = checksum;
        zio.compress = compress;
        zio.data = data;
        zio.bp = Some(BlockPtr::zero());
        zio.pipeline |= Stage::WriteCompress.bit()
            | Stage::ChecksumGenerate.bit()
            | Stage::GangPipeline.bit()
            | Stage::DvaAllocate.bit()
            | Stage::GangChecksumGenerate.bit()
            | Stage::DvaTranslate.bit()
            | Stage::VdevIoSetup.bit()
            | Stage::VdevIoStart.bit()
            | Stage::VdevIoDone.bit()
            | Stage::VdevIoAssess.bit();
        if compress != CompressId::Off {
            zio.async_stages |= Stage::WriteCompress.bit();
        }
        zio
    }

    /// `zio_rewrite`: like `write`, but the allocation already exists
    /// (`existing`); skips `DVA_ALLOCATE` (spec §4.6 "a rewrite skips
    /// ALLOCATE"). Also how gang children are expressed: each already has
    /// a freshly allocated DVA by the time it's constructed.
    pub fn rewrite(data: Vec<u8>, existing: BlockPtr, priority: Priority, flags: Flags) -> Zio {
        let mut zio = Zio::write(data, existing.checksum(), existing.compress(), existing.birth, priority, flags);
        zio.pipeline &= !Stage::DvaAllocate.bit();
        zio.bp_orig = Some(existing);
        zio.bp = Some(existing);
        zio
    }

    /// `zio_write_phys`: a raw write against a vdev/offset, bypassing
    /// allocation and BP bookkeeping entirely (labels, uberblocks).
    pub fn write_phys(vdev: u32, offset: u64, data: Vec<u8>, priority: Priority, flags: Flags) -> Zio {
        let mut zio = Zio::base(Type::Write, priority, 0, flags);
        zio.vdev = Some(vdev);
        zio.offset = offset;
        zio.size = data.len() as u64;
        zio.data = data;
        zio.pipeline |= Stage::VdevIoSetup.bit() | Stage::VdevIoStart.bit() | Stage::VdevIoDone.bit() | Stage::VdevIoAssess.bit();
        zio
    }

    /// `zio_free`: frees the extent(s) a BP describes, fanning out over a
    /// gang block's children first.
    pub fn free(bp: BlockPtr, txg: u64, priority: Priority, flags: Flags) -> Zio {
        let mut zio = Zio::base(Type::Free, priority, txg, flags);
        zio.bp = Some(bp);
        zio.pipeline |= Stage::GangPipeline.bit() | Stage::FreeGangMembers.bit() | Stage::DvaFree.bit();
        zio
    }

    /// `zio_claim`: intent-log replay marking a previously-known extent
    /// allocated.
    pub fn claim(bp: BlockPtr, txg: u64, priority: Priority, flags: Flags) -> Zio {
        let mut zio = Zio::base(Type::Claim, priority, txg, flags);
        zio.bp = Some(bp);
        zio.pipeline |= Stage::GangPipeline.bit() | Stage::ClaimGangMembers.bit() | Stage::DvaClaim.bit();
        zio
    }

    /// `zio_ioctl`: stands in for vdev control operations (reopen, probe);
    /// the physical drivers behind those are out of scope (spec §1), so
    /// this is a pass-through vehicle through the pipeline machinery.
    pub fn ioctl(priority: Priority, flags: Flags) -> Zio {
        Zio::base(Type::IoCtl, priority, 0, flags)
    }

    /// The gang-block header fetched for this I/O, if any (spec §3 "Gang
    /// fragmentation" / §8 property 4). `None` for a non-gang BP, or before
    /// `GET_GANG_HEADER` has run.
    pub fn gbh(&self) -> Option<&GangBlockHeader> {
        self.gbh.as_ref()
    }

    /// `zio_vdev_child_io`: a physical child issued directly against one
    /// DVA, used by `GET_GANG_HEADER`/`READ_GANG_MEMBERS` to fetch gang
    /// members and headers without going through a full logical read.
    fn vdev_child_io(member: BlockPtr, checksum: ChecksumId, priority: Priority, flags: Flags) -> Zio {
        let dva = *member.primary_dva();
        Zio::read_phys(dva.vdev(), dva.offset(), member.psize(), Some(member), checksum, priority, flags & Flags::VDEV_INHERIT)
    }
}

/// Arena of `Zio` slots keyed by index (spec §9 "Cycles / back-edges").
/// Descriptors are dropped at `DONE` by removing them from the arena.
#[derive(Default)]
pub struct Arena {
    slots: Vec<Option<Zio>>,
    free: Vec<ZioIndex>,
}

impl Arena {
    pub fn new() -> Self {
        Arena { slots: Vec::new(), free: Vec::new() }
    }

    pub(crate) fn insert(&mut self, zio: Zio) -> ZioIndex {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(zio);
            idx
        } else {
            self.slots.push(Some(zio));
            self.slots.len() - 1
        }
    }

    pub(crate) fn get(&self, idx: ZioIndex) -> &Zio {
        self.slots[idx].as_ref().expect("dangling zio index")
    }

    pub(crate) fn get_mut(&mut self, idx: ZioIndex) -> &mut Zio {
        self.slots[idx].as_mut().expect("dangling zio index")
    }

    pub(crate) fn remove(&mut self, idx: ZioIndex) -> Zio {
        let zio = self.slots[idx].take().expect("double free of zio arena slot");
        self.free.push(idx);
        zio
    }
}

enum StageOutcome {
    Advance,
    Stalled,
    Terminal,
    /// Rolls `stage` backward to the given stage and re-executes it
    /// (spec §3 "three explicit rollback operations"): used by the
    /// immediate vdev retry and the single checksum-mismatch retry.
    Reexecute(Stage),
}

#[derive(Copy, Clone)]
enum DriveMode {
    /// Compute the next enabled stage from the zio's current one, then run
    /// it (or dispatch it).
    Advance,
    /// Run (or dispatch) the given stage directly, without advancing —
    /// used to resume after an async dispatch, a barrier release, or a
    /// rollback.
    Current(Stage),
}

/// `next_stage`/`next_stage_async`: walks forward through the pipeline
/// bitmask (narrowed to the error pipeline once `zio.error` is set) to
/// find the next enabled stage after the zio's current one.
fn next_stage(zio: &Zio) -> Stage {
    let start = zio.stage.map(|s| s.ordinal() + 1).unwrap_or(0);
    let mask = if zio.error.is_some() { zio.pipeline & error_pipeline() } else { zio.pipeline };
    for ord in start..NUM_STAGES {
        let stage = STAGE_TABLE[ord as usize];
        if mask & stage.bit() != 0 {
            return stage;
        }
    }
    Stage::Done
}

fn is_async_stage(spa: &Spa, idx: ZioIndex, stage: Stage) -> bool {
    spa.inner.arena.lock().get(idx).async_stages & stage.bit() != 0
}

fn dispatch(spa: &Spa, idx: ZioIndex, stage: Stage) {
    let type_idx = spa.inner.arena.lock().get(idx).kind.index();
    let spa2 = spa.clone();
    let task: Task = Box::new(move || drive(&spa2, idx, DriveMode::Current(stage)));
    let pair = &spa.inner.taskqs[type_idx];
    if stage.ordinal() < Stage::VdevIoDone.ordinal() {
        pair.issue.dispatch(task);
    } else {
        pair.intr.dispatch(task);
    }
}

/// The pipeline driver loop. Runs (or hands off to a task queue) stages
/// until the zio stalls on a barrier, is handed off asynchronously, or
/// reaches `DONE`.
fn drive(spa: &Spa, idx: ZioIndex, mode: DriveMode) {
    let mut mode = mode;
    loop {
        let stage = match mode {
            DriveMode::Advance => {
                let mut arena = spa.inner.arena.lock();
                let zio = arena.get_mut(idx);
                let next = next_stage(zio);
                zio.stage = Some(next);
                next
            }
            DriveMode::Current(s) => s,
        };

        if is_async_stage(spa, idx, stage) {
            dispatch(spa, idx, stage);
            return;
        }

        match execute_stage(spa, idx, stage) {
            StageOutcome::Advance => {
                mode = DriveMode::Advance;
            }
            StageOutcome::Stalled | StageOutcome::Terminal => return,
            StageOutcome::Reexecute(s) => {
                spa.inner.arena.lock().get_mut(idx).stage = Some(s);
                mode = DriveMode::Current(s);
            }
        }
    }
}

/// `zio_nowait`: hands `zio` to the engine and returns immediately with
/// its arena index.
pub fn nowait(spa: &Spa, zio: Zio) -> ZioIndex {
    let idx = spa.inner.arena.lock().insert(zio);
    drive(spa, idx, DriveMode::Advance);
    idx
}

/// `zio_wait`: hands `zio` to the engine and blocks the calling thread
/// until it reaches `DONE`, returning the accumulated descriptor (so the
/// caller can inspect `bp`/`data`/`error`) or propagating its error.
pub fn wait(spa: &Spa, mut zio: Zio) -> Result<Zio> {
    zio.waiter = true;
    let idx = spa.inner.arena.lock().insert(zio);
    drive(spa, idx, DriveMode::Advance);

    let mut arena = spa.inner.arena.lock();
    while !arena.get(idx).done {
        spa.inner.zio_done_cv.wait(&mut arena);
    }
    let zio = arena.remove(idx);
    match zio.error {
        Some(e) => Err(e),
        None => Ok(zio),
    }
}

/// Attaches `child` under `parent_idx` and dispatches it (spec §4.6
/// "Parent/child barriers"): `children_notdone` is always incremented;
/// `children_notready` only if the parent hasn't reached `READY` yet.
fn spawn_child(spa: &Spa, parent_idx: ZioIndex, mut child: Zio) -> ZioIndex {
    child.parent = Some(parent_idx);
    {
        let mut arena = spa.inner.arena.lock();
        let parent = arena.get_mut(parent_idx);
        parent.children_notdone += 1;
        let before_ready = parent.stage.map(|s| s.ordinal() < Stage::Ready.ordinal()).unwrap_or(true);
        if before_ready {
            parent.children_notready += 1;
        }
    }
    nowait(spa, child)
}

/// Resumes a zio that stalled on `WAIT_CHILDREN_READY`/`WAIT_CHILDREN_DONE`
/// once the barrier it's waiting on has reached zero.
fn resume_stalled(spa: &Spa, idx: ZioIndex) {
    let stage = {
        let mut arena = spa.inner.arena.lock();
        let zio = arena.get_mut(idx);
        zio.stalled.take().expect("resume of a zio that wasn't stalled")
    };
    drive(spa, idx, DriveMode::Current(stage));
}

/// Runs at every child's `DONE`: propagates its error to the parent
/// (first error wins, unless `DONT_PROPAGATE`), decrements the matching
/// barrier counter, accumulates a gang child's ASIZE into the parent's
/// primary DVA, and resumes the parent if it was stalled on a
/// now-satisfied barrier.
fn notify_parent_done(spa: &Spa, idx: ZioIndex) {
    let (parent_idx, child_error, dont_propagate, child_asize) = {
        let arena = spa.inner.arena.lock();
        let zio = arena.get(idx);
        let asize = zio.bp.map(|bp| bp.primary_dva().asize()).unwrap_or(0);
        (zio.parent, zio.error, zio.flags.contains(Flags::DONT_PROPAGATE), asize)
    };
    let Some(parent_idx) = parent_idx else { return };

    let mut resume = false;
    {
        let mut arena = spa.inner.arena.lock();
        let parent = arena.get_mut(parent_idx);
        let parent_is_gang = parent.bp.map(|b| b.is_gang(0)).unwrap_or(false);
        if parent_is_gang {
            if let Some(bp) = parent.bp.as_mut() {
                bp.primary_dva_mut().add_asize(child_asize);
            }
        }
        if child_error.is_some() && !dont_propagate && parent.error.is_none() {
            parent.error = child_error;
        }
        parent.children_notdone = parent.children_notdone.saturating_sub(1);
        if parent.children_notdone == 0 && parent.stalled == Some(Stage::WaitChildrenDone) {
            parent.stalled = None;
            resume = true;
        }
    }
    if resume {
        resume_stalled(spa, parent_idx);
    }
}

/// Runs at every child's `READY`: decrements the parent's
/// `children_notready`, resuming it if it was stalled on
/// `WAIT_CHILDREN_READY`. Dormant in this crate's own constructors (none
/// pre-attach children before submission — that's a mirror/raidz fan-out
/// concern, out of scope per spec §1), but implemented for a future
/// collaborator that does.
fn notify_parent_ready(spa: &Spa, idx: ZioIndex) {
    let parent_idx = spa.inner.arena.lock().get(idx).parent;
    let Some(parent_idx) = parent_idx else { return };

    let mut resume = false;
    {
        let mut arena = spa.inner.arena.lock();
        let parent = arena.get_mut(parent_idx);
        parent.children_notready = parent.children_notready.saturating_sub(1);
        if parent.children_notready == 0 && parent.stalled == Some(Stage::WaitChildrenReady) {
            parent.stalled = None;
            resume = true;
        }
    }
    if resume {
        resume_stalled(spa, parent_idx);
    }
}

/// Reads and authenticates a gang block header for `zio`'s primary DVA if
/// it hasn't already been fetched this I/O (spec §4.6 "GET_GANG_HEADER").
fn ensure_gbh_loaded(spa: &Spa, idx: ZioIndex) -> Result<()> {
    let (dva, birth) = {
        let arena = spa.inner.arena.lock();
        let zio = arena.get(idx);
        if zio.gbh.is_some() {
            return Ok(());
        }
        (*zio.bp.as_ref().expect("gbh fetch without a bp").primary_dva(), zio.bp.unwrap().birth)
    };
    let top = spa.inner.vdevs.lookup_top(dva.vdev()).ok_or(ZioError::NoSuchDevice)?;
    let physical_offset = if top.kind == VdevKind::Leaf { dva.offset() + VDEV_LABEL_START_SIZE } else { dva.offset() };
    let raw = top.submit(false, physical_offset, GANG_BLOCK_SIZE, None)?;
    let gbh = GangBlockHeader::from_bytes(&raw).map_err(|_| ZioError::Io)?;
    if gbh.tail_cksum != gang_verifier(&dva, birth) {
        return Err(ZioError::ChecksumMismatch);
    }
    spa.inner.arena.lock().get_mut(idx).gbh = Some(gbh);
    Ok(())
}

/// Splits an ENOSPC'd write into a gang block: allocates a header extent,
/// carves the payload across up to `GBH_NBLKPTRS` children with a shrinking
/// `maxalloc` budget, and spawns each child as a rewrite against its own
/// pre-allocated DVA (spec §4.6 "Gang fragmentation").
fn fragment_into_gang(spa: &Spa, idx: ZioIndex) -> Result<()> {
    use crate::bam::GBH_NBLKPTRS;

    let (vdev, txg, checksum, payload) = {
        let arena = spa.inner.arena.lock();
        let zio = arena.get(idx);
        (zio.bp.unwrap().primary_dva().vdev(), zio.txg, zio.checksum, zio.data.clone())
    };
    log::debug!("zio {idx}: allocation failed, fragmenting {} bytes into a gang block on vdev {vdev}", payload.len());

    let header_dva = {
        let mut metaslab = spa.inner.metaslab.lock();
        metaslab
            .alloc(vdev, GANG_BLOCK_SIZE, txg)
            .unwrap_or_else(|_| panic!("pool truly full: cannot allocate a gang block header"))
    };

    let mut remaining = payload.len();
    let mut offset = 0usize;
    // Shrinks only on an allocator ENOSPC, never grows; bounds every
    // subsequent attempt once the pool has proven it can't satisfy a
    // larger one (spec §4.6 "a budget `maxalloc` that shrinks").
    let mut maxalloc = usize::MAX;
    let mut children_bp = Vec::with_capacity(GBH_NBLKPTRS);
    let mut child_zios = Vec::with_capacity(GBH_NBLKPTRS);

    while remaining > 0 {
        if children_bp.len() == GBH_NBLKPTRS {
            panic!("pool truly full: gang payload doesn't fit in {GBH_NBLKPTRS} members");
        }
        // Spreads what's left evenly over the remaining slots (ceiling
        // division) so the tail always still fits in the slots left to
        // carry it, even after `maxalloc` has shrunk.
        let slots_left = GBH_NBLKPTRS - children_bp.len();
        let even_share = (remaining + slots_left - 1) / slots_left;
        let this_len = remaining.min(maxalloc).min(even_share).max(crate::bam::MIN_BLOCK_SIZE as usize).min(remaining);

        let dva = {
            let mut metaslab = spa.inner.metaslab.lock();
            let mut size = this_len as u64;
            loop {
                match metaslab.alloc(vdev, size, txg) {
                    Ok(dva) => break dva,
                    Err(ZioError::NoSpace) if size > crate::bam::MIN_BLOCK_SIZE => {
                        size = (size / 2).max(crate::bam::MIN_BLOCK_SIZE);
                        maxalloc = size as usize;
                    }
                    Err(_) => panic!("pool truly full: cannot satisfy minimum gang allocation"),
                }
            }
        };

        let chunk = payload[offset..offset + this_len].to_vec();
        let mut child_bp = BlockPtr::zero();
        *child_bp.primary_dva_mut() = dva;
        child_bp.set_checksum(checksum);
        child_bp.set_compress(CompressId::Off);
        child_bp.set_lsize(chunk.len() as u64);
        child_bp.set_psize(chunk.len() as u64);
        child_bp.set_byteorder(true);
        child_bp.birth = txg;
        child_bp.cksum = checksum::checksum(checksum, &chunk);

        children_bp.push(child_bp);
        child_zios.push(Zio::rewrite(chunk, child_bp, Priority::AsyncWrite, Flags::GANG_INHERIT));

        offset += this_len;
        remaining -= this_len;
    }

    let mut gbh = GangBlockHeader::zero();
    for (slot, bp) in gbh.blkptrs.iter_mut().zip(children_bp.iter()) {
        *slot = *bp;
    }

    {
        let mut arena = spa.inner.arena.lock();
        let zio = arena.get_mut(idx);
        let bp = zio.bp.as_mut().unwrap();
        *bp.primary_dva_mut() = header_dva;
        bp.primary_dva_mut().set_gang(true);
        zio.gbh = Some(gbh);
        zio.pipeline |= Stage::GangChecksumGenerate.bit();
    }

    for child in child_zios {
        spawn_child(spa, idx, child);
    }
    Ok(())
}

fn should_retry(zio: &Zio) -> bool {
    let Some(err) = zio.error else { return false };
    if zio.flags.contains(Flags::DONT_RETRY) {
        return false;
    }
    if err.is_checksum_or_missing_device() {
        return zio.retries < 1;
    }
    zio.retries < 300
}

/// Delay before a background task reopens a top-level vdev and replays
/// its queued retries (spec §4.5 "a background task wakes after a delay").
const RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(50);

fn schedule_retry_task(spa: &Spa, top: std::sync::Arc<TopVdev>) {
    let spa = spa.clone();
    std::thread::spawn(move || {
        std::thread::sleep(RETRY_DELAY);
        for idx in top.drain_retries() {
            spa.inner.arena.lock().get_mut(idx).stage = Some(Stage::VdevIoSetup);
            drive(&spa, idx, DriveMode::Current(Stage::VdevIoSetup));
        }
    });
}

/// Executes one stage's action for `idx`, returning how the driver loop
/// should proceed. This is the stage dispatch table of spec §4.6 /
/// §9 ("the stage table is a static function-pointer array parameterized
/// by `&mut Zio`"), expressed as a `match` per the crate's convention of
/// small-enum dispatch over trait objects (spec §9 "Dynamic dispatch").
fn execute_stage(spa: &Spa, idx: ZioIndex, stage: Stage) -> StageOutcome {
    match stage {
        Stage::WaitChildrenReady => {
            let mut arena = spa.inner.arena.lock();
            let zio = arena.get_mut(idx);
            if zio.children_notready == 0 {
                StageOutcome::Advance
            } else {
                zio.stalled = Some(Stage::WaitChildrenReady);
                StageOutcome::Stalled
            }
        }

        Stage::WriteCompress => {
            let mut arena = spa.inner.arena.lock();
            let zio = arena.get_mut(idx);
            let is_rewrite = zio.bp_orig.map(|o| o.birth == zio.txg).unwrap_or(false);
            let dont_compress_after = spa.inner.config.dont_compress_after_pass;
            let pass = spa.inner.sync_pass.load(std::sync::atomic::Ordering::SeqCst);

            if is_rewrite && pass > dont_compress_after {
                let psize = zio.size;
                zio.bp.as_mut().unwrap().set_lsize(zio.size);
                zio.bp.as_mut().unwrap().set_psize(psize);
                zio.bp.as_mut().unwrap().set_compress(CompressId::Off);
                if Some(psize) == zio.bp_orig.map(|o| o.psize()) {
                    zio.pipeline &= !Stage::DvaAllocate.bit();
                }
                return StageOutcome::Advance;
            }

            let compressed = compress::compress(zio.compress, &zio.data);
            let lsize = zio.size;
            let psize = match &compressed {
                Some(c) => c.len() as u64,
                None => lsize,
            };

            if let Some(c) = compressed {
                let bufsize = c.len() as u64;
                zio.transform.push(std::mem::replace(&mut zio.data, c), lsize, bufsize);
            } else {
                zio.bp.as_mut().unwrap().set_compress(CompressId::Off);
            }

            let bp = zio.bp.as_mut().unwrap();
            bp.set_lsize(lsize);
            bp.set_psize(psize);
            if psize == 0 {
                // Compresses away to nothing: the block becomes a hole, no
                // physical allocation or I/O is needed.
                zio.pipeline &= !(Stage::DvaAllocate.bit()
                    | Stage::DvaTranslate.bit()
                    | Stage::VdevIoSetup.bit()
                    | Stage::VdevIoStart.bit()
                    | Stage::VdevIoDone.bit()
                    | Stage::VdevIoAssess.bit());
            } else if is_rewrite && Some(psize) == zio.bp_orig.map(|o| o.psize()) {
                zio.pipeline &= !Stage::DvaAllocate.bit();
            }
            StageOutcome::Advance
        }

        Stage::ChecksumGenerate => {
            let mut arena = spa.inner.arena.lock();
            let zio = arena.get_mut(idx);
            let cksum = checksum::checksum(zio.checksum, &zio.data);
            let bp = zio.bp.as_mut().unwrap();
            bp.cksum = cksum;
            bp.set_checksum(zio.checksum);
            StageOutcome::Advance
        }

        Stage::GangPipeline => {
            let mut arena = spa.inner.arena.lock();
            let zio = arena.get_mut(idx);
            let is_gang = zio.bp.map(|b| b.is_gang(0)).unwrap_or(false);
            if !is_gang && zio.kind == Type::Read {
                let strip = Stage::GetGangHeader.bit() | Stage::ReadGangMembers.bit();
                zio.pipeline &= !strip;
            }
            StageOutcome::Advance
        }

        Stage::GetGangHeader => {
            let is_gang = spa.inner.arena.lock().get(idx).bp.map(|b| b.is_gang(0)).unwrap_or(false);
            if !is_gang {
                return StageOutcome::Advance;
            }
            match ensure_gbh_loaded(spa, idx) {
                Ok(()) => StageOutcome::Advance,
                Err(e) => {
                    spa.inner.arena.lock().get_mut(idx).error = Some(e);
                    StageOutcome::Advance
                }
            }
        }

        // A rewrite of an already-gang BP whose compressed size converged
        // (the only rewrite path this crate's single-shot `write`/`rewrite`
        // constructors exercise) reuses the existing members verbatim —
        // each member's DVA and payload are unchanged, so there is nothing
        // to redo here beyond having the header available.
        Stage::RewriteGangMembers => StageOutcome::Advance,

        Stage::FreeGangMembers => {
            let is_gang = spa.inner.arena.lock().get(idx).bp.map(|b| b.is_gang(0)).unwrap_or(false);
            if !is_gang {
                return StageOutcome::Advance;
            }
            if let Err(e) = ensure_gbh_loaded(spa, idx) {
                spa.inner.arena.lock().get_mut(idx).error = Some(e);
                return StageOutcome::Advance;
            }
            let (children, txg) = {
                let arena = spa.inner.arena.lock();
                let zio = arena.get(idx);
                (zio.gbh.unwrap().children().copied().collect::<Vec<_>>(), zio.txg)
            };
            let mut metaslab = spa.inner.metaslab.lock();
            for child in children {
                metaslab.free(child.primary_dva(), txg);
            }
            StageOutcome::Advance
        }

        Stage::ClaimGangMembers => {
            let is_gang = spa.inner.arena.lock().get(idx).bp.map(|b| b.is_gang(0)).unwrap_or(false);
            if !is_gang {
                return StageOutcome::Advance;
            }
            if let Err(e) = ensure_gbh_loaded(spa, idx) {
                spa.inner.arena.lock().get_mut(idx).error = Some(e);
                return StageOutcome::Advance;
            }
            let (children, txg) = {
                let arena = spa.inner.arena.lock();
                let zio = arena.get(idx);
                (zio.gbh.unwrap().children().copied().collect::<Vec<_>>(), zio.txg)
            };
            let mut first_err = None;
            {
                let mut metaslab = spa.inner.metaslab.lock();
                for child in children {
                    if let Err(e) = metaslab.claim(child.primary_dva(), txg) {
                        first_err.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_err {
                spa.inner.arena.lock().get_mut(idx).error = Some(e);
            }
            StageOutcome::Advance
        }

        Stage::DvaAllocate => {
            let (vdev, size, txg, gang_bang) = {
                let arena = spa.inner.arena.lock();
                let zio = arena.get(idx);
                (
                    zio.bp.unwrap().primary_dva().vdev(),
                    zio.bp.unwrap().psize(),
                    zio.txg,
                    spa.inner.config.gang_bang_threshold,
                )
            };

            let forced_gang = gang_bang.map(|t| size > t).unwrap_or(false);
            let alloc_result = if forced_gang { Err(ZioError::NoSpace) } else { spa.inner.metaslab.lock().alloc(vdev, size, txg) };

            match alloc_result {
                Ok(dva) => {
                    spa.inner.arena.lock().get_mut(idx).bp.as_mut().unwrap().primary_dva_mut().clone_from(&dva);
                    StageOutcome::Advance
                }
                Err(ZioError::NoSpace) => match fragment_into_gang(spa, idx) {
                    Ok(()) => StageOutcome::Advance,
                    Err(e) => {
                        spa.inner.arena.lock().get_mut(idx).error = Some(e);
                        StageOutcome::Advance
                    }
                },
                Err(e) => {
                    spa.inner.arena.lock().get_mut(idx).error = Some(e);
                    StageOutcome::Advance
                }
            }
        }

        Stage::DvaFree => {
            let (dva, txg) = {
                let arena = spa.inner.arena.lock();
                let zio = arena.get(idx);
                (*zio.bp.unwrap().primary_dva(), zio.txg)
            };
            spa.inner.metaslab.lock().free(&dva, txg);
            spa.inner.arena.lock().get_mut(idx).bp = Some(BlockPtr::zero());
            StageOutcome::Advance
        }

        Stage::DvaClaim => {
            let (dva, txg) = {
                let arena = spa.inner.arena.lock();
                let zio = arena.get(idx);
                (*zio.bp.unwrap().primary_dva(), zio.txg)
            };
            if let Err(e) = spa.inner.metaslab.lock().claim(&dva, txg) {
                spa.inner.arena.lock().get_mut(idx).error = Some(e);
            }
            StageOutcome::Advance
        }

        Stage::GangChecksumGenerate => {
            let mut arena = spa.inner.arena.lock();
            let zio = arena.get_mut(idx);
            let is_gang = zio.bp.map(|b| b.is_gang(0)).unwrap_or(false);
            if !is_gang {
                return StageOutcome::Advance;
            }
            let dva = *zio.bp.unwrap().primary_dva();
            let birth = zio.txg;
            let mut gbh = zio.gbh.expect("gang checksum generate without a header");
            gbh.tail_cksum = gang_verifier(&dva, birth);
            let bytes = gbh.to_bytes();
            zio.size = bytes.len() as u64;
            zio.data = bytes;
            zio.gbh = Some(gbh);
            StageOutcome::Advance
        }

        Stage::Ready => {
            notify_parent_ready(spa, idx);
            StageOutcome::Advance
        }

        Stage::DvaTranslate => {
            let (dva, is_gang) = {
                let arena = spa.inner.arena.lock();
                let zio = arena.get(idx);
                (*zio.bp.unwrap().primary_dva(), zio.bp.unwrap().is_gang(0))
            };
            let top = match spa.inner.vdevs.lookup_top(dva.vdev()) {
                Some(t) => t,
                None => {
                    spa.inner.arena.lock().get_mut(idx).error = Some(ZioError::NoSuchDevice);
                    return StageOutcome::Advance;
                }
            };
            let _ = top;
            let size = if is_gang { GANG_BLOCK_SIZE } else { spa.inner.arena.lock().get(idx).bp.unwrap().psize() };
            let cap = spa.inner.metaslab.lock().capacity(dva.vdev());
            if cap.map(|c| dva.offset() + size > c).unwrap_or(true) {
                spa.inner.arena.lock().get_mut(idx).error = Some(ZioError::Overflow);
                return StageOutcome::Advance;
            }
            let mut arena = spa.inner.arena.lock();
            let zio = arena.get_mut(idx);
            zio.vdev = Some(dva.vdev());
            zio.offset = dva.offset();
            zio.size = size;
            StageOutcome::Advance
        }

        Stage::VdevIoSetup => {
            let mut arena = spa.inner.arena.lock();
            let zio = arena.get_mut(idx);
            let top = spa.inner.vdevs.lookup_top(zio.vdev.expect("vdev io setup without a resolved vdev"));
            if let Some(top) = top {
                if top.kind == VdevKind::Leaf && !zio.flags.contains(Flags::PHYSICAL) {
                    zio.offset += VDEV_LABEL_START_SIZE;
                    zio.flags.insert(Flags::PHYSICAL);
                }
            }
            StageOutcome::Advance
        }

        Stage::VdevIoStart => {
            let (top, is_write, offset, size, data) = {
                let arena = spa.inner.arena.lock();
                let zio = arena.get(idx);
                let top = spa.inner.vdevs.lookup_top(zio.vdev.unwrap()).expect("vdev io start without a device");
                (top, zio.kind == Type::Write, zio.offset, zio.size, zio.data.clone())
            };
            top.enter_pending(idx);
            let result = top.submit(is_write, offset, size, if is_write { Some(&data) } else { None });
            let mut arena = spa.inner.arena.lock();
            let zio = arena.get_mut(idx);
            match result {
                Ok(read_data) => {
                    if !is_write {
                        zio.data = read_data;
                    }
                }
                Err(e) => zio.error = Some(e),
            }
            StageOutcome::Advance
        }

        // The reference/test vdev driver is synchronous (spec §6 "Vdev
        // driver contract" note in `vdev.rs`), so by the time
        // `VDEV_IO_START` returns the result is already in hand; this
        // stage is the hook a real asynchronous driver's callback would
        // land on.
        Stage::VdevIoDone => StageOutcome::Advance,

        Stage::VdevIoAssess => {
            let top = spa.inner.arena.lock().get(idx).vdev.and_then(|v| spa.inner.vdevs.lookup_top(v));
            if let Some(top) = &top {
                top.exit_pending(idx);
            }

            let retry_now = {
                let mut arena = spa.inner.arena.lock();
                let zio = arena.get_mut(idx);
                if should_retry(zio) {
                    zio.retries += 1;
                    zio.flags.remove(Flags::FAILFAST);
                    zio.flags.insert(Flags::DONT_CACHE);
                    zio.error = None;
                    true
                } else {
                    false
                }
            };

            if !retry_now {
                return StageOutcome::Advance;
            }

            let retries = spa.inner.arena.lock().get(idx).retries;
            if retries == 1 {
                log::debug!("zio {idx}: retrying immediately (attempt {retries})");
                return StageOutcome::Reexecute(Stage::VdevIoSetup);
            }
            log::warn!("zio {idx}: queuing retry {retries} for device reopen");
            if let Some(top) = top {
                if top.enqueue_retry(idx) {
                    schedule_retry_task(spa, top);
                }
            }
            StageOutcome::Stalled
        }

        Stage::WaitChildrenDone => {
            let mut arena = spa.inner.arena.lock();
            let zio = arena.get_mut(idx);
            if zio.children_notdone == 0 {
                StageOutcome::Advance
            } else {
                zio.stalled = Some(Stage::WaitChildrenDone);
                StageOutcome::Stalled
            }
        }

        Stage::ChecksumVerify => {
            let mut arena = spa.inner.arena.lock();
            let zio = arena.get_mut(idx);
            if zio.checksum_verified {
                return StageOutcome::Advance;
            }
            let bp = zio.bp.unwrap();
            if bp.is_gang(0) {
                // `zio.data` at this point is the raw GBH, not the logical
                // payload `bp.cksum` describes — it has nothing to verify
                // against here. The GBH's own integrity was already
                // authenticated against the gang verifier in
                // `GET_GANG_HEADER`, and each member's own child
                // `read_phys` (its `bp` is the member's own `BlockPtr`,
                // from `vdev_child_io`) runs this same stage against its
                // own payload.
                return StageOutcome::Advance;
            }
            let actual = checksum::checksum(bp.checksum(), &zio.data);
            if actual == bp.cksum {
                return StageOutcome::Advance;
            }
            log::warn!("zio {idx}: checksum mismatch at offset {}", zio.offset);
            if zio.retries < 1 {
                zio.retries += 1;
                return StageOutcome::Reexecute(Stage::VdevIoSetup);
            }
            zio.error = Some(ZioError::ChecksumMismatch);
            StageOutcome::Advance
        }

        Stage::ReadGangMembers => {
            let is_gang = spa.inner.arena.lock().get(idx).bp.map(|b| b.is_gang(0)).unwrap_or(false);
            if !is_gang {
                return StageOutcome::Advance;
            }
            if let Err(e) = ensure_gbh_loaded(spa, idx) {
                spa.inner.arena.lock().get_mut(idx).error = Some(e);
                return StageOutcome::Advance;
            }
            let (members, checksum) = {
                let arena = spa.inner.arena.lock();
                let zio = arena.get(idx);
                (zio.gbh.unwrap().children().copied().collect::<Vec<_>>(), zio.checksum)
            };

            let mut reassembled = Vec::new();
            for member in members {
                let child = Zio::vdev_child_io(member, checksum, Priority::AsyncRead, Flags::GANG_INHERIT);
                match wait(spa, child) {
                    Ok(done) => reassembled.extend(done.data),
                    Err(e) => {
                        spa.inner.arena.lock().get_mut(idx).error = Some(e);
                        return StageOutcome::Advance;
                    }
                }
            }
            spa.inner.arena.lock().get_mut(idx).data = reassembled;
            StageOutcome::Advance
        }

        Stage::ReadDecompress => {
            let mut arena = spa.inner.arena.lock();
            let zio = arena.get_mut(idx);
            let bp = zio.bp.unwrap();
            if !bp.compress().is_off() {
                match compress::decompress(bp.compress(), &zio.data, bp.lsize() as usize) {
                    Some(d) => zio.data = d,
                    None => zio.error = Some(ZioError::Io),
                }
            }
            StageOutcome::Advance
        }

        Stage::Done => {
            let (has_bp, error, canfail) = {
                let arena = spa.inner.arena.lock();
                let zio = arena.get(idx);
                (zio.bp.is_some(), zio.error, zio.flags.contains(Flags::CANFAIL))
            };
            if has_bp {
                spa.inner.arena.lock().get(idx).bp.unwrap().assert_padding_zero();
            }
            if let Some(vdev) = spa.inner.arena.lock().get(idx).vdev {
                if let Some(top) = spa.inner.vdevs.lookup_top(vdev) {
                    top.stats.record(error.is_none());
                }
            }
            if error.is_some() && !canfail {
                log::error!("zio failed at DONE with an unrecoverable error: {:?}", error);
                panic!("zio done with an unrecoverable error and CANFAIL unset: {error:?}");
            }

            notify_parent_done(spa, idx);

            let (waiter, mut transform) = {
                let mut arena = spa.inner.arena.lock();
                let zio = arena.get_mut(idx);
                (zio.waiter, std::mem::take(&mut zio.transform))
            };
            transform.unwind(&mut spa.inner.buffer_pool.lock());

            {
                let mut arena = spa.inner.arena.lock();
                arena.get_mut(idx).done = true;
            }
            spa.inner.zio_done_cv.notify_all();

            if !waiter {
                spa.inner.arena.lock().remove(idx);
            }
            StageOutcome::Terminal
        }
    }
}
