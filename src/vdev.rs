//! Vdev tree and the per-top-level-vdev submit/retry layer (spec §4.5).
//! The physical drivers (mirror/raidz/leaf) are external collaborators
//! (spec §1); the core only needs the generic `submit` contract and the
//! pending/retry bookkeeping around it. Grounded on
//! `zio_vdev_io_{enter,exit,setup,start,done,assess}` and
//! `zio_vdev_io_retry` in the original.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Minimal per-vdev operation counters, updated at `VDEV_IO_ASSESS` (spec
/// §4.6 "Completion" / "updates vdev stats"). The original's full
/// `vdev_stat_t` (queue depths, latency histograms) is out of scope; this
/// is just enough for a caller to observe retry/error behavior.
#[derive(Default)]
pub struct VdevStats {
    pub ops: AtomicU64,
    pub errors: AtomicU64,
}

impl VdevStats {
    pub fn record(&self, ok: bool) {
        self.ops.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Label area reserved at the start of every leaf device
/// (`VDEV_LABEL_START_SIZE`); non-physical I/Os get this added to their
/// offset the first time they reach `VDEV_IO_SETUP` so label areas are
/// never overwritten (spec §4.5 "Offset translation").
pub const VDEV_LABEL_START_SIZE: u64 = 4 * 1024 * 1024;

/// The kind of node in the vdev tree (spec §9 "Dynamic dispatch": a sealed
/// tagged union over a fixed set of kinds, not an open trait hierarchy).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VdevKind {
    Root,
    Mirror,
    RaidZ,
    Leaf,
}

/// A contract a vdev driver implements to accept I/O (spec §6 "Vdev driver
/// contract"). `submit` is non-blocking: it schedules completion and the
/// driver is expected to report back asynchronously by the caller polling
/// or (in a fuller implementation) invoking a completion callback. The
/// reference/test implementation below polls synchronously, which is
/// sufficient because a test vdev has no real asynchronous hardware
/// latency.
pub trait VdevSubmit: Send {
    /// Begins a read or write of `size` bytes at byte `offset`. Returns
    /// `Ok(data)` for a read (the bytes read), `Ok(vec![])` for a write,
    /// or an error mirroring the device's failure.
    fn submit(
        &mut self,
        is_write: bool,
        offset: u64,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<Vec<u8>, crate::error::ZioError>;

    /// Purges any cached state and re-establishes the connection to the
    /// underlying device (spec §6 "`vdev_reopen`").
    fn reopen(&mut self);
}

/// A queued retry: the top-level vdev id and a closure-free marker the
/// retry task replays by re-entering the pipeline at `VDEV_IO_SETUP`. The
/// actual `Zio` is owned by the caller; this type only carries enough to
/// find it again, matching the original's intrusive `io_retry_next` list
/// living on the `zio_t` itself. Here, since `Zio` ownership is arena-based
/// (spec §9 "Cycles / back-edges"), the retry list holds arena indices.
pub type ZioIndex = usize;

/// Per-top-level-vdev pending/retry bookkeeping (spec §4.5). One instance
/// per top-level vdev in the tree; leaf vdevs below a top-level share its
/// lists (mirrors: `zio->io_vd->vdev_top`).
pub struct TopVdev {
    pub id: u32,
    pub ashift: u8,
    pub kind: VdevKind,
    driver: Mutex<Box<dyn VdevSubmit>>,
    state: Mutex<TopVdevState>,
    drain_cv: Condvar,
    pub stats: VdevStats,
}

struct TopVdevState {
    /// FIFO of in-flight I/Os, ordered by `VDEV_IO_SETUP` entry (spec §8
    /// property 7).
    pending: VecDeque<ZioIndex>,
    /// I/Os awaiting a reopen-and-retry replay.
    retry: Vec<ZioIndex>,
    retry_task_running: bool,
}

impl TopVdev {
    pub fn new(id: u32, ashift: u8, kind: VdevKind, driver: Box<dyn VdevSubmit>) -> Arc<Self> {
        Arc::new(TopVdev {
            id,
            ashift,
            kind,
            driver: Mutex::new(driver),
            state: Mutex::new(TopVdevState {
                pending: VecDeque::new(),
                retry: Vec::new(),
                retry_task_running: false,
            }),
            stats: VdevStats::default(),
        })
    }

    /// `zio_vdev_io_enter`: appends to the pending list on `VDEV_IO_START`.
    pub fn enter_pending(&self, idx: ZioIndex) {
        let mut state = self.state.lock();
        state.pending.push_back(idx);
    }

    /// `zio_vdev_io_exit`: removes from pending on `VDEV_IO_ASSESS`,
    /// broadcasting the drain condvar if pending becomes empty.
    pub fn exit_pending(&self, idx: ZioIndex) {
        let mut state = self.state.lock();
        if let Some(pos) = state.pending.iter().position(|&i| i == idx) {
            state.pending.remove(pos);
        }
        if state.pending.is_empty() {
            self.drain_cv.notify_all();
        }
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn pending_order(&self) -> Vec<ZioIndex> {
        self.state.lock().pending.iter().copied().collect()
    }

    /// Blocks the calling thread until the pending list drains.
    pub fn wait_drain(&self) {
        let mut state = self.state.lock();
        while !state.pending.is_empty() {
            self.drain_cv.wait(&mut state);
        }
    }

    /// Enqueues `idx` onto the retry list. Returns `true` if this is the
    /// first entry (the caller should dispatch the background reopen
    /// task), matching `zq == NULL` in `zio_vdev_io_assess`.
    pub fn enqueue_retry(&self, idx: ZioIndex) -> bool {
        let mut state = self.state.lock();
        state.retry.push(idx);
        if state.retry_task_running {
            false
        } else {
            state.retry_task_running = true;
            true
        }
    }

    /// Drains the retry list, reopening the device first (`vdev_reopen`).
    /// Called from the background retry task after its delay elapses.
    pub fn drain_retries(&self) -> Vec<ZioIndex> {
        self.driver.lock().reopen();
        let mut state = self.state.lock();
        state.retry_task_running = false;
        std::mem::take(&mut state.retry)
    }

    pub fn submit(
        &self,
        is_write: bool,
        offset: u64,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<Vec<u8>, crate::error::ZioError> {
        self.driver.lock().submit(is_write, offset, size, data)
    }
}

/// The vdev tree: a root with children, each a `TopVdev` (for this
/// simplified core, every immediate child of root is itself top-level —
/// mirror/raidz internal fan-out is the physical driver's concern and
/// isn't modeled here, matching spec §1's "generic vdev tree with a
/// `submit` contract").
pub struct VdevTree {
    top_level: Vec<Arc<TopVdev>>,
}

impl VdevTree {
    pub fn new(top_level: Vec<Arc<TopVdev>>) -> Self {
        VdevTree { top_level }
    }

    pub fn lookup_top(&self, vdev: u32) -> Option<Arc<TopVdev>> {
        self.top_level.iter().find(|v| v.id == vdev).cloned()
    }

    pub fn capacity_check(&self, vdev: u32, offset: u64, size: u64, capacity: u64) -> bool {
        let _ = vdev;
        offset + size <= capacity
    }
}

/// A test/reference leaf driver backed by a plain in-memory buffer,
/// standing in for the teacher's `File`-backed `Reader`. A real leaf
/// driver (and the kernel-emulation vnode shim behind it) is out of
/// scope (spec §1).
pub struct MemLeaf {
    data: Vec<u8>,
    pub fail_once: bool,
    pub corrupt_once: bool,
}

impl MemLeaf {
    pub fn new(capacity: u64) -> Self {
        MemLeaf { data: vec![0u8; capacity as usize], fail_once: false, corrupt_once: false }
    }
}

impl VdevSubmit for MemLeaf {
    fn submit(
        &mut self,
        is_write: bool,
        offset: u64,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<Vec<u8>, crate::error::ZioError> {
        if self.fail_once {
            self.fail_once = false;
            return Err(crate::error::ZioError::Io);
        }
        let start = offset as usize;
        let end = start + size as usize;
        if end > self.data.len() {
            return Err(crate::error::ZioError::Overflow);
        }
        if is_write {
            let payload = data.expect("write submit without data");
            self.data[start..end].copy_from_slice(&payload[..size as usize]);
            Ok(Vec::new())
        } else {
            let mut out = self.data[start..end].to_vec();
            if self.corrupt_once {
                self.corrupt_once = false;
                if let Some(byte) = out.first_mut() {
                    *byte ^= 0xFF;
                }
            }
            Ok(out)
        }
    }

    fn reopen(&mut self) {
        self.fail_once = false;
    }
}

/// A real on-disk leaf driver backed by a `std::fs::File`, grounded on the
/// teacher's own `Reader { disk: File }` (`zio.rs`'s `read`/`write` pair:
/// `seek` then `read`/`write` against a fixed-size backing file). Used by
/// the integration tests against a `tempfile::NamedTempFile` so the
/// scenarios in spec §8 exercise a real file descriptor, not just an
/// in-memory `Vec`.
pub struct FileLeaf {
    disk: std::fs::File,
}

impl FileLeaf {
    /// Opens `disk`, which must already be sized to at least `capacity`
    /// bytes (the teacher preallocates its backing file the same way
    /// before handing it to `Reader`).
    pub fn new(disk: std::fs::File) -> Self {
        FileLeaf { disk }
    }
}

impl VdevSubmit for FileLeaf {
    fn submit(
        &mut self,
        is_write: bool,
        offset: u64,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<Vec<u8>, crate::error::ZioError> {
        use std::io::{Read, Seek, SeekFrom, Write};

        self.disk.seek(SeekFrom::Start(offset)).map_err(|_| crate::error::ZioError::Io)?;
        if is_write {
            let payload = data.expect("write submit without data");
            self.disk.write_all(&payload[..size as usize]).map_err(|_| crate::error::ZioError::Io)?;
            self.disk.flush().map_err(|_| crate::error::ZioError::Io)?;
            Ok(Vec::new())
        } else {
            let mut buf = vec![0u8; size as usize];
            self.disk.read_exact(&mut buf).map_err(|_| crate::error::ZioError::Io)?;
            Ok(buf)
        }
    }

    fn reopen(&mut self) {
        let _ = self.disk.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_list_is_fifo() {
        let top = TopVdev::new(0, 9, VdevKind::Leaf, Box::new(MemLeaf::new(1 << 20)));
        top.enter_pending(3);
        top.enter_pending(1);
        top.enter_pending(2);
        assert_eq!(top.pending_order(), vec![3, 1, 2]);
        top.exit_pending(1);
        assert_eq!(top.pending_order(), vec![3, 2]);
    }

    #[test]
    fn pending_empty_after_last_exit() {
        let top = TopVdev::new(0, 9, VdevKind::Leaf, Box::new(MemLeaf::new(1 << 20)));
        top.enter_pending(1);
        top.exit_pending(1);
        assert_eq!(top.pending_len(), 0);
    }
}
