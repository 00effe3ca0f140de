//! End-to-end exercises of the six scenarios a pool build needs to get
//! right: a small write, a compressed write, a forced gang split, an
//! ENOSPC-triggered gang split, a checksum-mismatch retry, and a
//! sync-pass-gated deferred free. Each drives the real pipeline (`zio::wait`)
//! against a `Spa` backed by either a `tempfile`-provided file (exercising
//! the on-disk offset math) or the in-memory `MemLeaf` (where a test hook
//! like `corrupt_once` is easiest to reach).

use zio::bam::{BlockPtr, GANG_BLOCK_SIZE, MIN_BLOCK_SIZE};
use zio::checksum::{self, ChecksumId};
use zio::compress::CompressId;
use zio::metaslab::MemMetaslab;
use zio::spa::{PoolConfig, Spa};
use zio::vdev::{FileLeaf, MemLeaf, TopVdev, VdevKind, VdevTree, VDEV_LABEL_START_SIZE};
use zio::zio::{self, Flags, Priority, Zio};

const ASHIFT: u8 = 9;

/// Installs `env_logger` once so `RUST_LOG=debug cargo test -- --nocapture`
/// surfaces the pipeline's stage-level `trace!`/`debug!` output.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn round_up_ashift(size: u64) -> u64 {
    let unit = 1u64 << ASHIFT;
    let rem = size % unit;
    if rem == 0 {
        size
    } else {
        size + (unit - rem)
    }
}

/// A pool with a single leaf vdev backed by an anonymous, ashift-9 file
/// sized to comfortably hold `capacity` bytes of allocations plus the
/// label area every leaf reserves at its front.
fn file_backed_pool(capacity: u64, config: PoolConfig) -> Spa {
    let file = tempfile::tempfile().expect("create anonymous backing file");
    file.set_len(capacity + VDEV_LABEL_START_SIZE + (1 << 20)).expect("size backing file");
    let top = TopVdev::new(0, ASHIFT, VdevKind::Leaf, Box::new(FileLeaf::new(file)));
    let tree = VdevTree::new(vec![top]);
    let metaslab = MemMetaslab::new(ASHIFT, vec![capacity]);
    Spa::open(config, Box::new(metaslab), tree)
}

fn mem_backed_pool(capacity: u64, config: PoolConfig, leaf: MemLeaf) -> Spa {
    let top = TopVdev::new(0, ASHIFT, VdevKind::Leaf, Box::new(leaf));
    let tree = VdevTree::new(vec![top]);
    let metaslab = MemMetaslab::new(ASHIFT, vec![capacity]);
    Spa::open(config, Box::new(metaslab), tree)
}

#[test]
fn s1_small_write_no_compression_no_gang() {
    init_logging();
    let spa = file_backed_pool(16 << 20, PoolConfig::default());
    let payload = vec![0x41u8; 4096];

    let write = Zio::write(payload.clone(), ChecksumId::Fletcher2, CompressId::Off, 1, Priority::SyncWrite, Flags::empty());
    let done = zio::wait(&spa, write).expect("write succeeds");
    let bp = done.bp.expect("write produces a bp");

    assert!(!bp.is_gang(0));
    assert_eq!(bp.psize(), 4096);
    assert_eq!(bp.lsize(), 4096);
    assert_eq!(bp.primary_dva().asize(), 4096);
    assert_eq!(bp.cksum, checksum::checksum(ChecksumId::Fletcher2, &payload));

    let read = Zio::read(bp, Priority::SyncRead, Flags::empty());
    let done = zio::wait(&spa, read).expect("read succeeds");
    assert_eq!(done.data, payload);
}

#[test]
fn s2_compressed_write() {
    init_logging();
    let spa = file_backed_pool(16 << 20, PoolConfig::default());
    let payload = vec![0xAAu8; 128 * 1024];

    let write = Zio::write(payload.clone(), ChecksumId::Fletcher2, CompressId::Lzjb, 1, Priority::SyncWrite, Flags::empty());
    let done = zio::wait(&spa, write).expect("write succeeds");
    let bp = done.bp.expect("write produces a bp");

    assert_eq!(bp.lsize(), 131072);
    assert!(bp.psize() < bp.lsize());
    assert_eq!(bp.primary_dva().asize(), round_up_ashift(bp.psize()));

    let read = Zio::read(bp, Priority::SyncRead, Flags::empty());
    let done = zio::wait(&spa, read).expect("read succeeds");
    assert_eq!(done.data, payload);
}

#[test]
fn s3_forced_gang() {
    init_logging();
    let mut config = PoolConfig::default();
    config.gang_bang_threshold = Some(0);
    let spa = file_backed_pool(16 << 20, config);

    let mut payload = vec![0u8; 256 * 1024];
    for (i, b) in payload.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }

    let write = Zio::write(payload.clone(), ChecksumId::Sha256, CompressId::Off, 1, Priority::SyncWrite, Flags::empty());
    let done = zio::wait(&spa, write).expect("forced-gang write succeeds");
    let bp = done.bp.expect("write produces a bp");

    assert!(bp.is_gang(0));
    assert_eq!(bp.primary_dva().asize(), round_up_ashift(GANG_BLOCK_SIZE) + {
        let gbh = done.gbh().expect("gang header retained on the completed zio");
        gbh.children().map(|c| c.primary_dva().asize()).sum::<u64>()
    });

    let gbh = done.gbh().expect("gang header retained on the completed zio");
    let children: Vec<_> = gbh.children().collect();
    assert!(children.len() >= 2);
    assert_eq!(children.iter().map(|c| c.psize()).sum::<u64>(), 262144);

    let read = Zio::read(bp, Priority::SyncRead, Flags::empty());
    let done = zio::wait(&spa, read).expect("gang read succeeds");
    assert_eq!(done.data, payload);
}

#[test]
fn s4_enospc_triggered_gang() {
    init_logging();
    let capacity = 16u64 << 20;
    let top = TopVdev::new(0, ASHIFT, VdevKind::Leaf, Box::new(FileLeaf::new({
        let file = tempfile::tempfile().expect("create anonymous backing file");
        file.set_len(capacity + VDEV_LABEL_START_SIZE + (1 << 20)).expect("size backing file");
        file
    })));
    let tree = VdevTree::new(vec![top]);
    let mut metaslab = MemMetaslab::new(ASHIFT, vec![capacity]);
    metaslab.max_alloc_size = Some(64 * 1024);
    let spa = Spa::open(PoolConfig::default(), Box::new(metaslab), tree);

    let payload = vec![0x5Au8; 128 * 1024];
    let write = Zio::write(payload.clone(), ChecksumId::Fletcher2, CompressId::Off, 1, Priority::SyncWrite, Flags::empty());
    let done = zio::wait(&spa, write).expect("write succeeds via the gang path");
    let bp = done.bp.expect("write produces a bp");

    assert!(bp.is_gang(0));
    let gbh = done.gbh().expect("gang header retained on the completed zio");
    let children: Vec<_> = gbh.children().collect();
    assert!(children.len() >= 2 && children.len() <= 3);
    assert_eq!(children.iter().map(|c| c.psize()).sum::<u64>(), 131072);
    for child in &children {
        assert!(child.psize() <= 64 * 1024);
    }

    let read = Zio::read(bp, Priority::SyncRead, Flags::empty());
    let done = zio::wait(&spa, read).expect("gang read succeeds");
    assert_eq!(done.data, payload);
}

#[test]
fn s5_checksum_mismatch_retries_once() {
    init_logging();
    let mut leaf = MemLeaf::new(4 << 20);
    leaf.corrupt_once = true;
    let spa = mem_backed_pool(1 << 20, PoolConfig::default(), leaf);

    let payload = vec![0x7Eu8; 4096];
    let write = Zio::write(payload.clone(), ChecksumId::Sha256, CompressId::Off, 1, Priority::SyncWrite, Flags::empty());
    let done = zio::wait(&spa, write).expect("write succeeds");
    let bp = done.bp.expect("write produces a bp");

    let read = Zio::read(bp, Priority::SyncRead, Flags::empty());
    let done = zio::wait(&spa, read).expect("read recovers after one retry");
    assert_eq!(done.data, payload);
    assert_eq!(done.retries, 1);
}

#[test]
fn s6_deferred_free_then_direct_free() {
    init_logging();
    let spa = file_backed_pool(16 << 20, PoolConfig::default());
    let payload = vec![0x10u8; 4096];
    let write = Zio::write(payload, ChecksumId::Fletcher2, CompressId::Off, 1, Priority::SyncWrite, Flags::empty());
    let done = zio::wait(&spa, write).expect("write succeeds");
    let bp: BlockPtr = done.bp.expect("write produces a bp");

    spa.set_sync_pass(2);
    assert!(spa.free(&bp, 1), "free during sync_pass > defer_free_after_pass should be deferred");

    spa.set_sync_pass(1);
    assert_eq!(spa.sync_deferred_frees(1), 1, "the deferred free drains on the next pass");

    // A second BP, freed while sync_pass is already within the
    // direct-free window, hits the allocator immediately.
    let payload2 = vec![0x20u8; MIN_BLOCK_SIZE as usize];
    let write2 = Zio::write(payload2, ChecksumId::Fletcher2, CompressId::Off, 2, Priority::SyncWrite, Flags::empty());
    let done2 = zio::wait(&spa, write2).expect("second write succeeds");
    let bp2 = done2.bp.expect("second write produces a bp");
    assert!(!spa.free(&bp2, 2), "free at sync_pass <= defer_free_after_pass is direct");
}
