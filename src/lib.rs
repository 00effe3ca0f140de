//! A copy-on-write, pooled-storage block I/O engine: block pointers, a
//! transform stack, a pluggable allocator contract, a vdev submit/retry
//! layer, and the pipeline state machine (`zio`) that drives an I/O from
//! open to done through them.
//!
//! Grounded on the original's `zio.c`/`zio.h`, `vdev.c`, `spa_misc.c` and
//! the teacher's `uberblock.rs`/`from_bytes.rs` scaffolding.

pub mod bam;
pub mod buffer_pool;
pub mod checksum;
pub mod compress;
pub mod error;
pub mod from_bytes;
pub mod lzjb;
pub mod metaslab;
pub mod spa;
pub mod taskq;
pub mod transform;
pub mod uberblock;
pub mod vdev;
pub mod zio;

pub use error::{Result, ZioError};
pub use spa::{PoolConfig, Spa};
