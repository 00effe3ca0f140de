//! The crate's single error currency (§7 of the design: allocation,
//! translation, device I/O, checksum, decompression errors). Programmer
//! errors (bad stage, bad BP padding, bad sibling linkage) are `panic!`,
//! never a `ZioError` — see `zio::Zio::run_stage`.

use thiserror::Error;

/// Mirrors the errno taxonomy the engine's collaborators are specified to
/// return (§6 "Allocator contract", §7 "Error taxonomy").
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ZioError {
    /// ENOSPC: the allocator has no extent of the requested size.
    #[error("no space left in pool")]
    NoSpace,
    /// EIO: device transport failure, or decompression failure.
    #[error("I/O error")]
    Io,
    /// ECKSUM: a read's payload didn't match its block pointer's checksum.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// ENXIO: the DVA names a vdev id that isn't in the tree.
    #[error("no such device")]
    NoSuchDevice,
    /// EOVERFLOW: offset + size exceeds the vdev's allocated extent.
    #[error("offset out of range")]
    Overflow,
    /// EAGAIN: claim against a DVA that is already allocated this txg.
    #[error("extent already allocated")]
    AlreadyAllocated,
    /// ESTALE: claim against a DVA the allocator never handed out.
    #[error("extent not found")]
    NotFound,
}

impl ZioError {
    /// Coarse classification used by the retry policy (§4.5) to decide
    /// whether an error is the kind that should never be retried more than
    /// once.
    pub fn is_checksum_or_missing_device(self) -> bool {
        matches!(self, ZioError::ChecksumMismatch | ZioError::NoSuchDevice)
    }
}

pub type Result<T> = std::result::Result<T, ZioError>;
