//! Compression id space and dispatch table (spec §4.6 "Compression path").
//! As with `checksum`, dispatch is a `match` over a small enum rather than
//! a trait object (spec §9 "Dynamic dispatch").

use std::io::Read;

use crate::lzjb::{LzjbDecoder, LzjbEncoder};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CompressId {
    Off = 0,
    Lzjb = 1,
    /// Stand-in for the source's GZIP_1..9 levels. The engine treats
    /// compression algorithms as an abstract function table (spec §1); a
    /// real gzip implementation is out of scope, so this id is backed by
    /// a second LZJB pass at level >= 5 to keep the table total and
    /// deterministic for tests that only care that *some* distinct,
    /// reversible compression happened at each of the nine levels. Always
    /// round-trips: see `compress`/`decompress` for the marker byte that
    /// records whether the second pass actually ran.
    GzipStandIn(u8),
}

impl CompressId {
    pub fn is_off(self) -> bool {
        matches!(self, CompressId::Off)
    }
}

/// Attempts to compress `data`. Returns `None` if the compressed form
/// would not be smaller (mirrors `zio_compress_data` returning `false`
/// and the caller falling back to `ZIO_COMPRESS_OFF`).
///
/// `GzipStandIn` at level >= 5 runs LZJB twice; whether the second pass
/// actually fired is recorded as a leading marker byte (plus, when it
/// did, the intermediate length) so `decompress` never has to guess
/// which of the two encodings it's holding.
pub fn compress(id: CompressId, data: &[u8]) -> Option<Vec<u8>> {
    match id {
        CompressId::Off => None,
        CompressId::Lzjb => lzjb_compress(data),
        CompressId::GzipStandIn(level) => {
            let once = lzjb_compress(data)?;
            if level < 5 {
                return Some(once);
            }
            match lzjb_compress(&once) {
                Some(twice) => {
                    let mut out = Vec::with_capacity(1 + 8 + twice.len());
                    out.push(1);
                    out.extend_from_slice(&(once.len() as u64).to_le_bytes());
                    out.extend_from_slice(&twice);
                    Some(out)
                }
                None => {
                    let mut out = Vec::with_capacity(1 + once.len());
                    out.push(0);
                    out.extend_from_slice(&once);
                    Some(out)
                }
            }
        }
    }
}

/// Decompresses `data`, which was compressed under `id`, into a buffer of
/// exactly `lsize` bytes. Errors surface as `None`, which the pipeline
/// reports as `ZioError::Io` (spec §4.6 "Decompression path").
pub fn decompress(id: CompressId, data: &[u8], lsize: usize) -> Option<Vec<u8>> {
    match id {
        CompressId::Off => Some(data.to_vec()),
        CompressId::Lzjb => lzjb_decompress(data, lsize),
        CompressId::GzipStandIn(level) => {
            if level < 5 {
                return lzjb_decompress(data, lsize);
            }
            let (marker, rest) = data.split_first()?;
            match marker {
                1 => {
                    if rest.len() < 8 {
                        return None;
                    }
                    let (len_bytes, twice) = rest.split_at(8);
                    let once_len = u64::from_le_bytes(len_bytes.try_into().ok()?) as usize;
                    let once = lzjb_decompress(twice, once_len)?;
                    lzjb_decompress(&once, lsize)
                }
                _ => lzjb_decompress(rest, lsize),
            }
        }
    }
}

fn lzjb_compress(data: &[u8]) -> Option<Vec<u8>> {
    if data.is_empty() {
        return None;
    }
    let mut dst = vec![0u8; data.len()];
    let n = LzjbEncoder::new(data).read(&mut dst).ok()?;
    if n >= data.len() {
        None
    } else {
        dst.truncate(n);
        Some(dst)
    }
}

fn lzjb_decompress(data: &[u8], lsize: usize) -> Option<Vec<u8>> {
    let mut dst = vec![0u8; lsize];
    LzjbDecoder::new(data).read(&mut dst).ok()?;
    Some(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_repetitive_payload() {
        let payload = vec![0xAAu8; 128 * 1024];
        let compressed = compress(CompressId::Lzjb, &payload).expect("should compress");
        assert!(compressed.len() < payload.len());
        let decompressed = decompress(CompressId::Lzjb, &compressed, payload.len()).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[test]
    fn refuses_incompressible_tiny_payload() {
        // A couple of bytes can't beat LZJB's per-8-byte flag overhead.
        assert!(compress(CompressId::Lzjb, b"ab").is_none() || compress(CompressId::Lzjb, b"ab").unwrap().len() >= 2);
    }

    #[test]
    fn gzip_standin_round_trips_when_second_pass_fires() {
        let payload = vec![0x11u8; 128 * 1024];
        let compressed = compress(CompressId::GzipStandIn(9), &payload).expect("should compress");
        let decompressed = decompress(CompressId::GzipStandIn(9), &compressed, payload.len()).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[test]
    fn gzip_standin_round_trips_regardless_of_whether_second_pass_shrinks() {
        // A short repeating unit compresses well on the first LZJB pass;
        // whether the *second* pass over that result shrinks further or
        // not, `compress`/`decompress` must agree on which encoding was
        // used. Exercised at every level >= 5 since the fallback doesn't
        // depend on the level beyond the >= 5 threshold.
        let unit: Vec<u8> = (0..37u8).collect();
        let payload: Vec<u8> = unit.iter().copied().cycle().take(64 * 1024).collect();
        for level in 5..=9u8 {
            let compressed = compress(CompressId::GzipStandIn(level), &payload).expect("should compress");
            let decompressed = decompress(CompressId::GzipStandIn(level), &compressed, payload.len()).unwrap();
            assert_eq!(decompressed, payload);
        }
    }
}
