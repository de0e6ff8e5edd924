//! Binary snapshot codec for the pool.
//!
//! The on-disk image is self-describing and integrity-checked; it is never
//! fed through a language-native object serializer, because those formats
//! are brittle across versions and an attack surface when loading files.
//!
//! # Layout (all integers little-endian)
//!
//! ```text
//! +---------------------+--------------------------------------+
//! | magic               | 8 bytes, "EGDPOOL\0"                 |
//! | version             | u32                                  |
//! | chunk count K       | u64                                  |
//! | K × chunk           | u64 len, u64 entropy_bits, len bytes |
//! | digest              | 32 bytes, SHA-256 of everything above|
//! +---------------------+--------------------------------------+
//! ```
//!
//! Decoding is strict: wrong magic, unknown version, any length that does
//! not line up, a failed digest, or a chunk claiming more than 8 bits per
//! byte all reject the blob. Length fields are validated against a caller
//! supplied bound before any allocation happens.

use sha2::{Digest, Sha256};

/// File magic, 8 bytes.
pub const MAGIC: [u8; 8] = *b"EGDPOOL\0";

/// Current format version.
pub const VERSION: u32 = 1;

const HEADER_LEN: usize = 8 + 4 + 8;
const CHUNK_HEADER_LEN: usize = 8 + 8;
const DIGEST_LEN: usize = 32;

/// Snapshot decode failure. Every variant means "start empty" to the
/// daemon; none of them are recoverable by retrying.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("bad snapshot magic")]
    BadMagic,

    #[error("unsupported snapshot version {found}")]
    UnsupportedVersion { found: u32 },

    #[error("snapshot truncated or lengths inconsistent")]
    Truncated,

    #[error("trailing bytes after the last chunk")]
    TrailingGarbage,

    #[error("snapshot digest mismatch")]
    DigestMismatch,

    #[error("chunk ledger or capacity invariant violated")]
    LedgerViolation,

    #[error("snapshot payload of {bytes} bytes exceeds the pool cap of {max}")]
    Oversize { bytes: u64, max: u64 },
}

/// Encode chunks (payload, entropy_bits) into a snapshot blob.
pub fn encode<'a>(chunks: impl Iterator<Item = (&'a [u8], u64)>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());

    // Chunk count is patched in after the iterator is drained.
    let count_at = out.len();
    out.extend_from_slice(&0u64.to_le_bytes());

    let mut count: u64 = 0;
    for (bytes, bits) in chunks {
        out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        out.extend_from_slice(&bits.to_le_bytes());
        out.extend_from_slice(bytes);
        count += 1;
    }
    out[count_at..count_at + 8].copy_from_slice(&count.to_le_bytes());

    let digest = Sha256::digest(&out);
    out.extend_from_slice(&digest);
    out
}

/// Decode a snapshot blob into `(payload, entropy_bits)` pairs.
///
/// `max_total_bytes` bounds the summed payload size; it is checked while
/// walking the chunk headers so a corrupt length field cannot trigger a
/// huge allocation.
pub fn decode(blob: &[u8], max_total_bytes: usize) -> Result<Vec<(Vec<u8>, u64)>, SnapshotError> {
    if blob.len() < HEADER_LEN + DIGEST_LEN {
        return Err(SnapshotError::Truncated);
    }
    if blob[..8] != MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let version = u32::from_le_bytes(blob[8..12].try_into().expect("4 bytes"));
    if version != VERSION {
        return Err(SnapshotError::UnsupportedVersion { found: version });
    }

    let (body, digest) = blob.split_at(blob.len() - DIGEST_LEN);
    if Sha256::digest(body).as_slice() != digest {
        return Err(SnapshotError::DigestMismatch);
    }

    let count = u64::from_le_bytes(body[12..20].try_into().expect("8 bytes"));
    let mut cursor = HEADER_LEN;
    let mut total: u64 = 0;
    let mut chunks = Vec::new();
    for _ in 0..count {
        if body.len() - cursor < CHUNK_HEADER_LEN {
            return Err(SnapshotError::Truncated);
        }
        let len = u64::from_le_bytes(body[cursor..cursor + 8].try_into().expect("8 bytes"));
        let bits = u64::from_le_bytes(body[cursor + 8..cursor + 16].try_into().expect("8 bytes"));
        cursor += CHUNK_HEADER_LEN;

        total = total.saturating_add(len);
        if total > max_total_bytes as u64 {
            return Err(SnapshotError::Oversize {
                bytes: total,
                max: max_total_bytes as u64,
            });
        }
        let len = len as usize;
        if body.len() - cursor < len {
            return Err(SnapshotError::Truncated);
        }
        if bits > len as u64 * 8 {
            return Err(SnapshotError::LedgerViolation);
        }
        chunks.push((body[cursor..cursor + len].to_vec(), bits));
        cursor += len;
    }
    if cursor != body.len() {
        return Err(SnapshotError::TrailingGarbage);
    }
    Ok(chunks)
}
