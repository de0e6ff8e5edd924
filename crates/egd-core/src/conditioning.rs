//! Centralized entropy conditioning.
//!
//! **ALL** transformation of raw source bytes lives here — sources produce
//! raw blobs, this module is the single gateway that turns them into
//! pool-ready material together with a conservative entropy-bit estimate.
//!
//! # Pipeline
//!
//! ```text
//! raw bytes → [LZMA compress, keep smaller] → SHA-512 counter stir → pool bytes
//!                      │
//!                      └── len(c) * 8 * scale → entropy bits (floor)
//! ```
//!
//! The compressed size is the entropy estimate: an incompressible
//! high-entropy blob cannot be shrunk, so forcing the compressed form would
//! falsely inflate the accounting. The stir makes the output look uniform
//! without ever crediting more bits than the compressed length carried in.

use sha2::{Digest, Sha512};

/// Width in bytes of one stirred output block (SHA-512).
pub const DIGEST_WIDTH: usize = 64;

/// LZMA preset used for the compression estimate. Mid-range: the estimate
/// only needs a decent bound, not the best achievable ratio.
const XZ_PRESET: u32 = 6;

/// Output of [`condition`]: pool-ready bytes and their entropy credit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conditioned {
    /// Stirred bytes, a whole number of [`DIGEST_WIDTH`] blocks.
    pub bytes: Vec<u8>,
    /// Conservative entropy estimate, never more than `bytes.len() * 8`.
    pub entropy_bits: u64,
}

impl Conditioned {
    fn empty() -> Self {
        Self {
            bytes: Vec::new(),
            entropy_bits: 0,
        }
    }
}

/// Condition a raw blob into pool material.
///
/// When `compress` is set the blob is run through an LZMA encoder and the
/// smaller of {compressed, raw} becomes the pre-scale estimate `c`. The
/// stirred output is `ceil(len(c) / W) * W` bytes where block `i` is
/// `SHA-512(c ‖ i)`. `entropy_bits = floor(len(c) * 8 * clamp(scale, 0, 1))`.
///
/// Empty input yields an empty result with zero bits. Never fails: a
/// misbehaving encoder falls back to the raw bytes (which can only lower
/// the estimate relative to the truth, never raise it).
pub fn condition(raw: &[u8], compress: bool, scale: f64) -> Conditioned {
    if raw.is_empty() {
        return Conditioned::empty();
    }

    let compressed = if compress { xz_compress(raw) } else { None };
    let estimate = match &compressed {
        Some(c) if c.len() < raw.len() => c.as_slice(),
        _ => raw,
    };

    let bytes = stir(estimate);
    let entropy_bits = scale_bits(estimate.len(), scale);
    debug_assert!(entropy_bits <= bytes.len() as u64 * 8);

    Conditioned { bytes, entropy_bits }
}

/// Compress with LZMA; `None` when the encoder fails for any reason.
fn xz_compress(data: &[u8]) -> Option<Vec<u8>> {
    use std::io::Write;
    use xz2::write::XzEncoder;

    let mut encoder = XzEncoder::new(Vec::new(), XZ_PRESET);
    if let Err(err) = encoder.write_all(data) {
        tracing::warn!(error = %err, "lzma encoder failed, using raw size estimate");
        return None;
    }
    match encoder.finish() {
        Ok(out) => Some(out),
        Err(err) => {
            tracing::warn!(error = %err, "lzma encoder failed, using raw size estimate");
            None
        }
    }
}

/// Counter-mode SHA-512 stir: block `i` is `H(c ‖ i_le)`, output is a whole
/// number of blocks covering `c`.
fn stir(c: &[u8]) -> Vec<u8> {
    let blocks = c.len().div_ceil(DIGEST_WIDTH);
    let mut out = Vec::with_capacity(blocks * DIGEST_WIDTH);
    for i in 0..blocks as u64 {
        let mut h = Sha512::new();
        h.update(c);
        h.update(i.to_le_bytes());
        out.extend_from_slice(&h.finalize());
    }
    out
}

/// `floor(len * 8 * clamp(scale, 0, 1))`.
fn scale_bits(len: usize, scale: f64) -> u64 {
    let scale = scale.clamp(0.0, 1.0);
    ((len as u64 * 8) as f64 * scale).floor() as u64
}
