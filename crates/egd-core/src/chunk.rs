//! Bounded container of conditioned bytes with an entropy-bit ledger.
//!
//! A chunk accepts appends until its capacity is reached and is drained
//! destructively from the front. Bit accounting on partial transfers is
//! proportional and rounds down, so a chunk can under-report but never
//! over-report what it holds.

/// One segment of the pool. Invariant: `entropy_bits <= bytes.len() * 8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolChunk {
    bytes: Vec<u8>,
    entropy_bits: u64,
    cap: usize,
}

impl PoolChunk {
    /// Create an empty chunk with the given byte capacity.
    pub fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            entropy_bits: 0,
            cap,
        }
    }

    /// Rebuild a chunk from snapshot parts. Returns `None` when the parts
    /// would violate the chunk invariants.
    pub fn from_parts(bytes: Vec<u8>, entropy_bits: u64, cap: usize) -> Option<Self> {
        if bytes.len() > cap || entropy_bits > bytes.len() as u64 * 8 {
            return None;
        }
        Some(Self {
            bytes,
            entropy_bits,
            cap,
        })
    }

    /// Append as many of `data`'s bytes as fit within the capacity.
    ///
    /// Returns `(accepted_bytes, accepted_bits)`; the bit credit is scaled
    /// by `accepted / len(data)` and rounded down.
    pub fn append(&mut self, data: &[u8], bits: u64) -> (usize, u64) {
        let room = self.cap - self.bytes.len();
        let take = room.min(data.len());
        if take == 0 {
            return (0, 0);
        }
        let accepted_bits = if take == data.len() {
            bits
        } else {
            prorate(bits, take, data.len())
        };
        self.bytes.extend_from_slice(&data[..take]);
        self.entropy_bits += accepted_bits;
        (take, accepted_bits)
    }

    /// Remove up to `n` bytes from the front.
    ///
    /// The bit accounting is `floor(bits * taken / len)` for a partial
    /// drain and exactly the remaining bits when the chunk empties.
    pub fn withdraw(&mut self, n: usize) -> (Vec<u8>, u64) {
        let take = n.min(self.bytes.len());
        if take == 0 {
            return (Vec::new(), 0);
        }
        let bits = if take == self.bytes.len() {
            self.entropy_bits
        } else {
            prorate(self.entropy_bits, take, self.bytes.len())
        };
        let out: Vec<u8> = self.bytes.drain(..take).collect();
        self.entropy_bits -= bits;
        (out, bits)
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.bytes.len() >= self.cap
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn entropy_bits(&self) -> u64 {
        self.entropy_bits
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// `floor(bits * part / whole)` without intermediate overflow.
fn prorate(bits: u64, part: usize, whole: usize) -> u64 {
    debug_assert!(part <= whole && whole > 0);
    (bits as u128 * part as u128 / whole as u128) as u64
}
