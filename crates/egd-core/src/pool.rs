//! Bounded entropy pool: an ordered sequence of chunks with a global
//! byte cap and a conservative entropy-bit ledger.
//!
//! The pool is the only shared mutable state in the daemon. Callers wrap
//! it in a single mutex; every operation here is short, allocation-light,
//! and does no I/O, so one lock never becomes a bottleneck at the
//! minutes-to-hours fetch cadence the scheduler runs at.
//!
//! Eviction is whole-oldest-chunk: conditioned chunks are uniformly
//! distributed, so partial eviction would buy nothing and complicate the
//! ledger arithmetic.

use std::collections::VecDeque;

use crate::chunk::PoolChunk;
use crate::snapshot::{self, SnapshotError};

/// Aggregate pool counters, as reported over the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total_bytes: usize,
    pub total_bits: u64,
    pub max_bytes: usize,
    pub chunks: usize,
}

/// Chunked entropy pool. See the module docs for the locking discipline.
#[derive(Debug)]
pub struct Pool {
    chunks: VecDeque<PoolChunk>,
    max_bytes: usize,
    chunk_cap: usize,
    total_bytes: usize,
    total_bits: u64,
}

impl Pool {
    /// Create an empty pool.
    ///
    /// # Panics
    ///
    /// Panics when either cap is zero; a zero-capacity pool is a
    /// configuration bug, not a runtime condition.
    pub fn new(max_bytes: usize, chunk_cap: usize) -> Self {
        assert!(max_bytes > 0, "pool byte cap must be positive");
        assert!(chunk_cap > 0, "chunk byte cap must be positive");
        Self {
            chunks: VecDeque::new(),
            max_bytes,
            chunk_cap,
            total_bytes: 0,
            total_bits: 0,
        }
    }

    /// Append conditioned material, opening new chunks as needed and then
    /// evicting whole oldest chunks until the byte cap holds.
    ///
    /// # Panics
    ///
    /// Panics when `bits` exceeds `data.len() * 8` — a caller crediting
    /// more than one bit per bit is a ledger corruption bug and the
    /// daemon's policy for those is fail-fast.
    pub fn append(&mut self, data: &[u8], bits: u64) {
        if data.is_empty() {
            return;
        }
        assert!(
            bits <= data.len() as u64 * 8,
            "entropy credit {bits} exceeds {} bytes",
            data.len()
        );

        let mut offset = 0;
        let mut remaining_bits = bits;
        while offset < data.len() {
            if self.chunks.back().map_or(true, PoolChunk::is_full) {
                self.chunks.push_back(PoolChunk::new(self.chunk_cap));
            }
            let tail = self.chunks.back_mut().expect("tail chunk exists");
            let (took, took_bits) = tail.append(&data[offset..], remaining_bits);
            offset += took;
            remaining_bits -= took_bits;
            self.total_bytes += took;
            self.total_bits += took_bits;
        }

        while self.total_bytes > self.max_bytes {
            let evicted = self.chunks.pop_front().expect("over cap implies a chunk");
            self.total_bytes -= evicted.len_bytes();
            self.total_bits -= evicted.entropy_bits();
            tracing::debug!(
                evicted_bytes = evicted.len_bytes(),
                evicted_bits = evicted.entropy_bits(),
                "dropped oldest chunk to honour pool cap"
            );
        }
        self.check_ledger();
    }

    /// Remove up to `n` bytes from the front of the pool.
    ///
    /// Returns whatever is available immediately — an empty pool yields
    /// `(empty, 0)`, not an error. Delivered bits follow the per-chunk
    /// accounting of [`PoolChunk::withdraw`].
    pub fn withdraw(&mut self, n: usize) -> (Vec<u8>, u64) {
        let mut out = Vec::with_capacity(n.min(self.total_bytes));
        let mut bits = 0u64;
        while out.len() < n {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let (taken, taken_bits) = front.withdraw(n - out.len());
            out.extend_from_slice(&taken);
            bits += taken_bits;
            if front.is_empty() {
                self.chunks.pop_front();
            }
        }
        self.total_bytes -= out.len();
        self.total_bits -= bits;
        self.check_ledger();
        (out, bits)
    }

    /// Serialize the pool into a self-describing snapshot blob.
    pub fn snapshot(&self) -> Vec<u8> {
        snapshot::encode(self.chunks.iter().map(|c| (c.as_bytes(), c.entropy_bits())))
    }

    /// Replace the pool contents with a snapshot.
    ///
    /// Fails (leaving the pool untouched) when the blob is malformed, its
    /// digest does not verify, or any chunk violates the configured caps.
    pub fn load(&mut self, blob: &[u8]) -> Result<(), SnapshotError> {
        let parts = snapshot::decode(blob, self.max_bytes)?;

        let mut chunks = VecDeque::with_capacity(parts.len());
        let mut total_bytes = 0usize;
        let mut total_bits = 0u64;
        for (bytes, bits) in parts {
            total_bytes += bytes.len();
            total_bits += bits;
            let chunk = PoolChunk::from_parts(bytes, bits, self.chunk_cap)
                .ok_or(SnapshotError::LedgerViolation)?;
            chunks.push_back(chunk);
        }
        if total_bytes > self.max_bytes {
            return Err(SnapshotError::Oversize {
                bytes: total_bytes as u64,
                max: self.max_bytes as u64,
            });
        }

        self.chunks = chunks;
        self.total_bytes = total_bytes;
        self.total_bits = total_bits;
        self.check_ledger();
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_bytes: self.total_bytes,
            total_bits: self.total_bits,
            max_bytes: self.max_bytes,
            chunks: self.chunks.len(),
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn total_bits(&self) -> u64 {
        self.total_bits
    }

    /// Fail-fast ledger audit, run after every mutation. A violation here
    /// means the accounting is corrupt and continuing would silently serve
    /// overstated entropy.
    fn check_ledger(&self) {
        assert!(
            self.total_bits <= self.total_bytes as u64 * 8,
            "ledger violation: {} bits recorded for {} bytes",
            self.total_bits,
            self.total_bytes
        );
        assert!(
            self.total_bytes <= self.max_bytes,
            "ledger violation: {} bytes exceeds cap {}",
            self.total_bytes,
            self.max_bytes
        );
        debug_assert_eq!(
            self.total_bytes,
            self.chunks.iter().map(PoolChunk::len_bytes).sum::<usize>()
        );
        debug_assert_eq!(
            self.total_bits,
            self.chunks.iter().map(PoolChunk::entropy_bits).sum::<u64>()
        );
    }
}
