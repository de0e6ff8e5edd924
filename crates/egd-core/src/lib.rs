//! # egd-core
//!
//! Core pipeline of the entropy gathering daemon: harvest raw bytes from
//! heterogeneous sources, condition them (compress + cryptographic stir),
//! accumulate the result in a bounded chunked pool with a conservative
//! entropy ledger, and snapshot the pool to disk so entropy survives
//! restarts.
//!
//! ## Architecture
//!
//! ```text
//! Source → raw bytes → Conditioner → (conditioned bytes, entropy bits) → Pool
//!                                                                          │
//!                                              withdraw ←──────────────────┤
//!                                              snapshot/load ←── Persister ┘
//! ```
//!
//! The pool never overstates its entropy content: the per-blob estimate is
//! the compressed size of the raw input (scaled by operator trust), and
//! every partial append or withdrawal rounds the transferred bits down.
//!
//! ## Quick Start
//!
//! ```no_run
//! use egd_core::conditioning::condition;
//! use egd_core::pool::Pool;
//!
//! let mut pool = Pool::new(10 * 1024 * 1024, 64 * 1024);
//! let out = condition(b"raw sample bytes", true, 1.0);
//! pool.append(&out.bytes, out.entropy_bits);
//! let (bytes, bits) = pool.withdraw(32);
//! assert!(bits <= bytes.len() as u64 * 8);
//! ```

pub mod chunk;
pub mod conditioning;
pub mod config;
pub mod persist;
pub mod pool;
pub mod snapshot;
pub mod source;

pub use chunk::PoolChunk;
pub use conditioning::{condition, Conditioned, DIGEST_WIDTH};
pub use config::{ConfigError, DaemonConfig, FetcherConfig, SourceConfig};
pub use persist::{InstanceLock, PersistError, Persister};
pub use pool::{Pool, PoolStats};
pub use snapshot::SnapshotError;
pub use source::{FetchError, Fetcher, Producer, SourceDescriptor, UrlProvider};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
