//! # egd-daemon
//!
//! Long-running harness around [`egd_core`]: drives every enabled source
//! on its own cadence, feeds conditioned material into the shared pool,
//! snapshots the pool to disk, and serves entropy to local clients over a
//! loopback TCP control channel.
//!
//! ## Control protocol
//!
//! One text command per connection, one response, then close:
//!
//! | command          | success reply                                             |
//! |------------------|-----------------------------------------------------------|
//! | `status`         | `OK total_bytes=<n> total_bits=<b> max_bytes=<m> chunks=<k>` |
//! | `getentropy <n>` | `OK bytes=<k> bits=<b>` header, then `k` raw bytes        |
//! | `persist`        | `OK persisted=<path>`                                     |
//! | `stop`           | `OK stopping`                                             |
//!
//! Failures reply `ERR <reason>`. `getentropy` requests above 16 MiB are
//! clamped and the header gains a `clamped=<cap>` token.

pub mod control;
pub mod daemon;
pub mod scheduler;

pub use daemon::Daemon;
