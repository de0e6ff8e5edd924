//! Loopback TCP control channel.
//!
//! Binds `127.0.0.1:<port>` and speaks the line-oriented protocol
//! documented on the crate root: one command per connection, one reply,
//! close. Handlers run as independent tasks so a slow client never blocks
//! the accept loop, the scheduler, or other clients; the pool lock is held
//! only for the microseconds a pool operation takes, never across I/O.
//!
//! `stop` replies, then cancels the daemon-wide token. The accept loop
//! stops taking new connections and gives in-flight handlers a short grace
//! period to finish.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use egd_core::persist::Persister;
use egd_core::pool::Pool;

/// Hard cap on one `getentropy` request; larger requests are clamped.
pub const MAX_GETENTROPY_BYTES: usize = 16 * 1024 * 1024;

/// Longest accepted command line, newline included.
const MAX_COMMAND_LINE: u64 = 256;

/// Grace period for in-flight handlers once shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// What a handled command produced.
enum Reply {
    Line(String),
    /// `getentropy` header plus the raw payload.
    Entropy { header: String, body: Vec<u8> },
    /// `stop` acknowledgement; cancellation fires after the write.
    Stopping,
}

/// Control listener bound to the loopback interface.
pub struct ControlServer {
    listener: TcpListener,
    pool: Arc<Mutex<Pool>>,
    persister: Arc<Persister>,
    cancel: CancellationToken,
}

impl ControlServer {
    /// Bind the loopback listener. Port 0 asks the OS for a free port;
    /// [`Self::local_addr`] reports the result.
    pub async fn bind(
        port: u16,
        pool: Arc<Mutex<Pool>>,
        persister: Arc<Persister>,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        Ok(Self {
            listener,
            pool,
            persister,
            cancel,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until cancelled, then drain in-flight handlers for at most
    /// the grace period.
    pub async fn run(self) {
        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let pool = Arc::clone(&self.pool);
                            let persister = Arc::clone(&self.persister);
                            let cancel = self.cancel.clone();
                            handlers.spawn(async move {
                                if let Err(err) = handle_connection(stream, pool, persister, cancel).await {
                                    debug!(%peer, error = %err, "control connection error");
                                }
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "control accept failed");
                        }
                    }
                }
            }
            // Reap finished handlers so the set does not grow unbounded.
            while handlers.try_join_next().is_some() {}
        }

        info!("control server draining in-flight handlers");
        let drain = async {
            while handlers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("grace period elapsed, abandoning slow control handlers");
            handlers.abort_all();
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    pool: Arc<Mutex<Pool>>,
    persister: Arc<Persister>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();

    let mut line = String::new();
    BufReader::new(read_half.take(MAX_COMMAND_LINE))
        .read_line(&mut line)
        .await?;

    let reply = dispatch(line.trim(), &pool, &persister).await;
    match reply {
        Reply::Line(text) => {
            write_half.write_all(text.as_bytes()).await?;
            write_half.write_all(b"\n").await?;
        }
        Reply::Entropy { header, body } => {
            write_half.write_all(header.as_bytes()).await?;
            write_half.write_all(b"\n").await?;
            write_half.write_all(&body).await?;
        }
        Reply::Stopping => {
            write_half.write_all(b"OK stopping\n").await?;
            write_half.flush().await?;
            cancel.cancel();
        }
    }
    write_half.shutdown().await?;
    Ok(())
}

async fn dispatch(line: &str, pool: &Arc<Mutex<Pool>>, persister: &Arc<Persister>) -> Reply {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("status") => {
            let s = pool.lock().unwrap().stats();
            Reply::Line(format!(
                "OK total_bytes={} total_bits={} max_bytes={} chunks={}",
                s.total_bytes, s.total_bits, s.max_bytes, s.chunks
            ))
        }
        Some("getentropy") => match words.next().map(str::parse::<usize>) {
            Some(Ok(n)) if n >= 1 => {
                let clamped = n > MAX_GETENTROPY_BYTES;
                let n = n.min(MAX_GETENTROPY_BYTES);
                let (body, bits) = pool.lock().unwrap().withdraw(n);
                let mut header = format!("OK bytes={} bits={}", body.len(), bits);
                if clamped {
                    header.push_str(&format!(" clamped={MAX_GETENTROPY_BYTES}"));
                }
                Reply::Entropy { header, body }
            }
            Some(Ok(_)) => Reply::Line("ERR byte count must be at least 1".into()),
            Some(Err(_)) => Reply::Line("ERR malformed byte count".into()),
            None => Reply::Line("ERR getentropy requires a byte count".into()),
        },
        Some("persist") => {
            // Snapshot under the lock, write outside it.
            let blob = pool.lock().unwrap().snapshot();
            let persister = Arc::clone(persister);
            let outcome =
                tokio::task::spawn_blocking(move || persister.persist(&blob).map(|()| persister))
                    .await;
            match outcome {
                Ok(Ok(persister)) => {
                    Reply::Line(format!("OK persisted={}", persister.path().display()))
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "on-demand persist failed");
                    Reply::Line(format!("ERR {err}"))
                }
                Err(err) => Reply::Line(format!("ERR persist task failed: {err}")),
            }
        }
        Some("stop") => Reply::Stopping,
        Some(other) => Reply::Line(format!("ERR unknown command {other}")),
        None => Reply::Line("ERR empty command".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps() -> (Arc<Mutex<Pool>>, Arc<Persister>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(Mutex::new(Pool::new(10 * 1024 * 1024, 64 * 1024)));
        let persister = Arc::new(Persister::new(dir.path().join("pool.egd")));
        (pool, persister, dir)
    }

    #[tokio::test]
    async fn dispatch_status_empty_pool() {
        let (pool, persister, _dir) = deps();
        match dispatch("status", &pool, &persister).await {
            Reply::Line(s) => {
                assert_eq!(s, "OK total_bytes=0 total_bits=0 max_bytes=10485760 chunks=0");
            }
            _ => panic!("expected a line reply"),
        }
    }

    #[tokio::test]
    async fn dispatch_getentropy_clamps_and_notes() {
        let (pool, persister, _dir) = deps();
        match dispatch("getentropy 999999999", &pool, &persister).await {
            Reply::Entropy { header, body } => {
                assert!(header.contains("clamped=16777216"), "header: {header}");
                assert!(body.is_empty());
            }
            _ => panic!("expected an entropy reply"),
        }
    }

    #[tokio::test]
    async fn dispatch_rejects_garbage() {
        let (pool, persister, _dir) = deps();
        for bad in ["getentropy", "getentropy zero", "getentropy 0", "frobnicate", ""] {
            match dispatch(bad, &pool, &persister).await {
                Reply::Line(s) => assert!(s.starts_with("ERR "), "{bad:?} → {s}"),
                _ => panic!("expected an error line for {bad:?}"),
            }
        }
    }

    #[tokio::test]
    async fn dispatch_persist_writes_snapshot() {
        let (pool, persister, _dir) = deps();
        pool.lock().unwrap().append(&[1u8; 64], 64);
        match dispatch("persist", &pool, &persister).await {
            Reply::Line(s) => assert!(s.starts_with("OK persisted="), "{s}"),
            _ => panic!("expected a line reply"),
        }
        let blob = persister.load(1 << 20).unwrap().unwrap();
        let mut restored = Pool::new(10 * 1024 * 1024, 64 * 1024);
        restored.load(&blob).unwrap();
        assert_eq!(restored.stats().total_bytes, 64);
    }
}
