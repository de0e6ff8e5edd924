//! Daemon runtime: assembles pool, persister, scheduler, and control
//! server with the required startup ordering, and tears everything down
//! with a final snapshot on shutdown.
//!
//! Startup order matters: the instance lock is taken first (two daemons
//! must not interleave snapshot writes), the snapshot is restored next,
//! and only then do the scheduler and control server start — so a
//! withdrawal can never race the restoration of the snapshot.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use egd_core::config::DaemonConfig;
use egd_core::persist::{InstanceLock, Persister};
use egd_core::pool::Pool;
use egd_core::source::{SourceDescriptor, FETCH_TIMEOUT};

use crate::control::ControlServer;
use crate::scheduler::Scheduler;

/// The assembled daemon. Sources from the configuration file are joined
/// by any programmatically registered descriptors (the closure-bearing
/// fetcher variants can only arrive this way).
pub struct Daemon {
    config: DaemonConfig,
    extra_sources: Vec<SourceDescriptor>,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            extra_sources: Vec::new(),
        }
    }

    /// Register a source built in code (e.g. `HttpDynamic` or `Callback`).
    pub fn add_source(mut self, source: SourceDescriptor) -> Self {
        self.extra_sources.push(source);
        self
    }

    /// Run until a `stop` command or a termination signal arrives, then
    /// quiesce and write a final snapshot. `force` skips the
    /// single-instance lock.
    pub async fn run(self, force: bool) -> anyhow::Result<()> {
        let persister = Arc::new(Persister::new(&self.config.persist_file));

        let _lock = if force {
            warn!("instance lock bypassed by --force");
            None
        } else {
            Some(
                InstanceLock::acquire(&self.config.persist_file)
                    .context("another egdd instance may be running")?,
            )
        };

        let mut pool = Pool::new(self.config.max_entropy_bytes, self.config.pool_chunk_max_bytes);
        restore_snapshot(&mut pool, &persister, &self.config);
        let pool = Arc::new(Mutex::new(pool));

        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .connect_timeout(FETCH_TIMEOUT)
            .user_agent(concat!("egdd/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building http client")?;

        let cancel = CancellationToken::new();
        spawn_signal_listener(cancel.clone());

        let control = ControlServer::bind(
            self.config.tcp_port,
            Arc::clone(&pool),
            Arc::clone(&persister),
            cancel.clone(),
        )
        .await
        .with_context(|| format!("binding control port {}", self.config.tcp_port))?;
        info!(addr = %control.local_addr()?, "control channel listening");

        let mut sources: Vec<SourceDescriptor> = self
            .config
            .sources
            .iter()
            .cloned()
            .map(|s| s.into_descriptor())
            .collect();
        sources.extend(self.extra_sources);
        info!(
            sources = sources.iter().filter(|s| s.enabled).count(),
            "starting scheduler"
        );
        let scheduler = Scheduler::spawn(sources, Arc::clone(&pool), http, cancel.clone());

        let ticker = spawn_persist_ticker(
            Arc::clone(&pool),
            Arc::clone(&persister),
            Duration::from_secs(self.config.persist_interval_s),
            cancel.clone(),
        );

        // Runs until `stop` or a signal cancels the token.
        control.run().await;

        info!("quiescing scheduler");
        scheduler.quiesce().await;
        let _ = ticker.await;

        let blob = pool.lock().unwrap().snapshot();
        persister
            .persist(&blob)
            .context("writing final snapshot")?;
        info!(path = %persister.path().display(), "final snapshot written");
        Ok(())
    }
}

/// Install the persisted snapshot, or start empty on any failure.
fn restore_snapshot(pool: &mut Pool, persister: &Persister, config: &DaemonConfig) {
    // Generous bound: a legitimate snapshot cannot outgrow the pool cap
    // by more than its per-chunk framing.
    let bound = config.max_entropy_bytes as u64 * 2 + (1 << 20);
    match persister.load(bound) {
        Ok(Some(blob)) => match pool.load(&blob) {
            Ok(()) => {
                let s = pool.stats();
                info!(
                    total_bytes = s.total_bytes,
                    total_bits = s.total_bits,
                    "restored pool snapshot"
                );
            }
            Err(err) => {
                error!(error = %err, "persisted snapshot rejected, starting empty");
            }
        },
        Ok(None) => info!("no snapshot on disk, starting empty"),
        Err(err) => {
            error!(error = %err, "persisted snapshot unreadable, starting empty");
        }
    }
}

/// Background snapshot every `interval`; failures are logged and retried
/// at the next tick.
fn spawn_persist_ticker(
    pool: Arc<Mutex<Pool>>,
    persister: Arc<Persister>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the startup snapshot is not
        // interesting, so consume it.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let blob = pool.lock().unwrap().snapshot();
            let persister = Arc::clone(&persister);
            match tokio::task::spawn_blocking(move || persister.persist(&blob)).await {
                Ok(Ok(())) => debug!("periodic snapshot written"),
                Ok(Err(err)) => warn!(error = %err, "periodic persist failed, retrying next tick"),
                Err(err) => warn!(error = %err, "persist task panicked"),
            }
        }
    })
}

/// Cancel the daemon on SIGINT/SIGTERM.
#[cfg(unix)]
fn spawn_signal_listener(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};
    tokio::spawn(async move {
        let (Ok(mut term), Ok(mut int)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) else {
            warn!("signal handlers unavailable, relying on the stop command");
            return;
        };
        tokio::select! {
            _ = term.recv() => info!("SIGTERM received"),
            _ = int.recv() => info!("SIGINT received"),
        }
        cancel.cancel();
    });
}

#[cfg(not(unix))]
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            cancel.cancel();
        }
    });
}
