//! Per-source fetch scheduler.
//!
//! Every enabled source runs as its own task: wait out the initial delay,
//! then fetch → size gate → condition → pool append, and sleep the
//! source's interval (±10% jitter) before the next attempt. The loop is
//! strictly serial per source, so there is never more than one in-flight
//! fetch for a source and a slow fetch simply pushes the next tick out
//! instead of queueing behind itself. Sources are independent tasks; one
//! stalling never delays another.
//!
//! Every failure mode is soft: logged with the source name, credited zero
//! entropy, rescheduled. The scheduler only exits on cancellation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, gauge};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use egd_core::conditioning::condition;
use egd_core::pool::Pool;
use egd_core::source::SourceDescriptor;

/// Handle over the spawned source tasks.
pub struct Scheduler {
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn one task per enabled source. Disabled descriptors are
    /// dropped here.
    pub fn spawn(
        sources: Vec<SourceDescriptor>,
        pool: Arc<Mutex<Pool>>,
        http: reqwest::Client,
        cancel: CancellationToken,
    ) -> Self {
        let tasks = sources
            .into_iter()
            .filter(|s| s.enabled)
            .map(|source| {
                let pool = Arc::clone(&pool);
                let http = http.clone();
                let cancel = cancel.clone();
                tokio::spawn(run_source(source, pool, http, cancel))
            })
            .collect();
        Self { tasks }
    }

    /// Wait for every source task to observe cancellation and finish.
    pub async fn quiesce(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn run_source(
    source: SourceDescriptor,
    pool: Arc<Mutex<Pool>>,
    http: reqwest::Client,
    cancel: CancellationToken,
) {
    let mut consecutive_failures: u32 = 0;

    if !source.init_delay.is_zero() {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(source.init_delay) => {}
        }
    }

    loop {
        let fetched = tokio::select! {
            () = cancel.cancelled() => return,
            result = source.fetch(&http) => result,
        };

        match fetched {
            Ok(raw) if raw.len() < source.min_size.unwrap_or(0) => {
                // Time-keyed URLs often serve short error pages; those
                // carry no credit.
                warn!(
                    source = %source.name,
                    got = raw.len(),
                    min = source.min_size.unwrap_or(0),
                    "blob below minimum size, dropped"
                );
                consecutive_failures += 1;
                counter!("egd_fetch_fail_total", "source" => source.name.clone()).increment(1);
            }
            Ok(raw) => {
                consecutive_failures = 0;
                counter!("egd_fetch_ok_total", "source" => source.name.clone()).increment(1);
                ingest(&source, raw, &pool).await;
            }
            Err(err) => {
                consecutive_failures += 1;
                warn!(
                    source = %source.name,
                    error = %err,
                    consecutive_failures,
                    "fetch failed"
                );
                counter!("egd_fetch_fail_total", "source" => source.name.clone()).increment(1);
            }
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(jittered(source.interval)) => {}
        }
    }
}

/// Condition a fetched blob off the async threads and append the result.
async fn ingest(source: &SourceDescriptor, raw: Vec<u8>, pool: &Arc<Mutex<Pool>>) {
    let raw_len = raw.len();
    let compress = source.compress;
    let scale = source.scale;
    let conditioned =
        match tokio::task::spawn_blocking(move || condition(&raw, compress, scale)).await {
            Ok(out) => out,
            Err(err) => {
                // Conditioning blowing up is a bug in the primitive, not
                // in the source; drop the blob and keep the daemon alive.
                warn!(source = %source.name, error = %err, "conditioning failed, blob dropped");
                return;
            }
        };
    if conditioned.bytes.is_empty() {
        return;
    }

    let stats = {
        let mut pool = pool.lock().unwrap();
        pool.append(&conditioned.bytes, conditioned.entropy_bits);
        pool.stats()
    };
    gauge!("egd_pool_bytes").set(stats.total_bytes as f64);
    gauge!("egd_pool_bits").set(stats.total_bits as f64);
    debug!(
        source = %source.name,
        raw_bytes = raw_len,
        conditioned_bytes = conditioned.bytes.len(),
        credited_bits = conditioned.entropy_bits,
        pool_bytes = stats.total_bytes,
        "appended conditioned blob"
    );
}

/// Interval with ±10% uniform jitter, so fleets of daemons do not align
/// their fetches against the same remote endpoints.
fn jittered(interval: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.90..=1.10);
    interval.mul_f64(factor)
}
