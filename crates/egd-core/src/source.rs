//! Entropy source descriptors and their fetch methods.
//!
//! A [`SourceDescriptor`] is immutable after construction: it names the
//! source, carries its cadence, and holds exactly one [`Fetcher`] variant
//! that knows how to obtain a raw blob on demand. All failure modes are
//! *soft*: the scheduler logs them, credits zero entropy for the cycle,
//! and reschedules — a misbehaving source can never take the daemon down.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;

/// Connect + read timeout applied to network and subprocess fetches.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Computes the URL for an [`Fetcher::HttpDynamic`] source at fetch time
/// (e.g. a time-templated URL). An empty string means "nothing to fetch
/// this cycle".
pub type UrlProvider = Arc<dyn Fn() -> String + Send + Sync>;

/// In-process producer for a [`Fetcher::Callback`] source.
pub type Producer = Arc<dyn Fn() -> Result<Vec<u8>, String> + Send + Sync>;

/// Soft fetch failure. None of these terminate the daemon.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("dynamic url provider returned an empty url")]
    EmptyUrl,

    #[error("command argv is empty")]
    EmptyArgv,

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command exited with status {status:?}")]
    CommandFailed { status: Option<i32> },

    #[error("fetch timed out")]
    Timeout,

    #[error("producer failed: {0}")]
    Producer(String),
}

/// How a source obtains its raw bytes; exactly one tag per source.
#[derive(Clone)]
pub enum Fetcher {
    /// HTTP GET to a fixed URL.
    Http { url: String },
    /// HTTP GET to a URL computed at fetch time.
    HttpDynamic { provider: UrlProvider },
    /// Binary read of a local path (device files included).
    File { path: PathBuf },
    /// Spawn `argv` without shell interpretation; stdout is the blob.
    Command { argv: Vec<String> },
    /// Arbitrary in-process producer.
    Callback { producer: Producer },
}

impl fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http { url } => f.debug_struct("Http").field("url", url).finish(),
            Self::HttpDynamic { .. } => f.write_str("HttpDynamic"),
            Self::File { path } => f.debug_struct("File").field("path", path).finish(),
            Self::Command { argv } => f.debug_struct("Command").field("argv", argv).finish(),
            Self::Callback { .. } => f.write_str("Callback"),
        }
    }
}

/// One entropy producer. Immutable after construction; per-source runtime
/// state (next fire time, failure streak) lives in the scheduler.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    /// Unique among enabled sources.
    pub name: String,
    /// Whether the scheduler drives this source at all.
    pub enabled: bool,
    /// Minimum spacing between two fetches.
    pub interval: Duration,
    /// Delay before the first fetch.
    pub init_delay: Duration,
    pub fetcher: Fetcher,
    /// URL fetched and discarded before the real fetch, for sites that
    /// require a prior visit.
    pub prefetch_url: Option<String>,
    /// Read at most this many bytes (HTTP and File fetchers).
    pub size_hint: Option<usize>,
    /// Blobs shorter than this are dropped by the scheduler with zero
    /// entropy credit.
    pub min_size: Option<usize>,
    /// Run the compression stage of the conditioner.
    pub compress: bool,
    /// Operator derating of the entropy estimate, in [0, 1].
    pub scale: f64,
}

impl SourceDescriptor {
    pub fn new(name: impl Into<String>, interval: Duration, fetcher: Fetcher) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            interval,
            init_delay: Duration::ZERO,
            fetcher,
            prefetch_url: None,
            size_hint: None,
            min_size: None,
            compress: true,
            scale: 1.0,
        }
    }

    /// Obtain one raw blob. See [`Fetcher`] for the per-variant semantics.
    pub async fn fetch(&self, http: &reqwest::Client) -> Result<Vec<u8>, FetchError> {
        if let Some(url) = &self.prefetch_url {
            // Warm-up visit; its result is irrelevant beyond the side
            // effect on the remote end.
            match http.get(url).send().await {
                Ok(resp) => {
                    let _ = resp.bytes().await;
                }
                Err(err) => {
                    tracing::debug!(source = %self.name, error = %err, "prefetch failed");
                }
            }
        }

        match &self.fetcher {
            Fetcher::Http { url } => self.http_get(http, url).await,
            Fetcher::HttpDynamic { provider } => {
                let url = provider();
                if url.is_empty() {
                    return Err(FetchError::EmptyUrl);
                }
                self.http_get(http, &url).await
            }
            Fetcher::File { path } => self.read_file(path).await,
            Fetcher::Command { argv } => run_command(argv).await,
            Fetcher::Callback { producer } => producer().map_err(FetchError::Producer),
        }
    }

    async fn http_get(&self, http: &reqwest::Client, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut resp = http.get(url).send().await?.error_for_status()?;
        match self.size_hint {
            None => Ok(resp.bytes().await?.to_vec()),
            Some(hint) => {
                // Stream until the hint is met, then hang up.
                let mut buf = Vec::with_capacity(hint.min(1 << 20));
                while let Some(chunk) = resp.chunk().await? {
                    buf.extend_from_slice(&chunk);
                    if buf.len() >= hint {
                        buf.truncate(hint);
                        break;
                    }
                }
                Ok(buf)
            }
        }
    }

    async fn read_file(&self, path: &std::path::Path) -> Result<Vec<u8>, FetchError> {
        let file = tokio::fs::File::open(path).await?;
        let cap = self.size_hint.map_or(u64::MAX, |h| h as u64);
        let mut buf = Vec::new();
        file.take(cap).read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

/// Spawn `argv` with a piped stdout and the fixed timeout; non-zero exit
/// and timeout are both soft failures. Stderr is discarded.
async fn run_command(argv: &[String]) -> Result<Vec<u8>, FetchError> {
    let (program, args) = argv.split_first().ok_or(FetchError::EmptyArgv)?;
    let child = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::time::timeout(FETCH_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| FetchError::Timeout)??;
    if !output.status.success() {
        return Err(FetchError::CommandFailed {
            status: output.status.code(),
        });
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> reqwest::Client {
        reqwest::Client::new()
    }

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    // -----------------------------------------------------------------------
    // File fetcher
    // -----------------------------------------------------------------------

    #[test]
    fn file_fetch_reads_whole_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("blob.bin");
        std::fs::write(&path, [7u8; 100]).unwrap();

        let src = SourceDescriptor::new(
            "f",
            Duration::from_secs(60),
            Fetcher::File { path },
        );
        let bytes = rt().block_on(src.fetch(&client())).unwrap();
        assert_eq!(bytes, vec![7u8; 100]);
    }

    #[test]
    fn file_fetch_honours_size_hint() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("blob.bin");
        std::fs::write(&path, [9u8; 100]).unwrap();

        let mut src = SourceDescriptor::new(
            "f",
            Duration::from_secs(60),
            Fetcher::File { path },
        );
        src.size_hint = Some(32);
        let bytes = rt().block_on(src.fetch(&client())).unwrap();
        assert_eq!(bytes.len(), 32);
    }

    #[test]
    fn file_fetch_missing_path_is_soft() {
        let src = SourceDescriptor::new(
            "f",
            Duration::from_secs(60),
            Fetcher::File {
                path: PathBuf::from("/nonexistent/egd-test-blob"),
            },
        );
        assert!(matches!(
            rt().block_on(src.fetch(&client())),
            Err(FetchError::Io(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Command fetcher
    // -----------------------------------------------------------------------

    #[test]
    fn command_fetch_captures_stdout() {
        let src = SourceDescriptor::new(
            "c",
            Duration::from_secs(60),
            Fetcher::Command {
                argv: vec!["echo".into(), "noise".into()],
            },
        );
        let bytes = rt().block_on(src.fetch(&client())).unwrap();
        assert_eq!(bytes, b"noise\n");
    }

    #[test]
    fn command_nonzero_exit_is_soft_failure() {
        let src = SourceDescriptor::new(
            "c",
            Duration::from_secs(60),
            Fetcher::Command {
                argv: vec!["false".into()],
            },
        );
        assert!(matches!(
            rt().block_on(src.fetch(&client())),
            Err(FetchError::CommandFailed { status: Some(1) })
        ));
    }

    #[test]
    fn command_empty_argv_rejected() {
        let src = SourceDescriptor::new(
            "c",
            Duration::from_secs(60),
            Fetcher::Command { argv: vec![] },
        );
        assert!(matches!(
            rt().block_on(src.fetch(&client())),
            Err(FetchError::EmptyArgv)
        ));
    }

    // -----------------------------------------------------------------------
    // Callback and dynamic-URL fetchers
    // -----------------------------------------------------------------------

    #[test]
    fn callback_produces_bytes() {
        let src = SourceDescriptor::new(
            "cb",
            Duration::from_secs(60),
            Fetcher::Callback {
                producer: Arc::new(|| Ok(vec![1, 2, 3])),
            },
        );
        assert_eq!(rt().block_on(src.fetch(&client())).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn callback_error_is_soft() {
        let src = SourceDescriptor::new(
            "cb",
            Duration::from_secs(60),
            Fetcher::Callback {
                producer: Arc::new(|| Err("sensor offline".into())),
            },
        );
        match rt().block_on(src.fetch(&client())) {
            Err(FetchError::Producer(msg)) => assert_eq!(msg, "sensor offline"),
            other => panic!("expected producer error, got {other:?}"),
        }
    }

    #[test]
    fn dynamic_url_empty_string_is_soft_failure() {
        let src = SourceDescriptor::new(
            "dyn",
            Duration::from_secs(60),
            Fetcher::HttpDynamic {
                provider: Arc::new(String::new),
            },
        );
        assert!(matches!(
            rt().block_on(src.fetch(&client())),
            Err(FetchError::EmptyUrl)
        ));
    }

    #[test]
    fn descriptor_defaults() {
        let src = SourceDescriptor::new(
            "d",
            Duration::from_secs(300),
            Fetcher::Http {
                url: "http://127.0.0.1:1/".into(),
            },
        );
        assert!(src.enabled);
        assert!(src.compress);
        assert_eq!(src.scale, 1.0);
        assert_eq!(src.init_delay, Duration::ZERO);
        assert!(src.min_size.is_none());
    }
}
