//! Durable snapshot storage and the single-instance lock.
//!
//! Writes go through the temp-file + fsync + rename protocol so a crash at
//! any point leaves either the old complete snapshot or the new complete
//! snapshot on disk, never a torn one. Reads are bounded: the file size is
//! checked against a cap before any allocation.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// Persistence failure. Write-side errors are retried at the next persist
/// tick; load-side errors mean "start empty".
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("I/O error during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot file of {size} bytes exceeds the {max} byte bound")]
    TooLarge { size: u64, max: u64 },

    #[error("another instance holds the lock at {}", path.display())]
    AlreadyLocked { path: PathBuf },
}

impl PersistError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Owns the snapshot path and knows how to read and replace it atomically.
#[derive(Debug, Clone)]
pub struct Persister {
    path: PathBuf,
}

impl Persister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `blob` to the snapshot path atomically: temp file in the same
    /// directory, flush, fsync, rename, fsync the directory entry.
    pub fn persist(&self, blob: &[u8]) -> Result<(), PersistError> {
        let dir = parent_dir(&self.path);
        fs::create_dir_all(dir).map_err(|e| PersistError::io("create snapshot directory", e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| PersistError::io("create temp snapshot", e))?;
        tmp.write_all(blob)
            .map_err(|e| PersistError::io("write temp snapshot", e))?;
        tmp.flush()
            .map_err(|e| PersistError::io("flush temp snapshot", e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| PersistError::io("fsync temp snapshot", e))?;
        tmp.persist(&self.path)
            .map_err(|e| PersistError::io("rename snapshot into place", e.error))?;

        // Make the rename itself durable.
        let dir_file =
            File::open(dir).map_err(|e| PersistError::io("open snapshot directory", e))?;
        dir_file
            .sync_all()
            .map_err(|e| PersistError::io("fsync snapshot directory", e))?;
        Ok(())
    }

    /// Read the snapshot blob, or `None` when no snapshot exists yet.
    ///
    /// `max_size` bounds the read; a larger file is rejected rather than
    /// loaded, since no legitimate snapshot can outgrow the pool cap by
    /// much.
    pub fn load(&self, max_size: u64) -> Result<Option<Vec<u8>>, PersistError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistError::io("open snapshot", e)),
        };
        let size = file
            .metadata()
            .map_err(|e| PersistError::io("stat snapshot", e))?
            .len();
        if size > max_size {
            return Err(PersistError::TooLarge {
                size,
                max: max_size,
            });
        }

        let mut buf = Vec::with_capacity(size as usize);
        file.take(max_size.saturating_add(1))
            .read_to_end(&mut buf)
            .map_err(|e| PersistError::io("read snapshot", e))?;
        // The file may have grown between stat and read; `take` caps us,
        // and anything over the bound is rejected here.
        if buf.len() as u64 > max_size {
            return Err(PersistError::TooLarge {
                size: buf.len() as u64,
                max: max_size,
            });
        }
        Ok(Some(buf))
    }
}

/// Exclusive-instance marker next to the snapshot file.
///
/// Holds an OS advisory lock on `<snapshot>.lock` with this process id
/// written into it, so two daemons cannot interleave snapshot writes. The
/// lock is released on drop; the marker file is removed best-effort.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock for the given snapshot path, failing immediately
    /// when another live process holds it.
    pub fn acquire(persist_file: &Path) -> Result<Self, PersistError> {
        let path = lock_path(persist_file);
        let dir = parent_dir(&path);
        fs::create_dir_all(dir).map_err(|e| PersistError::io("create lock directory", e))?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| PersistError::io("open lock file", e))?;
        if file.try_lock_exclusive().is_err() {
            return Err(PersistError::AlreadyLocked { path });
        }
        file.set_len(0)
            .map_err(|e| PersistError::io("truncate lock file", e))?;
        writeln!(file, "{}", std::process::id())
            .map_err(|e| PersistError::io("write pid to lock file", e))?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_path(persist_file: &Path) -> PathBuf {
    let mut os = persist_file.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

/// Parent directory of a path, treating a bare filename as the cwd.
fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}
