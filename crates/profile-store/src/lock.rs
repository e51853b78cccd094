//! Advisory file lock scoped to the store file
//!
//! Serializes read-modify-write cycles across tasks and processes. The
//! lock lives in a sibling `.lock` file next to the store; acquisition
//! polls `try_lock_exclusive` instead of blocking in the kernel so a
//! cancellation signal fires promptly. The lock releases on drop, which
//! covers every exit path including panics and cancellation.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Held exclusive lock on a store's `.lock` file.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Acquire the exclusive lock guarding the store at `store_path`.
    ///
    /// Contention is handled by polling every 50 ms, racing each wait
    /// against `cancel`.
    pub async fn acquire(store_path: &Path, cancel: &CancellationToken) -> Result<Self> {
        let path = lock_path(store_path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::Io(format!("opening lock file {}: {e}", path.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = file.set_permissions(std::fs::Permissions::from_mode(0o600));
        }

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Aborted);
            }
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file, path }),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Aborted),
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                }
                Err(e) => {
                    return Err(Error::Io(format!("locking {}: {e}", path.display())));
                }
            }
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release store lock");
        }
    }
}

/// `<store>.json` -> `<store>.json.lock`, always in the store's directory.
pub(crate) fn lock_path(store_path: &Path) -> PathBuf {
    let mut os = store_path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}
