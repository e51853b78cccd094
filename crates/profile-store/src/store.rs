//! Persistent auth profile store
//!
//! Manages the JSON document mapping profile identifiers to credentials
//! and usage stats. The file on disk is the single source of truth; the
//! in-memory copy is a hint that may go stale under concurrent writers.
//! All mutations go through `update`, which re-reads the file under an
//! exclusive lock before applying the change, and every write is atomic
//! (temp file + fsync + rename) to prevent corruption on crash.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::lock::StoreLock;
use crate::schema::{AuthProfileStore, STORE_VERSION};

/// Handle on the persisted store file.
///
/// The tokio Mutex guards the in-memory copy only; cross-task and
/// cross-process serialization of writes is the file lock's job.
#[derive(Debug)]
pub struct ProfileStore {
    path: PathBuf,
    state: Mutex<AuthProfileStore>,
    cancel: CancellationToken,
}

impl ProfileStore {
    /// Load the store from the given file path.
    ///
    /// If the file doesn't exist, creates it as an empty `version == 1`
    /// document (cold start with zero profiles).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let store = read_store(&path).await?;
            info!(
                path = %path.display(),
                profiles = store.profiles.len(),
                "loaded profile store"
            );
            store
        } else {
            info!(path = %path.display(), "profile store not found, starting empty");
            let store = AuthProfileStore::default();
            write_atomic(&path, &store).await?;
            store
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
            cancel: CancellationToken::new(),
        })
    }

    /// Replace the cancellation token consulted while waiting for the
    /// store lock.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Clone of the in-memory state. May be stale relative to disk; treat
    /// it as a hint, not authoritative.
    pub async fn snapshot(&self) -> AuthProfileStore {
        self.state.lock().await.clone()
    }

    /// Read-modify-write under the store lock.
    ///
    /// Re-reads the file while holding the lock (the in-memory copy may be
    /// stale), applies `updater`, and persists atomically when it returns
    /// true. On a write the in-memory copy is refreshed from the
    /// post-update document and a snapshot of it is returned; `None` means
    /// the updater declined and nothing was written.
    pub async fn update<F>(&self, updater: F) -> Result<Option<AuthProfileStore>>
    where
        F: FnOnce(&mut AuthProfileStore) -> bool,
    {
        let _lock = StoreLock::acquire(&self.path, &self.cancel).await?;
        let mut fresh = read_store(&self.path).await?;

        if !updater(&mut fresh) {
            return Ok(None);
        }

        write_atomic(&self.path, &fresh).await?;
        let snapshot = fresh.clone();
        *self.state.lock().await = fresh;
        Ok(Some(snapshot))
    }

    /// Fallback write path used only when locking is unavailable: persists
    /// the current in-memory state without re-reading the file. Does not
    /// serialize against concurrent writers.
    pub async fn save(&self) -> Result<()> {
        let state = self.state.lock().await;
        write_atomic(&self.path, &state).await
    }

    /// Mutate only the in-memory copy (no lock, no disk). Returns the
    /// updater's decision so callers know whether a `save` is warranted.
    pub async fn mutate<F>(&self, updater: F) -> bool
    where
        F: FnOnce(&mut AuthProfileStore) -> bool,
    {
        let mut state = self.state.lock().await;
        updater(&mut state)
    }
}

/// Parse and version-check a store document.
pub fn parse_store(contents: &str) -> Result<AuthProfileStore> {
    let store: AuthProfileStore = serde_json::from_str(contents)
        .map_err(|e| Error::Parse(format!("parsing store file: {e}")))?;
    if store.version != STORE_VERSION {
        return Err(Error::Version(store.version));
    }
    Ok(store)
}

async fn read_store(path: &Path) -> Result<AuthProfileStore> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Io(format!("reading store file: {e}")))?;
    parse_store(&contents)
}

/// Write the store to disk atomically.
///
/// Serializes to a temp file in the same directory, fsyncs it, then
/// renames over the target, so the store file always parses even if the
/// process dies mid-write. Permissions are 0600 since the file contains
/// credential material.
async fn write_atomic(path: &Path, store: &AuthProfileStore) -> Result<()> {
    let json = serde_json::to_string_pretty(store)
        .map_err(|e| Error::Parse(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("store path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Io("store path has no file name".into()))?
        .to_string_lossy();
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| Error::Io(format!("creating temp store file: {e}")))?;
    file.write_all(json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Io(format!("syncing temp store file: {e}")))?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted profile store");
    Ok(())
}
