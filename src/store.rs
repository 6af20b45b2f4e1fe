//! Durable key→bytes store in the working directory.
//!
//! Everything the engine needs to survive a restart lives here as plain
//! files: the session document (`session`, JSON) and one raw-bytes hash
//! blob per completed part (`state_<n>.parthash`). Absent is a normal
//! answer and is distinguished from every other I/O failure; a session
//! file that exists but does not parse is its own error, never "absent".

use crate::session::Session;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

/// Well-known key of the session document inside the working directory.
const SESSION_KEY: &str = "session";

/// Errors from working-directory reads and writes.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("session document is malformed: {0}")]
    MalformedSession(#[from] serde_json::Error),
}

/// File-backed store rooted at the working directory. The directory is
/// assumed to be exclusive to one upload; concurrent runs against it are
/// undefined.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Key under which part `index`'s hash is stored.
    pub fn part_hash_key(index: u64) -> String {
        format!("state_{}.parthash", index)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Read a key. `Ok(None)` iff the underlying file does not exist; any
    /// other I/O error surfaces.
    pub async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io {
                key: key.to_string(),
                source: e,
            }),
        }
    }

    /// Overwrite a key. Writes go through a temp file, fsync, and rename so
    /// a crash never leaves a torn value behind.
    pub async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let data = bytes.to_vec();
        let result = tokio::task::spawn_blocking(move || atomic_write(&path, &data))
            .await
            .map_err(|e| io::Error::other(format!("spawn_blocking join failed: {}", e)));

        match result {
            Ok(Ok(())) => {
                debug!(key, bytes = bytes.len(), "stored");
                Ok(())
            }
            Ok(Err(e)) | Err(e) => Err(StoreError::Io {
                key: key.to_string(),
                source: e,
            }),
        }
    }

    /// Read the session document; absent is distinguished from malformed.
    pub async fn read_session(&self) -> Result<Option<Session>, StoreError> {
        match self.read(SESSION_KEY).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persist the session document. Written once per upload, never
    /// rewritten afterwards.
    pub async fn write_session(&self, session: &Session) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(session)?;
        self.write(SESSION_KEY, &bytes).await
    }

    pub async fn read_part_hash(&self, index: u64) -> Result<Option<Vec<u8>>, StoreError> {
        self.read(&Self::part_hash_key(index)).await
    }

    pub async fn write_part_hash(&self, index: u64, hash: &[u8]) -> Result<(), StoreError> {
        self.write(&Self::part_hash_key(index), hash).await
    }
}

/// Atomically write data to a file using write-to-temp + fsync + rename.
fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::other("cannot atomic-write to a path with no parent")
    })?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
