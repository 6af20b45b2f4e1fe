//! Upload session lifecycle: create, persist, resume, validate.
//!
//! A session binds a backend upload id to the file identity and part
//! geometry it was created for. It is written once as a JSON document in
//! the working directory and is authoritative from then on — in particular
//! the part size never changes on resume, even if the backend would
//! recommend a different one today.

use crate::backend::{parts_needed, Backend, BackendError};
use crate::store::{StateStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// The resumable handle, serialised as the `session` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub upload_id: String,
    pub file_path: String,
    pub file_last_changed: String,
    pub part_size: u64,
    pub parts_needed: u64,
}

/// The upload target, probed once at startup and immutable afterwards.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub size: u64,
    /// RFC 3339 mtime; the file-identity fingerprint stored in the session.
    pub last_modified: String,
}

impl FileDescriptor {
    pub async fn probe(path: &Path) -> io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        let mtime: DateTime<Utc> = metadata.modified()?.into();
        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            last_modified: mtime.to_rfc3339(),
        })
    }

    /// The name the backend files the archive under.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }
}

/// Errors while establishing or resuming a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(
        "session belongs to {stored}, not {actual}; point --work at a fresh directory or --file at the original path"
    )]
    PathMismatch { stored: String, actual: String },

    #[error(
        "file has changed since the session was created (was {stored}, now {actual}); rerun with --force to resume anyway"
    )]
    FileChanged { stored: String, actual: String },

    #[error(
        "file too small for {service}: it must split into at least {min_parts} parts of at least {min_part_size} bytes"
    )]
    FileTooSmall {
        service: &'static str,
        min_parts: u64,
        min_part_size: u64,
    },

    #[error("file too big for {service}: {needed} parts of {part_size} bytes exceeds the limit of {max_parts}")]
    FileTooBig {
        service: &'static str,
        needed: u64,
        part_size: u64,
        max_parts: u64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Loaded per-part hashes; `None` marks a part that still needs uploading.
pub type PartHashes = Vec<Option<Vec<u8>>>;

/// Resume the stored session if one exists, otherwise derive geometry,
/// initiate the upload with the backend, and persist a new session.
pub async fn resume_or_create(
    store: &StateStore,
    backend: &dyn Backend,
    file: &FileDescriptor,
    force: bool,
) -> Result<Session, SessionError> {
    if let Some(session) = store.read_session().await? {
        validate_resume(&session, file, force)?;
        info!(
            upload_id = %session.upload_id,
            parts = session.parts_needed,
            "resuming existing session"
        );
        return Ok(session);
    }

    let limits = backend.limits();
    let part_size = backend
        .ideal_part_size(file.size)
        .await?
        .clamp(limits.min_part_size, limits.max_part_size);
    let needed = parts_needed(file.size, part_size);

    if needed < limits.min_parts {
        return Err(SessionError::FileTooSmall {
            service: backend.name(),
            min_parts: limits.min_parts,
            min_part_size: limits.min_part_size,
        });
    }
    if needed > limits.max_parts {
        return Err(SessionError::FileTooBig {
            service: backend.name(),
            needed,
            part_size,
            max_parts: limits.max_parts,
        });
    }

    let upload_id = backend.initiate(&file.name(), part_size).await?;
    let session = Session {
        upload_id,
        file_path: file.path.to_string_lossy().into_owned(),
        file_last_changed: file.last_modified.clone(),
        part_size,
        parts_needed: needed,
    };
    store.write_session(&session).await?;

    info!(
        upload_id = %session.upload_id,
        part_size,
        parts = needed,
        "created new session"
    );
    Ok(session)
}

/// A resumed session must describe the same file, byte for byte. `force`
/// overrides the mtime check on the user's authority; the path check always
/// holds.
fn validate_resume(
    session: &Session,
    file: &FileDescriptor,
    force: bool,
) -> Result<(), SessionError> {
    let actual_path = file.path.to_string_lossy();
    if session.file_path != actual_path {
        return Err(SessionError::PathMismatch {
            stored: session.file_path.clone(),
            actual: actual_path.into_owned(),
        });
    }
    if session.file_last_changed != file.last_modified {
        if !force {
            return Err(SessionError::FileChanged {
                stored: session.file_last_changed.clone(),
                actual: file.last_modified.clone(),
            });
        }
        debug!("file mtime changed but --force is set, resuming anyway");
    }
    Ok(())
}

/// Load the per-part hash vector from the store. The count of `Some`
/// entries is how many parts are already durable on the service.
pub async fn load_part_hashes(
    store: &StateStore,
    session: &Session,
) -> Result<PartHashes, StoreError> {
    let mut hashes = Vec::with_capacity(session.parts_needed as usize);
    for index in 0..session.parts_needed {
        hashes.push(store.read_part_hash(index).await?);
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session {
            upload_id: "up-9".to_string(),
            file_path: "/data/big.bin".to_string(),
            file_last_changed: "2026-06-01T00:00:00+00:00".to_string(),
            part_size: 8,
            parts_needed: 4,
        }
    }

    fn descriptor(path: &str, mtime: &str) -> FileDescriptor {
        FileDescriptor {
            path: PathBuf::from(path),
            size: 32,
            last_modified: mtime.to_string(),
        }
    }

    #[test]
    fn test_validate_resume_matches() {
        let file = descriptor("/data/big.bin", "2026-06-01T00:00:00+00:00");
        assert!(validate_resume(&session(), &file, false).is_ok());
    }

    #[test]
    fn test_validate_resume_rejects_changed_mtime() {
        let file = descriptor("/data/big.bin", "2026-07-01T00:00:00+00:00");
        assert!(matches!(
            validate_resume(&session(), &file, false),
            Err(SessionError::FileChanged { .. })
        ));
    }

    #[test]
    fn test_validate_resume_force_overrides_mtime() {
        let file = descriptor("/data/big.bin", "2026-07-01T00:00:00+00:00");
        assert!(validate_resume(&session(), &file, true).is_ok());
    }

    #[test]
    fn test_validate_resume_path_mismatch_beats_force() {
        let file = descriptor("/elsewhere/big.bin", "2026-06-01T00:00:00+00:00");
        assert!(matches!(
            validate_resume(&session(), &file, true),
            Err(SessionError::PathMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_part_hashes_marks_pending_as_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        store.write_part_hash(0, &[1; 20]).await.unwrap();
        store.write_part_hash(2, &[3; 20]).await.unwrap();

        let hashes = load_part_hashes(&store, &session()).await.unwrap();
        assert_eq!(hashes.len(), 4);
        assert!(hashes[0].is_some());
        assert!(hashes[1].is_none());
        assert!(hashes[2].is_some());
        assert!(hashes[3].is_none());
    }

    #[tokio::test]
    async fn test_probe_reports_rfc3339_mtime() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        tmp.write_all(b"0123456789").unwrap();

        let file = FileDescriptor::probe(tmp.path()).await.unwrap();
        assert_eq!(file.size, 10);
        // RFC 3339 parses back.
        assert!(DateTime::parse_from_rfc3339(&file.last_modified).is_ok());
    }
}
