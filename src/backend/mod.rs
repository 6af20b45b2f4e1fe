//! Backend capability definitions.
//!
//! A backend is the narrow interface the upload engine needs from a
//! cold-storage service: its geometry limits, a part-size recommendation,
//! and the initiate / upload-part / complete protocol calls. Two
//! implementations exist (S3 Glacier, Backblaze B2) behind the same
//! object-safe trait.

pub mod b2;
pub mod glacier;
pub mod sigv4;

pub use b2::{B2Backend, B2Options};
pub use glacier::{GlacierBackend, GlacierOptions};

use crate::hash::{self, RangeDigests};
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_util::io::ReaderStream;

/// Errors that can occur during backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Non-2xx HTTP response; carries the status and the raw body.
    #[error("bad status {status}: {body}")]
    BadStatus { status: u16, body: String },

    /// The server echoed a different checksum than we computed; the bytes
    /// were corrupted in flight.
    #[error("part checksum mismatch: sent {sent}, server echoed {echoed}")]
    ChecksumMismatch { sent: String, echoed: String },

    /// Missing or unusable credentials/configuration.
    #[error("credentials: {0}")]
    Credentials(String),

    /// Response arrived but did not carry what the protocol promises.
    #[error("protocol: {0}")]
    Protocol(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl BackendError {
    /// Fatal errors abort the run; everything else is a retryable task
    /// failure fed back into the scheduler.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Credentials(_))
    }

    /// Build a `BadStatus` from a response, consuming the body for context.
    pub async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        BackendError::BadStatus { status, body }
    }
}

/// Hard per-request timeout. Hung transfers surface as task failures the
/// scheduler retries with backoff.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// Shared HTTP client defaults for both backends.
pub(crate) fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(std::time::Duration::from_secs(30))
        .build()
}

/// Geometry limits a backend imposes on multipart uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub min_parts: u64,
    pub max_parts: u64,
    pub min_part_size: u64,
    pub max_part_size: u64,
}

/// One contiguous byte range of the source file, inclusive on both ends to
/// match the range semantics of the backends' wire protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Part {
    pub index: u64,
    pub start: u64,
    pub end: u64,
}

impl Part {
    /// Geometry of part `index` for a file of `file_size` bytes cut into
    /// `part_size` slices. Every part except possibly the last has exactly
    /// `part_size` bytes.
    pub fn nth(index: u64, part_size: u64, file_size: u64) -> Self {
        let start = index * part_size;
        let end = ((index + 1) * part_size - 1).min(file_size - 1);
        Part { index, start, end }
    }

    /// Size in bytes. A part always spans at least one byte.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Number of parts needed to cover `size` bytes at `part_size` per part.
pub fn parts_needed(size: u64, part_size: u64) -> u64 {
    size.div_ceil(part_size)
}

/// Factory for fresh byte streams over one part's range.
///
/// Backends read a range twice — once to checksum it before the request and
/// once as the request body — so they get a factory rather than a stream.
/// Every `open` call yields an independent reader positioned at the start of
/// the range and limited to its length; nothing is buffered.
#[derive(Debug, Clone)]
pub struct PartSource {
    path: PathBuf,
    part: Part,
}

impl PartSource {
    pub fn new(path: PathBuf, part: Part) -> Self {
        Self { path, part }
    }

    pub fn part(&self) -> Part {
        self.part
    }

    pub fn len(&self) -> u64 {
        self.part.len()
    }

    /// Open a fresh reader over exactly this range.
    pub async fn open(&self) -> io::Result<impl AsyncRead + Send + 'static> {
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.part.start)).await?;
        Ok(file.take(self.part.len()))
    }

    /// Open a fresh reader and wrap it as a streaming HTTP request body.
    pub async fn body(&self) -> io::Result<reqwest::Body> {
        let reader = self.open().await?;
        Ok(reqwest::Body::wrap_stream(ReaderStream::with_capacity(
            reader,
            64 * 1024,
        )))
    }

    /// Tree + linear SHA-256 over the range (Glacier).
    pub async fn digests(&self) -> io::Result<RangeDigests> {
        hash::digest_range(&self.path, self.part.start, self.part.end).await
    }

    /// SHA-1 over the range (B2).
    pub async fn sha1(&self) -> io::Result<[u8; 20]> {
        hash::sha1_range(&self.path, self.part.start, self.part.end).await
    }
}

/// Abstract cold-storage backend for resumable multipart uploads.
///
/// This trait is object-safe and is used as `Box<dyn Backend>` by the
/// engine. Construction (authentication included) happens on the concrete
/// types, which act as the opaque state handle.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Human-readable service name for logs and error messages.
    fn name(&self) -> &'static str;

    /// Geometry limits. Constant for Glacier; B2 learns its minimum part
    /// size from the authorize call.
    fn limits(&self) -> Limits;

    /// Recommended part size for a file of `size` bytes, before clamping to
    /// `limits()`. May be non-deterministic (B2 asks the server).
    async fn ideal_part_size(&self, size: u64) -> Result<u64, BackendError>;

    /// Start a multipart upload; returns the backend-opaque upload id.
    async fn initiate(&self, name: &str, part_size: u64) -> Result<String, BackendError>;

    /// Upload one part; returns the backend-specific part hash (32-byte
    /// tree hash for Glacier, 20-byte SHA-1 for B2).
    async fn upload_part(
        &self,
        upload_id: &str,
        source: &PartSource,
    ) -> Result<Vec<u8>, BackendError>;

    /// Finalise the upload from the ordered vector of part hashes.
    async fn complete(
        &self,
        upload_id: &str,
        size: u64,
        part_hashes: &[Vec<u8>],
    ) -> Result<(), BackendError>;
}
