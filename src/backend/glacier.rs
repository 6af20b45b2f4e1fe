//! AWS S3 Glacier backend.
//!
//! Speaks the Glacier multipart REST API directly: initiate returns an
//! upload id, each part is PUT with its tree and linear SHA-256 digests,
//! and completion sends the composed root tree hash plus the archive size.
//! Requests are signed with SigV4 using the linear digest as the payload
//! hash.

use super::sigv4::{Credentials, Signer};
use super::{Backend, BackendError, Limits, PartSource};
use crate::hash;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_LENGTH;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

/// Protocol version header required on every Glacier call.
const GLACIER_API_VERSION: &str = "2012-06-01";

/// Glacier multipart geometry: parts are 1 MiB to 4 GiB, at most 10 000 per
/// archive, and the tree-hash scheme needs power-of-two part sizes.
const LIMITS: Limits = Limits {
    min_parts: 1,
    max_parts: 10_000,
    min_part_size: 1024 * 1024,
    max_part_size: 4 * 1024 * 1024 * 1024,
};

/// Configuration for the Glacier backend.
#[derive(Debug, Clone)]
pub struct GlacierOptions {
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub vault: String,
}

/// Glacier backend state: HTTP client plus signing material.
#[derive(Debug)]
pub struct GlacierBackend {
    http: reqwest::Client,
    signer: Signer,
    host: String,
    vault: String,
}

impl GlacierBackend {
    pub fn new(options: GlacierOptions) -> Result<Self, BackendError> {
        if options.access_key.is_empty() || options.secret_key.is_empty() {
            return Err(BackendError::Credentials(
                "AWS access key and secret are required (flags or AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY)"
                    .to_string(),
            ));
        }

        let host = format!("glacier.{}.amazonaws.com", options.region);
        let signer = Signer::new(
            Credentials {
                access_key: options.access_key,
                secret_key: options.secret_key,
            },
            options.region,
            "glacier",
        );

        Ok(Self {
            http: super::http_client()?,
            signer,
            host,
            vault: options.vault,
        })
    }

    fn uploads_path(&self) -> String {
        format!("/-/vaults/{}/multipart-uploads", self.vault)
    }

    fn upload_path(&self, upload_id: &str) -> String {
        format!("/-/vaults/{}/multipart-uploads/{}", self.vault, upload_id)
    }

    fn url(&self, path: &str) -> String {
        format!("https://{}{}", self.host, path)
    }
}

/// Hex SHA-256 of the empty payload, used for body-less requests.
fn empty_payload_sha256() -> String {
    hex::encode(Sha256::digest(b""))
}

#[async_trait]
impl Backend for GlacierBackend {
    fn name(&self) -> &'static str {
        "aws"
    }

    fn limits(&self) -> Limits {
        LIMITS
    }

    /// Smallest power-of-two part size that fits the archive into the part
    /// budget. The tree hash needs power-of-two parts so leaf boundaries of
    /// the archive-level composition line up.
    async fn ideal_part_size(&self, size: u64) -> Result<u64, BackendError> {
        let ideal = size.div_ceil(LIMITS.max_parts).next_power_of_two();
        Ok(ideal.clamp(LIMITS.min_part_size, LIMITS.max_part_size))
    }

    #[instrument(skip(self))]
    async fn initiate(&self, name: &str, part_size: u64) -> Result<String, BackendError> {
        let path = self.uploads_path();
        let part_size_str = part_size.to_string();
        let payload = empty_payload_sha256();
        let signature = self.signer.sign(
            "POST",
            &self.host,
            &path,
            &[],
            &[
                ("x-amz-archive-description", name),
                ("x-amz-glacier-version", GLACIER_API_VERSION),
                ("x-amz-part-size", &part_size_str),
            ],
            &payload,
            Utc::now(),
        );

        let response = self
            .http
            .post(self.url(&path))
            .header("x-amz-archive-description", name)
            .header("x-amz-glacier-version", GLACIER_API_VERSION)
            .header("x-amz-part-size", &part_size_str)
            .header("x-amz-content-sha256", &payload)
            .header("x-amz-date", &signature.amz_date)
            .header("Authorization", &signature.authorization)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BackendError::from_response(response).await);
        }

        let upload_id = response
            .headers()
            .get("x-amz-multipart-upload-id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                BackendError::Protocol("initiate response lacks x-amz-multipart-upload-id".into())
            })?
            .to_string();

        debug!(%upload_id, "multipart upload initiated");
        Ok(upload_id)
    }

    #[instrument(skip(self, source), fields(part = source.part().index))]
    async fn upload_part(
        &self,
        upload_id: &str,
        source: &PartSource,
    ) -> Result<Vec<u8>, BackendError> {
        // First pass over the range: both digests, one read.
        let digests = source.digests().await?;
        let tree_hex = hex::encode(digests.tree);
        let linear_hex = hex::encode(digests.linear);

        let part = source.part();
        let content_range = format!("bytes {}-{}/*", part.start, part.end);
        let path = self.upload_path(upload_id);
        let signature = self.signer.sign(
            "PUT",
            &self.host,
            &path,
            &[],
            &[
                ("content-range", &content_range),
                ("x-amz-content-sha256", &linear_hex),
                ("x-amz-glacier-version", GLACIER_API_VERSION),
                ("x-amz-sha256-tree-hash", &tree_hex),
            ],
            &linear_hex,
            Utc::now(),
        );

        // Second pass: the request body streams the range again. The
        // explicit Content-Length keeps hyper from chunking, which Glacier
        // rejects.
        let response = self
            .http
            .put(self.url(&path))
            .header("Content-Range", &content_range)
            .header(CONTENT_LENGTH, source.len())
            .header("x-amz-content-sha256", &linear_hex)
            .header("x-amz-glacier-version", GLACIER_API_VERSION)
            .header("x-amz-sha256-tree-hash", &tree_hex)
            .header("x-amz-date", &signature.amz_date)
            .header("Authorization", &signature.authorization)
            .body(source.body().await?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BackendError::from_response(response).await);
        }

        // The service echoes the tree hash it computed over what it
        // received; a mismatch means the bytes were corrupted in flight.
        let echoed = response
            .headers()
            .get("x-amz-sha256-tree-hash")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !echoed.eq_ignore_ascii_case(&tree_hex) {
            return Err(BackendError::ChecksumMismatch {
                sent: tree_hex,
                echoed,
            });
        }

        Ok(digests.tree.to_vec())
    }

    #[instrument(skip(self, part_hashes))]
    async fn complete(
        &self,
        upload_id: &str,
        size: u64,
        part_hashes: &[Vec<u8>],
    ) -> Result<(), BackendError> {
        let trees = part_hashes
            .iter()
            .map(|h| {
                <[u8; 32]>::try_from(h.as_slice()).map_err(|_| {
                    BackendError::Protocol(format!(
                        "stored part hash has {} bytes, expected 32",
                        h.len()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let root_hex = hex::encode(hash::compose(&trees));
        let size_str = size.to_string();

        let path = self.upload_path(upload_id);
        let payload = empty_payload_sha256();
        let signature = self.signer.sign(
            "POST",
            &self.host,
            &path,
            &[],
            &[
                ("x-amz-archive-size", &size_str),
                ("x-amz-glacier-version", GLACIER_API_VERSION),
                ("x-amz-sha256-tree-hash", &root_hex),
            ],
            &payload,
            Utc::now(),
        );

        let response = self
            .http
            .post(self.url(&path))
            .header("x-amz-archive-size", &size_str)
            .header("x-amz-glacier-version", GLACIER_API_VERSION)
            .header("x-amz-sha256-tree-hash", &root_hex)
            .header("x-amz-content-sha256", &payload)
            .header("x-amz-date", &signature.amz_date)
            .header("Authorization", &signature.authorization)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BackendError::from_response(response).await);
        }

        debug!(upload_id, archive_size = size, "multipart upload completed");
        Ok(())
    }
}
