//! Shared test infrastructure for engine integration tests
//!
//! Provides a scripted in-memory backend, deterministic data generators,
//! and a ready-to-run upload fixture (source file + working directory).

#![allow(dead_code)]

use async_trait::async_trait;
use coldhaul::backend::{Backend, BackendError, Limits, PartSource};
use coldhaul::engine::UploadOptions;
use coldhaul::session::FileDescriptor;
use coldhaul::store::StateStore;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::path::PathBuf;
use tempfile::TempDir;

/// Deterministic pseudo-random bytes; same seed, same file, every run.
pub fn generate_binary(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    data
}

/// SHA-1 of one part range, the hash the mock backend would return for it.
pub fn part_sha1(data: &[u8], start: u64, end: u64) -> Vec<u8> {
    Sha1::digest(&data[start as usize..=end as usize])
        .to_vec()
}

/// Everything a mock backend saw during a run.
#[derive(Default)]
pub struct Calls {
    pub initiated: u32,
    /// Part indices in completion order.
    pub uploaded: Vec<u64>,
    /// Hash vectors handed to `complete`, one entry per call.
    pub completed: Vec<Vec<Vec<u8>>>,
    pub completed_sizes: Vec<u64>,
}

/// Scripted in-memory backend. Hashes parts with SHA-1 over the real byte
/// range (exercising the part-stream factory) and can fail the first N
/// attempts of chosen parts with a 503.
pub struct MockBackend {
    pub limits: Limits,
    pub part_size: u64,
    pub calls: Mutex<Calls>,
    failures: Mutex<HashMap<u64, u32>>,
}

impl MockBackend {
    pub fn new(part_size: u64) -> Self {
        Self {
            limits: Limits {
                min_parts: 1,
                max_parts: 10_000,
                min_part_size: 1,
                max_part_size: u64::MAX,
            },
            part_size,
            calls: Mutex::new(Calls::default()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_limits(part_size: u64, limits: Limits) -> Self {
        Self {
            limits,
            ..Self::new(part_size)
        }
    }

    /// Make the first `times` attempts for `index` fail with a 503.
    pub fn fail_first(&self, index: u64, times: u32) {
        self.failures.lock().insert(index, times);
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn limits(&self) -> Limits {
        self.limits
    }

    async fn ideal_part_size(&self, _size: u64) -> Result<u64, BackendError> {
        Ok(self.part_size)
    }

    async fn initiate(&self, _name: &str, _part_size: u64) -> Result<String, BackendError> {
        let mut calls = self.calls.lock();
        calls.initiated += 1;
        Ok(format!("mock-upload-{}", calls.initiated))
    }

    async fn upload_part(
        &self,
        _upload_id: &str,
        source: &PartSource,
    ) -> Result<Vec<u8>, BackendError> {
        let index = source.part().index;
        {
            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(&index) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BackendError::BadStatus {
                        status: 503,
                        body: "scripted outage".to_string(),
                    });
                }
            }
        }

        let hash = source.sha1().await?.to_vec();
        self.calls.lock().uploaded.push(index);
        Ok(hash)
    }

    async fn complete(
        &self,
        _upload_id: &str,
        size: u64,
        part_hashes: &[Vec<u8>],
    ) -> Result<(), BackendError> {
        let mut calls = self.calls.lock();
        calls.completed.push(part_hashes.to_vec());
        calls.completed_sizes.push(size);
        Ok(())
    }
}

/// A source file plus working directory, ready for `engine::run`.
pub struct Fixture {
    pub dir: TempDir,
    pub data: Vec<u8>,
    pub file_path: PathBuf,
    pub store: StateStore,
}

impl Fixture {
    pub async fn new(seed: u64, len: usize) -> Self {
        let dir = TempDir::new().expect("create tempdir");
        let data = generate_binary(seed, len);
        let file_path = dir.path().join("source.bin");
        tokio::fs::write(&file_path, &data).await.expect("write source");

        let work = dir.path().join("work");
        tokio::fs::create_dir(&work).await.expect("create work dir");

        Self {
            store: StateStore::new(&work),
            dir,
            data,
            file_path,
        }
    }

    pub async fn descriptor(&self) -> FileDescriptor {
        FileDescriptor::probe(&self.file_path)
            .await
            .expect("probe source file")
    }

    /// Expected SHA-1 for part `index` at the given part size.
    pub fn expected_hash(&self, index: u64, part_size: u64) -> Vec<u8> {
        let start = index * part_size;
        let end = ((index + 1) * part_size - 1).min(self.data.len() as u64 - 1);
        part_sha1(&self.data, start, end)
    }
}

/// Default engine options for tests: modest concurrency, no bar.
pub fn test_options() -> UploadOptions {
    UploadOptions {
        concurrency: 2,
        force: false,
        quiet: true,
    }
}
