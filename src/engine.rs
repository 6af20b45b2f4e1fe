//! Upload orchestrator.
//!
//! Drives one upload through its lifecycle: resume or create the session,
//! enumerate parts whose hash is not yet durable, push them through the
//! scheduler, and finalise with the composed hash vector once the queue
//! drains. Per-part durability is exact: a hash is persisted only after the
//! backend confirms the part, and finalisation reads hashes strictly in
//! part-index order no matter what order uploads completed in.

use crate::backend::{Backend, BackendError, Part, PartSource};
use crate::progress::Progress;
use crate::scheduler::{Scheduler, TaskError};
use crate::session::{self, FileDescriptor, SessionError};
use crate::store::{StateStore, StoreError};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Fatal engine failures. Transient network/service errors never surface
/// here — the scheduler retries them indefinitely.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("part {index}: freshly uploaded hash differs from the stored one; working directory and service disagree")]
    HashConflict { index: u64 },

    #[error("internal: {0}")]
    Internal(String),
}

/// Knobs the CLI passes down.
#[derive(Debug, Clone, Copy)]
pub struct UploadOptions {
    pub concurrency: usize,
    pub force: bool,
    pub quiet: bool,
}

/// Shared context for part-upload tasks.
struct TaskContext {
    backend: Arc<dyn Backend>,
    store: StateStore,
    file_path: PathBuf,
    file_size: u64,
    part_size: u64,
    upload_id: String,
    hashes: Mutex<Vec<Option<Vec<u8>>>>,
    completed: AtomicU64,
    progress: Progress,
}

/// Run one upload to durable completion.
pub async fn run(
    backend: Arc<dyn Backend>,
    store: StateStore,
    file: FileDescriptor,
    options: UploadOptions,
) -> Result<(), EngineError> {
    let session = session::resume_or_create(&store, backend.as_ref(), &file, options.force).await?;
    let hashes = session::load_part_hashes(&store, &session).await?;

    let already_done = hashes.iter().filter(|h| h.is_some()).count() as u64;
    let missing: Vec<u64> = hashes
        .iter()
        .enumerate()
        .filter(|(_, h)| h.is_none())
        .map(|(index, _)| index as u64)
        .collect();
    info!(
        parts = session.parts_needed,
        done = already_done,
        pending = missing.len(),
        "enumerated parts"
    );

    let progress = Progress::new(session.parts_needed, options.quiet);
    progress.parts_done(already_done);

    let ctx = Arc::new(TaskContext {
        backend,
        store,
        file_path: file.path.clone(),
        file_size: file.size,
        part_size: session.part_size,
        upload_id: session.upload_id.clone(),
        hashes: Mutex::new(hashes),
        completed: AtomicU64::new(already_done),
        progress,
    });

    let result = upload_and_finalise(&ctx, missing, file.size, options.concurrency).await;
    match result {
        Ok(()) => {
            ctx.progress.finish();
            info!(upload_id = %ctx.upload_id, "upload complete");
            Ok(())
        }
        Err(err) => {
            // Clear the bar so the error prints on a clean line.
            ctx.progress.clear();
            Err(err)
        }
    }
}

async fn upload_and_finalise(
    ctx: &Arc<TaskContext>,
    missing: Vec<u64>,
    file_size: u64,
    concurrency: usize,
) -> Result<(), EngineError> {
    if !missing.is_empty() {
        let scheduler = Scheduler::new(concurrency);
        let task_ctx = ctx.clone();
        scheduler
            .run(missing, move |index| {
                let ctx = task_ctx.clone();
                Box::pin(async move { upload_one(ctx, index).await })
            })
            .await
            .map_err(into_engine_error)?;
    }

    // Queue drained: every slot must hold a hash, in index order.
    ctx.progress.finalising();
    let ordered = ctx
        .hashes
        .lock()
        .iter()
        .enumerate()
        .map(|(index, hash)| {
            hash.clone()
                .ok_or_else(|| EngineError::Internal(format!("part {index} has no hash after drain")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    ctx.backend
        .complete(&ctx.upload_id, file_size, &ordered)
        .await?;
    Ok(())
}

/// Upload one part and persist its hash. This is the task body the
/// scheduler wraps with backoff and retry.
async fn upload_one(ctx: Arc<TaskContext>, index: u64) -> Result<(), TaskError> {
    let part = Part::nth(index, ctx.part_size, ctx.file_size);
    let source = PartSource::new(ctx.file_path.clone(), part);

    let hash = ctx
        .backend
        .upload_part(&ctx.upload_id, &source)
        .await
        .map_err(|err| {
            if err.is_fatal() {
                TaskError::Fatal(Box::new(EngineError::Backend(err)))
            } else {
                TaskError::Transient(Box::new(err))
            }
        })?;

    // A slot can already be filled only if this part was uploaded twice;
    // the protocol guarantees identical hashes, so a difference means the
    // working directory and the service have diverged.
    let prior = ctx.hashes.lock()[index as usize].clone();
    if let Some(prior) = prior {
        if prior != hash {
            return Err(TaskError::Fatal(Box::new(EngineError::HashConflict {
                index,
            })));
        }
        return Ok(());
    }

    // Durability point: only a backend-confirmed part gets its hash
    // persisted. A store failure is fatal (error kind: local I/O).
    ctx.store
        .write_part_hash(index, &hash)
        .await
        .map_err(|err| TaskError::Fatal(Box::new(EngineError::Store(err))))?;

    ctx.hashes.lock()[index as usize] = Some(hash);
    let done = ctx.completed.fetch_add(1, Ordering::SeqCst) + 1;
    ctx.progress.parts_done(done);
    debug!(part = index, done, "part durable");
    Ok(())
}

/// Recover the typed engine error from the scheduler's boxed fatal.
fn into_engine_error(err: TaskError) -> EngineError {
    match err {
        TaskError::Fatal(boxed) => match boxed.downcast::<EngineError>() {
            Ok(engine) => *engine,
            Err(other) => EngineError::Internal(other.to_string()),
        },
        // The scheduler retries transients forever; it never hands one back.
        TaskError::Transient(boxed) => EngineError::Internal(boxed.to_string()),
    }
}
