//! Worker pool: concurrent stage executors over the durable job queue.
//!
//! Workers poll the queue cooperatively, fetch the media blob, run the
//! stage's black-box model and hand the outcome to the executor. A reaper
//! thread sweeps expired leases so a crashed worker's job is requeued rather
//! than stuck in `started` forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info};

use super::executor::PipelineExecutor;
use super::models::StageModels;
use super::{Stage, StageOutcome, StageResult};
use crate::config::PipelineConfig;
use crate::db::{Database, Job, JobFailure};
use crate::error::PipelineError;
use crate::storage::BlobStore;

/// Everything a worker needs, shared by reference across the pool. Model
/// handles live here instead of in globals.
pub struct WorkerContext {
    pub db: Arc<Database>,
    pub store: Arc<dyn BlobStore>,
    pub models: Arc<dyn StageModels>,
    pub executor: Arc<PipelineExecutor>,
    pub config: PipelineConfig,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn `config.worker_count` workers plus the lease reaper.
    pub fn spawn(ctx: Arc<WorkerContext>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(ctx.config.worker_count + 1);

        for worker_id in 0..ctx.config.worker_count {
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            handles.push(thread::spawn(move || worker_loop(worker_id, &ctx, &shutdown)));
        }

        {
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            handles.push(thread::spawn(move || reaper_loop(&ctx, &shutdown)));
        }

        info!(workers = ctx.config.worker_count, "Worker pool started");
        Self { handles, shutdown }
    }

    /// Signal shutdown and wait for workers to finish their current job.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles {
            let _ = handle.join();
        }
        info!("Worker pool stopped");
    }
}

fn worker_loop(worker_id: usize, ctx: &WorkerContext, shutdown: &AtomicBool) {
    let poll = Duration::from_millis(ctx.config.poll_interval_ms);

    while !shutdown.load(Ordering::SeqCst) {
        match ctx.db.claim_job(ctx.config.lease_secs) {
            Ok(Some(job)) => {
                debug!(worker_id, job_id = job.id, media_id = job.media_id, stage = %job.stage, "Claimed job");
                if let Err(e) = run_job(ctx, &job) {
                    error!(worker_id, job_id = job.id, error = %e, "Job bookkeeping failed");
                }
            }
            Ok(None) => thread::sleep(poll),
            Err(e) => {
                error!(worker_id, error = %e, "Dequeue failed");
                thread::sleep(poll);
            }
        }
    }
}

fn reaper_loop(ctx: &WorkerContext, shutdown: &AtomicBool) {
    let interval = Duration::from_secs(ctx.config.reap_interval_secs.max(1));
    // Sleep in short slices so shutdown stays responsive
    let slice = Duration::from_millis(100);

    while !shutdown.load(Ordering::SeqCst) {
        if let Err(e) = reap_expired(ctx) {
            error!(error = %e, "Lease sweep failed");
        }

        let mut slept = Duration::ZERO;
        while slept < interval && !shutdown.load(Ordering::SeqCst) {
            thread::sleep(slice);
            slept += slice;
        }
    }
}

/// One lease sweep: requeue expired jobs, escalate the ones whose retries
/// the expiry exhausted.
fn reap_expired(ctx: &WorkerContext) -> Result<()> {
    for failure in ctx.db.requeue_expired_jobs(ctx.config.max_attempts)? {
        if let JobFailure::Exhausted {
            job_id,
            media_id,
            stage,
        } = failure
        {
            let error = PipelineError::WorkerLeaseExpired(job_id).to_string();
            ctx.executor.apply_permanent_failure(media_id, stage, &error)?;
        }
    }
    Ok(())
}

/// Execute one claimed job end to end and commit its outcome.
fn run_job(ctx: &WorkerContext, job: &Job) -> Result<()> {
    let media = match ctx.db.get_media(job.media_id)? {
        Some(media) => media,
        None => {
            // Deleted while queued; the job row went with it
            debug!(media_id = job.media_id, "Media gone, dropping job");
            return Ok(());
        }
    };

    ctx.executor.note_stage_started(job.media_id)?;

    let outcome = ctx
        .store
        .get(&media.storage_key)
        .and_then(|bytes| execute_stage(ctx.models.as_ref(), job.stage, &bytes));

    match outcome {
        Ok(outcome) => {
            ctx.db.finish_job(job.id)?;
            ctx.executor.apply_success(job.media_id, job.stage, outcome)?;
        }
        Err(e) => {
            let error = PipelineError::StageExecution {
                stage: job.stage,
                message: e.to_string(),
            }
            .to_string();
            match ctx.db.fail_job(job.id, &error, ctx.config.max_attempts)? {
                JobFailure::Requeued { attempt_count } => {
                    debug!(job_id = job.id, attempt_count, "Stage failed, requeued");
                }
                JobFailure::Exhausted {
                    media_id, stage, ..
                } => {
                    ctx.executor.apply_permanent_failure(media_id, stage, &error)?;
                }
            }
        }
    }

    Ok(())
}

fn execute_stage(models: &dyn StageModels, stage: Stage, bytes: &[u8]) -> Result<StageOutcome> {
    let outcome = match stage {
        Stage::Detection => StageOutcome::Result(StageResult::Detection {
            objects: models.detect_objects(bytes)?,
        }),
        Stage::Caption => StageOutcome::Result(StageResult::Caption {
            caption: models.caption(bytes)?,
        }),
        Stage::Ocr => StageOutcome::Result(StageResult::Ocr {
            output: models.extract_text(bytes)?,
        }),
        Stage::Faces => StageOutcome::Result(StageResult::Faces {
            faces: models.embed_faces(bytes)?,
        }),
        Stage::Embedding => StageOutcome::Embedding(models.embed_image(bytes)?),
    };
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::index::SimilarityIndex;
    use crate::pipeline::models::BaselineModels;
    use crate::storage::FsBlobStore;

    fn context(max_attempts: i64) -> (Arc<WorkerContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(test_db());
        let index = Arc::new(SimilarityIndex::new());
        let store = Arc::new(FsBlobStore::open(dir.path()).unwrap());
        let executor = Arc::new(PipelineExecutor::new(
            db.clone(),
            index.clone(),
            store.clone(),
        ));
        let ctx = Arc::new(WorkerContext {
            db,
            store,
            models: Arc::new(BaselineModels::new()),
            executor,
            config: PipelineConfig {
                worker_count: 2,
                max_attempts,
                lease_secs: 600,
                poll_interval_ms: 10,
                reap_interval_secs: 1,
            },
        });
        (ctx, dir)
    }

    fn png_bytes(r: u8, g: u8, b: u8) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([r, g, b]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_run_job_success_path() {
        let (ctx, _dir) = context(3);
        ctx.store.put("k1", &png_bytes(10, 20, 30)).unwrap();
        let id = ctx
            .db
            .create_media("h1", "k1", "f.png", None, None, None)
            .unwrap()
            .unwrap();
        ctx.db.enqueue_job(id, Stage::Embedding).unwrap();

        let job = ctx.db.claim_job(600).unwrap().unwrap();
        run_job(&ctx, &job).unwrap();

        assert_eq!(
            ctx.db.media_status(id).unwrap(),
            Some(crate::db::MediaStatus::Indexed)
        );
        assert!(ctx.db.get_embedding(id).unwrap().is_some());
    }

    #[test]
    fn test_missing_blob_exhausts_and_fails_media() {
        let (ctx, _dir) = context(1);
        let id = ctx
            .db
            .create_media("h1", "missing-key", "f.png", None, None, None)
            .unwrap()
            .unwrap();
        ctx.db.enqueue_job(id, Stage::Embedding).unwrap();

        let job = ctx.db.claim_job(600).unwrap().unwrap();
        run_job(&ctx, &job).unwrap();

        assert_eq!(
            ctx.db.media_status(id).unwrap(),
            Some(crate::db::MediaStatus::Failed)
        );
    }

    #[test]
    fn test_reaper_records_the_expired_job() {
        let (ctx, _dir) = context(1);
        let id = ctx
            .db
            .create_media("h1", "k1", "f.png", None, None, None)
            .unwrap()
            .unwrap();
        let job_id = ctx.db.enqueue_job(id, Stage::Ocr).unwrap();

        // Claimed with an already-expired lease: the worker is presumed dead
        ctx.db.claim_job(-5).unwrap().unwrap();
        reap_expired(&ctx).unwrap();

        let media = ctx.db.get_media(id).unwrap().unwrap();
        let error = media.stage_results["ocr"].error.clone().unwrap();
        assert!(error.contains(&format!("job {job_id}")));
    }

    #[test]
    fn test_pool_processes_queue_and_shuts_down() {
        let (ctx, _dir) = context(3);
        ctx.store.put("k1", &png_bytes(200, 10, 10)).unwrap();
        let id = ctx
            .db
            .create_media("h1", "k1", "f.png", None, None, None)
            .unwrap()
            .unwrap();
        ctx.executor.enqueue_all_stages(id).unwrap();

        let pool = WorkerPool::spawn(ctx.clone());
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while ctx.db.count_queued_jobs().unwrap() > 0 {
            assert!(std::time::Instant::now() < deadline, "queue did not drain");
            thread::sleep(Duration::from_millis(20));
        }
        pool.shutdown();

        let media = ctx.db.get_media(id).unwrap().unwrap();
        assert_eq!(media.status, crate::db::MediaStatus::Indexed);
        // Enrichment stages ran too
        assert!(media.stage_results.contains_key("caption"));
    }
}
