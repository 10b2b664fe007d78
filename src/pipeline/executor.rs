//! Stage pipeline executor.
//!
//! The executor is the only component allowed to change a media item's
//! lifecycle status. It reacts to job completions: stage results are merged
//! into the registry row, embedding vectors go to the embedding store, and
//! the status is re-evaluated after every change. Late results for a deleted
//! media id are discarded.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use super::{Stage, StageOutcome, StageRecord};
use crate::db::{Database, JobStatus, MediaStatus};
use crate::error::PipelineError;
use crate::index::SimilarityIndex;
use crate::storage::BlobStore;

pub struct PipelineExecutor {
    db: Arc<Database>,
    index: Arc<SimilarityIndex>,
    store: Arc<dyn BlobStore>,
}

impl PipelineExecutor {
    pub fn new(db: Arc<Database>, index: Arc<SimilarityIndex>, store: Arc<dyn BlobStore>) -> Self {
        Self { db, index, store }
    }

    /// Fan out one job per stage for a freshly created media item. The five
    /// stages are mutually independent, so all are enqueued at once; queue
    /// idempotence absorbs repeats.
    pub fn enqueue_all_stages(&self, media_id: i64) -> Result<()> {
        for stage in Stage::ALL {
            self.db.enqueue_job(media_id, stage)?;
        }
        Ok(())
    }

    /// Mark a started job as having begun work on the media: the first stage
    /// to start moves a pending item to processing.
    pub fn note_stage_started(&self, media_id: i64) -> Result<()> {
        if self.db.media_status(media_id)? == Some(MediaStatus::Pending) {
            self.db.set_media_status(media_id, MediaStatus::Processing)?;
        }
        Ok(())
    }

    /// Apply a successful stage outcome and re-evaluate status. A result
    /// arriving for a deleted media id is discarded.
    pub fn apply_success(&self, media_id: i64, stage: Stage, outcome: StageOutcome) -> Result<()> {
        if self.db.media_status(media_id)?.is_none() {
            warn!(media_id, %stage, "Discarding stage result for deleted media");
            return Ok(());
        }

        match outcome {
            StageOutcome::Embedding(vector) => {
                self.db.upsert_embedding(media_id, &vector)?;
                // A success clears any earlier embedding failure
                self.db.set_media_error(media_id, None)?;
            }
            StageOutcome::Result(result) => {
                self.db.merge_stage_record(
                    media_id,
                    stage.as_str(),
                    StageRecord {
                        result: Some(result),
                        error: None,
                    },
                )?;
            }
        }

        debug!(media_id, %stage, "Stage succeeded");
        self.reevaluate(media_id)
    }

    /// Record a permanent stage failure (retries exhausted) and re-evaluate.
    /// Only the mandatory embedding stage escalates to media-level failure;
    /// enrichment failures stay local to their stage record.
    pub fn apply_permanent_failure(&self, media_id: i64, stage: Stage, error: &str) -> Result<()> {
        if self.db.media_status(media_id)?.is_none() {
            warn!(media_id, %stage, "Discarding stage failure for deleted media");
            return Ok(());
        }

        if stage.is_mandatory() {
            self.db.set_media_error(
                media_id,
                Some(&PipelineError::MandatoryStageFailure(media_id).to_string()),
            )?;
        } else {
            self.db.merge_stage_record(
                media_id,
                stage.as_str(),
                StageRecord {
                    result: None,
                    error: Some(error.to_string()),
                },
            )?;
        }

        warn!(media_id, %stage, error, "Stage permanently failed");
        self.reevaluate(media_id)
    }

    /// Re-derive the lifecycle status from the embedding stage's fate.
    ///
    /// - embedding finished and vector present -> `indexed`
    /// - embedding permanently failed -> `failed`
    /// - anything else -> keep `processing` (or `pending` if untouched)
    fn reevaluate(&self, media_id: i64) -> Result<()> {
        let Some(current) = self.db.media_status(media_id)? else {
            return Ok(());
        };

        let embedding_job = self.db.stage_job_status(media_id, Stage::Embedding)?;
        let has_vector = self.db.get_embedding(media_id)?.is_some();

        let next = match embedding_job {
            Some(JobStatus::Finished) if has_vector => MediaStatus::Indexed,
            Some(JobStatus::Failed) => MediaStatus::Failed,
            _ => {
                if current == MediaStatus::Pending {
                    MediaStatus::Pending
                } else {
                    MediaStatus::Processing
                }
            }
        };

        if next != current {
            self.db.set_media_status(media_id, next)?;
            info!(media_id, from = current.as_str(), to = next.as_str(), "Media status changed");
        }

        // Keep the similarity index consistent with the status
        match next {
            MediaStatus::Indexed => {
                if let Some(vector) = self.db.get_embedding(media_id)? {
                    self.index.upsert(media_id, vector);
                }
            }
            _ => self.index.remove(media_id),
        }

        Ok(())
    }

    /// Re-enqueue a subset of stages for an existing media item, clearing
    /// their stored errors. Stages not included are untouched. A failed
    /// media whose embedding re-run succeeds moves back toward `indexed`.
    pub fn rerun_stages(&self, media_id: i64, stages: &[Stage]) -> Result<()> {
        if self.db.media_status(media_id)?.is_none() {
            return Err(PipelineError::MediaNotFound(media_id).into());
        }

        let names: Vec<&str> = stages.iter().map(Stage::as_str).collect();
        self.db.clear_stage_errors(media_id, &names)?;
        if stages.iter().any(Stage::is_mandatory) {
            self.db.set_media_error(media_id, None)?;
        }
        for stage in stages {
            self.db.enqueue_job(media_id, *stage)?;
        }
        info!(media_id, ?stages, "Re-enqueued stages");
        Ok(())
    }

    /// Explicit recovery for a failed media item: back to `pending` with all
    /// stages re-enqueued. Failed items are never retried automatically.
    pub fn retry_media(&self, media_id: i64) -> Result<()> {
        match self.db.media_status(media_id)? {
            None => return Err(PipelineError::MediaNotFound(media_id).into()),
            Some(MediaStatus::Failed) => {}
            Some(status) => {
                anyhow::bail!(
                    "media {} is {}, only failed media can be retried",
                    media_id,
                    status.as_str()
                );
            }
        }

        self.db.set_media_error(media_id, None)?;
        self.db.set_media_status(media_id, MediaStatus::Pending)?;
        self.enqueue_all_stages(media_id)?;
        info!(media_id, "Failed media re-enqueued");
        Ok(())
    }

    /// Delete a media item: registry row, jobs, embedding row (cascade),
    /// index entry and the stored blob. In-flight jobs keep running but
    /// their results will be discarded on arrival. Returns whether the item
    /// existed.
    pub fn delete_media(&self, media_id: i64) -> Result<bool> {
        self.index.remove(media_id);
        let Some(key) = self.db.delete_media(media_id)? else {
            return Ok(false);
        };
        // Idempotent; an already-missing blob is not an error
        self.store.delete(&key)?;
        info!(media_id, "Media deleted");
        Ok(true)
    }
}
