//! Error taxonomy for the processing pipeline.
//!
//! Duplicate uploads are not represented here: deduplication is a normal
//! outcome, reported through [`crate::ingest::UploadStatus::Duplicate`].

use thiserror::Error;

use crate::pipeline::Stage;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A single stage's inference failed. Recorded per stage and retried up
    /// to the configured ceiling.
    #[error("stage {stage} failed: {message}")]
    StageExecution { stage: Stage, message: String },

    /// The mandatory embedding stage exhausted its retries; the media item
    /// can never become searchable.
    #[error("embedding stage permanently failed for media {0}")]
    MandatoryStageFailure(i64),

    /// A started job outlived its lease; the worker is presumed dead and the
    /// job is requeued.
    #[error("worker lease expired for job {0}")]
    WorkerLeaseExpired(i64),

    /// A clustering run was requested while one is already executing.
    #[error("a clustering run is already in progress")]
    ConcurrentClusteringRun,

    /// The similarity index returned an id the media registry no longer
    /// knows about. Treated as "no match" by queries, never fatal.
    #[error("media {0} referenced by the index is missing from the registry")]
    IndexConsistency(i64),

    #[error("media {0} not found")]
    MediaNotFound(i64),
}
