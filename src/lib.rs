//! Content-addressed image analysis pipeline.
//!
//! Uploaded images are deduplicated by SHA-256, pushed through a set of
//! analysis stages (object detection, captioning, OCR, face embedding,
//! semantic embedding) by a durable job queue and worker pool, and the
//! resulting vectors feed a cosine similarity index and a density-based
//! clustering engine.

pub mod cluster;
pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod pipeline;
pub mod storage;

pub use cluster::{ClusterRunSummary, ClusteringEngine, RunRequest};
pub use config::Config;
pub use db::Database;
pub use error::PipelineError;
pub use index::SimilarityIndex;
pub use ingest::{Ingestor, UploadOutcome, UploadStatus};
pub use index::{search_text, search_vector, SearchHit};
pub use pipeline::executor::PipelineExecutor;
pub use pipeline::models::{BaselineModels, StageModels};
pub use pipeline::worker::{WorkerContext, WorkerPool};
pub use pipeline::{Stage, StageResult};
pub use storage::{BlobStore, FsBlobStore};
