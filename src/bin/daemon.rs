//! Photosift daemon: ingestion and background pipeline processing.
//!
//! Runs the stage worker pool over the durable job queue, optionally
//! triggers periodic clustering runs, and can ingest files handed to it on
//! the command line before entering the loop.
//!
//! ## Usage
//!
//! ```bash
//! photosift-daemon                       # Run workers in the foreground
//! photosift-daemon --ingest a.jpg b.jpg  # Ingest files, then run
//! photosift-daemon --once                # Drain the queue and exit
//! photosift-daemon --cluster             # Force a clustering run and exit
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use photosift::cluster::ClusteringEngine;
use photosift::db::Database;
use photosift::pipeline::models::BaselineModels;
use photosift::pipeline::worker::{WorkerContext, WorkerPool};
use photosift::{Config, FsBlobStore, Ingestor, PipelineExecutor, SimilarityIndex, UploadStatus};

struct DaemonArgs {
    /// Drain the queue once instead of polling forever.
    once: bool,
    /// Force one clustering run, then exit.
    cluster: bool,
    config_path: Option<PathBuf>,
    workers: Option<usize>,
    ingest: Vec<PathBuf>,
}

impl Default for DaemonArgs {
    fn default() -> Self {
        Self {
            once: false,
            cluster: false,
            config_path: None,
            workers: None,
            ingest: Vec::new(),
        }
    }
}

fn main() -> Result<()> {
    let args = parse_args();

    let _ = photosift::logging::init(None);
    info!("Photosift daemon starting...");

    let mut config = match &args.config_path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {:?}", path))?,
        None => Config::load()?,
    };
    if let Some(workers) = args.workers {
        config.pipeline.worker_count = workers;
    }

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Arc::new(Database::open(&config.db_path)?);
    db.initialize()?;
    info!("Database opened at {:?}", config.db_path);

    let index = Arc::new(SimilarityIndex::hydrate(&db)?);
    info!(vectors = index.len(), "Similarity index hydrated");

    let store = Arc::new(FsBlobStore::open(&config.storage.root)?);
    let models = Arc::new(BaselineModels::new());
    let executor = Arc::new(PipelineExecutor::new(
        db.clone(),
        index.clone(),
        store.clone(),
    ));
    let engine = Arc::new(ClusteringEngine::new(db.clone(), config.clustering.clone()));

    if args.cluster {
        let summary = engine.run_now()?;
        info!(
            clusters = summary.clusters,
            clustered = summary.clustered,
            noise = summary.noise,
            "Clustering run finished"
        );
        return Ok(());
    }

    let ingestor = Ingestor::new(db.clone(), store.clone(), executor.clone());
    for path in &args.ingest {
        ingest_file(&ingestor, path);
    }

    let ctx = Arc::new(WorkerContext {
        db: db.clone(),
        store,
        models,
        executor,
        config: config.pipeline.clone(),
    });

    if args.once {
        info!("Running in single-shot mode");
        drain_queue(&ctx)?;
        info!("Queue drained");
        return Ok(());
    }

    let pool = WorkerPool::spawn(ctx);

    let cluster_thread = config.clustering.auto_interval_secs.map(|secs| {
        let engine = engine.clone();
        info!(interval_secs = secs, "Periodic clustering enabled");
        thread::spawn(move || loop {
            thread::sleep(Duration::from_secs(secs));
            if let Err(e) = engine.request_run() {
                error!(error = %e, "Periodic clustering run failed");
            }
        })
    });
    // The cluster thread never exits; the daemon runs until killed
    let _ = cluster_thread;

    // Runs until killed; workers stay alive inside the pool handle
    let _pool = pool;
    loop {
        thread::sleep(Duration::from_secs(60));
        match db.count_queued_jobs() {
            Ok(queued) => info!(queued, indexed = index.len(), "Daemon heartbeat"),
            Err(e) => error!(error = %e, "Heartbeat query failed"),
        }
    }
}

fn ingest_file(ingestor: &Ingestor, path: &PathBuf) {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Cannot read file");
            return;
        }
    };

    match ingestor.ingest(&filename, &bytes) {
        Ok(outcome) => match outcome.status {
            UploadStatus::Uploaded => {
                info!(media_id = outcome.media_id, %filename, "Ingested")
            }
            UploadStatus::Duplicate => {
                info!(media_id = outcome.media_id, %filename, "Already known, skipped")
            }
            UploadStatus::Failed => {
                warn!(%filename, error = ?outcome.error, "Rejected")
            }
        },
        Err(e) => error!(%filename, error = %e, "Ingest failed"),
    }
}

/// Run the pool until the queue is empty and all leases are settled.
fn drain_queue(ctx: &Arc<WorkerContext>) -> Result<()> {
    let pool = WorkerPool::spawn(ctx.clone());
    loop {
        let queued = ctx.db.count_queued_jobs()?;
        if queued == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(200));
    }
    // Let in-flight jobs land before stopping
    thread::sleep(Duration::from_millis(500));
    pool.shutdown();
    Ok(())
}

fn parse_args() -> DaemonArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = DaemonArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--once" | "-1" => {
                parsed.once = true;
            }
            "--cluster" => {
                parsed.cluster = true;
            }
            "--workers" | "-w" => {
                if i + 1 < args.len() {
                    if let Ok(n) = args[i + 1].parse() {
                        parsed.workers = Some(n);
                    }
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--ingest" => {
                // Consume every following non-flag argument as a file path
                while i + 1 < args.len() && !args[i + 1].starts_with('-') {
                    parsed.ingest.push(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("photosift-daemon {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"photosift-daemon - Background analysis pipeline for Photosift

USAGE:
    photosift-daemon [OPTIONS]

OPTIONS:
    --once, -1          Drain the job queue once and exit
    --cluster           Run clustering once and exit
    --ingest FILES...   Ingest the given image files before running
    --workers, -w N     Number of stage workers (default from config)
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    PHOTOSIFT_LOG       Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/photosift/config.toml
"#
    );
}
