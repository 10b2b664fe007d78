pub const SCHEMA: &str = r#"
-- Media registry: one row per distinct uploaded image
CREATE TABLE IF NOT EXISTS media (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_hash TEXT NOT NULL UNIQUE,  -- SHA-256, the dedup key
    storage_key TEXT NOT NULL,          -- opaque reference into blob storage
    filename TEXT NOT NULL,

    -- Captured at ingest
    width INTEGER,
    height INTEGER,
    exif_json TEXT,

    -- Lifecycle: 'pending', 'processing', 'indexed', 'failed'
    status TEXT NOT NULL DEFAULT 'pending',
    stage_results TEXT NOT NULL DEFAULT '{}',  -- stage name -> {result, error} JSON
    error_message TEXT,

    -- Weak back-reference maintained by the clustering engine only
    cluster_id INTEGER,

    liked INTEGER NOT NULL DEFAULT 0,

    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    processed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_media_status ON media(status);
CREATE INDEX IF NOT EXISTS idx_media_cluster ON media(cluster_id);

-- Durable job queue: one unit of work per (media, stage)
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    media_id INTEGER NOT NULL,
    stage TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',  -- 'queued', 'started', 'finished', 'failed'
    attempt_count INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    started_at TEXT,
    ended_at TEXT,
    lease_expires_at TEXT,
    FOREIGN KEY (media_id) REFERENCES media(id) ON DELETE CASCADE
);

-- At most one non-terminal job per (media, stage)
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_inflight
    ON jobs(media_id, stage) WHERE status IN ('queued', 'started');
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_media ON jobs(media_id);

-- Semantic embeddings, float32 arrays stored as bytes
CREATE TABLE IF NOT EXISTS embeddings (
    media_id INTEGER PRIMARY KEY,
    embedding BLOB NOT NULL,
    embedding_dim INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (media_id) REFERENCES media(id) ON DELETE CASCADE
);

-- Clusters are immutable snapshots; each clustering run stamps its rows with
-- a fresh run_id and supersedes (never edits) older rows
CREATE TABLE IF NOT EXISTS clusters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL,
    cluster_type TEXT NOT NULL,
    centroid BLOB NOT NULL,
    member_ids TEXT NOT NULL,          -- JSON array of media ids
    representative_ids TEXT NOT NULL,  -- JSON array, nearest-to-centroid first
    label TEXT,
    description TEXT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_clusters_run ON clusters(run_id);
"#;

/// Schema amendments for databases created by older builds. Each statement is
/// applied unconditionally with errors ignored, so re-running is harmless.
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE media ADD COLUMN liked INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE media ADD COLUMN exif_json TEXT",
    "ALTER TABLE clusters ADD COLUMN description TEXT",
];
