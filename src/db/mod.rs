//! SQLite persistence: media registry, job queue, embeddings, clusters.

mod schema;

pub mod clusters;
pub mod embeddings;
pub mod jobs;
pub mod media;

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub use clusters::ClusterRow;
pub use embeddings::{bytes_to_embedding, cosine_similarity, embedding_to_bytes};
pub use jobs::{Job, JobFailure, JobStatus};
pub use media::{Media, MediaStatus};
pub use schema::{MIGRATIONS, SCHEMA};

/// Shared database handle. All access goes through one connection guarded by
/// a mutex, which also makes multi-statement read-modify-write sequences
/// atomic across worker threads.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(SCHEMA)?;
        for migration in MIGRATIONS {
            let _ = conn.execute(migration, []);
        }
        Ok(())
    }

    /// A poisoned mutex only means another thread panicked mid-query; the
    /// connection itself is still usable.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
pub(crate) fn test_db() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.initialize().unwrap();
    db
}
