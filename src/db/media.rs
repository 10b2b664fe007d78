//! Media registry operations.

use anyhow::Result;
use rusqlite::params;

use super::Database;
use crate::pipeline::{StageRecord, StageResults};

/// Pipeline lifecycle status of a media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStatus {
    Pending,
    Processing,
    Indexed,
    Failed,
}

impl MediaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaStatus::Pending => "pending",
            MediaStatus::Processing => "processing",
            MediaStatus::Indexed => "indexed",
            MediaStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<MediaStatus> {
        match s {
            "pending" => Some(MediaStatus::Pending),
            "processing" => Some(MediaStatus::Processing),
            "indexed" => Some(MediaStatus::Indexed),
            "failed" => Some(MediaStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MediaStatus::Indexed | MediaStatus::Failed)
    }
}

/// One row of the media registry.
#[derive(Debug, Clone)]
pub struct Media {
    pub id: i64,
    pub content_hash: String,
    pub storage_key: String,
    pub filename: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub exif_json: Option<serde_json::Value>,
    pub status: MediaStatus,
    pub stage_results: StageResults,
    pub error_message: Option<String>,
    pub cluster_id: Option<i64>,
    pub liked: bool,
    pub created_at: String,
    pub processed_at: Option<String>,
}

const MEDIA_COLUMNS: &str = "id, content_hash, storage_key, filename, width, height, exif_json, \
     status, stage_results, error_message, cluster_id, liked, created_at, processed_at";

fn media_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Media> {
    let status_str: String = row.get(7)?;
    let stage_results_str: String = row.get(8)?;
    let exif_str: Option<String> = row.get(6)?;
    Ok(Media {
        id: row.get(0)?,
        content_hash: row.get(1)?,
        storage_key: row.get(2)?,
        filename: row.get(3)?,
        width: row.get(4)?,
        height: row.get(5)?,
        exif_json: exif_str.and_then(|s| serde_json::from_str(&s).ok()),
        status: MediaStatus::parse(&status_str).unwrap_or(MediaStatus::Failed),
        stage_results: serde_json::from_str(&stage_results_str).unwrap_or_default(),
        error_message: row.get(9)?,
        cluster_id: row.get(10)?,
        liked: row.get::<_, i64>(11)? != 0,
        created_at: row.get(12)?,
        processed_at: row.get(13)?,
    })
}

impl Database {
    /// Insert a new media row, unless one with this content hash already
    /// exists. Returns `None` when the uniqueness constraint resolved the
    /// insert in favor of an existing row (the caller lost the race).
    pub fn create_media(
        &self,
        content_hash: &str,
        storage_key: &str,
        filename: &str,
        width: Option<u32>,
        height: Option<u32>,
        exif_json: Option<&serde_json::Value>,
    ) -> Result<Option<i64>> {
        let conn = self.conn();
        let exif_str = exif_json.map(|v| v.to_string());
        let changed = conn.execute(
            r#"
            INSERT INTO media (content_hash, storage_key, filename, width, height, exif_json, status)
            VALUES (?, ?, ?, ?, ?, ?, 'pending')
            ON CONFLICT(content_hash) DO NOTHING
            "#,
            params![content_hash, storage_key, filename, width, height, exif_str],
        )?;

        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    pub fn find_media_by_hash(&self, content_hash: &str) -> Result<Option<i64>> {
        let result = self.conn().query_row(
            "SELECT id FROM media WHERE content_hash = ?",
            [content_hash],
            |row| row.get(0),
        );
        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_media(&self, media_id: i64) -> Result<Option<Media>> {
        let sql = format!("SELECT {} FROM media WHERE id = ?", MEDIA_COLUMNS);
        let result = self.conn().query_row(&sql, [media_id], media_from_row);
        match result {
            Ok(media) => Ok(Some(media)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn media_status(&self, media_id: i64) -> Result<Option<MediaStatus>> {
        let result = self.conn().query_row(
            "SELECT status FROM media WHERE id = ?",
            [media_id],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(s) => Ok(MediaStatus::parse(&s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set lifecycle status. `processed_at` is stamped the first time a
    /// terminal status is reached. Only the pipeline executor calls this.
    pub(crate) fn set_media_status(&self, media_id: i64, status: MediaStatus) -> Result<()> {
        if status.is_terminal() {
            self.conn().execute(
                r#"
                UPDATE media
                SET status = ?,
                    processed_at = COALESCE(processed_at, CURRENT_TIMESTAMP)
                WHERE id = ?
                "#,
                params![status.as_str(), media_id],
            )?;
        } else {
            self.conn().execute(
                "UPDATE media SET status = ? WHERE id = ?",
                params![status.as_str(), media_id],
            )?;
        }
        Ok(())
    }

    /// Merge one stage's record into `stage_results`. The read-modify-write
    /// happens under the connection mutex, so two stages finishing
    /// near-simultaneously cannot drop each other's results.
    pub fn merge_stage_record(
        &self,
        media_id: i64,
        stage_name: &str,
        record: StageRecord,
    ) -> Result<()> {
        let conn = self.conn();
        let current: String = conn.query_row(
            "SELECT stage_results FROM media WHERE id = ?",
            [media_id],
            |row| row.get(0),
        )?;
        let mut results: StageResults = serde_json::from_str(&current).unwrap_or_default();
        results.insert(stage_name.to_string(), record);
        conn.execute(
            "UPDATE media SET stage_results = ? WHERE id = ?",
            params![serde_json::to_string(&results)?, media_id],
        )?;
        Ok(())
    }

    /// Drop stored errors for the given stage names ahead of a re-run.
    pub fn clear_stage_errors(&self, media_id: i64, stage_names: &[&str]) -> Result<()> {
        let conn = self.conn();
        let current: String = conn.query_row(
            "SELECT stage_results FROM media WHERE id = ?",
            [media_id],
            |row| row.get(0),
        )?;
        let mut results: StageResults = serde_json::from_str(&current).unwrap_or_default();
        for name in stage_names {
            if let Some(record) = results.get_mut(*name) {
                record.error = None;
            }
        }
        conn.execute(
            "UPDATE media SET stage_results = ? WHERE id = ?",
            params![serde_json::to_string(&results)?, media_id],
        )?;
        Ok(())
    }

    pub fn set_media_error(&self, media_id: i64, error: Option<&str>) -> Result<()> {
        self.conn().execute(
            "UPDATE media SET error_message = ? WHERE id = ?",
            params![error, media_id],
        )?;
        Ok(())
    }

    pub fn set_liked(&self, media_id: i64, liked: bool) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE media SET liked = ? WHERE id = ?",
            params![liked as i64, media_id],
        )?;
        Ok(changed > 0)
    }

    /// Delete a media row. Jobs and the embedding row go with it (foreign key
    /// cascade). Returns the storage key so the caller can drop the blob.
    pub fn delete_media(&self, media_id: i64) -> Result<Option<String>> {
        let conn = self.conn();
        let key = match conn.query_row(
            "SELECT storage_key FROM media WHERE id = ?",
            [media_id],
            |row| row.get::<_, String>(0),
        ) {
            Ok(k) => k,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        conn.execute("DELETE FROM media WHERE id = ?", [media_id])?;
        Ok(Some(key))
    }

    pub fn list_media_by_status(&self, status: MediaStatus) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id FROM media WHERE status = ? ORDER BY id")?;
        let ids = stmt
            .query_map([status.as_str()], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    pub fn count_media(&self) -> Result<i64> {
        let count = self
            .conn()
            .query_row("SELECT COUNT(*) FROM media", [], |row| row.get(0))?;
        Ok(count)
    }
}
