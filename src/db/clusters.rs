//! Cluster snapshot rows and membership back-references.

use anyhow::Result;
use rusqlite::params;

use super::embeddings::{bytes_to_embedding, embedding_to_bytes};
use super::media::MediaStatus;
use super::Database;

/// One persisted cluster from a clustering run. Rows are immutable; a new
/// run supersedes older rows by stamping a higher `run_id`.
#[derive(Debug, Clone)]
pub struct ClusterRow {
    pub id: i64,
    pub run_id: i64,
    pub cluster_type: String,
    pub centroid: Vec<f32>,
    pub member_ids: Vec<i64>,
    pub representative_ids: Vec<i64>,
    pub label: Option<String>,
    pub description: Option<String>,
    pub created_at: String,
}

fn cluster_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClusterRow> {
    let centroid_bytes: Vec<u8> = row.get(3)?;
    let members_str: String = row.get(4)?;
    let reps_str: String = row.get(5)?;
    Ok(ClusterRow {
        id: row.get(0)?,
        run_id: row.get(1)?,
        cluster_type: row.get(2)?,
        centroid: bytes_to_embedding(&centroid_bytes),
        member_ids: serde_json::from_str(&members_str).unwrap_or_default(),
        representative_ids: serde_json::from_str(&reps_str).unwrap_or_default(),
        label: row.get(6)?,
        description: row.get(7)?,
        created_at: row.get(8)?,
    })
}

const CLUSTER_COLUMNS: &str =
    "id, run_id, cluster_type, centroid, member_ids, representative_ids, label, description, created_at";

impl Database {
    /// Next clustering run id (1-based, monotonic).
    pub fn next_cluster_run_id(&self) -> Result<i64> {
        let max: i64 = self.conn().query_row(
            "SELECT COALESCE(MAX(run_id), 0) FROM clusters",
            [],
            |row| row.get(0),
        )?;
        Ok(max + 1)
    }

    pub fn insert_cluster(
        &self,
        run_id: i64,
        cluster_type: &str,
        centroid: &[f32],
        member_ids: &[i64],
        representative_ids: &[i64],
        label: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO clusters (run_id, cluster_type, centroid, member_ids, representative_ids, label)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                run_id,
                cluster_type,
                embedding_to_bytes(centroid),
                serde_json::to_string(member_ids)?,
                serde_json::to_string(representative_ids)?,
                label,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Clusters of the most recent run, if any.
    pub fn current_clusters(&self) -> Result<Vec<ClusterRow>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM clusters WHERE run_id = (SELECT MAX(run_id) FROM clusters) ORDER BY id",
            CLUSTER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], cluster_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn get_cluster(&self, cluster_id: i64) -> Result<Option<ClusterRow>> {
        let sql = format!("SELECT {} FROM clusters WHERE id = ?", CLUSTER_COLUMNS);
        let result = self.conn().query_row(&sql, [cluster_id], cluster_from_row);
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reconcile `media.cluster_id` after a run: every assignment is applied
    /// and every indexed media the run left unclustered is cleared, in one
    /// transaction so readers never see a half-applied run.
    pub fn apply_cluster_assignments(&self, assignments: &[(i64, i64)]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE media SET cluster_id = NULL WHERE cluster_id IS NOT NULL",
            [],
        )?;
        for (media_id, cluster_id) in assignments {
            tx.execute(
                "UPDATE media SET cluster_id = ? WHERE id = ? AND status = ?",
                params![cluster_id, media_id, MediaStatus::Indexed.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}
