//! Persisted embedding vectors and vector math helpers.

use anyhow::Result;
use rusqlite::params;

use super::media::MediaStatus;
use super::Database;

impl Database {
    /// Store or replace the embedding for a media item. Only the embedding
    /// stage ever writes here.
    pub fn upsert_embedding(&self, media_id: i64, embedding: &[f32]) -> Result<()> {
        let bytes = embedding_to_bytes(embedding);
        self.conn().execute(
            r#"
            INSERT OR REPLACE INTO embeddings (media_id, embedding, embedding_dim, created_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            "#,
            params![media_id, bytes, embedding.len() as i64],
        )?;
        Ok(())
    }

    pub fn get_embedding(&self, media_id: i64) -> Result<Option<Vec<f32>>> {
        let result = self.conn().query_row(
            "SELECT embedding FROM embeddings WHERE media_id = ?",
            [media_id],
            |row| row.get::<_, Vec<u8>>(0),
        );
        match result {
            Ok(bytes) => Ok(Some(bytes_to_embedding(&bytes))),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove_embedding(&self, media_id: i64) -> Result<()> {
        self.conn()
            .execute("DELETE FROM embeddings WHERE media_id = ?", [media_id])?;
        Ok(())
    }

    /// Embeddings of all indexed media, ascending by media id. This is the
    /// input set for clustering runs and index hydration.
    pub fn indexed_embeddings(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT e.media_id, e.embedding
            FROM embeddings e
            JOIN media m ON m.id = e.media_id
            WHERE m.status = ?
            ORDER BY e.media_id
            "#,
        )?;
        let records = stmt
            .query_map([MediaStatus::Indexed.as_str()], |row| {
                let bytes: Vec<u8> = row.get(1)?;
                Ok((row.get(0)?, bytes_to_embedding(&bytes)))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(records)
    }

    pub fn count_embeddings(&self) -> Result<i64> {
        let count = self
            .conn()
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count)
    }
}

/// Convert f32 slice to bytes for storage
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            let mut arr = [0u8; 4];
            arr.copy_from_slice(chunk);
            f32::from_le_bytes(arr)
        })
        .collect()
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::db::MediaStatus;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.0001);

        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 0.0001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) - (-1.0)).abs() < 0.0001);
    }

    #[test]
    fn test_embedding_conversion() {
        let original = vec![1.5, -2.3, 0.0, 100.0];
        let bytes = embedding_to_bytes(&original);
        let recovered = bytes_to_embedding(&bytes);
        assert_eq!(original, recovered);
    }

    #[test]
    fn test_upsert_replaces_and_remove_drops() {
        let db = test_db();
        let id = db
            .create_media("h1", "k", "f.jpg", None, None, None)
            .unwrap()
            .unwrap();

        db.upsert_embedding(id, &[1.0, 2.0]).unwrap();
        db.upsert_embedding(id, &[3.0, 4.0]).unwrap();
        assert_eq!(db.get_embedding(id).unwrap(), Some(vec![3.0, 4.0]));
        assert_eq!(db.count_embeddings().unwrap(), 1);

        db.remove_embedding(id).unwrap();
        assert_eq!(db.get_embedding(id).unwrap(), None);
    }

    #[test]
    fn test_indexed_embeddings_filters_by_status() {
        let db = test_db();
        let a = db
            .create_media("ha", "ka", "a.jpg", None, None, None)
            .unwrap()
            .unwrap();
        let b = db
            .create_media("hb", "kb", "b.jpg", None, None, None)
            .unwrap()
            .unwrap();
        db.upsert_embedding(a, &[1.0]).unwrap();
        db.upsert_embedding(b, &[2.0]).unwrap();
        db.set_media_status(a, MediaStatus::Indexed).unwrap();
        // b stays pending

        let rows = db.indexed_embeddings().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, a);
    }
}
