//! Embedding store front: in-memory similarity index over indexed media.
//!
//! The index only ever holds vectors for media whose status is `indexed`;
//! the pipeline executor inserts on the pending -> indexed transition and
//! deletion removes immediately. Upserts replace the whole vector under a
//! write lock, so readers never observe a partially written entry.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use rayon::prelude::*;
use tracing::warn;

use crate::db::{cosine_similarity, Database, Media, MediaStatus};
use crate::error::PipelineError;
use crate::pipeline::models::StageModels;

pub struct SimilarityIndex {
    vectors: RwLock<HashMap<i64, Vec<f32>>>,
}

/// One ranked search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub media_id: i64,
    /// Cosine similarity rescaled to [0, 1].
    pub similarity: f32,
    pub metadata: Media,
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self {
            vectors: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the index from the database: embeddings of all currently
    /// indexed media.
    pub fn hydrate(db: &Database) -> Result<Self> {
        let index = Self::new();
        let rows = db.indexed_embeddings()?;
        let mut vectors = index.vectors.write().unwrap_or_else(|e| e.into_inner());
        for (media_id, embedding) in rows {
            vectors.insert(media_id, embedding);
        }
        drop(vectors);
        Ok(index)
    }

    /// Replace the vector for a media id. Atomic per id.
    pub fn upsert(&self, media_id: i64, embedding: Vec<f32>) {
        let mut vectors = self.vectors.write().unwrap_or_else(|e| e.into_inner());
        vectors.insert(media_id, embedding);
    }

    /// Drop a media id from the index. It cannot re-enter without a fresh
    /// upsert.
    pub fn remove(&self, media_id: i64) {
        let mut vectors = self.vectors.write().unwrap_or_else(|e| e.into_inner());
        vectors.remove(&media_id);
    }

    pub fn contains(&self, media_id: i64) -> bool {
        let vectors = self.vectors.read().unwrap_or_else(|e| e.into_inner());
        vectors.contains_key(&media_id)
    }

    pub fn len(&self) -> usize {
        let vectors = self.vectors.read().unwrap_or_else(|e| e.into_inner());
        vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Top-k nearest ids by cosine similarity, descending, ties broken by
    /// ascending media id. Scores are rescaled from [-1, 1] to [0, 1].
    pub fn query(&self, query: &[f32], k: usize) -> Vec<(i64, f32)> {
        let vectors = self.vectors.read().unwrap_or_else(|e| e.into_inner());

        let mut scored: Vec<(i64, f32)> = vectors
            .par_iter()
            .map(|(id, v)| (*id, (cosine_similarity(query, v) + 1.0) / 2.0))
            .collect();
        drop(vectors);

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }
}

impl Default for SimilarityIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Natural-language search: encode the query text through the model
/// boundary, rank against the index, and attach registry metadata. Ids the
/// registry no longer knows about are skipped, not fatal.
pub fn search_text(
    db: &Database,
    index: &SimilarityIndex,
    models: &dyn StageModels,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    let query_vector = models.embed_text(query)?;
    search_vector(db, index, &query_vector, limit)
}

pub fn search_vector(
    db: &Database,
    index: &SimilarityIndex,
    query_vector: &[f32],
    limit: usize,
) -> Result<Vec<SearchHit>> {
    let ranked = index.query(query_vector, limit);

    let mut hits = Vec::with_capacity(ranked.len());
    for (media_id, similarity) in ranked {
        match db.get_media(media_id)? {
            Some(media) if media.status == MediaStatus::Indexed => {
                hits.push(SearchHit {
                    media_id,
                    similarity,
                    metadata: media,
                });
            }
            Some(_) => {
                // Status changed since the vector was indexed; stale entry
                warn!(media_id, "Skipping non-indexed media still in index");
            }
            None => {
                warn!(
                    media_id,
                    error = %PipelineError::IndexConsistency(media_id),
                    "Dropping dangling index entry from results"
                );
            }
        }
    }
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn test_query_ordering_and_truncation() {
        let index = SimilarityIndex::new();
        index.upsert(1, vec![1.0, 0.0]);
        index.upsert(2, vec![0.0, 1.0]);
        index.upsert(3, vec![0.7, 0.7]);

        let results = index.query(&[1.0, 0.0], 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 1);
        assert!((results[0].1 - 1.0).abs() < 1e-5); // self-similarity is max
        assert_eq!(results[1].0, 3);
        assert!(results[0].1 >= results[1].1);
    }

    #[test]
    fn test_tie_break_by_ascending_id() {
        let index = SimilarityIndex::new();
        index.upsert(9, vec![1.0, 0.0]);
        index.upsert(4, vec![1.0, 0.0]);
        index.upsert(7, vec![1.0, 0.0]);

        let results = index.query(&[1.0, 0.0], 3);
        let ids: Vec<i64> = results.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![4, 7, 9]);
    }

    #[test]
    fn test_scores_normalized_to_unit_interval() {
        let index = SimilarityIndex::new();
        index.upsert(1, vec![-1.0, 0.0]);

        let results = index.query(&[1.0, 0.0], 1);
        // Opposite vectors score 0 after rescaling
        assert!(results[0].1.abs() < 1e-5);
    }

    #[test]
    fn test_removed_id_never_returns() {
        let index = SimilarityIndex::new();
        index.upsert(1, vec![1.0]);
        index.remove(1);
        assert!(index.query(&[1.0], 10).is_empty());
        assert!(!index.contains(1));
    }

    #[test]
    fn test_search_skips_dangling_ids() {
        let db = test_db();
        let id = db
            .create_media("h1", "k", "f.jpg", None, None, None)
            .unwrap()
            .unwrap();
        db.set_media_status(id, crate::db::MediaStatus::Indexed)
            .unwrap();

        let index = SimilarityIndex::new();
        index.upsert(id, vec![1.0, 0.0]);
        index.upsert(999, vec![1.0, 0.0]); // no registry row

        let hits = search_vector(&db, &index, &[1.0, 0.0], 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].media_id, id);
    }

    #[test]
    fn test_hydrate_loads_only_indexed() {
        let db = test_db();
        let a = db
            .create_media("ha", "k", "a.jpg", None, None, None)
            .unwrap()
            .unwrap();
        let b = db
            .create_media("hb", "k", "b.jpg", None, None, None)
            .unwrap()
            .unwrap();
        db.upsert_embedding(a, &[1.0]).unwrap();
        db.upsert_embedding(b, &[1.0]).unwrap();
        db.set_media_status(a, crate::db::MediaStatus::Indexed)
            .unwrap();

        let index = SimilarityIndex::hydrate(&db).unwrap();
        assert!(index.contains(a));
        assert!(!index.contains(b));
    }
}
