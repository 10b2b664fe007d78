//! Clustering engine: density-based grouping of indexed embeddings.
//!
//! Runs DBSCAN over cosine distance. No preset cluster count; points in
//! sparse neighborhoods stay noise rather than being forced into a group.
//! Each run persists a fresh set of immutable cluster rows and reconciles
//! the weak `media.cluster_id` back-references. At most one run executes at
//! a time; requests arriving mid-run are coalesced into a single deferred
//! run instead of queueing up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{info, warn};

use crate::config::ClusteringConfig;
use crate::db::{cosine_similarity, Database};
use crate::error::PipelineError;

const CLUSTER_TYPE_SEMANTIC: &str = "semantic";

/// Statistics of one completed clustering run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterRunSummary {
    pub run_id: Option<i64>,
    pub clusters: usize,
    pub clustered: usize,
    pub noise: usize,
    pub total: usize,
}

/// How a run request was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunRequest {
    /// The caller's run executed (possibly plus one coalesced follow-up).
    Completed(ClusterRunSummary),
    /// Another run was active; this request was folded into it.
    Coalesced,
}

pub struct ClusteringEngine {
    db: Arc<Database>,
    config: ClusteringConfig,
    run_lock: Mutex<()>,
    pending: AtomicBool,
}

impl ClusteringEngine {
    pub fn new(db: Arc<Database>, config: ClusteringConfig) -> Self {
        Self {
            db,
            config,
            run_lock: Mutex::new(()),
            pending: AtomicBool::new(false),
        }
    }

    /// Request a clustering run. If one is already executing the request is
    /// coalesced: the active run performs one deferred pass before releasing
    /// the run lock, so a burst of triggers costs at most one extra run.
    pub fn request_run(&self) -> Result<RunRequest> {
        let guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(std::sync::TryLockError::WouldBlock) => {
                self.pending.store(true, Ordering::SeqCst);
                info!("Clustering run already active, request coalesced");
                return Ok(RunRequest::Coalesced);
            }
            Err(std::sync::TryLockError::Poisoned(p)) => p.into_inner(),
        };

        let mut summary = self.run_once()?;
        while self.pending.swap(false, Ordering::SeqCst) {
            summary = self.run_once()?;
        }
        drop(guard);

        // A request landing between the last flag check and the unlock would
        // otherwise sit until some later trigger. Drain it here; if another
        // runner holds the lock by now, the flag is its to consume.
        while self.pending.load(Ordering::SeqCst) {
            let guard = match self.run_lock.try_lock() {
                Ok(guard) => guard,
                Err(std::sync::TryLockError::WouldBlock) => break,
                Err(std::sync::TryLockError::Poisoned(p)) => p.into_inner(),
            };
            while self.pending.swap(false, Ordering::SeqCst) {
                summary = self.run_once()?;
            }
            drop(guard);
        }
        Ok(RunRequest::Completed(summary))
    }

    /// Run exactly once, erroring instead of coalescing when a run is
    /// already active.
    pub fn run_now(&self) -> Result<ClusterRunSummary> {
        let _guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(std::sync::TryLockError::WouldBlock) => {
                return Err(PipelineError::ConcurrentClusteringRun.into());
            }
            Err(std::sync::TryLockError::Poisoned(p)) => p.into_inner(),
        };
        self.run_once()
    }

    fn run_once(&self) -> Result<ClusterRunSummary> {
        // Ascending media id order keeps DBSCAN deterministic for a given
        // input set and configuration.
        let rows = self.db.indexed_embeddings()?;
        let total = rows.len();

        if total < self.config.min_cluster_size {
            // Too small a corpus: leave the prior cluster set untouched
            warn!(total, "Not enough embeddings for clustering, skipping run");
            return Ok(ClusterRunSummary {
                total,
                noise: total,
                ..Default::default()
            });
        }

        let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
        let vectors: Vec<&[f32]> = rows.iter().map(|(_, v)| v.as_slice()).collect();

        let labels = dbscan(&vectors, self.config.epsilon, self.config.min_cluster_size);
        let cluster_count = labels
            .iter()
            .filter_map(|l| *l)
            .max()
            .map(|m| m + 1)
            .unwrap_or(0);

        let run_id = self.db.next_cluster_run_id()?;
        let mut assignments: Vec<(i64, i64)> = Vec::new();
        let mut clustered = 0usize;

        for cluster in 0..cluster_count {
            let member_indices: Vec<usize> = (0..total)
                .filter(|&i| labels[i] == Some(cluster))
                .collect();
            let member_ids: Vec<i64> = member_indices.iter().map(|&i| ids[i]).collect();

            let centroid = centroid_of(&member_indices, &vectors);
            let representatives =
                representatives_of(&member_indices, &vectors, &ids, &centroid, self.config.max_representatives);

            let label = format!("Group {}", cluster + 1);
            let cluster_row_id = self.db.insert_cluster(
                run_id,
                CLUSTER_TYPE_SEMANTIC,
                &centroid,
                &member_ids,
                &representatives,
                Some(&label),
            )?;

            clustered += member_ids.len();
            for media_id in member_ids {
                assignments.push((media_id, cluster_row_id));
            }
        }

        // Reconcile back-references wholesale: members point at their new
        // cluster, everyone else (noise included) is cleared.
        self.db.apply_cluster_assignments(&assignments)?;

        let summary = ClusterRunSummary {
            run_id: Some(run_id),
            clusters: cluster_count,
            clustered,
            noise: total - clustered,
            total,
        };
        info!(
            run_id,
            clusters = summary.clusters,
            clustered = summary.clustered,
            noise = summary.noise,
            "Clustering run complete"
        );
        Ok(summary)
    }
}

/// Cosine distance in [0, 2].
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Plain DBSCAN over cosine distance. `min_points` counts the point itself.
/// Returns `Some(cluster)` per point or `None` for noise. Deterministic:
/// points are visited in input order and neighborhoods expand in input
/// order, so identical inputs and parameters always produce identical
/// labels.
fn dbscan(vectors: &[&[f32]], epsilon: f32, min_points: usize) -> Vec<Option<usize>> {
    let n = vectors.len();
    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut visited = vec![false; n];
    let mut next_cluster = 0usize;

    let neighbors = |i: usize| -> Vec<usize> {
        (0..n)
            .filter(|&j| cosine_distance(vectors[i], vectors[j]) <= epsilon)
            .collect()
    };

    for i in 0..n {
        if visited[i] {
            continue;
        }
        visited[i] = true;

        let seed = neighbors(i);
        if seed.len() < min_points {
            continue; // noise unless later absorbed by a core point
        }

        let cluster = next_cluster;
        next_cluster += 1;
        labels[i] = Some(cluster);

        let mut frontier = seed;
        let mut cursor = 0;
        while cursor < frontier.len() {
            let j = frontier[cursor];
            cursor += 1;

            if labels[j].is_none() {
                labels[j] = Some(cluster);
            }
            if visited[j] {
                continue;
            }
            visited[j] = true;

            let reach = neighbors(j);
            if reach.len() >= min_points {
                // j is a core point: its neighborhood joins the frontier
                for q in reach {
                    if !frontier.contains(&q) {
                        frontier.push(q);
                    }
                }
            }
        }
    }

    labels
}

/// Normalized mean of the member vectors.
fn centroid_of(member_indices: &[usize], vectors: &[&[f32]]) -> Vec<f32> {
    let dim = member_indices
        .first()
        .map(|&i| vectors[i].len())
        .unwrap_or(0);
    let mut centroid = vec![0.0f32; dim];
    for &i in member_indices {
        for (c, v) in centroid.iter_mut().zip(vectors[i]) {
            *c += v;
        }
    }
    let count = member_indices.len() as f32;
    for c in &mut centroid {
        *c /= count;
    }
    let norm: f32 = centroid.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for c in &mut centroid {
            *c /= norm;
        }
    }
    centroid
}

/// Up to `limit` member ids nearest the centroid, as display samples.
fn representatives_of(
    member_indices: &[usize],
    vectors: &[&[f32]],
    ids: &[i64],
    centroid: &[f32],
    limit: usize,
) -> Vec<i64> {
    let mut by_distance: Vec<(f32, i64)> = member_indices
        .iter()
        .map(|&i| (cosine_distance(vectors[i], centroid), ids[i]))
        .collect();
    by_distance.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
    by_distance.into_iter().take(limit).map(|(_, id)| id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_db, MediaStatus};

    fn engine(db: Arc<Database>) -> ClusteringEngine {
        ClusteringEngine::new(
            db,
            ClusteringConfig {
                min_cluster_size: 2,
                epsilon: 0.1,
                max_representatives: 3,
                auto_interval_secs: None,
            },
        )
    }

    fn indexed_media(db: &Database, hash: &str, embedding: &[f32]) -> i64 {
        let id = db
            .create_media(hash, "k", "f.jpg", None, None, None)
            .unwrap()
            .unwrap();
        db.upsert_embedding(id, embedding).unwrap();
        db.set_media_status(id, MediaStatus::Indexed).unwrap();
        id
    }

    #[test]
    fn test_dbscan_two_groups_and_noise() {
        // Three near-identical A vectors, three B vectors, one outlier C
        let a = [1.0f32, 0.0, 0.0];
        let a2 = [0.99f32, 0.05, 0.0];
        let b = [0.0f32, 1.0, 0.0];
        let b2 = [0.05f32, 0.99, 0.0];
        let c = [0.0f32, 0.0, 1.0];
        let vectors: Vec<&[f32]> = vec![&a, &a2, &a, &b, &b2, &b, &c];

        let labels = dbscan(&vectors, 0.1, 2);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_eq!(labels[4], labels[5]);
        assert_ne!(labels[0], labels[3]);
        assert_eq!(labels[6], None); // C stays noise

        // Deterministic across invocations
        assert_eq!(labels, dbscan(&vectors, 0.1, 2));
    }

    #[test]
    fn test_run_persists_clusters_and_back_references() {
        let db = Arc::new(test_db());
        let a1 = indexed_media(&db, "a1", &[1.0, 0.0, 0.0]);
        let a2 = indexed_media(&db, "a2", &[0.99, 0.05, 0.0]);
        let a3 = indexed_media(&db, "a3", &[0.98, 0.0, 0.05]);
        let b1 = indexed_media(&db, "b1", &[0.0, 1.0, 0.0]);
        let b2 = indexed_media(&db, "b2", &[0.05, 0.99, 0.0]);
        let b3 = indexed_media(&db, "b3", &[0.0, 0.98, 0.05]);
        let c = indexed_media(&db, "c", &[0.0, 0.0, 1.0]);

        let engine = engine(db.clone());
        let summary = engine.run_now().unwrap();
        assert_eq!(summary.clusters, 2);
        assert_eq!(summary.clustered, 6);
        assert_eq!(summary.noise, 1);

        let clusters = db.current_clusters().unwrap();
        assert_eq!(clusters.len(), 2);
        for cluster in &clusters {
            assert!(cluster.member_ids.len() == 3);
            assert!(!cluster.representative_ids.is_empty());
            // Members carry the back-reference
            for &m in &cluster.member_ids {
                assert_eq!(db.get_media(m).unwrap().unwrap().cluster_id, Some(cluster.id));
            }
        }

        // The outlier is unassigned
        assert_eq!(db.get_media(c).unwrap().unwrap().cluster_id, None);
        let _ = (a1, a2, a3, b1, b2, b3);
    }

    #[test]
    fn test_repeated_runs_are_deterministic_snapshots() {
        let db = Arc::new(test_db());
        indexed_media(&db, "a1", &[1.0, 0.0]);
        indexed_media(&db, "a2", &[0.99, 0.05]);
        indexed_media(&db, "b1", &[0.0, 1.0]);
        indexed_media(&db, "b2", &[0.05, 0.99]);

        let engine = engine(db.clone());
        let first = engine.run_now().unwrap();
        let second = engine.run_now().unwrap();

        assert_eq!(first.clusters, second.clusters);
        assert_eq!(first.clustered, second.clustered);
        assert_ne!(first.run_id, second.run_id);

        let run1 = first.run_id.unwrap();
        let run2 = second.run_id.unwrap();
        assert_eq!(run2, run1 + 1);

        // Both runs' rows exist; membership is identical
        let current = db.current_clusters().unwrap();
        assert_eq!(current.len(), first.clusters);
    }

    #[test]
    fn test_small_corpus_is_a_noop() {
        let db = Arc::new(test_db());
        indexed_media(&db, "a1", &[1.0, 0.0]);

        let engine = engine(db.clone());
        let summary = engine.run_now().unwrap();
        assert_eq!(summary.run_id, None);
        assert_eq!(summary.clusters, 0);
        assert!(db.current_clusters().unwrap().is_empty());
    }

    #[test]
    fn test_deleted_media_leaves_next_run() {
        let db = Arc::new(test_db());
        let a1 = indexed_media(&db, "a1", &[1.0, 0.0]);
        let a2 = indexed_media(&db, "a2", &[0.99, 0.05]);
        let a3 = indexed_media(&db, "a3", &[0.98, 0.02]);

        let engine = engine(db.clone());
        let summary = engine.run_now().unwrap();
        assert_eq!(summary.clustered, 3);

        db.delete_media(a3).unwrap();
        let summary = engine.run_now().unwrap();
        assert_eq!(summary.total, 2);
        let clusters = db.current_clusters().unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].member_ids, vec![a1, a2]);
    }

    #[test]
    fn test_pending_flag_is_drained_before_returning() {
        let db = Arc::new(test_db());
        indexed_media(&db, "a1", &[1.0, 0.0]);
        indexed_media(&db, "a2", &[0.99, 0.05]);

        let engine = engine(db);
        // Flag left by a request that raced the tail end of an earlier run
        engine.pending.store(true, Ordering::SeqCst);

        let summary = match engine.request_run().unwrap() {
            RunRequest::Completed(summary) => summary,
            RunRequest::Coalesced => panic!("no run was active"),
        };
        // Both the caller's pass and the deferred one executed, and the
        // flag is consumed rather than stranded for a later trigger
        assert_eq!(summary.run_id, Some(2));
        assert!(!engine.pending.load(Ordering::SeqCst));
    }

    #[test]
    fn test_request_run_completes_when_idle() {
        let db = Arc::new(test_db());
        indexed_media(&db, "a1", &[1.0, 0.0]);
        indexed_media(&db, "a2", &[0.99, 0.05]);

        let engine = engine(db);
        match engine.request_run().unwrap() {
            RunRequest::Completed(summary) => assert_eq!(summary.clusters, 1),
            RunRequest::Coalesced => panic!("no run was active"),
        }
    }
}
