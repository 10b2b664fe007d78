//! Durable at-least-once job queue.
//!
//! One row per unit of work binding a media id to a stage. A partial unique
//! index guarantees at most one non-terminal job per (media, stage), making
//! enqueue idempotent while work is in flight. Claimed jobs carry a lease;
//! a started job whose lease expires is presumed abandoned and requeued by
//! the liveness sweep.

use anyhow::Result;
use rusqlite::params;

use super::Database;
use crate::pipeline::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "started" => Some(JobStatus::Started),
            "finished" => Some(JobStatus::Finished),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub media_id: i64,
    pub stage: Stage,
    pub status: JobStatus,
    pub attempt_count: i64,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
}

/// Outcome of `fail_job`: either the job went back to the queue for another
/// attempt, or its retries are exhausted and the stage is permanently failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    Requeued {
        attempt_count: i64,
    },
    Exhausted {
        job_id: i64,
        media_id: i64,
        stage: Stage,
    },
}

const JOB_COLUMNS: &str =
    "id, media_id, stage, status, attempt_count, error, created_at, started_at, ended_at";

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let stage_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    Ok(Job {
        id: row.get(0)?,
        media_id: row.get(1)?,
        stage: Stage::parse(&stage_str).unwrap_or(Stage::Embedding),
        status: JobStatus::parse(&status_str).unwrap_or(JobStatus::Failed),
        attempt_count: row.get(4)?,
        error: row.get(5)?,
        created_at: row.get(6)?,
        started_at: row.get(7)?,
        ended_at: row.get(8)?,
    })
}

impl Database {
    /// Enqueue a (media, stage) job. If a non-terminal job for the pair
    /// already exists this is a no-op returning the existing job id.
    pub fn enqueue_job(&self, media_id: i64, stage: Stage) -> Result<i64> {
        let conn = self.conn();
        let changed = conn.execute(
            r#"
            INSERT INTO jobs (media_id, stage, status)
            VALUES (?, ?, 'queued')
            ON CONFLICT(media_id, stage) WHERE status IN ('queued', 'started') DO NOTHING
            "#,
            params![media_id, stage.as_str()],
        )?;

        if changed > 0 {
            return Ok(conn.last_insert_rowid());
        }

        let existing = conn.query_row(
            r#"
            SELECT id FROM jobs
            WHERE media_id = ? AND stage = ? AND status IN ('queued', 'started')
            "#,
            params![media_id, stage.as_str()],
            |row| row.get(0),
        )?;
        Ok(existing)
    }

    /// Claim the oldest queued job, moving it to `started` with a lease of
    /// `lease_secs`. Returns `None` when the queue is empty; callers poll.
    pub fn claim_job(&self, lease_secs: i64) -> Result<Option<Job>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM jobs WHERE status = 'queued' ORDER BY id LIMIT 1",
            JOB_COLUMNS
        );
        let candidate = match conn.query_row(&sql, [], job_from_row) {
            Ok(job) => job,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        conn.execute(
            r#"
            UPDATE jobs
            SET status = 'started',
                started_at = CURRENT_TIMESTAMP,
                lease_expires_at = datetime('now', printf('%+d seconds', ?))
            WHERE id = ?
            "#,
            params![lease_secs, candidate.id],
        )?;

        Ok(Some(Job {
            status: JobStatus::Started,
            ..candidate
        }))
    }

    /// Terminal success transition.
    pub fn finish_job(&self, job_id: i64) -> Result<()> {
        self.conn().execute(
            r#"
            UPDATE jobs
            SET status = 'finished', error = NULL, ended_at = CURRENT_TIMESTAMP,
                lease_expires_at = NULL
            WHERE id = ?
            "#,
            [job_id],
        )?;
        Ok(())
    }

    /// Record a failed attempt. Below the retry ceiling the job goes back to
    /// `queued`; at the ceiling it is permanently failed and the caller must
    /// notify the pipeline executor.
    pub fn fail_job(&self, job_id: i64, error: &str, max_attempts: i64) -> Result<JobFailure> {
        let conn = self.conn();
        let (media_id, stage_str, attempts): (i64, String, i64) = conn.query_row(
            "SELECT media_id, stage, attempt_count FROM jobs WHERE id = ?",
            [job_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let stage = Stage::parse(&stage_str).unwrap_or(Stage::Embedding);
        let attempts = attempts + 1;

        if attempts < max_attempts {
            conn.execute(
                r#"
                UPDATE jobs
                SET status = 'queued', attempt_count = ?, error = ?, lease_expires_at = NULL
                WHERE id = ?
                "#,
                params![attempts, error, job_id],
            )?;
            Ok(JobFailure::Requeued {
                attempt_count: attempts,
            })
        } else {
            conn.execute(
                r#"
                UPDATE jobs
                SET status = 'failed', attempt_count = ?, error = ?,
                    ended_at = CURRENT_TIMESTAMP, lease_expires_at = NULL
                WHERE id = ?
                "#,
                params![attempts, error, job_id],
            )?;
            Ok(JobFailure::Exhausted {
                job_id,
                media_id,
                stage,
            })
        }
    }

    /// Liveness sweep: requeue started jobs whose lease has expired. The
    /// expiry counts as an attempt, so a job that keeps killing workers still
    /// hits the retry ceiling. Returns the jobs whose retries the sweep
    /// exhausted, for executor notification.
    pub fn requeue_expired_jobs(&self, max_attempts: i64) -> Result<Vec<JobFailure>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT id FROM jobs
            WHERE status = 'started' AND datetime(lease_expires_at) <= datetime('now')
            ORDER BY id
            "#,
        )?;
        let expired: Vec<i64> = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(conn);

        let mut exhausted = Vec::new();
        for job_id in expired {
            tracing::warn!(job_id, "Worker lease expired, requeueing job");
            let error = crate::error::PipelineError::WorkerLeaseExpired(job_id).to_string();
            let failure = self.fail_job(job_id, &error, max_attempts)?;
            if matches!(failure, JobFailure::Exhausted { .. }) {
                exhausted.push(failure);
            }
        }
        Ok(exhausted)
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let result = self.conn().query_row(&sql, [job_id], job_from_row);
        match result {
            Ok(job) => Ok(Some(job)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Latest job per stage for a media item, for status/audit queries.
    pub fn jobs_for_media(&self, media_id: i64) -> Result<Vec<Job>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM jobs WHERE media_id = ? ORDER BY id",
            JOB_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map([media_id], job_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(jobs)
    }

    /// Status of the most recent job for a (media, stage) pair.
    pub fn stage_job_status(&self, media_id: i64, stage: Stage) -> Result<Option<JobStatus>> {
        let result = self.conn().query_row(
            r#"
            SELECT status FROM jobs
            WHERE media_id = ? AND stage = ?
            ORDER BY id DESC LIMIT 1
            "#,
            params![media_id, stage.as_str()],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(s) => Ok(JobStatus::parse(&s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn count_queued_jobs(&self) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM jobs WHERE status IN ('queued', 'started')",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::db::Database;

    fn media(db: &Database, hash: &str) -> i64 {
        db.create_media(hash, "k", "f.jpg", None, None, None)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_enqueue_is_idempotent_while_in_flight() {
        let db = test_db();
        let m = media(&db, "h1");

        let first = db.enqueue_job(m, Stage::Caption).unwrap();
        let second = db.enqueue_job(m, Stage::Caption).unwrap();
        assert_eq!(first, second);

        // Still the same job after it is claimed
        let claimed = db.claim_job(600).unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(db.enqueue_job(m, Stage::Caption).unwrap(), first);

        // After the job finishes, a new one may be created
        db.finish_job(first).unwrap();
        let third = db.enqueue_job(m, Stage::Caption).unwrap();
        assert_ne!(third, first);
    }

    #[test]
    fn test_claim_transitions_and_drains_queue() {
        let db = test_db();
        let m = media(&db, "h1");
        db.enqueue_job(m, Stage::Detection).unwrap();
        db.enqueue_job(m, Stage::Embedding).unwrap();

        let a = db.claim_job(600).unwrap().unwrap();
        assert_eq!(a.status, JobStatus::Started);
        let b = db.claim_job(600).unwrap().unwrap();
        assert_ne!(a.id, b.id);
        assert!(db.claim_job(600).unwrap().is_none());
    }

    #[test]
    fn test_fail_requeues_until_ceiling() {
        let db = test_db();
        let m = media(&db, "h1");
        let id = db.enqueue_job(m, Stage::Embedding).unwrap();

        let claimed = db.claim_job(600).unwrap().unwrap();
        assert_eq!(claimed.id, id);
        let outcome = db.fail_job(id, "inference crashed", 3).unwrap();
        assert_eq!(outcome, JobFailure::Requeued { attempt_count: 1 });

        // Second and third attempts
        db.claim_job(600).unwrap().unwrap();
        db.fail_job(id, "inference crashed", 3).unwrap();
        db.claim_job(600).unwrap().unwrap();
        let outcome = db.fail_job(id, "inference crashed", 3).unwrap();
        assert_eq!(
            outcome,
            JobFailure::Exhausted {
                job_id: id,
                media_id: m,
                stage: Stage::Embedding
            }
        );

        let job = db.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 3);
        assert!(db.claim_job(600).unwrap().is_none());
    }

    #[test]
    fn test_expired_lease_requeues_job() {
        let db = test_db();
        let m = media(&db, "h1");
        let id = db.enqueue_job(m, Stage::Ocr).unwrap();

        // Negative lease: expired the moment it is claimed
        db.claim_job(-5).unwrap().unwrap();
        assert!(db.claim_job(-5).unwrap().is_none());

        let exhausted = db.requeue_expired_jobs(3).unwrap();
        assert!(exhausted.is_empty());

        let job = db.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 1);
        assert!(job.error.unwrap().contains("lease expired"));
    }

    #[test]
    fn test_expiry_sweep_reports_exhausted_jobs() {
        let db = test_db();
        let m = media(&db, "h1");
        let id = db.enqueue_job(m, Stage::Embedding).unwrap();

        db.claim_job(-5).unwrap().unwrap();
        let exhausted = db.requeue_expired_jobs(1).unwrap();
        assert_eq!(
            exhausted,
            vec![JobFailure::Exhausted {
                job_id: id,
                media_id: m,
                stage: Stage::Embedding
            }]
        );
    }
}
