//! Upload ingestion: content hashing, dedup gate, blob write, job fan-out.
//!
//! Identity is the SHA-256 of the raw bytes, so a renamed copy of an
//! existing image is a duplicate and a one-pixel edit is a new item. The
//! blob is written before the registry row: if two uploads of the same
//! bytes race, both write the same key with identical content and exactly
//! one wins the registry insert.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::pipeline::executor::PipelineExecutor;
use crate::storage::BlobStore;

/// Per-file result of an ingest call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// New item: registered and queued for analysis.
    Uploaded,
    /// Bytes already known; no new row, no new jobs.
    Duplicate,
    /// Rejected before registration (empty or undecodable).
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub filename: String,
    pub status: UploadStatus,
    /// Registry id of the item the bytes resolve to. Present for both
    /// uploaded and duplicate outcomes, absent for failures.
    pub media_id: Option<i64>,
    pub content_hash: Option<String>,
    pub error: Option<String>,
}

impl UploadOutcome {
    fn failed(filename: &str, error: String) -> Self {
        Self {
            filename: filename.to_string(),
            status: UploadStatus::Failed,
            media_id: None,
            content_hash: None,
            error: Some(error),
        }
    }
}

pub struct Ingestor {
    db: Arc<Database>,
    store: Arc<dyn BlobStore>,
    executor: Arc<PipelineExecutor>,
}

impl Ingestor {
    pub fn new(
        db: Arc<Database>,
        store: Arc<dyn BlobStore>,
        executor: Arc<PipelineExecutor>,
    ) -> Self {
        Self { db, store, executor }
    }

    /// Ingest one file. Per-file problems are reported in the outcome, not
    /// as errors, so a batch upload never aborts halfway; `Err` is reserved
    /// for infrastructure faults (database or blob store down).
    pub fn ingest(&self, filename: &str, bytes: &[u8]) -> Result<UploadOutcome> {
        if bytes.is_empty() {
            return Ok(UploadOutcome::failed(filename, "empty file".to_string()));
        }

        let content_hash = hex_digest(bytes);

        // Cheap pre-check so a re-upload skips decode and blob I/O. The
        // authoritative dedup decision is still the insert below.
        if let Some(existing) = self.db.find_media_by_hash(&content_hash)? {
            debug!(media_id = existing, hash = %content_hash, "Duplicate upload");
            return Ok(duplicate_outcome(filename, existing, content_hash));
        }

        let image = match image::load_from_memory(bytes) {
            Ok(image) => image,
            Err(e) => {
                warn!(filename, error = %e, "Rejecting undecodable upload");
                return Ok(UploadOutcome::failed(
                    filename,
                    format!("not a decodable image: {e}"),
                ));
            }
        };
        let (width, height) = (image.width(), image.height());
        let exif_json = extract_exif(bytes);

        let storage_key = storage_key_for(&content_hash, filename);
        self.store.put(&storage_key, bytes)?;

        let media_id = match self.db.create_media(
            &content_hash,
            &storage_key,
            filename,
            Some(width),
            Some(height),
            exif_json.as_ref(),
        )? {
            Some(id) => id,
            None => {
                // Lost an insert race with a concurrent identical upload.
                // The blob write above was idempotent, nothing to undo.
                let existing = self
                    .db
                    .find_media_by_hash(&content_hash)?
                    .ok_or_else(|| anyhow::anyhow!("media vanished during ingest race"))?;
                debug!(media_id = existing, hash = %content_hash, "Lost ingest race");
                return Ok(duplicate_outcome(filename, existing, content_hash));
            }
        };

        self.executor.enqueue_all_stages(media_id)?;
        info!(media_id, hash = %content_hash, filename, "Media ingested");

        Ok(UploadOutcome {
            filename: filename.to_string(),
            status: UploadStatus::Uploaded,
            media_id: Some(media_id),
            content_hash: Some(content_hash),
            error: None,
        })
    }
}

fn duplicate_outcome(filename: &str, media_id: i64, content_hash: String) -> UploadOutcome {
    UploadOutcome {
        filename: filename.to_string(),
        status: UploadStatus::Duplicate,
        media_id: Some(media_id),
        content_hash: Some(content_hash),
        error: None,
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Blob key: two-character hash prefix fans the tree out, the full hash
/// keeps the key content-addressed, the original extension is preserved
/// for sniffing-averse tooling.
fn storage_key_for(content_hash: &str, filename: &str) -> String {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_default();
    format!("images/{}/{}{}", &content_hash[..2], content_hash, ext)
}

/// Best-effort EXIF summary. Absent or malformed EXIF is not an error;
/// most screenshots and web images carry none.
fn extract_exif(bytes: &[u8]) -> Option<serde_json::Value> {
    let reader = exif::Reader::new();
    let parsed = reader.read_from_container(&mut Cursor::new(bytes)).ok()?;

    let mut map = serde_json::Map::new();
    for (name, tag) in [("make", exif::Tag::Make), ("model", exif::Tag::Model)] {
        if let Some(field) = parsed.get_field(tag, exif::In::PRIMARY) {
            let value = field.display_value().to_string().trim_matches('"').to_string();
            if !value.is_empty() {
                map.insert(name.to_string(), serde_json::Value::String(value));
            }
        }
    }
    if let Some(field) = parsed.get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY) {
        let raw = field.display_value().to_string();
        if let Some(taken_at) = normalize_exif_datetime(&raw) {
            map.insert("taken_at".to_string(), serde_json::Value::String(taken_at));
        }
    }

    if map.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(map))
    }
}

/// EXIF dates use colon-separated fields ("2023:05:01 12:00:00"); store them
/// in RFC 3339 form so downstream consumers can sort lexically.
fn normalize_exif_datetime(raw: &str) -> Option<String> {
    let trimmed = raw.trim_matches('"').trim();
    let parsed = chrono::NaiveDateTime::parse_from_str(trimmed, "%Y:%m:%d %H:%M:%S")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S"))
        .ok()?;
    Some(parsed.format("%Y-%m-%dT%H:%M:%S").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::index::SimilarityIndex;
    use crate::storage::FsBlobStore;

    fn ingestor() -> (Ingestor, Arc<Database>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(test_db());
        let index = Arc::new(SimilarityIndex::new());
        let store = Arc::new(FsBlobStore::open(dir.path()).unwrap());
        let executor = Arc::new(PipelineExecutor::new(db.clone(), index, store.clone()));
        (Ingestor::new(db.clone(), store, executor), db, dir)
    }

    fn png_bytes(r: u8, g: u8, b: u8) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(3, 2, image::Rgb([r, g, b]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_upload_registers_and_queues() {
        let (ingestor, db, _dir) = ingestor();
        let outcome = ingestor.ingest("sunset.png", &png_bytes(200, 80, 10)).unwrap();

        assert_eq!(outcome.status, UploadStatus::Uploaded);
        let id = outcome.media_id.unwrap();
        let media = db.get_media(id).unwrap().unwrap();
        assert_eq!(media.width, Some(3));
        assert_eq!(media.height, Some(2));
        assert!(media.storage_key.ends_with(".png"));
        assert!(media.storage_key.starts_with("images/"));
        // One job per stage
        assert_eq!(db.count_queued_jobs().unwrap(), 5);
    }

    #[test]
    fn test_second_upload_is_duplicate() {
        let (ingestor, db, _dir) = ingestor();
        let bytes = png_bytes(1, 2, 3);

        let first = ingestor.ingest("a.png", &bytes).unwrap();
        let second = ingestor.ingest("renamed-copy.png", &bytes).unwrap();

        assert_eq!(second.status, UploadStatus::Duplicate);
        assert_eq!(second.media_id, first.media_id);
        assert_eq!(db.count_media().unwrap(), 1);
        // No extra jobs for the duplicate
        assert_eq!(db.count_queued_jobs().unwrap(), 5);
    }

    #[test]
    fn test_different_bytes_are_distinct() {
        let (ingestor, db, _dir) = ingestor();
        let a = ingestor.ingest("a.png", &png_bytes(1, 2, 3)).unwrap();
        let b = ingestor.ingest("b.png", &png_bytes(3, 2, 1)).unwrap();

        assert_eq!(a.status, UploadStatus::Uploaded);
        assert_eq!(b.status, UploadStatus::Uploaded);
        assert_ne!(a.content_hash, b.content_hash);
        assert_eq!(db.count_media().unwrap(), 2);
    }

    #[test]
    fn test_rejects_empty_and_garbage() {
        let (ingestor, db, _dir) = ingestor();

        let empty = ingestor.ingest("empty.png", &[]).unwrap();
        assert_eq!(empty.status, UploadStatus::Failed);

        let garbage = ingestor.ingest("notes.txt", b"not an image at all").unwrap();
        assert_eq!(garbage.status, UploadStatus::Failed);
        assert!(garbage.error.is_some());

        // Nothing registered, nothing queued
        assert_eq!(db.count_media().unwrap(), 0);
        assert_eq!(db.count_queued_jobs().unwrap(), 0);
    }

    #[test]
    fn test_exif_datetime_normalized() {
        assert_eq!(
            normalize_exif_datetime("2023:05:01 12:30:00").as_deref(),
            Some("2023-05-01T12:30:00")
        );
        assert_eq!(normalize_exif_datetime("yesterday"), None);
    }

    #[test]
    fn test_storage_key_shape() {
        let hash = "ab".to_string() + &"0".repeat(62);
        assert_eq!(
            storage_key_for(&hash, "IMG_001.JPG"),
            format!("images/ab/{}.jpg", hash)
        );
        assert_eq!(storage_key_for(&hash, "noext"), format!("images/ab/{}", hash));
    }
}
