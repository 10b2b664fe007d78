//! Analysis stage definitions and per-stage result payloads.

pub mod executor;
pub mod models;
pub mod worker;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One independent analysis step applied to a media item.
///
/// The four enrichment stages are best-effort: their failure is recorded per
/// stage but never fails the media. Only the semantic embedding stage gates
/// the `indexed` status, because search and clustering cannot function
/// without a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detection,
    Caption,
    Ocr,
    Faces,
    Embedding,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Detection,
        Stage::Caption,
        Stage::Ocr,
        Stage::Faces,
        Stage::Embedding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Detection => "detection",
            Stage::Caption => "caption",
            Stage::Ocr => "ocr",
            Stage::Faces => "faces",
            Stage::Embedding => "embedding",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "detection" => Some(Stage::Detection),
            "caption" => Some(Stage::Caption),
            "ocr" => Some(Stage::Ocr),
            "faces" => Some(Stage::Faces),
            "embedding" => Some(Stage::Embedding),
            _ => None,
        }
    }

    /// Whether this stage must succeed before a media item can be indexed.
    pub fn is_mandatory(&self) -> bool {
        matches!(self, Stage::Embedding)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected object with class label, confidence and normalized bbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: String,
    pub confidence: f32,
    /// [x, y, width, height] in normalized image coordinates.
    pub bbox: [f32; 4],
}

/// A block of recognized text with its location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

/// Full OCR output: concatenated text plus positioned blocks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrOutput {
    pub text: String,
    pub blocks: Vec<TextBlock>,
}

/// A detected face and its embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceVector {
    pub bbox: [f32; 4],
    pub embedding: Vec<f32>,
}

/// Typed per-stage output, stored in `media.stage_results` keyed by stage
/// name. The embedding stage is absent here: its vector goes to the
/// embedding store instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageResult {
    Detection { objects: Vec<Detection> },
    Caption { caption: String },
    Ocr { output: OcrOutput },
    Faces { faces: Vec<FaceVector> },
}

/// Stored record for one stage: its latest result and/or error message.
/// A successful re-run clears a previously stored error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<StageResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Stage name -> record map persisted as JSON on the media row.
/// BTreeMap keeps serialization stable.
pub type StageResults = BTreeMap<String, StageRecord>;

/// What a worker produced for one job.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    Result(StageResult),
    Embedding(Vec<f32>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("thumbnails"), None);
    }

    #[test]
    fn test_only_embedding_is_mandatory() {
        let mandatory: Vec<Stage> = Stage::ALL
            .into_iter()
            .filter(Stage::is_mandatory)
            .collect();
        assert_eq!(mandatory, vec![Stage::Embedding]);
    }

    #[test]
    fn test_stage_result_tagged_serialization() {
        let result = StageResult::Caption {
            caption: "a dog on a beach".to_string(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["kind"], "caption");

        let back: StageResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_stage_record_skips_empty_fields() {
        let record = StageRecord {
            result: None,
            error: Some("inference timed out".to_string()),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("result"));
        assert!(json.contains("inference timed out"));
    }
}
