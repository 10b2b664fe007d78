//! Model inference boundary.
//!
//! Every analysis stage calls a black-box function from image bytes to a
//! stage result. Implementations are swapped without touching orchestration:
//! the worker pool only ever sees this trait, passed in as a shared handle
//! rather than reached through globals.

use anyhow::Result;

use super::{Detection, FaceVector, OcrOutput};

pub trait StageModels: Send + Sync {
    fn detect_objects(&self, image: &[u8]) -> Result<Vec<Detection>>;
    fn caption(&self, image: &[u8]) -> Result<String>;
    fn extract_text(&self, image: &[u8]) -> Result<OcrOutput>;
    fn embed_faces(&self, image: &[u8]) -> Result<Vec<FaceVector>>;

    /// Semantic embedding of the full image; the vector that gates `indexed`.
    fn embed_image(&self, image: &[u8]) -> Result<Vec<f32>>;

    /// Encode a free-text query into the same embedding space. Search calls
    /// this before hitting the similarity index.
    fn embed_text(&self, text: &str) -> Result<Vec<f32>>;
}

/// Baseline models that need no neural network: the image embedding is a
/// downsampled color signature and text queries are hashed bags of words.
/// Enrichment stages return empty results. Useful for wiring the pipeline
/// end-to-end before real model handles are plugged in; not a substitute
/// for CLIP-quality search.
pub struct BaselineModels {
    dim: usize,
}

impl BaselineModels {
    const GRID: u32 = 4;

    pub fn new() -> Self {
        // 4x4 grid of RGB means
        Self {
            dim: (Self::GRID * Self::GRID * 3) as usize,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl Default for BaselineModels {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

impl StageModels for BaselineModels {
    fn detect_objects(&self, _image: &[u8]) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }

    fn caption(&self, _image: &[u8]) -> Result<String> {
        Ok(String::new())
    }

    fn extract_text(&self, _image: &[u8]) -> Result<OcrOutput> {
        Ok(OcrOutput::default())
    }

    fn embed_faces(&self, _image: &[u8]) -> Result<Vec<FaceVector>> {
        Ok(Vec::new())
    }

    fn embed_image(&self, image: &[u8]) -> Result<Vec<f32>> {
        let img = image::load_from_memory(image)?;
        let small = img
            .resize_exact(
                Self::GRID,
                Self::GRID,
                image::imageops::FilterType::Triangle,
            )
            .to_rgb8();

        let mut v = Vec::with_capacity(self.dim);
        for pixel in small.pixels() {
            v.push(pixel.0[0] as f32 / 255.0);
            v.push(pixel.0[1] as f32 / 255.0);
            v.push(pixel.0[2] as f32 / 255.0);
        }
        Ok(normalize(v))
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        use sha2::{Digest, Sha256};

        // Each token lights up a stable bucket; same words, same vector.
        let mut v = vec![0.0f32; self.dim];
        for token in text.split_whitespace() {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u16::from_le_bytes([digest[0], digest[1]]) as usize % self.dim;
            v[bucket] += 1.0;
        }
        Ok(normalize(v))
    }
}
