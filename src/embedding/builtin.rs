//! Deterministic feature-hashing backbones. They produce honest, stable
//! similarity within a modality (shared tokens, similar palettes, similar
//! energy envelopes) without any learned weights; real model backends plug
//! in through the same trait.

use sha2::{Digest, Sha256};

use crate::{
    embedding::EmbeddingModel,
    media::{RgbImage, Waveform},
    state::AppResult,
};

/// Maps a feature key to an output bucket and a sign, both stable across
/// runs and platforms.
fn hashed_bucket(seed: &str, key: &str, dim: usize) -> (usize, f32) {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(b"/");
    hasher.update(key.as_bytes());
    let hash = hasher.finalize();

    let bucket = u64::from_le_bytes(hash[..8].try_into().expect("hash has 8 bytes")) as usize
        % dim.max(1);
    let sign = if hash[8] & 1 == 0 { 1.0 } else { -1.0 };
    (bucket, sign)
}

pub(crate) fn hash_text_features(text: &str, dim: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; dim];
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let token = token.to_lowercase();
        let (bucket, sign) = hashed_bucket("text", &token, dim);
        out[bucket] += sign;
    }
    out
}

pub struct BuiltinVisualModel {
    dim: usize,
    batch: usize,
}

impl BuiltinVisualModel {
    pub fn new(dim: usize, batch: usize) -> Self {
        Self { dim, batch }
    }
}

impl EmbeddingModel for BuiltinVisualModel {
    fn name(&self) -> &str {
        "builtin-visual"
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn preferred_batch(&self) -> usize {
        self.batch
    }

    fn embed_texts(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| hash_text_features(text, self.dim))
            .collect())
    }

    fn embed_image(&self, image: &RgbImage) -> AppResult<Vec<f32>> {
        let mut out = vec![0.0f32; self.dim];
        let pixel_count = (image.pixels.len() / 3).max(1) as f32;

        // 4x4x4 color histogram plus a 16-bin luminance histogram.
        let mut color_bins = [0.0f32; 64];
        let mut luma_bins = [0.0f32; 16];
        for pixel in image.pixels.chunks_exact(3) {
            let (r, g, b) = (pixel[0] as usize, pixel[1] as usize, pixel[2] as usize);
            color_bins[(r / 64) * 16 + (g / 64) * 4 + (b / 64)] += 1.0;
            let luma = 0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32;
            luma_bins[(luma as usize / 16).min(15)] += 1.0;
        }

        for (i, value) in color_bins.iter().enumerate() {
            if *value > 0.0 {
                let (bucket, sign) = hashed_bucket("img-color", &i.to_string(), self.dim);
                out[bucket] += sign * value / pixel_count;
            }
        }
        for (i, value) in luma_bins.iter().enumerate() {
            if *value > 0.0 {
                let (bucket, sign) = hashed_bucket("img-luma", &i.to_string(), self.dim);
                out[bucket] += sign * value / pixel_count;
            }
        }
        Ok(out)
    }
}

pub struct BuiltinAudioModel {
    dim: usize,
    batch: usize,
}

impl BuiltinAudioModel {
    pub fn new(dim: usize, batch: usize) -> Self {
        Self { dim, batch }
    }
}

impl EmbeddingModel for BuiltinAudioModel {
    fn name(&self) -> &str {
        "builtin-audio"
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn preferred_batch(&self) -> usize {
        self.batch
    }

    fn embed_audio(&self, waveform: &Waveform) -> AppResult<Vec<f32>> {
        let mut out = vec![0.0f32; self.dim];
        let samples = &waveform.samples;
        if samples.is_empty() {
            return Ok(out);
        }

        // Energy envelope and zero-crossing profile over 32 windows each;
        // quantized so nearby envelopes hash to the same buckets.
        let window = (samples.len() / 32).max(1);
        for (i, chunk) in samples.chunks(window).take(32).enumerate() {
            let rms =
                (chunk.iter().map(|s| s * s).sum::<f32>() / chunk.len() as f32).sqrt();
            let level = (rms * 20.0).round() as i32;
            let (bucket, sign) = hashed_bucket("audio-rms", &format!("{i}:{level}"), self.dim);
            out[bucket] += sign;

            let crossings = chunk
                .windows(2)
                .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
                .count();
            let rate = ((crossings as f32 / chunk.len() as f32) * 40.0).round() as i32;
            let (bucket, sign) = hashed_bucket("audio-zcr", &format!("{i}:{rate}"), self.dim);
            out[bucket] += sign;
        }
        Ok(out)
    }
}
