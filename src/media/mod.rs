pub mod ffmpeg;
pub mod filter;
pub mod preprocess;

#[cfg(test)]
pub mod mock;

use std::path::Path;

use crate::state::AppResult;

/// Decoded RGB24 pixels, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct RgbImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RgbImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> AppResult<Self> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(crate::state::AppError::Codec(format!(
                "decoded frame is {} bytes, expected {expected} for {width}x{height} rgb24",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }
}

/// Mono PCM samples at a known rate.
#[derive(Debug, Clone)]
pub struct Waveform {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl Waveform {
    pub fn duration_s(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImageProbe {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct VideoProbe {
    pub duration_s: f64,
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct AudioProbe {
    pub duration_s: f64,
    pub sample_rate: u32,
    pub channels: u32,
    pub bit_rate: Option<u64>,
}

/// Seam for the external media-decoding library. The shipped implementation
/// drives the ffmpeg executables; anything able to satisfy these calls can
/// replace it.
pub trait MediaDecoder: Send + Sync {
    fn probe_image(&self, path: &Path) -> AppResult<ImageProbe>;

    /// Decodes to RGB, downscaling so the long side stays within
    /// `max_long_side` while preserving aspect ratio.
    fn decode_image(&self, path: &Path, max_long_side: u32) -> AppResult<RgbImage>;

    fn probe_video(&self, path: &Path) -> AppResult<VideoProbe>;

    /// Scene-change timestamps in seconds, strictly inside `(0, within_s)`,
    /// ascending.
    fn detect_scenes(&self, path: &Path, within_s: f64) -> AppResult<Vec<f64>>;

    /// One decoded frame per requested timestamp.
    fn sample_frames(
        &self,
        path: &Path,
        timestamps: &[f64],
        max_long_side: u32,
    ) -> AppResult<Vec<RgbImage>>;

    /// JPEG thumbnail bytes; for videos `at_s` picks the frame.
    fn thumbnail(&self, path: &Path, at_s: Option<f64>, size: u32) -> AppResult<Vec<u8>>;
}

/// Seam for the external audio-loading library.
pub trait AudioLoader: Send + Sync {
    fn probe_audio(&self, path: &Path) -> AppResult<AudioProbe>;

    /// Mono samples resampled to `sample_rate`.
    fn load_mono(&self, path: &Path, sample_rate: u32) -> AppResult<Waveform>;

    /// Resample + mono-mix straight to a file, for the content store.
    fn transcode_mono(&self, path: &Path, sample_rate: u32, dest: &Path) -> AppResult<()>;
}

/// Scaled dimensions preserving aspect ratio with the long side capped.
pub fn capped_dimensions(width: u32, height: u32, max_long_side: u32) -> (u32, u32) {
    let long = width.max(height);
    if long <= max_long_side || long == 0 {
        return (width, height);
    }
    let scale = max_long_side as f64 / long as f64;
    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    (w, h)
}
