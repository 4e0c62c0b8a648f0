use std::{path::Path, sync::Arc};

use tracing::debug;

use crate::{
    config::{AudioConfig, ImageConfig, VideoConfig},
    media::{AudioLoader, MediaDecoder, RgbImage, VideoProbe, Waveform},
    state::AppResult,
    store::segments::SegmentSpan,
};

/// Inputs past either bound are indexed only over their head; playback is
/// unaffected, this is an indexing-cost policy.
const OVERSIZE_BYTES: u64 = 3 * 1024 * 1024 * 1024;
const OVERSIZE_SECS: f64 = 30.0 * 60.0;
const TRUNCATED_INDEX_SECS: f64 = 5.0 * 60.0;

#[derive(Debug, Clone)]
pub struct VideoPlan {
    pub short: bool,
    /// Seconds actually indexed when the oversize policy applied.
    pub truncated_after: Option<f64>,
    pub spans: Vec<SegmentSpan>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioClass {
    Music,
    Speech,
    Mixed,
    Silence,
    Unknown,
}

impl AudioClass {
    pub fn name(&self) -> &'static str {
        match self {
            AudioClass::Music => "music",
            AudioClass::Speech => "speech",
            AudioClass::Mixed => "mixed",
            AudioClass::Silence => "silence",
            AudioClass::Unknown => "unknown",
        }
    }
}

pub struct Preprocessor {
    decoder: Arc<dyn MediaDecoder>,
    audio: Arc<dyn AudioLoader>,
    image_cfg: ImageConfig,
    video_cfg: VideoConfig,
    audio_cfg: AudioConfig,
}

impl Preprocessor {
    pub fn new(
        decoder: Arc<dyn MediaDecoder>,
        audio: Arc<dyn AudioLoader>,
        image_cfg: ImageConfig,
        video_cfg: VideoConfig,
        audio_cfg: AudioConfig,
    ) -> Self {
        Self {
            decoder,
            audio,
            image_cfg,
            video_cfg,
            audio_cfg,
        }
    }

    pub fn decoder(&self) -> &Arc<dyn MediaDecoder> {
        &self.decoder
    }

    pub fn audio_loader(&self) -> &Arc<dyn AudioLoader> {
        &self.audio
    }

    pub fn decode_image(&self, path: &Path) -> AppResult<RgbImage> {
        self.decoder.decode_image(path, self.image_cfg.max_long_side)
    }

    pub fn thumbnail(&self, path: &Path, at_s: Option<f64>) -> AppResult<Vec<u8>> {
        self.decoder.thumbnail(path, at_s, self.image_cfg.thumb_size)
    }

    pub fn audio_artifact_tag(&self) -> String {
        format!("audio_resample_{}k_mono", self.audio_cfg.sample_rate / 1000)
    }

    /// Splits a video into the segments that get one embedding each.
    ///
    /// At or under the short boundary the whole clip is one full-video
    /// segment and no scene detection runs at all. Longer inputs are cut at
    /// scene changes, then any stretch over the cap is subdivided evenly;
    /// the spans always partition [0, indexed duration) exactly.
    pub fn plan_video(
        &self,
        path: &Path,
        probe: &VideoProbe,
        size_bytes: u64,
    ) -> AppResult<VideoPlan> {
        let duration = probe.duration_s;

        if duration <= self.video_cfg.short_max_s {
            return Ok(VideoPlan {
                short: true,
                truncated_after: None,
                spans: vec![SegmentSpan {
                    idx: 0,
                    start_s: 0.0,
                    end_s: duration,
                    full_video: true,
                }],
            });
        }

        let oversized = size_bytes > OVERSIZE_BYTES || duration > OVERSIZE_SECS;
        let indexed = if oversized {
            TRUNCATED_INDEX_SECS.min(duration)
        } else {
            duration
        };

        let scenes = self.decoder.detect_scenes(path, indexed)?;
        let mut boundaries = Vec::with_capacity(scenes.len() + 2);
        boundaries.push(0.0);
        boundaries.extend(scenes.into_iter().filter(|t| *t > 0.0 && *t < indexed));
        boundaries.push(indexed);

        let spans = subdivide(&boundaries, self.video_cfg.segment_max_s);
        debug!(
            "planned {} segments for {path:?} ({duration:.1}s{})",
            spans.len(),
            if oversized { ", truncated" } else { "" }
        );

        Ok(VideoPlan {
            short: false,
            truncated_after: oversized.then_some(indexed),
            spans,
        })
    }

    /// Evenly bounded spans over a standalone audio file. Short audio never
    /// reaches this point, the noise filter drops it first.
    pub fn plan_audio(&self, duration_s: f64) -> Vec<SegmentSpan> {
        subdivide(&[0.0, duration_s], self.audio_cfg.segment_max_s)
    }

    pub fn load_audio(&self, path: &Path) -> AppResult<Waveform> {
        self.audio.load_mono(path, self.audio_cfg.sample_rate)
    }

    pub fn transcode_audio(&self, path: &Path, dest: &Path) -> AppResult<()> {
        self.audio
            .transcode_mono(path, self.audio_cfg.sample_rate, dest)
    }

    /// Coarse class label from signal statistics. Observability only; the
    /// embedding path is identical for every class.
    pub fn classify_audio(waveform: &Waveform) -> AudioClass {
        let samples = &waveform.samples;
        if waveform.duration_s() < 0.1 {
            return AudioClass::Unknown;
        }

        let rms = (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
        if rms < 0.004 {
            return AudioClass::Silence;
        }

        let crossings = samples
            .windows(2)
            .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
            .count();
        let zcr = crossings as f32 / samples.len() as f32;

        // Energy variation across 50ms windows; speech pauses make it spiky.
        let window = (waveform.sample_rate as usize / 20).max(1);
        let energies: Vec<f32> = samples
            .chunks(window)
            .map(|chunk| (chunk.iter().map(|s| s * s).sum::<f32>() / chunk.len() as f32).sqrt())
            .collect();
        let mean = energies.iter().sum::<f32>() / energies.len() as f32;
        let variance = energies.iter().map(|e| (e - mean).powi(2)).sum::<f32>()
            / energies.len() as f32;
        let spread = if mean > f32::EPSILON {
            variance.sqrt() / mean
        } else {
            0.0
        };

        match (spread > 0.8, zcr > 0.02) {
            (true, true) => AudioClass::Speech,
            (false, _) => AudioClass::Music,
            (true, false) => AudioClass::Mixed,
        }
    }
}

/// Cuts `[boundaries[0], boundaries[last])` into spans at the given
/// boundaries, further splitting any span longer than `max_len` into equal
/// parts. The output partitions the input range exactly.
fn subdivide(boundaries: &[f64], max_len: f64) -> Vec<SegmentSpan> {
    let mut spans = Vec::new();
    let mut idx = 0;
    for pair in boundaries.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let len = b - a;
        if len <= 0.0 {
            continue;
        }
        let pieces = (len / max_len).ceil().max(1.0) as i64;
        let step = len / pieces as f64;
        for i in 0..pieces {
            let start = a + i as f64 * step;
            let end = if i == pieces - 1 { b } else { a + (i + 1) as f64 * step };
            spans.push(SegmentSpan {
                idx,
                start_s: start,
                end_s: end,
                full_video: false,
            });
            idx += 1;
        }
    }
    spans
}
