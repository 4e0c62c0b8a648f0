use crate::{
    config::{AudioConfig, NoiseFilterConfig},
    media::{AudioProbe, ImageProbe, VideoProbe},
};

/// Outcome of a cheap pre-embedding predicate. A rejected file is recorded
/// as `skipped` with the reason and never reaches a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
}

impl Verdict {
    pub fn reject(reason: impl Into<String>) -> Self {
        Verdict::Reject(reason.into())
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

pub struct NoiseFilter {
    thresholds: NoiseFilterConfig,
    audio_min_duration_s: f64,
}

impl NoiseFilter {
    pub fn new(thresholds: NoiseFilterConfig, audio: &AudioConfig) -> Self {
        Self {
            thresholds,
            audio_min_duration_s: audio.min_duration_s,
        }
    }

    pub fn check_image(&self, probe: &ImageProbe, size_bytes: u64) -> Verdict {
        let min_dim = self.thresholds.image_min_dimension;
        if probe.width < min_dim || probe.height < min_dim {
            return Verdict::reject(format!(
                "image {}x{} below minimum dimension {min_dim}",
                probe.width, probe.height
            ));
        }
        if size_bytes < self.thresholds.image_min_bytes {
            return Verdict::reject(format!(
                "image file of {size_bytes} bytes below minimum {}",
                self.thresholds.image_min_bytes
            ));
        }
        Verdict::Accept
    }

    pub fn check_video(&self, probe: &VideoProbe) -> Verdict {
        if probe.duration_s < self.thresholds.video_min_duration_s {
            return Verdict::reject(format!(
                "video of {:.2}s below minimum duration {:.2}s",
                probe.duration_s, self.thresholds.video_min_duration_s
            ));
        }
        let min_dim = self.thresholds.video_min_dimension;
        if probe.width.min(probe.height) < min_dim {
            return Verdict::reject(format!(
                "video resolution {}x{} below minimum dimension {min_dim}",
                probe.width, probe.height
            ));
        }
        Verdict::Accept
    }

    /// The duration rule runs before anything model-shaped: audio at or
    /// under the threshold has no retrieval value, so no compute is spent
    /// classifying it.
    pub fn check_audio(&self, probe: &AudioProbe) -> Verdict {
        if probe.duration_s < self.audio_min_duration_s {
            return Verdict::reject(format!(
                "low-value audio: {:.2}s is shorter than {:.2}s",
                probe.duration_s, self.audio_min_duration_s
            ));
        }
        if let Some(bit_rate) = probe.bit_rate {
            if bit_rate < self.thresholds.audio_min_bitrate {
                return Verdict::reject(format!(
                    "audio bitrate {bit_rate} below minimum {}",
                    self.thresholds.audio_min_bitrate
                ));
            }
        }
        Verdict::Accept
    }

    pub fn check_text(&self, text: &str) -> Verdict {
        let chars = text.chars().filter(|c| !c.is_whitespace()).count();
        if chars < self.thresholds.text_min_chars {
            return Verdict::reject(format!(
                "text of {chars} characters below minimum {}",
                self.thresholds.text_min_chars
            ));
        }
        Verdict::Accept
    }
}
