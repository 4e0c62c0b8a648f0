pub mod builtin;

#[cfg(test)]
pub mod mock;

use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    config::ModelsConfig,
    media::{RgbImage, Waveform},
    state::{AppError, AppResult},
    store::Modality,
};

/// Whitespace-normalized input is cut to this many tokens before encoding.
const TEXT_TOKEN_LIMIT: usize = 512;
/// Audio is clipped or tiled to this window before it reaches the model.
const AUDIO_WINDOW_S: f64 = 10.0;

/// One loaded embedding backbone. Image-family models (CLIP-style) serve
/// text, image and video; audio models serve audio. Methods a model does
/// not support keep their defaults and report a wiring error.
pub trait EmbeddingModel: Send + Sync {
    fn name(&self) -> &str;
    fn dimension(&self) -> usize;
    fn preferred_batch(&self) -> usize;

    fn embed_texts(&self, _texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        Err(unsupported(self.name(), "text"))
    }

    fn embed_image(&self, _image: &RgbImage) -> AppResult<Vec<f32>> {
        Err(unsupported(self.name(), "image"))
    }

    fn embed_audio(&self, _waveform: &Waveform) -> AppResult<Vec<f32>> {
        Err(unsupported(self.name(), "audio"))
    }

    /// Video support is optional; the default temporally pools uniformly
    /// sampled frame embeddings. Callers cannot tell which path ran.
    fn embed_video(&self, frames: &[RgbImage]) -> AppResult<Vec<f32>> {
        if frames.is_empty() {
            return Err(AppError::Integrity(
                "cannot embed a video segment without frames".to_owned(),
            ));
        }
        let mut pooled = vec![0.0f32; self.dimension()];
        for frame in frames {
            let embedding = self.embed_image(frame)?;
            for (acc, v) in pooled.iter_mut().zip(&embedding) {
                *acc += v;
            }
        }
        for v in pooled.iter_mut() {
            *v /= frames.len() as f32;
        }
        l2_normalize(&mut pooled);
        Ok(pooled)
    }
}

fn unsupported(model: &str, modality: &str) -> AppError {
    AppError::Integrity(format!("model {model} does not embed {modality} input"))
}

/// Modality-polymorphic facade over the loaded models. Fails fast with
/// `ModelNotReady` when the required backbone is absent.
pub struct EmbeddingService {
    image_model: Option<Arc<dyn EmbeddingModel>>,
    audio_model: Option<Arc<dyn EmbeddingModel>>,
}

impl EmbeddingService {
    pub fn from_config(models: &ModelsConfig) -> AppResult<Self> {
        let image_model: Arc<dyn EmbeddingModel> = match models.image.name.as_str() {
            "builtin" => Arc::new(builtin::BuiltinVisualModel::new(
                models.image.dim,
                models.image.batch,
            )),
            other => {
                return Err(AppError::Config(format!(
                    "unknown image model '{other}' (available: builtin)"
                )))
            }
        };
        let audio_model: Arc<dyn EmbeddingModel> = match models.audio.name.as_str() {
            "builtin" => Arc::new(builtin::BuiltinAudioModel::new(
                models.audio.dim,
                models.audio.batch,
            )),
            other => {
                return Err(AppError::Config(format!(
                    "unknown audio model '{other}' (available: builtin)"
                )))
            }
        };
        Ok(Self {
            image_model: Some(image_model),
            audio_model: Some(audio_model),
        })
    }

    /// Direct wiring for plug-in backends and tests.
    pub fn with_models(
        image_model: Option<Arc<dyn EmbeddingModel>>,
        audio_model: Option<Arc<dyn EmbeddingModel>>,
    ) -> Self {
        Self {
            image_model,
            audio_model,
        }
    }

    /// One dummy inference per loaded model so the first user query does
    /// not pay the cold-start.
    pub fn warmup(&self) -> AppResult<()> {
        if let Some(model) = &self.image_model {
            let start = std::time::Instant::now();
            model.embed_texts(std::slice::from_ref(&"warmup".to_owned()))?;
            let frame = RgbImage::new(8, 8, vec![0; 8 * 8 * 3])?;
            model.embed_image(&frame)?;
            debug!("warmed up {} in {:?}", model.name(), start.elapsed());
        }
        if let Some(model) = &self.audio_model {
            let start = std::time::Instant::now();
            model.embed_audio(&Waveform {
                sample_rate: 48_000,
                samples: vec![0.0; 4_800],
            })?;
            debug!("warmed up {} in {:?}", model.name(), start.elapsed());
        }
        info!("embedding models ready");
        Ok(())
    }

    pub fn is_ready(&self, modality: Modality) -> bool {
        match modality {
            Modality::Text | Modality::Image | Modality::Video => self.image_model.is_some(),
            Modality::Audio => self.audio_model.is_some(),
        }
    }

    pub fn dimension(&self, modality: Modality) -> AppResult<usize> {
        Ok(self.model_for(modality)?.dimension())
    }

    pub fn preferred_batch(&self, modality: Modality) -> AppResult<usize> {
        Ok(self.model_for(modality)?.preferred_batch())
    }

    fn model_for(&self, modality: Modality) -> AppResult<&Arc<dyn EmbeddingModel>> {
        let slot = match modality {
            Modality::Text | Modality::Image | Modality::Video => &self.image_model,
            Modality::Audio => &self.audio_model,
        };
        slot.as_ref()
            .ok_or_else(|| AppError::ModelNotReady(modality.name().to_owned()))
    }

    pub fn embed_text(&self, text: &str) -> AppResult<Vec<f32>> {
        Ok(self
            .embed_texts(std::slice::from_ref(&text.to_owned()))?
            .pop()
            .expect("one input yields one vector"))
    }

    pub fn embed_texts(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let model = self.model_for(Modality::Text)?;
        let prepared: Vec<String> = texts.iter().map(|t| prepare_text(t)).collect();
        let mut vectors = model.embed_texts(&prepared)?;
        for vector in &mut vectors {
            l2_normalize(vector);
        }
        Ok(vectors)
    }

    pub fn embed_image(&self, image: &RgbImage) -> AppResult<Vec<f32>> {
        let model = self.model_for(Modality::Image)?;
        let mut vector = model.embed_image(image)?;
        l2_normalize(&mut vector);
        Ok(vector)
    }

    pub fn embed_audio(&self, waveform: &Waveform) -> AppResult<Vec<f32>> {
        let model = self.model_for(Modality::Audio)?;
        let fitted = fit_window(waveform, AUDIO_WINDOW_S);
        let mut vector = model.embed_audio(&fitted)?;
        l2_normalize(&mut vector);
        Ok(vector)
    }

    pub fn embed_video_segment(&self, frames: &[RgbImage]) -> AppResult<Vec<f32>> {
        let model = self.model_for(Modality::Video)?;
        let mut vector = model.embed_video(frames)?;
        l2_normalize(&mut vector);
        Ok(vector)
    }
}

/// Collapse whitespace runs and truncate to the token limit.
fn prepare_text(text: &str) -> String {
    text.split_whitespace()
        .take(TEXT_TOKEN_LIMIT)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Clip long input to the window, tile short input up to it.
fn fit_window(waveform: &Waveform, window_s: f64) -> Waveform {
    let target = (waveform.sample_rate as f64 * window_s) as usize;
    if waveform.samples.is_empty() || target == 0 {
        return waveform.clone();
    }

    let samples = if waveform.samples.len() >= target {
        waveform.samples[..target].to_vec()
    } else {
        let mut tiled = Vec::with_capacity(target);
        while tiled.len() < target {
            let take = (target - tiled.len()).min(waveform.samples.len());
            tiled.extend_from_slice(&waveform.samples[..take]);
        }
        tiled
    };

    Waveform {
        sample_rate: waveform.sample_rate,
        samples,
    }
}

pub(crate) fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}
