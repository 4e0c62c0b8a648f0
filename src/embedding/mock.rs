//! Test backbones that map media labels (planted by the media mock) and
//! query text into one hashed space, so cross-modal retrieval is exact and
//! assertable.

use crate::{
    embedding::{builtin::hash_text_features, EmbeddingModel},
    media::{
        mock::{label_from_image, label_from_waveform},
        RgbImage, Waveform,
    },
    state::AppResult,
};

pub struct MockClipModel {
    dim: usize,
}

impl MockClipModel {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl EmbeddingModel for MockClipModel {
    fn name(&self) -> &str {
        "mock-clip"
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn preferred_batch(&self) -> usize {
        4
    }

    fn embed_texts(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| hash_text_features(text, self.dim))
            .collect())
    }

    fn embed_image(&self, image: &RgbImage) -> AppResult<Vec<f32>> {
        let label = label_from_image(image).unwrap_or_default();
        Ok(hash_text_features(&label, self.dim))
    }
}

pub struct MockAudioModel {
    dim: usize,
}

impl MockAudioModel {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl EmbeddingModel for MockAudioModel {
    fn name(&self) -> &str {
        "mock-audio"
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn preferred_batch(&self) -> usize {
        2
    }

    fn embed_audio(&self, waveform: &Waveform) -> AppResult<Vec<f32>> {
        let label = label_from_waveform(waveform).unwrap_or_default();
        Ok(hash_text_features(&label, self.dim))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::l2_normalize;
    use crate::media::mock::{image_with_label, waveform_with_label};

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let (mut a, mut b) = (a.to_vec(), b.to_vec());
        l2_normalize(&mut a);
        l2_normalize(&mut b);
        a.iter().zip(&b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn text_and_labeled_image_share_a_space() {
        let model = MockClipModel::new(64);
        let text = model.embed_texts(&["cat".to_owned()]).unwrap();
        let image = model
            .embed_image(&image_with_label(8, 8, "cat"))
            .unwrap();
        let other = model
            .embed_image(&image_with_label(8, 8, "dog"))
            .unwrap();

        assert!(cosine(&text[0], &image) > 0.99);
        assert!(cosine(&text[0], &other) < 0.5);
    }

    #[test]
    fn audio_labels_align_too() {
        let model = MockAudioModel::new(64);
        let guitar = model
            .embed_audio(&waveform_with_label(48_000, 10.0, "guitar"))
            .unwrap();
        let speech = model
            .embed_audio(&waveform_with_label(48_000, 10.0, "speech"))
            .unwrap();
        assert!(cosine(&guitar, &speech) < 0.5);
        assert!(cosine(&guitar, &guitar.clone()) > 0.99);
    }
}
