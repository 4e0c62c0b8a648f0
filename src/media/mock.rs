//! Deterministic in-repo stand-ins for the decoder and audio plug-ins.
//! Fixtures are small key=value text files; the "decoded" pixels and
//! samples carry the fixture's label so the mock embedding models can map
//! media and text into one space.

use std::{collections::HashMap, path::Path};

use crate::{
    media::{
        capped_dimensions, AudioLoader, AudioProbe, ImageProbe, MediaDecoder, RgbImage,
        VideoProbe, Waveform,
    },
    state::{AppError, AppResult},
};

pub struct MockMedia;

impl MockMedia {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MockMedia {
    fn default() -> Self {
        Self::new()
    }
}

pub fn write_video_fixture(path: &Path, duration: f64, scenes: &[f64], labels: &[&str]) {
    let scenes = scenes
        .iter()
        .map(f64::to_string)
        .collect::<Vec<_>>()
        .join(",");
    std::fs::write(
        path,
        format!(
            "kind=video\nduration={duration}\nscenes={scenes}\nwidth=1280\nheight=720\nlabels={}\n",
            labels.join(",")
        ),
    )
    .expect("failed to write video fixture");
}

pub fn write_image_fixture(path: &Path, width: u32, height: u32, label: &str) {
    std::fs::write(
        path,
        format!("kind=image\nwidth={width}\nheight={height}\nlabel={label}\n"),
    )
    .expect("failed to write image fixture");
}

pub fn write_audio_fixture(path: &Path, duration: f64, bitrate: u64, label: &str) {
    std::fs::write(
        path,
        format!(
            "kind=audio\nduration={duration}\nsample_rate=44100\nbitrate={bitrate}\nlabel={label}\n"
        ),
    )
    .expect("failed to write audio fixture");
}

/// A fixture every probe refuses to decode, for permanent-failure paths.
pub fn write_broken_fixture(path: &Path) {
    std::fs::write(path, "kind=broken\n").expect("failed to write broken fixture");
}

fn parse_fixture(path: &Path, expected_kind: &str) -> AppResult<HashMap<String, String>> {
    let raw = std::fs::read_to_string(path)?;
    let fields: HashMap<String, String> = raw
        .lines()
        .filter_map(|line| {
            let (k, v) = line.split_once('=')?;
            Some((k.to_owned(), v.to_owned()))
        })
        .collect();

    match fields.get("kind").map(String::as_str) {
        Some(kind) if kind == expected_kind => Ok(fields),
        Some("broken") => Err(AppError::Codec(format!("unsupported codec in {path:?}"))),
        Some(other) => Err(AppError::Codec(format!(
            "expected {expected_kind} fixture, {path:?} is {other}"
        ))),
        None => Err(AppError::Codec(format!("{path:?} is not a mock fixture"))),
    }
}

fn field_f64(fields: &HashMap<String, String>, key: &str) -> f64 {
    fields
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

fn field_u32(fields: &HashMap<String, String>, key: &str) -> u32 {
    fields
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

/// Renders a label into the first pixel row: length byte, then the bytes.
pub fn image_with_label(width: u32, height: u32, label: &str) -> RgbImage {
    let mut pixels = vec![0u8; width as usize * height as usize * 3];
    let bytes = label.as_bytes();
    pixels[0] = bytes.len().min(255) as u8;
    for (i, b) in bytes.iter().take(pixels.len() - 1).enumerate() {
        pixels[i + 1] = *b;
    }
    RgbImage {
        width,
        height,
        pixels,
    }
}

pub fn label_from_image(image: &RgbImage) -> Option<String> {
    let len = *image.pixels.first()? as usize;
    let bytes = image.pixels.get(1..1 + len)?;
    String::from_utf8(bytes.to_vec()).ok()
}

/// Same trick for waveforms: sample 0 holds the length, then one sample
/// per byte, then filler tone out to the requested duration.
pub fn waveform_with_label(sample_rate: u32, duration_s: f64, label: &str) -> Waveform {
    let total = (sample_rate as f64 * duration_s) as usize;
    let bytes = label.as_bytes();
    let mut samples = Vec::with_capacity(total);
    samples.push(bytes.len() as f32);
    samples.extend(bytes.iter().map(|b| *b as f32));
    while samples.len() < total {
        samples.push(((samples.len() as f32) * 0.05).sin() * 0.3);
    }
    Waveform {
        sample_rate,
        samples,
    }
}

pub fn label_from_waveform(waveform: &Waveform) -> Option<String> {
    let len = *waveform.samples.first()? as usize;
    if len == 0 || len > 255 {
        return None;
    }
    let bytes: Vec<u8> = waveform.samples.get(1..1 + len)?.iter().map(|s| *s as u8).collect();
    String::from_utf8(bytes).ok()
}

impl MediaDecoder for MockMedia {
    fn probe_image(&self, path: &Path) -> AppResult<ImageProbe> {
        let fields = parse_fixture(path, "image")?;
        Ok(ImageProbe {
            width: field_u32(&fields, "width"),
            height: field_u32(&fields, "height"),
        })
    }

    fn decode_image(&self, path: &Path, max_long_side: u32) -> AppResult<RgbImage> {
        let fields = parse_fixture(path, "image")?;
        let (w, h) = capped_dimensions(
            field_u32(&fields, "width"),
            field_u32(&fields, "height"),
            max_long_side,
        );
        let label = fields.get("label").cloned().unwrap_or_default();
        Ok(image_with_label(w, h, &label))
    }

    fn probe_video(&self, path: &Path) -> AppResult<VideoProbe> {
        let fields = parse_fixture(path, "video")?;
        Ok(VideoProbe {
            duration_s: field_f64(&fields, "duration"),
            frame_rate: 30.0,
            width: field_u32(&fields, "width"),
            height: field_u32(&fields, "height"),
        })
    }

    fn detect_scenes(&self, path: &Path, within_s: f64) -> AppResult<Vec<f64>> {
        let fields = parse_fixture(path, "video")?;
        let scenes = fields
            .get("scenes")
            .map(String::as_str)
            .unwrap_or_default()
            .split(',')
            .filter_map(|s| s.trim().parse::<f64>().ok())
            .filter(|t| *t > 0.0 && *t < within_s)
            .collect();
        Ok(scenes)
    }

    fn sample_frames(
        &self,
        path: &Path,
        timestamps: &[f64],
        max_long_side: u32,
    ) -> AppResult<Vec<RgbImage>> {
        let fields = parse_fixture(path, "video")?;
        let (w, h) = capped_dimensions(
            field_u32(&fields, "width"),
            field_u32(&fields, "height"),
            max_long_side,
        );

        let scenes: Vec<f64> = fields
            .get("scenes")
            .map(String::as_str)
            .unwrap_or_default()
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        let labels: Vec<&str> = fields
            .get("labels")
            .map(String::as_str)
            .unwrap_or_default()
            .split(',')
            .collect();

        let frames = timestamps
            .iter()
            .map(|ts| {
                let scene_index = scenes.iter().filter(|s| **s <= *ts).count();
                let label = labels
                    .get(scene_index)
                    .or_else(|| labels.first())
                    .copied()
                    .unwrap_or_default();
                image_with_label(w, h, label)
            })
            .collect();
        Ok(frames)
    }

    fn thumbnail(&self, path: &Path, _at_s: Option<f64>, _size: u32) -> AppResult<Vec<u8>> {
        // Not a real JPEG; enough to be stored and asserted on.
        let raw = std::fs::read(path)?;
        let mut bytes = b"MOCKJPEG:".to_vec();
        bytes.extend_from_slice(&raw);
        Ok(bytes)
    }
}

impl AudioLoader for MockMedia {
    fn probe_audio(&self, path: &Path) -> AppResult<AudioProbe> {
        // Videos also carry an audio track in the mock.
        let fields = parse_fixture(path, "audio").or_else(|_| parse_fixture(path, "video"))?;
        Ok(AudioProbe {
            duration_s: field_f64(&fields, "duration"),
            sample_rate: field_u32(&fields, "sample_rate").max(44_100),
            channels: 2,
            bit_rate: fields.get("bitrate").and_then(|v| v.parse().ok()),
        })
    }

    fn load_mono(&self, path: &Path, sample_rate: u32) -> AppResult<Waveform> {
        let fields = parse_fixture(path, "audio").or_else(|_| parse_fixture(path, "video"))?;
        let label = fields.get("label").cloned().unwrap_or_else(|| {
            fields
                .get("labels")
                .map(String::as_str)
                .unwrap_or_default()
                .split(',')
                .next()
                .unwrap_or_default()
                .to_owned()
        });
        Ok(waveform_with_label(
            sample_rate,
            field_f64(&fields, "duration"),
            &label,
        ))
    }

    fn transcode_mono(&self, path: &Path, sample_rate: u32, dest: &Path) -> AppResult<()> {
        let raw = std::fs::read(path)?;
        let mut bytes = format!("MOCKWAV:{sample_rate}:").into_bytes();
        bytes.extend_from_slice(&raw);
        std::fs::write(dest, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_roundtrip_through_pixels_and_samples() {
        let image = image_with_label(64, 64, "cat");
        assert_eq!(label_from_image(&image).as_deref(), Some("cat"));

        let wave = waveform_with_label(48_000, 10.0, "guitar solo");
        assert_eq!(label_from_waveform(&wave).as_deref(), Some("guitar solo"));
        assert!((wave.duration_s() - 10.0).abs() < 1e-3);
    }

    #[test]
    fn frames_pick_the_scene_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mp4");
        write_video_fixture(&path, 60.0, &[20.0, 40.0], &["intro", "middle", "outro"]);

        let media = MockMedia::new();
        let frames = media.sample_frames(&path, &[1.0, 25.0, 55.0], 2048).unwrap();
        let labels: Vec<_> = frames.iter().map(|f| label_from_image(f).unwrap()).collect();
        assert_eq!(labels, vec!["intro", "middle", "outro"]);
    }

    #[test]
    fn broken_fixture_is_a_codec_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.mp4");
        write_broken_fixture(&path);

        let media = MockMedia::new();
        assert!(matches!(
            media.probe_video(&path),
            Err(AppError::Codec(_))
        ));
    }
}
