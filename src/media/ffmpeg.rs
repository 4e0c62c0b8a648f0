use std::{
    path::{Path, PathBuf},
    process::Command,
};

use serde_json::Value;
use tracing::trace;

use crate::{
    media::{capped_dimensions, AudioLoader, AudioProbe, ImageProbe, MediaDecoder, RgbImage,
        VideoProbe, Waveform},
    state::{AppError, AppResult},
};

const SCENE_THRESHOLD: f64 = 0.4;

/// Decoder plug-in backed by the ffmpeg/ffprobe executables. Nothing is
/// linked; a missing binary surfaces as a codec error on first use.
pub struct FfmpegDecoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegDecoder {
    pub fn with_binaries(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg, ffprobe }
    }

    fn probe_json(&self, path: &Path) -> AppResult<Value> {
        let output = run(Command::new(&self.ffprobe).args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path))?;
        serde_json::from_slice(&output)
            .map_err(|e| AppError::Codec(format!("unparseable ffprobe output for {path:?}: {e}")))
    }

    fn first_stream<'a>(probe: &'a Value, codec_type: &str) -> Option<&'a Value> {
        probe
            .get("streams")?
            .as_array()?
            .iter()
            .find(|s| s.get("codec_type").and_then(Value::as_str) == Some(codec_type))
    }

    fn duration(probe: &Value) -> Option<f64> {
        probe
            .get("format")?
            .get("duration")?
            .as_str()?
            .parse()
            .ok()
    }

    fn raw_frame(&self, args: &[&str], width: u32, height: u32) -> AppResult<RgbImage> {
        let output = run(Command::new(&self.ffmpeg).args(args))?;
        RgbImage::new(width, height, output)
    }
}

impl MediaDecoder for FfmpegDecoder {
    fn probe_image(&self, path: &Path) -> AppResult<ImageProbe> {
        let probe = self.probe_json(path)?;
        let stream = Self::first_stream(&probe, "video")
            .ok_or_else(|| AppError::Codec(format!("no image stream in {path:?}")))?;
        Ok(ImageProbe {
            width: stream.get("width").and_then(Value::as_u64).unwrap_or(0) as u32,
            height: stream.get("height").and_then(Value::as_u64).unwrap_or(0) as u32,
        })
    }

    fn decode_image(&self, path: &Path, max_long_side: u32) -> AppResult<RgbImage> {
        let probe = self.probe_image(path)?;
        let (w, h) = capped_dimensions(probe.width, probe.height, max_long_side);
        let path_arg = path.to_string_lossy();
        self.raw_frame(
            &[
                "-v",
                "error",
                "-i",
                path_arg.as_ref(),
                "-vf",
                &format!("scale={w}:{h}"),
                "-frames:v",
                "1",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "-",
            ],
            w,
            h,
        )
    }

    fn probe_video(&self, path: &Path) -> AppResult<VideoProbe> {
        let probe = self.probe_json(path)?;
        let stream = Self::first_stream(&probe, "video")
            .ok_or_else(|| AppError::Codec(format!("no video stream in {path:?}")))?;

        let frame_rate = stream
            .get("avg_frame_rate")
            .and_then(Value::as_str)
            .and_then(parse_rational)
            .unwrap_or(0.0);

        Ok(VideoProbe {
            duration_s: Self::duration(&probe)
                .ok_or_else(|| AppError::Codec(format!("no duration reported for {path:?}")))?,
            frame_rate,
            width: stream.get("width").and_then(Value::as_u64).unwrap_or(0) as u32,
            height: stream.get("height").and_then(Value::as_u64).unwrap_or(0) as u32,
        })
    }

    fn detect_scenes(&self, path: &Path, within_s: f64) -> AppResult<Vec<f64>> {
        let output = Command::new(&self.ffmpeg)
            .args(["-v", "info", "-t", &format!("{within_s}")])
            .arg("-i")
            .arg(path)
            .args([
                "-an",
                "-vf",
                &format!("select='gt(scene,{SCENE_THRESHOLD})',showinfo"),
                "-f",
                "null",
                "-",
            ])
            .output()
            .map_err(spawn_error)?;
        if !output.status.success() {
            return Err(status_error(&output));
        }

        // showinfo logs one line per selected frame on stderr.
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut scenes: Vec<f64> = stderr
            .lines()
            .filter_map(|line| {
                let idx = line.find("pts_time:")?;
                let rest = &line[idx + "pts_time:".len()..];
                let end = rest
                    .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-')
                    .unwrap_or(rest.len());
                rest[..end].parse::<f64>().ok()
            })
            .filter(|t| *t > 0.0 && *t < within_s)
            .collect();
        scenes.sort_unstable_by(|a, b| a.partial_cmp(b).expect("scene times are finite"));
        scenes.dedup();
        trace!("detected {} scene changes in {path:?}", scenes.len());
        Ok(scenes)
    }

    fn sample_frames(
        &self,
        path: &Path,
        timestamps: &[f64],
        max_long_side: u32,
    ) -> AppResult<Vec<RgbImage>> {
        let probe = self.probe_video(path)?;
        let (w, h) = capped_dimensions(probe.width, probe.height, max_long_side);
        let path_arg = path.to_string_lossy();

        let mut frames = Vec::with_capacity(timestamps.len());
        for ts in timestamps {
            frames.push(self.raw_frame(
                &[
                    "-v",
                    "error",
                    "-ss",
                    &format!("{ts}"),
                    "-i",
                    path_arg.as_ref(),
                    "-vf",
                    &format!("scale={w}:{h}"),
                    "-frames:v",
                    "1",
                    "-f",
                    "rawvideo",
                    "-pix_fmt",
                    "rgb24",
                    "-",
                ],
                w,
                h,
            )?);
        }
        Ok(frames)
    }

    fn thumbnail(&self, path: &Path, at_s: Option<f64>, size: u32) -> AppResult<Vec<u8>> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-v", "error"]);
        if let Some(at) = at_s {
            cmd.args(["-ss", &format!("{at}")]);
        }
        cmd.arg("-i").arg(path).args([
            "-frames:v",
            "1",
            "-vf",
            &format!("scale={size}:{size}:force_original_aspect_ratio=decrease"),
            "-f",
            "mjpeg",
            "-",
        ]);
        run(&mut cmd)
    }
}

impl AudioLoader for FfmpegDecoder {
    fn probe_audio(&self, path: &Path) -> AppResult<AudioProbe> {
        let probe = self.probe_json(path)?;
        let stream = Self::first_stream(&probe, "audio")
            .ok_or_else(|| AppError::Codec(format!("no audio stream in {path:?}")))?;

        Ok(AudioProbe {
            duration_s: Self::duration(&probe)
                .ok_or_else(|| AppError::Codec(format!("no duration reported for {path:?}")))?,
            sample_rate: stream
                .get("sample_rate")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            channels: stream.get("channels").and_then(Value::as_u64).unwrap_or(0) as u32,
            bit_rate: stream
                .get("bit_rate")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok()),
        })
    }

    fn load_mono(&self, path: &Path, sample_rate: u32) -> AppResult<Waveform> {
        let output = run(Command::new(&self.ffmpeg)
            .args(["-v", "error"])
            .arg("-i")
            .arg(path)
            .args([
                "-map",
                "a:0",
                "-ac",
                "1",
                "-ar",
                &sample_rate.to_string(),
                "-f",
                "f32le",
                "-",
            ]))?;

        let samples = output
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("chunk is 4 bytes")))
            .collect();
        Ok(Waveform {
            sample_rate,
            samples,
        })
    }

    fn transcode_mono(&self, path: &Path, sample_rate: u32, dest: &Path) -> AppResult<()> {
        run(Command::new(&self.ffmpeg)
            .args(["-v", "error", "-y"])
            .arg("-i")
            .arg(path)
            .args([
                "-map",
                "a:0",
                "-ac",
                "1",
                "-ar",
                &sample_rate.to_string(),
                "-c:a",
                "pcm_s16le",
                "-f",
                "wav",
            ])
            .arg(dest))?;
        Ok(())
    }
}

fn run(cmd: &mut Command) -> AppResult<Vec<u8>> {
    let output = cmd.output().map_err(spawn_error)?;
    if !output.status.success() {
        return Err(status_error(&output));
    }
    Ok(output.stdout)
}

fn spawn_error(e: std::io::Error) -> AppError {
    AppError::Codec(format!("failed to launch decoder executable: {e}"))
}

fn status_error(output: &std::process::Output) -> AppError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail: String = stderr
        .lines()
        .rev()
        .take(3)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("; ");
    AppError::Codec(format!("decoder exited with {}: {tail}", output.status))
}

fn parse_rational(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            (den != 0.0).then_some(num / den)
        }
        None => raw.parse().ok(),
    }
}
