use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::state::{AppError, AppResult};

/// On-disk configuration. Every section has full defaults so a missing or
/// partial file still yields a working engine; a malformed file is fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub data_dir: PathBuf,
    pub watch: WatchConfig,
    pub pools: PoolsConfig,
    pub tasks: TasksConfig,
    pub timeouts: TimeoutsConfig,
    pub model: ModelsConfig,
    pub audio: AudioConfig,
    pub video: VideoConfig,
    pub image: ImageConfig,
    pub noise_filter: NoiseFilterConfig,
    pub search: SearchConfig,
    pub cache: CacheConfig,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            watch: WatchConfig::default(),
            pools: PoolsConfig::default(),
            tasks: TasksConfig::default(),
            timeouts: TimeoutsConfig::default(),
            model: ModelsConfig::default(),
            audio: AudioConfig::default(),
            video: VideoConfig::default(),
            image: ImageConfig::default(),
            noise_filter: NoiseFilterConfig::default(),
            search: SearchConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub directories: Vec<PathBuf>,
    pub debounce_ms: u64,
    pub batch_size: usize,
    pub exclude: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            debounce_ms: 500,
            batch_size: 100,
            exclude: vec![
                ".*".to_owned(),
                "*~".to_owned(),
                "*.tmp".to_owned(),
                "*.part".to_owned(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    pub embedding: PoolConfig,
    pub io: PoolConfig,
    pub task: PoolConfig,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            embedding: PoolConfig { workers: 4 },
            io: PoolConfig { workers: 8 },
            task: PoolConfig { workers: 8 },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    pub max_attempts: u32,
    /// Optional per-type concurrency caps, keyed by task kind name.
    pub per_type_caps: HashMap<String, usize>,
    /// Bound on the queued working set; enqueueing blocks above this.
    pub working_set: usize,
    /// Tighter bound on queued embedding work to keep scan bursts in check.
    pub embed_queue: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            per_type_caps: HashMap::new(),
            working_set: 10_000,
            embed_queue: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub embedding: u64,
    pub io: u64,
    pub task: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            embedding: 300,
            io: 60,
            task: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub image: ModelConfig,
    pub audio: ModelConfig,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            image: ModelConfig {
                name: "builtin".to_owned(),
                path: None,
                dim: 512,
                batch: 8,
                device: "cpu".to_owned(),
            },
            audio: ModelConfig {
                name: "builtin".to_owned(),
                path: None,
                dim: 256,
                batch: 4,
                device: "cpu".to_owned(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub path: Option<PathBuf>,
    pub dim: usize,
    pub batch: usize,
    pub device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub min_duration_s: f64,
    pub segment_max_s: f64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            min_duration_s: 5.0,
            segment_max_s: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub short_max_s: f64,
    pub segment_max_s: f64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            short_max_s: 6.0,
            segment_max_s: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub max_long_side: u32,
    pub thumb_size: u32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_long_side: 2048,
            thumb_size: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseFilterConfig {
    pub image_min_dimension: u32,
    pub image_min_bytes: u64,
    pub video_min_duration_s: f64,
    pub video_min_dimension: u32,
    pub audio_min_bitrate: u64,
    pub text_min_chars: usize,
}

impl Default for NoiseFilterConfig {
    fn default() -> Self {
        Self {
            image_min_dimension: 32,
            image_min_bytes: 1024,
            video_min_duration_s: 1.0,
            video_min_dimension: 128,
            audio_min_bitrate: 32_000,
            text_min_chars: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub over_fetch: f64,
    pub fusion: FusionConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            over_fetch: 3.0,
            fusion: FusionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub text: f64,
    pub image: f64,
    pub audio: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            text: 0.5,
            image: 0.3,
            audio: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size_bytes: u64,
    pub ttl_s: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 4 * 1024 * 1024 * 1024,
            ttl_s: 7 * 24 * 3600,
        }
    }
}

impl ConfigFile {
    /// Reads the configuration, writing out a default file when none exists
    /// yet. A file that exists but does not parse is a startup error.
    pub fn load(path: &Path) -> AppResult<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw)
                .map_err(|e| AppError::Config(format!("failed to parse {path:?}: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let default = Self::default();
                let raw = toml::to_string_pretty(&default)
                    .expect("the default config always serializes");
                std::fs::write(path, raw)?;
                info!("Wrote default configuration to {path:?}");
                default
            }
            Err(e) => return Err(e.into()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        fn ensure(cond: bool, msg: &str) -> AppResult<()> {
            if cond {
                Ok(())
            } else {
                Err(AppError::Config(msg.to_owned()))
            }
        }

        ensure(self.pools.embedding.workers > 0, "pools.embedding.workers must be > 0")?;
        ensure(self.pools.io.workers > 0, "pools.io.workers must be > 0")?;
        ensure(self.pools.task.workers > 0, "pools.task.workers must be > 0")?;
        ensure(self.tasks.max_attempts > 0, "tasks.max_attempts must be > 0")?;
        ensure(self.watch.batch_size > 0, "watch.batch_size must be > 0")?;
        ensure(self.model.image.dim > 0, "model.image.dim must be > 0")?;
        ensure(self.model.audio.dim > 0, "model.audio.dim must be > 0")?;
        ensure(self.model.image.batch > 0, "model.image.batch must be > 0")?;
        ensure(self.model.audio.batch > 0, "model.audio.batch must be > 0")?;
        ensure(self.audio.sample_rate > 0, "audio.sample_rate must be > 0")?;
        ensure(self.audio.segment_max_s > 0.0, "audio.segment_max_s must be > 0")?;
        ensure(self.video.short_max_s > 0.0, "video.short_max_s must be > 0")?;
        ensure(self.video.segment_max_s > 0.0, "video.segment_max_s must be > 0")?;
        ensure(self.image.max_long_side > 0, "image.max_long_side must be > 0")?;
        ensure(self.search.over_fetch >= 1.0, "search.over_fetch must be >= 1")?;

        let weights = &self.search.fusion;
        ensure(
            weights.text >= 0.0 && weights.image >= 0.0 && weights.audio >= 0.0,
            "search.fusion weights must not be negative",
        )?;
        ensure(
            weights.text + weights.image + weights.audio > 0.0,
            "search.fusion weights must not all be zero",
        )?;

        for root in &self.watch.directories {
            ensure(
                root.is_absolute(),
                &format!("watch.directories entries must be absolute, got {root:?}"),
            )?;
        }

        Ok(())
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join("metadata.db")
    }

    pub fn vectors_dir(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    pub fn content_dir(&self) -> PathBuf {
        self.data_dir.join("content")
    }

    pub fn thumbs_dir(&self) -> PathBuf {
        self.data_dir.join("thumbs")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_roundtrips_through_toml() {
        let default = ConfigFile::default();
        let raw = toml::to_string_pretty(&default).unwrap();
        let back: ConfigFile = toml::from_str(&raw).unwrap();
        assert_eq!(back.watch.debounce_ms, 500);
        assert_eq!(back.pools.embedding.workers, 4);
        assert_eq!(back.tasks.max_attempts, 3);
        assert_eq!(back.audio.sample_rate, 48_000);
        back.validate().unwrap();
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: ConfigFile = toml::from_str(
            r#"
            [pools.embedding]
            workers = 2

            [video]
            short_max_s = 8.0
            "#,
        )
        .unwrap();
        assert_eq!(config.pools.embedding.workers, 2);
        assert_eq!(config.pools.io.workers, 8);
        assert_eq!(config.video.short_max_s, 8.0);
        assert_eq!(config.video.segment_max_s, 5.0);
    }

    #[test]
    fn rejects_zero_workers() {
        let mut config = ConfigFile::default();
        config.pools.io.workers = 0;
        assert!(matches!(config.validate(), Err(crate::state::AppError::Config(_))));
    }

    #[test]
    fn rejects_relative_watch_root() {
        let mut config = ConfigFile::default();
        config.watch.directories.push(PathBuf::from("relative/dir"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_writes_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msearch.toml");
        let config = ConfigFile::load(&path).unwrap();
        assert_eq!(config.watch.debounce_ms, 500);
        assert!(path.exists());

        std::fs::write(&path, "not valid toml [").unwrap();
        assert!(matches!(
            ConfigFile::load(&path),
            Err(crate::state::AppError::Config(_))
        ));
    }
}
