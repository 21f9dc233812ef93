use rollcall_core::matcher::{CosineMatcher, DistanceMatcher, MatchPolicy};
use rollcall_core::SchedulerConfig;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("ROLLCALL_FRAME_SKIP must be at least 1")]
    FrameSkip,
    #[error("ROLLCALL_ENCODING_EVERY must be at least 1")]
    EncodingEvery,
    #[error("ROLLCALL_DOWNSCALE must be in (0, 1], got {0}")]
    Downscale(f32),
    #[error("ROLLCALL_COOLDOWN_SECS must be a finite non-negative number, got {0}")]
    Cooldown(f64),
    #[error("ROLLCALL_PREVIEW_EVERY must be at least 1")]
    PreviewEvery,
    #[error("ROLLCALL_MATCH_TOLERANCE must be positive, got {0}")]
    Tolerance(f32),
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// MJPEG stream of the camera collector.
    pub stream_url: String,
    /// Replay a directory of frames instead of the live stream.
    pub replay_dir: Option<PathBuf>,
    /// Endpoint receiving attendance POSTs.
    pub attendance_url: String,
    pub attendance_timeout: Duration,
    pub queue_capacity: usize,
    /// Directory holding `names.json` and `encodings.json`.
    pub data_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Euclidean tolerance; selects the distance matcher when set.
    pub match_tolerance: Option<f32>,
    pub preview_path: PathBuf,
    pub preview_every: u64,
    pub frame_skip: u64,
    pub downscale_factor: f32,
    pub encoding_every: u64,
    pub persistence_frames: i64,
    pub cooldown_secs: f64,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Unparseable values fall
    /// back to their defaults.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(rollcall_core::default_data_dir);
        let model_dir = var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("models"));
        let preview_path = var("ROLLCALL_PREVIEW_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("preview.jpg"));

        let defaults = SchedulerConfig::default();
        Self {
            stream_url: var("ROLLCALL_STREAM_URL")
                .unwrap_or_else(|| "http://localhost:5000/stream".to_string()),
            replay_dir: var("ROLLCALL_REPLAY_DIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            attendance_url: var("ROLLCALL_ATTENDANCE_URL")
                .unwrap_or_else(|| "http://localhost:5000/attendance".to_string()),
            attendance_timeout: Duration::from_millis(parse_or(&var, "ROLLCALL_ATTENDANCE_TIMEOUT_MS", 1000)),
            queue_capacity: parse_or(
                &var,
                "ROLLCALL_QUEUE_CAPACITY",
                rollcall_io::attendance::DEFAULT_QUEUE_CAPACITY,
            ),
            data_dir,
            model_dir,
            similarity_threshold: parse_or(
                &var,
                "ROLLCALL_SIMILARITY_THRESHOLD",
                rollcall_core::matcher::DEFAULT_SIMILARITY_THRESHOLD,
            ),
            match_tolerance: var("ROLLCALL_MATCH_TOLERANCE").and_then(|v| v.parse().ok()),
            preview_path,
            preview_every: parse_or(&var, "ROLLCALL_PREVIEW_EVERY", 5),
            frame_skip: parse_or(&var, "ROLLCALL_FRAME_SKIP", defaults.frame_skip),
            downscale_factor: parse_or(&var, "ROLLCALL_DOWNSCALE", defaults.downscale_factor),
            encoding_every: parse_or(&var, "ROLLCALL_ENCODING_EVERY", defaults.encoding_every),
            persistence_frames: parse_or(&var, "ROLLCALL_PERSISTENCE_FRAMES", defaults.persistence_frames),
            cooldown_secs: parse_or(&var, "ROLLCALL_COOLDOWN_SECS", defaults.cooldown.as_secs_f64()),
        }
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_skip == 0 {
            return Err(ConfigError::FrameSkip);
        }
        if self.encoding_every == 0 {
            return Err(ConfigError::EncodingEvery);
        }
        if !(self.downscale_factor > 0.0 && self.downscale_factor <= 1.0) {
            return Err(ConfigError::Downscale(self.downscale_factor));
        }
        if !self.cooldown_secs.is_finite() || self.cooldown_secs < 0.0 {
            return Err(ConfigError::Cooldown(self.cooldown_secs));
        }
        if self.preview_every == 0 {
            return Err(ConfigError::PreviewEvery);
        }
        if let Some(t) = self.match_tolerance {
            if !(t > 0.0 && t.is_finite()) {
                return Err(ConfigError::Tolerance(t));
            }
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            frame_skip: self.frame_skip,
            downscale_factor: self.downscale_factor,
            encoding_every: self.encoding_every,
            persistence_frames: self.persistence_frames,
            cooldown: Duration::try_from_secs_f64(self.cooldown_secs).unwrap_or_default(),
        }
    }

    pub fn match_policy(&self) -> MatchPolicy {
        match self.match_tolerance {
            Some(tolerance) => MatchPolicy::Distance(DistanceMatcher { tolerance }),
            None => MatchPolicy::Cosine(CosineMatcher {
                threshold: self.similarity_threshold,
            }),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(rollcall_core::SCRFD_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join(rollcall_core::ARCFACE_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

fn parse_or<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
