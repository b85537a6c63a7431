use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Runtime configuration: defaults, then an optional TOML file, then
/// `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Root of the enrollment store (one directory per identity).
    pub dataset_dir: PathBuf,
    /// Trained nearest-neighbor model file.
    pub model_path: PathBuf,
    /// Attendance CSV.
    pub ledger_path: PathBuf,
    /// V4L2 device path.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// SCRFD ONNX model used for face-region detection.
    pub detector_model: PathBuf,
    /// Minimum SCRFD score for a region to count as a face.
    pub detector_threshold: f32,
    /// Frames to discard at stream start (camera AGC/AE stabilization).
    pub warmup_frames: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dataset_dir: PathBuf::from("dataset"),
            model_path: PathBuf::from("knn_model.json"),
            ledger_path: PathBuf::from("attendance.csv"),
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            detector_model: PathBuf::from("models/det_10g.onnx"),
            detector_threshold: rollcall_core::detector::DEFAULT_CONFIDENCE_THRESHOLD,
            warmup_frames: 4,
        }
    }
}

/// Keys accepted in the TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    dataset_dir: Option<PathBuf>,
    model_path: Option<PathBuf>,
    ledger_path: Option<PathBuf>,
    camera_device: Option<String>,
    camera_width: Option<u32>,
    camera_height: Option<u32>,
    detector_model: Option<PathBuf>,
    detector_threshold: Option<f32>,
    warmup_frames: Option<usize>,
}

impl Config {
    /// Load configuration from `file` (or `ROLLCALL_CONFIG`) and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let file = file
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("ROLLCALL_CONFIG").map(PathBuf::from));

        let mut config = Self::default();
        if let Some(path) = file {
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            config.apply_toml(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        }
        config.apply_env(|key| std::env::var(key).ok());

        tracing::debug!(?config, "configuration loaded");
        Ok(config)
    }

    fn apply_toml(&mut self, text: &str) -> Result<(), toml::de::Error> {
        let file: FileConfig = toml::from_str(text)?;

        if let Some(v) = file.dataset_dir {
            self.dataset_dir = v;
        }
        if let Some(v) = file.model_path {
            self.model_path = v;
        }
        if let Some(v) = file.ledger_path {
            self.ledger_path = v;
        }
        if let Some(v) = file.camera_device {
            self.camera_device = v;
        }
        if let Some(v) = file.camera_width {
            self.camera_width = v;
        }
        if let Some(v) = file.camera_height {
            self.camera_height = v;
        }
        if let Some(v) = file.detector_model {
            self.detector_model = v;
        }
        if let Some(v) = file.detector_threshold {
            self.detector_threshold = v;
        }
        if let Some(v) = file.warmup_frames {
            self.warmup_frames = v;
        }
        Ok(())
    }

    /// Apply `ROLLCALL_*` overrides. Unparsable numbers keep the current value.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_DATASET_DIR") {
            self.dataset_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_LEDGER_PATH") {
            self.ledger_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("ROLLCALL_DETECTOR_MODEL") {
            self.detector_model = PathBuf::from(v);
        }
        self.camera_width = env_or(&lookup, "ROLLCALL_CAMERA_WIDTH", self.camera_width);
        self.camera_height = env_or(&lookup, "ROLLCALL_CAMERA_HEIGHT", self.camera_height);
        self.detector_threshold =
            env_or(&lookup, "ROLLCALL_DETECTOR_THRESHOLD", self.detector_threshold);
        self.warmup_frames = env_or(&lookup, "ROLLCALL_WARMUP_FRAMES", self.warmup_frames);
    }
}

fn env_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(current)
}
