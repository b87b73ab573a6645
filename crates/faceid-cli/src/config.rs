use faceid_core::session::{EnrollmentParams, RecognitionParams};
use faceid_core::QualityGate;
use faceid_hw::SourceConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Engine configuration: defaults, then an optional TOML file named by
/// `FACEID_CONFIG`, then `FACEID_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Root of the per-identity image directories; also holds the index cache.
    pub data_dir: PathBuf,
    /// Embedding model name: `<model_dir>/<model_name>.onnx`, and the cache key.
    pub model_name: String,
    /// Detector model file inside `model_dir`.
    pub detector_model: String,
    /// Cosine similarity a sample needs to vote for an identity.
    pub similarity_threshold: f32,
    pub recognition_samples: usize,
    /// The winning identity needs strictly more than this share of samples.
    pub min_agreement: f32,
    pub recognition_timeout_secs: u64,
    pub frame_timeout_ms: u64,
    pub enroll_frames: usize,
    pub reopen_backoff_ms: u64,
    pub capture_interval_ms: u64,
    pub min_brightness: f32,
    pub max_brightness: f32,
    /// Minimum Laplacian variance; 0 disables the blur check.
    pub blur_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        let data_home = xdg_data_home().join("faceid");
        Self {
            camera_device: "/dev/video0".to_string(),
            capture_width: 640,
            capture_height: 480,
            model_dir: data_home.join("models"),
            data_dir: data_home.join("faces"),
            model_name: "w600k_r50".to_string(),
            detector_model: "det_10g.onnx".to_string(),
            similarity_threshold: 0.40,
            recognition_samples: 10,
            min_agreement: 0.25,
            recognition_timeout_secs: 5,
            frame_timeout_ms: 3000,
            enroll_frames: 30,
            reopen_backoff_ms: 2000,
            capture_interval_ms: 10,
            min_brightness: 15.0,
            max_brightness: 240.0,
            blur_threshold: 20.0,
        }
    }
}

impl Config {
    /// Load the full configuration stack from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("FACEID_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Defaults overlaid with the keys present in a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Apply `FACEID_*` overrides. Unparseable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = env("FACEID_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = env("FACEID_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("FACEID_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env("FACEID_MODEL_NAME") {
            self.model_name = v;
        }
        if let Some(v) = env("FACEID_DETECTOR_MODEL") {
            self.detector_model = v;
        }

        override_parsed(&env, "FACEID_CAPTURE_WIDTH", &mut self.capture_width);
        override_parsed(&env, "FACEID_CAPTURE_HEIGHT", &mut self.capture_height);
        override_parsed(&env, "FACEID_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        override_parsed(&env, "FACEID_RECOGNITION_SAMPLES", &mut self.recognition_samples);
        override_parsed(&env, "FACEID_MIN_AGREEMENT", &mut self.min_agreement);
        override_parsed(&env, "FACEID_RECOGNITION_TIMEOUT_SECS", &mut self.recognition_timeout_secs);
        override_parsed(&env, "FACEID_FRAME_TIMEOUT_MS", &mut self.frame_timeout_ms);
        override_parsed(&env, "FACEID_ENROLL_FRAMES", &mut self.enroll_frames);
        override_parsed(&env, "FACEID_REOPEN_BACKOFF_MS", &mut self.reopen_backoff_ms);
        override_parsed(&env, "FACEID_CAPTURE_INTERVAL_MS", &mut self.capture_interval_ms);
        override_parsed(&env, "FACEID_MIN_BRIGHTNESS", &mut self.min_brightness);
        override_parsed(&env, "FACEID_MAX_BRIGHTNESS", &mut self.max_brightness);
        override_parsed(&env, "FACEID_BLUR_THRESHOLD", &mut self.blur_threshold);
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    /// Path to the ArcFace-style embedding model.
    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join(format!("{}.onnx", self.model_name))
    }

    pub fn recognition_params(&self) -> RecognitionParams {
        RecognitionParams {
            sample_count: self.recognition_samples,
            similarity_threshold: self.similarity_threshold,
            min_agreement: self.min_agreement,
            timeout: Duration::from_secs(self.recognition_timeout_secs),
            frame_timeout: Duration::from_millis(self.frame_timeout_ms),
        }
    }

    pub fn enrollment_params(&self) -> EnrollmentParams {
        EnrollmentParams {
            capture_target: self.enroll_frames,
            frame_timeout: Duration::from_millis(self.frame_timeout_ms),
            timeout: None,
        }
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            reopen_backoff: Duration::from_millis(self.reopen_backoff_ms),
            capture_interval: Duration::from_millis(self.capture_interval_ms),
        }
    }

    pub fn quality_gate(&self) -> QualityGate {
        QualityGate {
            min_brightness: self.min_brightness,
            max_brightness: self.max_brightness,
            blur_threshold: self.blur_threshold,
        }
    }
}

fn override_parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = env(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}

fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
}
