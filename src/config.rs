//! Configuration loading for the tracker.
//!
//! Every section is optional; missing values fall back to the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model_download::ModelKind;
use crate::osc::{DEFAULT_HOST, DEFAULT_PORT};
use crate::tracker::{Backoff, TrackerSettings};

const DEFAULT_CONFIG_FILE: &str = "body-tracker.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub osc: OscConfig,
    pub camera: CameraConfig,
    pub capture: CaptureConfig,
    pub models: ModelConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load `explicit` if given, otherwise `body-tracker.toml` in the working
    /// directory, otherwise defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_FILE);
        if fallback.exists() {
            log::info!("loading config from {}", fallback.display());
            return Self::from_file(fallback);
        }

        log::debug!("no config file found, using defaults");
        Ok(Self::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OscConfig {
    pub host: String,
    pub port: u16,
}

impl Default for OscConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// How long `start` waits for the camera to open.
    pub open_timeout_ms: u64,
    /// How long `stop` waits for the capture thread before detaching it.
    pub stop_timeout_ms: u64,
    /// Consecutive failed reads that are retried without delay.
    pub backoff_after_failures: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: 10_000,
            stop_timeout_ms: 2_000,
            backoff_after_failures: 5,
            backoff_base_ms: 10,
            backoff_max_ms: 500,
        }
    }
}

impl CaptureConfig {
    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            open_timeout: Duration::from_millis(self.open_timeout_ms),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            backoff: Backoff {
                after_failures: self.backoff_after_failures,
                base: Duration::from_millis(self.backoff_base_ms),
                max: Duration::from_millis(self.backoff_max_ms),
            },
        }
    }
}

/// Model files for both modalities. Each modality runs a region detector
/// followed by a landmark model; a missing file is fetched from its URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub person_detector_model: PathBuf,
    pub person_detector_model_url: Option<String>,
    pub pose_model: PathBuf,
    pub pose_model_url: Option<String>,
    pub face_detector_model: PathBuf,
    pub face_detector_model_url: Option<String>,
    pub face_model: PathBuf,
    pub face_model_url: Option<String>,
    /// Applied to both the person detector and the pose landmark score.
    pub min_pose_confidence: f32,
    /// Applied to both the face detector and the face presence score.
    pub min_face_confidence: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let url = |kind: ModelKind| Some(kind.default_url().to_string());
        Self {
            person_detector_model: ModelKind::PersonDetector.default_path(),
            person_detector_model_url: url(ModelKind::PersonDetector),
            pose_model: ModelKind::Pose.default_path(),
            pose_model_url: url(ModelKind::Pose),
            face_detector_model: ModelKind::FaceDetector.default_path(),
            face_detector_model_url: url(ModelKind::FaceDetector),
            face_model: ModelKind::FaceMesh.default_path(),
            face_model_url: url(ModelKind::FaceMesh),
            min_pose_confidence: 0.5,
            min_face_confidence: 0.5,
        }
    }
}
