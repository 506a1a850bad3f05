use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;

const DEFAULT_DB_PATH: &str = "proctor.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8811";
const DEFAULT_YAW_THRESHOLD: f64 = 30.0;
const DEFAULT_PITCH_THRESHOLD: f64 = 20.0;
const DEFAULT_ROLL_THRESHOLD: f64 = 30.0;
const DEFAULT_POSITION_MARGIN: f64 = 0.3;
const DEFAULT_DETECTOR_BACKEND: &str = "stub";
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DEFAULT_FORBIDDEN_LABELS: &[&str] = &["cell phone", "laptop"];

#[derive(Debug, Deserialize, Default)]
struct ProctordConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    pose: Option<PoseConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PoseConfigFile {
    yaw_threshold: Option<f64>,
    pitch_threshold: Option<f64>,
    roll_threshold: Option<f64>,
    position_margin: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    confidence_threshold: Option<f32>,
    forbidden_labels: Option<Vec<String>>,
    object_model: Option<String>,
    face_model: Option<String>,
    landmark_model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProctordConfig {
    pub db_path: String,
    pub api_addr: String,
    pub pose: PoseSettings,
    pub detector: DetectorSettings,
}

#[derive(Debug, Clone)]
pub struct PoseSettings {
    /// Degrees past which yaw/pitch/roll raise an alert.
    pub yaw_threshold: f64,
    pub pitch_threshold: f64,
    pub roll_threshold: f64,
    /// Normalized edge margin for the simplified position heuristic.
    pub position_margin: f64,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub confidence_threshold: f32,
    pub forbidden_labels: Vec<String>,
    pub object_model: Option<String>,
    pub face_model: Option<String>,
    pub landmark_model: Option<String>,
}

impl Default for PoseSettings {
    fn default() -> Self {
        Self {
            yaw_threshold: DEFAULT_YAW_THRESHOLD,
            pitch_threshold: DEFAULT_PITCH_THRESHOLD,
            roll_threshold: DEFAULT_ROLL_THRESHOLD,
            position_margin: DEFAULT_POSITION_MARGIN,
        }
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTOR_BACKEND.to_string(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            forbidden_labels: DEFAULT_FORBIDDEN_LABELS
                .iter()
                .map(|label| label.to_string())
                .collect(),
            object_model: None,
            face_model: None,
            landmark_model: None,
        }
    }
}

impl ProctordConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PROCTOR_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ProctordConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let pose_defaults = PoseSettings::default();
        let pose = match file.pose {
            Some(pose) => PoseSettings {
                yaw_threshold: pose.yaw_threshold.unwrap_or(pose_defaults.yaw_threshold),
                pitch_threshold: pose
                    .pitch_threshold
                    .unwrap_or(pose_defaults.pitch_threshold),
                roll_threshold: pose.roll_threshold.unwrap_or(pose_defaults.roll_threshold),
                position_margin: pose
                    .position_margin
                    .unwrap_or(pose_defaults.position_margin),
            },
            None => pose_defaults,
        };
        let detector_defaults = DetectorSettings::default();
        let detector = match file.detector {
            Some(detector) => DetectorSettings {
                backend: detector
                    .backend
                    .unwrap_or_else(|| detector_defaults.backend.clone()),
                confidence_threshold: detector
                    .confidence_threshold
                    .unwrap_or(detector_defaults.confidence_threshold),
                forbidden_labels: detector
                    .forbidden_labels
                    .unwrap_or_else(|| detector_defaults.forbidden_labels.clone()),
                object_model: detector.object_model,
                face_model: detector.face_model,
                landmark_model: detector.landmark_model,
            },
            None => detector_defaults,
        };
        Self {
            db_path,
            api_addr,
            pose,
            detector,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("PROCTOR_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(path) = std::env::var("PROCTOR_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(backend) = std::env::var("PROCTOR_DETECTOR_BACKEND") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend;
            }
        }
        if let Ok(labels) = std::env::var("PROCTOR_FORBIDDEN_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.detector.forbidden_labels = parsed;
            }
        }
        if let Ok(threshold) = std::env::var("PROCTOR_CONFIDENCE_THRESHOLD") {
            let parsed: f32 = threshold
                .parse()
                .map_err(|_| anyhow!("PROCTOR_CONFIDENCE_THRESHOLD must be a number"))?;
            self.detector.confidence_threshold = parsed;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.pose.yaw_threshold <= 0.0
            || self.pose.pitch_threshold <= 0.0
            || self.pose.roll_threshold <= 0.0
        {
            return Err(anyhow!("pose thresholds must be greater than zero"));
        }
        if !(0.0..0.5).contains(&self.pose.position_margin) {
            return Err(anyhow!("position margin must be in [0, 0.5)"));
        }
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return Err(anyhow!("confidence threshold must be in [0, 1]"));
        }
        if self.detector.forbidden_labels.is_empty() {
            return Err(anyhow!("forbidden label set must not be empty"));
        }
        match self.detector.backend.as_str() {
            "stub" | "tract" => Ok(()),
            other => Err(anyhow!("unknown detector backend '{}'", other)),
        }
    }
}

impl Default for ProctordConfig {
    fn default() -> Self {
        Self::from_file(ProctordConfigFile::default())
    }
}

fn read_config_file(path: &Path) -> Result<ProctordConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
