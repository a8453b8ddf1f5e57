use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use veil_core::{DetectorMode, EnsembleParams, FusionStrategy, MatchPolicy, PreprocessParams, ThresholdParams};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value}")]
    Env { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine configuration: TOML file (optional) overridden by `VEIL_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of images in flight at once.
    pub concurrency_limit: usize,
    /// Global distance threshold; also the adaptive-threshold starting point.
    pub base_threshold: f32,
    pub min_threshold: f32,
    pub max_threshold: f32,
    pub use_adaptive_thresholds: bool,
    pub detector_mode: DetectorMode,
    /// Backends to run, in ensemble order.
    pub ensemble_backends: Vec<String>,
    pub backend_weights: BTreeMap<String, f32>,
    pub fusion: FusionStrategy,
    pub min_consensus: usize,
    pub iou_threshold: f32,
    pub variance_scale: f32,
    pub variance_weight: f32,
    /// Bounded wait for a requested backend to finish loading.
    pub backend_ready_timeout_ms: u64,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Backend name -> SCRFD model file (relative to `model_dir`).
    pub backend_models: BTreeMap<String, String>,
    /// ArcFace model file shared by every ONNX backend.
    pub recognizer_model: String,
    pub preprocess: PreprocessParams,
}

impl Default for Config {
    fn default() -> Self {
        let threshold = ThresholdParams::default();
        Self {
            concurrency_limit: 8,
            base_threshold: threshold.base,
            min_threshold: threshold.min,
            max_threshold: threshold.max,
            use_adaptive_thresholds: true,
            detector_mode: DetectorMode::Selective,
            ensemble_backends: vec!["scrfd_10g".to_string()],
            backend_weights: BTreeMap::from([
                ("scrfd_10g".to_string(), 1.2),
                ("scrfd_500m".to_string(), 1.0),
            ]),
            fusion: FusionStrategy::BestSet,
            min_consensus: 2,
            iou_threshold: 0.5,
            variance_scale: threshold.variance_scale,
            variance_weight: threshold.variance_weight,
            backend_ready_timeout_ms: 10_000,
            model_dir: default_model_dir(),
            backend_models: BTreeMap::from([
                ("scrfd_10g".to_string(), "det_10g.onnx".to_string()),
                ("scrfd_500m".to_string(), "scrfd_500m_bnkps.onnx".to_string()),
            ]),
            recognizer_model: "w600k_r50.onnx".to_string(),
            preprocess: PreprocessParams::default(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, apply `VEIL_*` overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        fn parse<T: FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &'static str,
        ) -> Result<Option<T>, ConfigError> {
            match lookup(key) {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError::Env { key, value }),
            }
        }

        if let Some(v) = parse(&lookup, "VEIL_CONCURRENCY_LIMIT")? {
            self.concurrency_limit = v;
        }
        if let Some(v) = parse(&lookup, "VEIL_BASE_THRESHOLD")? {
            self.base_threshold = v;
        }
        if let Some(v) = parse(&lookup, "VEIL_MIN_THRESHOLD")? {
            self.min_threshold = v;
        }
        if let Some(v) = parse(&lookup, "VEIL_MAX_THRESHOLD")? {
            self.max_threshold = v;
        }
        if let Some(v) = lookup("VEIL_USE_ADAPTIVE_THRESHOLDS") {
            self.use_adaptive_thresholds = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Some(v) = parse(&lookup, "VEIL_DETECTOR_MODE")? {
            self.detector_mode = v;
        }
        if let Some(v) = lookup("VEIL_ENSEMBLE_BACKENDS") {
            self.ensemble_backends = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = parse(&lookup, "VEIL_FUSION")? {
            self.fusion = v;
        }
        if let Some(v) = parse(&lookup, "VEIL_MIN_CONSENSUS")? {
            self.min_consensus = v;
        }
        if let Some(v) = parse(&lookup, "VEIL_IOU_THRESHOLD")? {
            self.iou_threshold = v;
        }
        if let Some(v) = parse(&lookup, "VEIL_BACKEND_TIMEOUT_MS")? {
            self.backend_ready_timeout_ms = v;
        }
        if let Some(v) = lookup("VEIL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.concurrency_limit == 0 {
            return invalid("concurrency_limit must be at least 1".into());
        }
        if self.base_threshold <= 0.0 {
            return invalid(format!("base_threshold must be positive, got {}", self.base_threshold));
        }
        if self.min_threshold > self.max_threshold {
            return invalid(format!(
                "min_threshold {} exceeds max_threshold {}",
                self.min_threshold, self.max_threshold
            ));
        }
        if !(self.min_threshold..=self.max_threshold).contains(&self.base_threshold) {
            return invalid(format!(
                "base_threshold {} outside [{}, {}]",
                self.base_threshold, self.min_threshold, self.max_threshold
            ));
        }
        if self.detector_mode != DetectorMode::Off && self.ensemble_backends.is_empty() {
            return invalid("ensemble_backends is empty".into());
        }
        if !(self.iou_threshold > 0.0 && self.iou_threshold <= 1.0) {
            return invalid(format!("iou_threshold must be in (0, 1], got {}", self.iou_threshold));
        }
        if self.min_consensus == 0 {
            return invalid("min_consensus must be at least 1".into());
        }
        Ok(())
    }

    pub fn threshold_params(&self) -> ThresholdParams {
        ThresholdParams {
            base: self.base_threshold,
            min: self.min_threshold,
            max: self.max_threshold,
            variance_scale: self.variance_scale,
            variance_weight: self.variance_weight,
            ..ThresholdParams::default()
        }
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            mode: self.detector_mode,
            use_adaptive_thresholds: self.use_adaptive_thresholds,
            base_threshold: self.base_threshold,
        }
    }

    pub fn ensemble_params(&self) -> EnsembleParams {
        EnsembleParams {
            strategy: self.fusion,
            weights: self.backend_weights.clone(),
            iou_threshold: self.iou_threshold,
            min_consensus: self.min_consensus,
            ..EnsembleParams::default()
        }
    }

    pub fn backend_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_ready_timeout_ms)
    }

    /// Path to the SCRFD model for a named backend.
    pub fn backend_model_path(&self, name: &str) -> Option<PathBuf> {
        self.backend_models.get(name).map(|file| self.model_dir.join(file))
    }

    /// Path to the shared ArcFace model.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.recognizer_model)
    }

    /// Whether switching from `self` to `next` changes any identity threshold.
    pub fn thresholds_changed(&self, next: &Config) -> bool {
        self.threshold_params() != next.threshold_params()
            || self.use_adaptive_thresholds != next.use_adaptive_thresholds
    }
}

fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("veil/models")
}
