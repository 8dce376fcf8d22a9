//! Configuration file support for repeat-predictor
//!
//! Reads from .repeat-predictor/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::calibrate::ThresholdPolicy;
use crate::error::ConfigError;
use crate::trainer::TrainerConfig;

/// Directory holding the config file and the default database.
pub const PROJECT_DIR: &str = ".repeat-predictor";

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Config {
    /// Windowing and calibration settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Network shape and optimiser settings
    #[serde(default)]
    pub trainer: TrainerConfig,

    /// Where the call database lives
    #[serde(default)]
    pub store: StoreConfig,
}

/// Windowing and calibration settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Calendar days after an attended call during which a follow-up counts as a repeat
    /// Default: 14
    #[serde(default = "default_repeat_days")]
    pub repeat_days: u32,

    /// Days of history loaded before the prediction date (all history when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_days: Option<u32>,

    /// Most recent model-region rows reserved for threshold calibration
    /// Default: 1000
    #[serde(default = "default_calibration_rows")]
    pub calibration_rows: usize,

    /// Fewest rows the trainer will accept after the calibration slice is reserved
    /// Default: 200
    #[serde(default = "default_min_training_rows")]
    pub min_training_rows: usize,

    /// TP/FP ratio at which the threshold scan stops
    /// Default: 2.0
    #[serde(default = "default_target_ratio")]
    pub target_ratio: f64,
}

/// Database location
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct StoreConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

fn default_repeat_days() -> u32 {
    14
}

fn default_calibration_rows() -> usize {
    1000
}

fn default_min_training_rows() -> usize {
    200
}

fn default_target_ratio() -> f64 {
    2.0
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            repeat_days: default_repeat_days(),
            history_days: None,
            calibration_rows: default_calibration_rows(),
            min_training_rows: default_min_training_rows(),
            target_ratio: default_target_ratio(),
        }
    }
}

impl PipelineConfig {
    pub fn threshold_policy(&self) -> ThresholdPolicy {
        ThresholdPolicy {
            target_ratio: self.target_ratio,
        }
    }
}

impl Config {
    /// Load config from .repeat-predictor/config.toml
    /// Returns default config if the file doesn't exist or can't be used
    pub fn load() -> Self {
        match Self::find_config_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "ignoring config file");
                Self::default()
            }),
            None => Self::default(),
        }
    }

    /// Load and validate a specific config file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.repeat_days == 0 {
            return Err(ConfigError::Invalid("pipeline.repeat_days must be positive".into()));
        }
        if self.pipeline.target_ratio <= 0.0 {
            return Err(ConfigError::Invalid("pipeline.target_ratio must be positive".into()));
        }
        if self.pipeline.calibration_rows == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.calibration_rows must be positive".into(),
            ));
        }
        self.trainer
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("trainer: {}", e)))
    }

    /// Find config.toml by walking up directory tree
    pub fn find_config_path() -> Option<PathBuf> {
        find_in_ancestors(&Path::new(PROJECT_DIR).join("config.toml"))
    }

    /// Render as TOML, for `init`
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Walk up from the current directory looking for `relative`
pub fn find_in_ancestors(relative: &Path) -> Option<PathBuf> {
    let current_dir = std::env::current_dir().ok()?;
    let mut dir = current_dir.as_path();

    loop {
        let candidate = dir.join(relative);
        if candidate.exists() {
            return Some(candidate);
        }

        match dir.parent() {
            Some(parent) => dir = parent,
            None => break,
        }
    }
    None
}
