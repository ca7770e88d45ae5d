// projeto: lstmsensorforecast
// file: src/config.rs
// Settings file: data source, model shape, training policy and output paths

use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::neural::data::ChannelSet;
use crate::neural::metrics::{EarlyStopping, MonitorMode};
use crate::neural::model::{ArchitectureConfig, ModelConfig, TrainingOptions};
use crate::neural::utils::{ForecastError, LearningRateScheduler};

pub const DEFAULT_CONFIG_FILE: &str = "sensor_forecast.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub data: DataSettings,
    pub model: ModelSettings,
    pub training: TrainingSettings,
    pub paths: PathSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    /// CSV or JSON table; synthetic data is generated when unset.
    pub path: Option<PathBuf>,
    pub synthetic_samples: usize,
    pub synthetic_seed: u64,
    pub synthetic_interval_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub sequence_length: usize,
    pub prediction_horizon: usize,
    pub lstm_units: Vec<usize>,
    pub dense_units: [usize; 2],
    pub attention: bool,
    pub dropout_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub train_split: f64,
    pub patience: usize,
    pub min_delta: f64,
    pub clip_norm: Option<f64>,
    pub lr_factor: f64,
    pub lr_patience: usize,
    pub min_lr: f64,
    pub shuffle: bool,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
}

impl Default for DataSettings {
    fn default() -> Self {
        DataSettings {
            path: None,
            synthetic_samples: 2000,
            synthetic_seed: 42,
            synthetic_interval_minutes: 60,
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        let arch = ArchitectureConfig::default();
        ModelSettings {
            sequence_length: 24,
            prediction_horizon: 12,
            lstm_units: arch.lstm_units,
            dense_units: arch.dense_units,
            attention: arch.attention,
            dropout_rate: arch.dropout_rate,
        }
    }
}

impl Default for TrainingSettings {
    fn default() -> Self {
        TrainingSettings {
            epochs: 100,
            batch_size: 32,
            learning_rate: 0.001,
            train_split: 0.8,
            patience: 15,
            min_delta: 0.0,
            clip_norm: Some(1.0),
            lr_factor: 0.5,
            lr_patience: 7,
            min_lr: 1e-7,
            shuffle: true,
            seed: None,
        }
    }
}

impl Default for PathSettings {
    fn default() -> Self {
        PathSettings {
            artifacts_dir: PathBuf::from("artifacts"),
            reports_dir: PathBuf::from("reports"),
        }
    }
}

fn invalid(msg: String) -> Result<(), ForecastError> {
    Err(ForecastError::InvalidConfig(msg))
}

impl Settings {
    /// Reads `path`, or returns defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ForecastError> {
        if !path.exists() {
            info!("📄 [Config] {} not found, using defaults", path.display());
            return Ok(Settings::default());
        }
        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)
            .map_err(|e| ForecastError::Config(format!("{}: {}", path.display(), e)))?;
        info!("⚙️ [Config] Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), ForecastError> {
        let content = toml::to_string_pretty(self).map_err(|e| ForecastError::Config(e.to_string()))?;
        fs::write(path, content)?;
        info!("💾 [Config] Settings saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ForecastError> {
        let m = &self.model;
        if m.sequence_length < 2 {
            return invalid(format!("model.sequence_length must be at least 2, got {}", m.sequence_length));
        }
        if m.prediction_horizon == 0 {
            return invalid("model.prediction_horizon must be positive".to_string());
        }
        if m.lstm_units.is_empty() || m.lstm_units.contains(&0) || m.dense_units.contains(&0) {
            return invalid(format!(
                "layer sizes must be positive: lstm_units {:?}, dense_units {:?}",
                m.lstm_units, m.dense_units
            ));
        }
        if !(0.0..1.0).contains(&m.dropout_rate) {
            return invalid(format!("model.dropout_rate must be in [0, 1), got {}", m.dropout_rate));
        }

        let t = &self.training;
        if t.epochs == 0 || t.batch_size == 0 {
            return invalid("training.epochs and training.batch_size must be positive".to_string());
        }
        if !(t.learning_rate > 0.0 && t.learning_rate.is_finite()) {
            return invalid(format!("training.learning_rate must be positive, got {}", t.learning_rate));
        }
        if !(t.train_split > 0.0 && t.train_split < 1.0) {
            return invalid(format!("training.train_split must be in (0, 1), got {}", t.train_split));
        }
        if !(t.lr_factor > 0.0 && t.lr_factor < 1.0) {
            return invalid(format!("training.lr_factor must be in (0, 1), got {}", t.lr_factor));
        }
        if t.min_lr < 0.0 || t.min_delta < 0.0 {
            return invalid("training.min_lr and training.min_delta cannot be negative".to_string());
        }
        if let Some(clip) = t.clip_norm {
            if clip <= 0.0 {
                return invalid(format!("training.clip_norm must be positive, got {}", clip));
            }
        }

        let d = &self.data;
        if d.synthetic_interval_minutes <= 0 {
            return invalid("data.synthetic_interval_minutes must be positive".to_string());
        }
        if d.path.is_none() && d.synthetic_samples < m.sequence_length + m.prediction_horizon {
            return invalid(format!(
                "data.synthetic_samples ({}) is shorter than one window ({})",
                d.synthetic_samples,
                m.sequence_length + m.prediction_horizon
            ));
        }
        Ok(())
    }

    pub fn architecture(&self) -> ArchitectureConfig {
        ArchitectureConfig {
            lstm_units: self.model.lstm_units.clone(),
            dense_units: self.model.dense_units,
            attention: self.model.attention,
            dropout_rate: self.model.dropout_rate,
        }
    }

    pub fn model_config(&self, channels: ChannelSet) -> ModelConfig {
        ModelConfig::new(self.model.sequence_length, self.model.prediction_horizon, channels, self.architecture())
    }

    pub fn training_options(&self) -> TrainingOptions {
        let t = &self.training;
        TrainingOptions {
            epochs: t.epochs,
            batch_size: t.batch_size,
            learning_rate: t.learning_rate,
            clip_norm: t.clip_norm,
            scheduler: LearningRateScheduler::ReduceOnPlateau {
                factor: t.lr_factor,
                patience: t.lr_patience,
                min_rate: t.min_lr,
            },
            shuffle: t.shuffle,
            seed: t.seed,
        }
    }

    pub fn early_stopping(&self) -> EarlyStopping {
        EarlyStopping::new(self.training.patience, self.training.min_delta, MonitorMode::Min)
    }

    pub fn print_summary(&self) {
        info!("📋 [Config] Settings:");
        match &self.data.path {
            Some(path) => info!("  📥 Data: {}", path.display()),
            None => info!(
                "  📥 Data: synthetic ({} samples, seed {})",
                self.data.synthetic_samples, self.data.synthetic_seed
            ),
        }
        info!(
            "  🧠 Model: L={} H={} lstm={:?} dense={:?} attention={} dropout={}",
            self.model.sequence_length,
            self.model.prediction_horizon,
            self.model.lstm_units,
            self.model.dense_units,
            self.model.attention,
            self.model.dropout_rate
        );
        info!(
            "  🏋️ Training: epochs={} batch={} lr={} split={} patience={}",
            self.training.epochs,
            self.training.batch_size,
            self.training.learning_rate,
            self.training.train_split,
            self.training.patience
        );
        info!("  📁 Artifacts: {}", self.paths.artifacts_dir.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.model.sequence_length, 24);
        assert_eq!(settings.model.prediction_horizon, 12);
        assert_eq!(settings.model.lstm_units, vec![128, 64]);
        assert_eq!(settings.training.patience, 15);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut settings = Settings::default();
        settings.model.sequence_length = 1;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.training.train_split = 1.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.model.dropout_rate = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.data.synthetic_samples = 30;
        assert!(settings.validate().is_err());
        settings.data.path = Some(PathBuf::from("sensors.csv"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut settings = Settings::default();
        settings.training.epochs = 7;
        settings.training.seed = Some(3);
        settings.save(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("[training]"));
        assert!(content.contains("[model]"));

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(&path, "[model]\nprediction_horizon = 6\n\n[training]\nepochs = 5\n").unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.model.prediction_horizon, 6);
        assert_eq!(settings.model.sequence_length, 24);
        assert_eq!(settings.training.epochs, 5);
        assert_eq!(settings.training.batch_size, 32);
    }

    #[test]
    fn test_missing_file_and_bad_file() {
        let dir = tempdir().unwrap();
        assert_eq!(Settings::load(&dir.path().join("absent.toml")).unwrap(), Settings::default());

        let bad = dir.path().join("bad.toml");
        fs::write(&bad, "[model\nsequence_length = ").unwrap();
        assert!(matches!(Settings::load(&bad), Err(ForecastError::Config(_))));
    }

    #[test]
    fn test_conversions() {
        let settings = Settings::default();
        let channels = ChannelSet::new(["a", "b", "c"]).unwrap();
        let config = settings.model_config(channels);
        assert_eq!(config.channel_count, 3);
        assert_eq!(config.input_shape(), (24, 3));
        assert!(config.validate().is_ok());

        let options = settings.training_options();
        assert_eq!(options.batch_size, 32);
        assert!(matches!(options.scheduler, LearningRateScheduler::ReduceOnPlateau { patience: 7, .. }));
    }
}
