// projeto: lstmsensorforecast
// file: src/neural/metrics.rs
// Per-epoch training history, forecast error metrics and early stopping

use log::info;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::neural::utils::ForecastError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_mae: f64,
    pub val_loss: f64,
    pub val_mae: f64,
    pub learning_rate: f64,
    pub duration_secs: f64,
    /// Validation loss beat every earlier epoch.
    pub improved: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingLog {
    pub epochs: Vec<EpochMetrics>,
    pub best_epoch: usize,
    pub best_val_loss: f64,
    pub stopped_early: bool,
}

impl TrainingLog {
    pub fn new() -> Self {
        TrainingLog {
            epochs: Vec::new(),
            best_epoch: 0,
            best_val_loss: f64::INFINITY,
            stopped_early: false,
        }
    }

    /// Appends an epoch; returns whether it is the new best.
    pub fn record(&mut self, mut metrics: EpochMetrics) -> bool {
        let is_best = metrics.val_loss < self.best_val_loss;
        if is_best {
            self.best_val_loss = metrics.val_loss;
            self.best_epoch = metrics.epoch;
        }
        metrics.improved = is_best;
        self.epochs.push(metrics);
        is_best
    }

    pub fn best(&self) -> Option<&EpochMetrics> {
        self.epochs.iter().find(|m| m.epoch == self.best_epoch)
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    pub fn print_summary(&self) {
        if let Some(best) = self.best() {
            info!("📈 [Trainer] Training summary:");
            info!("   ├── Epochs run: {}", self.epochs.len());
            info!("   ├── Best epoch: {}", best.epoch);
            info!("   ├── Best val loss: {:.6}", best.val_loss);
            info!("   ├── Val MAE: {:.6}", best.val_mae);
            info!("   └── Stopped early: {}", self.stopped_early);
        }
    }

    pub fn save_to_csv(&self, path: &Path) -> Result<(), ForecastError> {
        let mut writer = csv::Writer::from_path(path)?;
        for metrics in &self.epochs {
            writer.serialize(metrics)?;
        }
        writer.flush()?;
        info!("📊 [Trainer] Training history saved to: {}", path.display());
        Ok(())
    }
}

/// Aggregate error of forecasts against ground truth, in whatever units the
/// inputs are in (scaled during training).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastMetrics {
    pub mse: f64,
    pub mae: f64,
    pub rmse: f64,
    pub max_error: f64,
    pub per_channel_rmse: Vec<f64>,
    pub n_samples: usize,
}

impl ForecastMetrics {
    /// Every pair must share one `(horizon, channels)` shape.
    pub fn compute(predictions: &[Array2<f64>], targets: &[Array2<f64>]) -> Result<Self, ForecastError> {
        if predictions.len() != targets.len() {
            return Err(ForecastError::Shape(format!(
                "{} predictions for {} targets",
                predictions.len(),
                targets.len()
            )));
        }
        let first = targets
            .first()
            .ok_or_else(|| ForecastError::InvalidInput("no samples to evaluate".to_string()))?;
        let channels = first.ncols();

        let mut sq_sum = 0.0;
        let mut abs_sum = 0.0;
        let mut max_error: f64 = 0.0;
        let mut channel_sq = Array1::<f64>::zeros(channels);
        for (pred, target) in predictions.iter().zip(targets) {
            if pred.dim() != first.dim() || target.dim() != first.dim() {
                return Err(ForecastError::Shape(format!(
                    "expected {:?}, got prediction {:?} / target {:?}",
                    first.dim(),
                    pred.dim(),
                    target.dim()
                )));
            }
            let diff = pred - target;
            sq_sum += diff.iter().map(|d| d * d).sum::<f64>();
            abs_sum += diff.iter().map(|d| d.abs()).sum::<f64>();
            max_error = diff.iter().fold(max_error, |acc, d| acc.max(d.abs()));
            channel_sq += &diff.mapv(|d| d * d).sum_axis(ndarray::Axis(0));
        }

        let n = predictions.len();
        let elements = (n * first.len()) as f64;
        let per_channel_count = (n * first.nrows()) as f64;
        let mse = sq_sum / elements;
        Ok(ForecastMetrics {
            mse,
            mae: abs_sum / elements,
            rmse: mse.sqrt(),
            max_error,
            per_channel_rmse: channel_sq.iter().map(|s| (s / per_channel_count).sqrt()).collect(),
            n_samples: n,
        })
    }

    pub fn print(&self, prefix: &str, channel_names: &[String]) {
        info!("📊 [{}] Forecast metrics:", prefix);
        info!("   ├── Samples: {}", self.n_samples);
        info!("   ├── MSE: {:.6}", self.mse);
        info!("   ├── MAE: {:.6}", self.mae);
        info!("   ├── RMSE: {:.6}", self.rmse);
        info!("   ├── Max error: {:.6}", self.max_error);
        for (name, rmse) in channel_names.iter().zip(&self.per_channel_rmse) {
            info!("   │   {:<14} RMSE {:.6}", name, rmse);
        }
        info!("   └──");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorMode {
    Min,
    Max,
}

/// Stop predicate over a monitored score, meant to be driven from the
/// per-epoch training callback.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    pub patience: usize,
    pub min_delta: f64,
    pub mode: MonitorMode,
    pub best_score: Option<f64>,
    pub wait: usize,
    pub stopped_epoch: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64, mode: MonitorMode) -> Self {
        EarlyStopping {
            patience,
            min_delta,
            mode,
            best_score: None,
            wait: 0,
            stopped_epoch: 0,
        }
    }

    pub fn should_stop(&mut self, current_score: f64, epoch: usize) -> bool {
        match self.best_score {
            None => {
                self.best_score = Some(current_score);
                false
            }
            Some(best) => {
                let is_better = match self.mode {
                    MonitorMode::Min => current_score < best - self.min_delta,
                    MonitorMode::Max => current_score > best + self.min_delta,
                };

                if is_better {
                    self.best_score = Some(current_score);
                    self.wait = 0;
                    false
                } else {
                    self.wait += 1;
                    if self.wait >= self.patience {
                        self.stopped_epoch = epoch;
                        true
                    } else {
                        false
                    }
                }
            }
        }
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best_score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    fn epoch(epoch: usize, val_loss: f64) -> EpochMetrics {
        EpochMetrics {
            epoch,
            train_loss: val_loss * 0.9,
            train_mae: 0.1,
            val_loss,
            val_mae: 0.2,
            learning_rate: 1e-3,
            duration_secs: 0.5,
            improved: false,
        }
    }

    #[test]
    fn test_training_log_tracks_best() {
        let mut log = TrainingLog::new();
        assert!(log.record(epoch(1, 0.5)));
        assert!(log.record(epoch(2, 0.3)));
        assert!(!log.record(epoch(3, 0.4)));
        assert_eq!(log.best_epoch, 2);
        assert_eq!(log.best_val_loss, 0.3);
        assert!(log.epochs[1].improved);
        assert!(!log.epochs[2].improved);
        assert_eq!(log.best().map(|m| m.epoch), Some(2));
    }

    #[test]
    fn test_training_log_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.csv");
        let mut log = TrainingLog::new();
        log.record(epoch(1, 0.5));
        log.record(epoch(2, 0.4));
        log.save_to_csv(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("epoch,train_loss"));
    }

    #[test]
    fn test_forecast_metrics() {
        let preds = vec![array![[1.0, 2.0], [3.0, 4.0]], array![[0.0, 0.0], [0.0, 0.0]]];
        let targets = vec![array![[1.0, 2.0], [3.0, 2.0]], array![[1.0, 0.0], [0.0, 0.0]]];
        let m = ForecastMetrics::compute(&preds, &targets).unwrap();

        // errors: 0,0,0,2 and 1,0,0,0
        assert!((m.mse - 5.0 / 8.0).abs() < 1e-12);
        assert!((m.mae - 3.0 / 8.0).abs() < 1e-12);
        assert!((m.rmse - (5.0f64 / 8.0).sqrt()).abs() < 1e-12);
        assert_eq!(m.max_error, 2.0);
        assert!((m.per_channel_rmse[0] - (1.0f64 / 4.0).sqrt()).abs() < 1e-12);
        assert!((m.per_channel_rmse[1] - (4.0f64 / 4.0).sqrt()).abs() < 1e-12);
        assert_eq!(m.n_samples, 2);
    }

    #[test]
    fn test_forecast_metrics_shape_errors() {
        let preds = vec![array![[1.0, 2.0]]];
        assert!(ForecastMetrics::compute(&preds, &[]).is_err());
        assert!(ForecastMetrics::compute(&preds, &[array![[1.0, 2.0, 3.0]]]).is_err());
        assert!(ForecastMetrics::compute(&[], &[]).is_err());
    }

    #[test]
    fn test_early_stopping() {
        let mut es = EarlyStopping::new(2, 0.01, MonitorMode::Min);
        assert!(!es.should_stop(1.0, 1));
        assert!(!es.should_stop(0.8, 2));
        assert!(!es.should_stop(0.795, 3));
        assert!(es.should_stop(0.9, 4));
        assert_eq!(es.stopped_epoch, 4);
        assert_eq!(es.best_score(), Some(0.8));
    }
}
