// projeto: lstmsensorforecast
// file: src/neural/scaler.rs
// Per-channel standardization fitted on raw sensor values

use log::{debug, warn};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::neural::data::{ChannelSet, TimeSeriesTable};
use crate::neural::utils::{ForecastError, validate_input_data};

/// Lower bound for a channel's scale. Constant channels map to zero instead of
/// dividing by zero.
pub const MIN_SCALE: f64 = 1e-8;
pub const SCALER_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub mean: f64,
    pub scale: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalerParams {
    channels: ChannelSet,
    mean: Array1<f64>,
    scale: Array1<f64>,
}

/// On-disk form, keyed by channel name.
#[derive(Debug, Serialize, Deserialize)]
struct ScalerArtifact {
    format_version: u32,
    channels: BTreeMap<String, ChannelStats>,
}

impl ScalerParams {
    pub fn fit(table: &TimeSeriesTable) -> Result<Self, ForecastError> {
        Self::fit_matrix(table.channels().clone(), table.values())
    }

    /// Population mean and standard deviation per column.
    pub fn fit_matrix(channels: ChannelSet, values: &Array2<f64>) -> Result<Self, ForecastError> {
        if values.nrows() == 0 {
            return Err(ForecastError::InvalidInput("cannot fit scaler on zero rows".to_string()));
        }
        if values.ncols() != channels.len() {
            return Err(ForecastError::InvalidInput(format!(
                "scaler fit: {} columns for {} channels",
                values.ncols(),
                channels.len()
            )));
        }
        validate_input_data(values, "scaler fit data")?;

        let mean = values
            .mean_axis(Axis(0))
            .ok_or_else(|| ForecastError::InvalidInput("cannot fit scaler on zero rows".to_string()))?;
        let std = values.std_axis(Axis(0), 0.0);

        for (name, &s) in channels.names().iter().zip(std.iter()) {
            if s < MIN_SCALE {
                warn!("⚠️ [Scaler] Channel '{}' is constant; scale clamped to {:e}", name, MIN_SCALE);
            }
        }
        let scale = std.mapv(|s| s.max(MIN_SCALE));
        debug!("[Scaler] Fitted {} channels on {} rows", channels.len(), values.nrows());

        Ok(ScalerParams { channels, mean, scale })
    }

    pub fn from_stats(channels: ChannelSet, stats: &[ChannelStats]) -> Result<Self, ForecastError> {
        if stats.len() != channels.len() {
            return Err(ForecastError::InvalidInput(format!(
                "{} stats for {} channels",
                stats.len(),
                channels.len()
            )));
        }
        if stats.iter().any(|s| !s.mean.is_finite() || !s.scale.is_finite() || s.scale <= 0.0) {
            return Err(ForecastError::InvalidInput("scaler stats must be finite with positive scale".to_string()));
        }
        Ok(ScalerParams {
            channels,
            mean: stats.iter().map(|s| s.mean).collect(),
            scale: stats.iter().map(|s| s.scale.max(MIN_SCALE)).collect(),
        })
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    pub fn stats(&self) -> Vec<ChannelStats> {
        self.mean
            .iter()
            .zip(self.scale.iter())
            .map(|(&mean, &scale)| ChannelStats { mean, scale })
            .collect()
    }

    fn check(&self, values: &Array2<f64>, op: &str) -> Result<(), ForecastError> {
        if values.ncols() != self.channels.len() {
            return Err(ForecastError::InvalidInput(format!(
                "{}: expected {} channels, got {}",
                op,
                self.channels.len(),
                values.ncols()
            )));
        }
        validate_input_data(values, op)
    }

    /// `(x - mean) / scale`, column-wise.
    pub fn transform(&self, values: &Array2<f64>) -> Result<Array2<f64>, ForecastError> {
        self.check(values, "transform")?;
        Ok((values - &self.mean) / &self.scale)
    }

    pub fn inverse_transform(&self, values: &Array2<f64>) -> Result<Array2<f64>, ForecastError> {
        self.check(values, "inverse_transform")?;
        Ok(values * &self.scale + &self.mean)
    }

    pub fn to_json(&self) -> Result<String, ForecastError> {
        let artifact = ScalerArtifact {
            format_version: SCALER_FORMAT_VERSION,
            channels: self
                .channels
                .names()
                .iter()
                .cloned()
                .zip(self.stats())
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&artifact)?)
    }

    /// Rebuilds the scaler in `channels` order. Every channel must be present,
    /// and no others.
    pub fn from_json(json: &str, channels: &ChannelSet) -> Result<Self, ForecastError> {
        let artifact: ScalerArtifact = serde_json::from_str(json)?;
        if artifact.format_version != SCALER_FORMAT_VERSION {
            return Err(ForecastError::ArtifactMismatch(format!(
                "scaler format version {} (expected {})",
                artifact.format_version, SCALER_FORMAT_VERSION
            )));
        }
        if artifact.channels.len() != channels.len() {
            return Err(ForecastError::ArtifactMismatch(format!(
                "scaler has {} channels, model has {}",
                artifact.channels.len(),
                channels.len()
            )));
        }
        let stats = channels
            .names()
            .iter()
            .map(|name| {
                artifact.channels.get(name).copied().ok_or_else(|| {
                    ForecastError::ArtifactMismatch(format!("scaler has no stats for channel '{}'", name))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_stats(channels.clone(), &stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn channels(names: &[&str]) -> ChannelSet {
        ChannelSet::new(names.iter().copied()).unwrap()
    }

    #[test]
    fn test_fit_and_transform() {
        let data = array![[1.0, 10.0], [3.0, 30.0], [5.0, 50.0]];
        let scaler = ScalerParams::fit_matrix(channels(&["a", "b"]), &data).unwrap();
        let stats = scaler.stats();
        assert!((stats[0].mean - 3.0).abs() < 1e-12);
        assert!((stats[1].mean - 30.0).abs() < 1e-12);

        let scaled = scaler.transform(&data).unwrap();
        let col_mean = scaled.mean_axis(Axis(0)).unwrap();
        let col_std = scaled.std_axis(Axis(0), 0.0);
        for c in 0..2 {
            assert!(col_mean[c].abs() < 1e-12);
            assert!((col_std[c] - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_inverse_restores_values() {
        let data = array![[21.5, 400.0, 1013.2], [22.0, 410.0, 1012.9], [23.7, 395.0, 1013.8], [20.1, 430.0, 1011.0]];
        let scaler = ScalerParams::fit_matrix(channels(&["t", "co2", "p"]), &data).unwrap();
        let restored = scaler.inverse_transform(&scaler.transform(&data).unwrap()).unwrap();
        for (a, b) in restored.iter().zip(data.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_constant_channel_stays_finite() {
        let data = array![[5.0, 1.0], [5.0, 2.0], [5.0, 3.0]];
        let scaler = ScalerParams::fit_matrix(channels(&["flat", "ramp"]), &data).unwrap();
        assert_eq!(scaler.stats()[0].scale, MIN_SCALE);

        let scaled = scaler.transform(&data).unwrap();
        assert!(scaled.iter().all(|v| v.is_finite()));
        assert!(scaled.column(0).iter().all(|&v| v == 0.0));

        let restored = scaler.inverse_transform(&scaled).unwrap();
        assert!(restored.column(0).iter().all(|&v| (v - 5.0).abs() < 1e-12));
    }

    #[test]
    fn test_fit_rejects_empty_and_nan() {
        let empty = Array2::<f64>::zeros((0, 2));
        assert!(matches!(
            ScalerParams::fit_matrix(channels(&["a", "b"]), &empty),
            Err(ForecastError::InvalidInput(_))
        ));
        let nan = array![[1.0, f64::NAN]];
        assert!(ScalerParams::fit_matrix(channels(&["a", "b"]), &nan).is_err());
    }

    #[test]
    fn test_transform_checks_width() {
        let data = array![[1.0, 2.0], [3.0, 4.0]];
        let scaler = ScalerParams::fit_matrix(channels(&["a", "b"]), &data).unwrap();
        assert!(scaler.transform(&array![[1.0, 2.0, 3.0]]).is_err());
        assert!(scaler.inverse_transform(&array![[f64::INFINITY, 0.0]]).is_err());
    }

    #[test]
    fn test_json_round_trip_follows_channel_order() {
        let data = array![[1.0, 100.0], [2.0, 300.0], [4.0, 200.0]];
        let scaler = ScalerParams::fit_matrix(channels(&["zeta", "alpha"]), &data).unwrap();
        let json = scaler.to_json().unwrap();

        let restored = ScalerParams::from_json(&json, &channels(&["zeta", "alpha"])).unwrap();
        assert_eq!(restored.channels(), scaler.channels());
        for (a, b) in restored.stats().iter().zip(scaler.stats()) {
            assert!((a.mean - b.mean).abs() < 1e-9);
            assert!((a.scale - b.scale).abs() < 1e-9);
        }

        let missing = ScalerParams::from_json(&json, &channels(&["zeta", "beta"]));
        assert!(matches!(missing, Err(ForecastError::ArtifactMismatch(_))));
    }
}
