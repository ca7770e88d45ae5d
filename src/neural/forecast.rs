// projeto: lstmsensorforecast
// file: src/neural/forecast.rs
// Calendar-aligned multi-step forecasts from a trained model

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info};
use ndarray::{Array2, s};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::neural::data::{ChannelSet, TimeSeriesTable};
use crate::neural::model::{ModelConfig, SequenceModel};
use crate::neural::scaler::ScalerParams;
use crate::neural::utils::ForecastError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub timestamp: DateTime<Utc>,
    pub channel_values: BTreeMap<String, f64>,
}

/// Predicted values in physical units, one row per future step.
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    channels: ChannelSet,
    timestamps: Vec<DateTime<Utc>>,
    values: Array2<f64>,
}

impl Forecast {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn records(&self) -> Vec<ForecastRecord> {
        self.timestamps
            .iter()
            .zip(self.values.rows())
            .map(|(&timestamp, row)| ForecastRecord {
                timestamp,
                channel_values: self.channels.names().iter().cloned().zip(row.iter().copied()).collect(),
            })
            .collect()
    }

    pub fn to_table(&self) -> Result<TimeSeriesTable, ForecastError> {
        TimeSeriesTable::new(self.timestamps.clone(), self.channels.clone(), self.values.clone())
    }
}

/// Forecast `steps_ahead` rows (default: the full horizon) past the end of
/// `recent`. Only the last `sequence_length` rows of `recent` are used, and
/// future timestamps continue at the spacing of its last two rows.
pub fn predict_future(
    model: &SequenceModel,
    scaler: Option<&ScalerParams>,
    recent: &TimeSeriesTable,
    steps_ahead: Option<usize>,
) -> Result<Forecast, ForecastError> {
    let config = model.config();
    let sequence_length = config.sequence_length;
    if recent.len() < sequence_length {
        return Err(ForecastError::InsufficientHistory { required: sequence_length, actual: recent.len() });
    }

    let horizon = config.prediction_horizon;
    let steps = steps_ahead.unwrap_or(horizon);
    if steps == 0 {
        return Err(ForecastError::InvalidInput("steps_ahead must be at least 1".to_string()));
    }
    if steps > horizon {
        return Err(ForecastError::UnsupportedHorizon { requested: steps, horizon });
    }

    let tail = recent.tail(sequence_length);
    let history = tail.select(&config.channel_names)?;

    let predicted = match scaler {
        Some(scaler) => {
            if scaler.channels() != &config.channel_names {
                return Err(ForecastError::ArtifactMismatch(format!(
                    "scaler channels {:?} differ from model channels {:?}",
                    scaler.channels().names(),
                    config.channel_names.names()
                )));
            }
            let scaled = scaler.transform(&history)?;
            scaler.inverse_transform(&model.predict(&scaled)?)?
        }
        None => model.predict(&history)?,
    };
    let values = predicted.slice(s![..steps, ..]).to_owned();

    let timestamps = future_timestamps(tail.timestamps(), steps)?;
    debug!(
        "[Forecast] {} steps from {} to {}",
        steps,
        timestamps.first().map(|t| t.to_rfc3339()).unwrap_or_default(),
        timestamps.last().map(|t| t.to_rfc3339()).unwrap_or_default()
    );

    Ok(Forecast { channels: config.channel_names.clone(), timestamps, values })
}

/// `last + (k+1) * (last - second_last)` for `k` in `0..steps`.
fn future_timestamps(history: &[DateTime<Utc>], steps: usize) -> Result<Vec<DateTime<Utc>>, ForecastError> {
    let (prev, last) = match history {
        [.., prev, last] => (*prev, *last),
        _ => {
            return Err(ForecastError::IrregularSampling(
                "need at least two timestamps to infer the sampling interval".to_string(),
            ));
        }
    };
    let interval = last - prev;
    if interval <= TimeDelta::zero() {
        return Err(ForecastError::IrregularSampling(format!(
            "non-positive interval between {} and {}",
            prev, last
        )));
    }

    (1..=steps)
        .map(|k| {
            i32::try_from(k)
                .ok()
                .and_then(|k| interval.checked_mul(k))
                .and_then(|offset| last.checked_add_signed(offset))
                .ok_or_else(|| {
                    ForecastError::IrregularSampling(format!("step {} overflows the calendar", k))
                })
        })
        .collect()
}

/// A trained model with the scaler and config it was saved with.
#[derive(Debug, Clone)]
pub struct SensorForecaster {
    model: SequenceModel,
    scaler: Option<ScalerParams>,
}

impl SensorForecaster {
    pub fn new(model: SequenceModel, scaler: Option<ScalerParams>) -> Result<Self, ForecastError> {
        if let Some(scaler) = &scaler {
            if scaler.channels() != &model.config().channel_names {
                return Err(ForecastError::ArtifactMismatch(format!(
                    "scaler channels {:?} differ from model channels {:?}",
                    scaler.channels().names(),
                    model.config().channel_names.names()
                )));
            }
        }
        Ok(SensorForecaster { model, scaler })
    }

    pub fn config(&self) -> &ModelConfig {
        self.model.config()
    }

    pub fn model(&self) -> &SequenceModel {
        &self.model
    }

    pub fn scaler(&self) -> Option<&ScalerParams> {
        self.scaler.as_ref()
    }

    pub fn forecast(&self, recent: &TimeSeriesTable, steps_ahead: Option<usize>) -> Result<Forecast, ForecastError> {
        predict_future(&self.model, self.scaler.as_ref(), recent, steps_ahead)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Rising,
    Falling,
    Steady,
}

impl TrendDirection {
    pub fn arrow(&self) -> &'static str {
        match self {
            TrendDirection::Rising => "↑",
            TrendDirection::Falling => "↓",
            TrendDirection::Steady => "→",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelTrend {
    pub channel: String,
    pub last_observed: f64,
    pub last_predicted: f64,
    /// Undefined when the last observation is zero.
    pub change_pct: Option<f64>,
    pub direction: TrendDirection,
}

/// Last observed value vs. last forecast value, per forecast channel.
pub fn summarize_trends(recent: &TimeSeriesTable, forecast: &Forecast) -> Result<Vec<ChannelTrend>, ForecastError> {
    let observed = recent.select(forecast.channels())?;
    let last_observed = observed
        .rows()
        .into_iter()
        .last()
        .ok_or_else(|| ForecastError::InvalidInput("no observed rows".to_string()))?;
    let last_predicted = forecast
        .values()
        .rows()
        .into_iter()
        .last()
        .ok_or_else(|| ForecastError::InvalidInput("empty forecast".to_string()))?;

    Ok(forecast
        .channels()
        .names()
        .iter()
        .zip(last_observed.iter().zip(last_predicted.iter()))
        .map(|(name, (&actual, &predicted))| ChannelTrend {
            channel: name.clone(),
            last_observed: actual,
            last_predicted: predicted,
            change_pct: (actual != 0.0).then(|| (predicted - actual) / actual * 100.0),
            direction: if predicted > actual {
                TrendDirection::Rising
            } else if predicted < actual {
                TrendDirection::Falling
            } else {
                TrendDirection::Steady
            },
        })
        .collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub sequence_length: usize,
    pub prediction_horizon: usize,
    pub channels: Vec<String>,
}

/// Forecast export with enough context to interpret it later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastReport {
    pub generated_at: DateTime<Utc>,
    pub model_info: ModelInfo,
    pub historical_period: Period,
    pub prediction_period: Period,
    pub predictions: Vec<ForecastRecord>,
    pub trends: Vec<ChannelTrend>,
}

impl ForecastReport {
    pub fn new(config: &ModelConfig, recent: &TimeSeriesTable, forecast: &Forecast) -> Result<Self, ForecastError> {
        let history = recent.tail(config.sequence_length);
        let period = |ts: &[DateTime<Utc>], what: &str| match (ts.first(), ts.last()) {
            (Some(&start), Some(&end)) => Ok(Period { start, end }),
            _ => Err(ForecastError::InvalidInput(format!("{} period is empty", what))),
        };
        Ok(ForecastReport {
            generated_at: Utc::now(),
            model_info: ModelInfo {
                sequence_length: config.sequence_length,
                prediction_horizon: config.prediction_horizon,
                channels: config.channel_names.names().to_vec(),
            },
            historical_period: period(history.timestamps(), "historical")?,
            prediction_period: period(forecast.timestamps(), "prediction")?,
            predictions: forecast.records(),
            trends: summarize_trends(recent, forecast)?,
        })
    }

    pub fn save_json(&self, path: &Path) -> Result<(), ForecastError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("💾 [Forecast] Report saved to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::model::ArchitectureConfig;
    use chrono::TimeZone;

    fn model(l: usize, h: usize) -> SequenceModel {
        let config = ModelConfig::new(
            l,
            h,
            ChannelSet::new(["temperature", "co2"]).unwrap(),
            ArchitectureConfig { lstm_units: vec![4], dense_units: [6, 4], attention: true, dropout_rate: 0.1 },
        );
        SequenceModel::build_seeded(config, 9).unwrap()
    }

    fn hourly_table(rows: usize, channels: &[&str]) -> TimeSeriesTable {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let ts = (0..rows).map(|i| start + TimeDelta::hours(i as i64)).collect();
        let values = Array2::from_shape_fn((rows, channels.len()), |(r, c)| 20.0 + r as f64 * 0.1 + c as f64 * 380.0);
        TimeSeriesTable::new(ts, ChannelSet::new(channels.iter().copied()).unwrap(), values).unwrap()
    }

    fn scaler_for(table: &TimeSeriesTable) -> ScalerParams {
        ScalerParams::fit(table).unwrap()
    }

    #[test]
    fn test_hourly_timestamps() {
        let m = model(24, 12);
        let recent = hourly_table(24, &["temperature", "co2"]);
        let scaler = scaler_for(&recent);

        let forecast = predict_future(&m, Some(&scaler), &recent, Some(6)).unwrap();
        assert_eq!(forecast.len(), 6);
        assert_eq!(forecast.values().dim(), (6, 2));
        let last = *recent.timestamps().last().unwrap();
        for (k, ts) in forecast.timestamps().iter().enumerate() {
            assert_eq!(*ts, last + TimeDelta::hours(k as i64 + 1));
        }
        assert!(forecast.values().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_default_steps_is_full_horizon() {
        let m = model(4, 3);
        let recent = hourly_table(10, &["temperature", "co2"]);
        let forecast = predict_future(&m, None, &recent, None).unwrap();
        assert_eq!(forecast.len(), 3);
    }

    #[test]
    fn test_truncation_matches_prefix_of_full_forecast() {
        let m = model(4, 3);
        let recent = hourly_table(10, &["temperature", "co2"]);
        let scaler = scaler_for(&recent);
        let full = predict_future(&m, Some(&scaler), &recent, Some(3)).unwrap();
        let short = predict_future(&m, Some(&scaler), &recent, Some(2)).unwrap();
        assert_eq!(short.values(), &full.values().slice(s![..2, ..]).to_owned());
        assert_eq!(short.timestamps(), &full.timestamps()[..2]);
    }

    #[test]
    fn test_error_paths() {
        let m = model(6, 3);
        let recent = hourly_table(10, &["temperature", "co2"]);
        assert!(matches!(
            predict_future(&m, None, &recent, Some(4)),
            Err(ForecastError::UnsupportedHorizon { requested: 4, horizon: 3 })
        ));
        assert!(matches!(
            predict_future(&m, None, &recent.tail(5), Some(2)),
            Err(ForecastError::InsufficientHistory { required: 6, actual: 5 })
        ));
        assert!(matches!(predict_future(&m, None, &recent, Some(0)), Err(ForecastError::InvalidInput(_))));

        let wrong = hourly_table(10, &["temperature", "humidity"]);
        assert!(matches!(predict_future(&m, None, &wrong, None), Err(ForecastError::InvalidInput(_))));
    }

    #[test]
    fn test_only_the_tail_matters() {
        let m = model(5, 2);
        let long = hourly_table(40, &["temperature", "co2"]);
        let tail = long.tail(5);
        let a = predict_future(&m, None, &long, None).unwrap();
        let b = predict_future(&m, None, &tail, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_channel_order_follows_model() {
        let m = model(4, 2);
        let table = hourly_table(8, &["temperature", "co2"]);
        let swapped_values = table.select(&ChannelSet::new(["co2", "temperature"]).unwrap()).unwrap();
        let swapped = TimeSeriesTable::new(
            table.timestamps().to_vec(),
            ChannelSet::new(["co2", "temperature"]).unwrap(),
            swapped_values,
        )
        .unwrap();
        assert_eq!(
            predict_future(&m, None, &table, None).unwrap(),
            predict_future(&m, None, &swapped, None).unwrap()
        );
    }

    #[test]
    fn test_future_timestamps_need_two_points() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(future_timestamps(&[t], 2), Err(ForecastError::IrregularSampling(_))));
        let ts = future_timestamps(&[t, t + TimeDelta::minutes(15)], 2).unwrap();
        assert_eq!(ts, vec![t + TimeDelta::minutes(30), t + TimeDelta::minutes(45)]);
    }

    #[test]
    fn test_records_and_trends() {
        let m = model(4, 2);
        let recent = hourly_table(8, &["temperature", "co2"]);
        let scaler = scaler_for(&recent);
        let forecaster = SensorForecaster::new(m, Some(scaler)).unwrap();
        let forecast = forecaster.forecast(&recent, None).unwrap();

        let records = forecast.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].channel_values["co2"], forecast.values()[[1, 1]]);

        let trends = summarize_trends(&recent, &forecast).unwrap();
        assert_eq!(trends.len(), 2);
        for trend in &trends {
            let expected = match trend.last_predicted.partial_cmp(&trend.last_observed) {
                Some(std::cmp::Ordering::Greater) => TrendDirection::Rising,
                Some(std::cmp::Ordering::Less) => TrendDirection::Falling,
                _ => TrendDirection::Steady,
            };
            assert_eq!(trend.direction, expected);
            assert!(trend.change_pct.is_some());
        }

        let report = ForecastReport::new(forecaster.config(), &recent, &forecast).unwrap();
        assert_eq!(report.historical_period.start, recent.timestamps()[4]);
        assert_eq!(report.prediction_period.end, forecast.timestamps()[1]);
    }

    #[test]
    fn test_forecaster_rejects_foreign_scaler() {
        let other = hourly_table(8, &["temperature", "humidity"]);
        let result = SensorForecaster::new(model(4, 2), Some(scaler_for(&other)));
        assert!(matches!(result, Err(ForecastError::ArtifactMismatch(_))));
    }
}
