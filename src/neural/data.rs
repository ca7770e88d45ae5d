// projeto: lstmsensorforecast
// file: src/neural/data.rs
// Sensor tables: channel sets, loading, quality checks and synthetic data

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use log::{debug, info, warn};
use ndarray::{Array2, s};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::neural::utils::ForecastError;

pub const TIMESTAMP_COLUMN: &str = "timestamp";

/// Ordered channel names. Column `i` of every matrix tied to a model is the
/// channel at position `i` here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ChannelSet(Vec<String>);

impl TryFrom<Vec<String>> for ChannelSet {
    type Error = ForecastError;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        ChannelSet::new(names)
    }
}

impl From<ChannelSet> for Vec<String> {
    fn from(set: ChannelSet) -> Self {
        set.0
    }
}

impl ChannelSet {
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Result<Self, ForecastError> {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(ForecastError::InvalidInput("channel set is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for name in &names {
            if name.trim().is_empty() {
                return Err(ForecastError::InvalidInput("channel name is blank".to_string()));
            }
            if !seen.insert(name.as_str()) {
                return Err(ForecastError::InvalidInput(format!("duplicate channel '{}'", name)));
            }
        }
        Ok(ChannelSet(names))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|n| n == name)
    }
}

/// Timestamped rows over a fixed channel set, stored row-major as
/// `rows × channels`. Timestamps are strictly increasing.
#[derive(Debug, Clone)]
pub struct TimeSeriesTable {
    timestamps: Vec<DateTime<Utc>>,
    channels: ChannelSet,
    values: Array2<f64>,
}

impl TimeSeriesTable {
    pub fn new(
        timestamps: Vec<DateTime<Utc>>,
        channels: ChannelSet,
        values: Array2<f64>,
    ) -> Result<Self, ForecastError> {
        if values.nrows() != timestamps.len() {
            return Err(ForecastError::InvalidInput(format!(
                "{} timestamps for {} rows",
                timestamps.len(),
                values.nrows()
            )));
        }
        if values.ncols() != channels.len() {
            return Err(ForecastError::InvalidInput(format!(
                "{} channels declared but rows have {} values",
                channels.len(),
                values.ncols()
            )));
        }
        if let Some(i) = timestamps.windows(2).position(|w| w[1] <= w[0]) {
            return Err(ForecastError::InvalidInput(format!(
                "timestamps not strictly increasing at row {} ({} -> {})",
                i + 1,
                timestamps[i],
                timestamps[i + 1]
            )));
        }
        Ok(TimeSeriesTable { timestamps, channels, values })
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// Last `n` rows (or the whole table when shorter).
    pub fn tail(&self, n: usize) -> TimeSeriesTable {
        let start = self.len().saturating_sub(n);
        TimeSeriesTable {
            timestamps: self.timestamps[start..].to_vec(),
            channels: self.channels.clone(),
            values: self.values.slice(s![start.., ..]).to_owned(),
        }
    }

    /// Values reordered to `channels`. Extra columns in the table are ignored;
    /// a missing channel is an error.
    pub fn select(&self, channels: &ChannelSet) -> Result<Array2<f64>, ForecastError> {
        if &self.channels == channels {
            return Ok(self.values.clone());
        }
        let indices = channels
            .names()
            .iter()
            .map(|name| {
                self.channels.index_of(name).ok_or_else(|| {
                    ForecastError::InvalidInput(format!("table has no channel '{}'", name))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.values.select(ndarray::Axis(1), &indices))
    }
}

/// Accepts RFC 3339 or `YYYY-MM-DD HH:MM:SS[.f]` / `YYYY-MM-DDTHH:MM:SS[.f]` as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ForecastError> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(ForecastError::InvalidInput(format!("cannot parse timestamp '{}'", raw)))
}

pub fn load_csv(path: &Path) -> Result<TimeSeriesTable, ForecastError> {
    info!("📥 [Data] Loading sensor table from {}", path.display());
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();

    let ts_col = headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(TIMESTAMP_COLUMN))
        .ok_or_else(|| ForecastError::InvalidInput(format!("missing '{}' column", TIMESTAMP_COLUMN)))?;
    let channel_cols: Vec<usize> = (0..headers.len()).filter(|&i| i != ts_col).collect();
    let channels = ChannelSet::new(channel_cols.iter().map(|&i| headers[i].trim().to_string()))?;

    let mut timestamps = Vec::new();
    let mut flat = Vec::new();
    for (row_idx, record) in reader.records().enumerate() {
        let record = record?;
        timestamps.push(parse_timestamp(record.get(ts_col).unwrap_or(""))?);
        for &col in &channel_cols {
            let cell = record.get(col).unwrap_or("").trim();
            // Blank cells are gaps; the quality report counts them.
            if cell.is_empty() {
                flat.push(f64::NAN);
                continue;
            }
            let value: f64 = cell.parse().map_err(|_| {
                ForecastError::InvalidInput(format!(
                    "row {} column '{}': '{}' is not numeric",
                    row_idx + 1,
                    &headers[col],
                    cell
                ))
            })?;
            flat.push(value);
        }
    }

    let values = Array2::from_shape_vec((timestamps.len(), channels.len()), flat)?;
    let table = TimeSeriesTable::new(timestamps, channels, values)?;
    info!("✅ [Data] Loaded {} rows × {} channels", table.len(), table.channels().len());
    Ok(table)
}

/// JSON array of objects, each with a `timestamp` field. Channel order is the
/// key order of the first object; `null` readings load as NaN.
pub fn load_json(path: &Path) -> Result<TimeSeriesTable, ForecastError> {
    info!("📥 [Data] Loading sensor table from {}", path.display());
    let content = fs::read_to_string(path)?;
    let rows: Vec<serde_json::Map<String, serde_json::Value>> = serde_json::from_str(&content)?;
    let first = rows
        .first()
        .ok_or_else(|| ForecastError::InvalidInput("JSON table has no rows".to_string()))?;
    let channels = ChannelSet::new(first.keys().filter(|k| k.as_str() != TIMESTAMP_COLUMN).cloned())?;

    let mut timestamps = Vec::with_capacity(rows.len());
    let mut flat = Vec::with_capacity(rows.len() * channels.len());
    for (row_idx, row) in rows.iter().enumerate() {
        let ts = row
            .get(TIMESTAMP_COLUMN)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ForecastError::InvalidInput(format!("row {} has no timestamp", row_idx + 1)))?;
        timestamps.push(parse_timestamp(ts)?);
        for name in channels.names() {
            let value = match row.get(name) {
                Some(serde_json::Value::Null) => Some(f64::NAN),
                Some(v) => v.as_f64(),
                None => None,
            }
            .ok_or_else(|| {
                ForecastError::InvalidInput(format!("row {} channel '{}' missing or not numeric", row_idx + 1, name))
            })?;
            flat.push(value);
        }
    }

    let values = Array2::from_shape_vec((timestamps.len(), channels.len()), flat)?;
    TimeSeriesTable::new(timestamps, channels, values)
}

pub fn load_table(path: &Path) -> Result<TimeSeriesTable, ForecastError> {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()) {
        Some(ext) if ext == "csv" => load_csv(path),
        Some(ext) if ext == "json" => load_json(path),
        _ => Err(ForecastError::InvalidInput(format!(
            "{}: data file must be CSV or JSON",
            path.display()
        ))),
    }
}

pub fn write_csv(table: &TimeSeriesTable, path: &Path) -> Result<(), ForecastError> {
    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec![TIMESTAMP_COLUMN.to_string()];
    header.extend(table.channels().names().iter().cloned());
    writer.write_record(&header)?;

    for (ts, row) in table.timestamps().iter().zip(table.values().rows()) {
        let mut record = vec![ts.format("%Y-%m-%d %H:%M:%S").to_string()];
        record.extend(row.iter().map(|v| format!("{:.6}", v)));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    debug!("💾 [Data] Wrote {} rows to {}", table.len(), path.display());
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct DataQualityReport {
    pub rows: usize,
    pub channels: Vec<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub median_interval_secs: Option<i64>,
    pub irregular_intervals: usize,
    pub non_finite_values: usize,
    pub issues: Vec<String>,
}

impl DataQualityReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

pub const RECOMMENDED_MIN_ROWS: usize = 100;

/// Intervals further than one minute from the median count as irregular.
pub fn inspect_table(table: &TimeSeriesTable) -> DataQualityReport {
    let mut issues = Vec::new();

    let mut intervals: Vec<i64> = table
        .timestamps()
        .windows(2)
        .map(|w| (w[1] - w[0]).num_seconds())
        .collect();
    let median_interval_secs = if intervals.is_empty() {
        None
    } else {
        let mut sorted = intervals.clone();
        sorted.sort_unstable();
        Some(sorted[sorted.len() / 2])
    };
    let irregular_intervals = match median_interval_secs {
        Some(median) => {
            intervals.retain(|&d| (d - median).abs() > 60);
            intervals.len()
        }
        None => 0,
    };
    if irregular_intervals > 0 {
        issues.push(format!("{} irregular sampling intervals", irregular_intervals));
    }

    let non_finite_values = table.values().iter().filter(|v| !v.is_finite()).count();
    if non_finite_values > 0 {
        issues.push(format!("{} missing or non-finite values", non_finite_values));
    }
    if table.len() < RECOMMENDED_MIN_ROWS {
        issues.push(format!(
            "only {} rows (recommend {}+)",
            table.len(),
            RECOMMENDED_MIN_ROWS
        ));
    }

    DataQualityReport {
        rows: table.len(),
        channels: table.channels().names().to_vec(),
        start: table.timestamps().first().copied(),
        end: table.timestamps().last().copied(),
        median_interval_secs,
        irregular_intervals,
        non_finite_values,
        issues,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorProfile {
    pub name: String,
    pub base: f64,
    pub amplitude: f64,
    pub noise: f64,
}

impl SensorProfile {
    pub fn new(name: &str, base: f64, amplitude: f64, noise: f64) -> Self {
        SensorProfile { name: name.to_string(), base, amplitude, noise }
    }
}

pub fn default_sensor_profiles() -> Vec<SensorProfile> {
    vec![
        SensorProfile::new("temperature", 22.0, 5.0, 0.5),
        SensorProfile::new("humidity", 50.0, 15.0, 2.0),
        SensorProfile::new("co2", 400.0, 50.0, 10.0),
        SensorProfile::new("pm25", 15.0, 10.0, 2.0),
        SensorProfile::new("pressure", 1013.0, 5.0, 1.0),
    ]
}

/// Linear drift + sinusoid with a period of `period` samples + Gaussian noise.
pub fn generate_synthetic_table(
    n_samples: usize,
    profiles: &[SensorProfile],
    start: DateTime<Utc>,
    interval: TimeDelta,
    period: usize,
    seed: u64,
) -> Result<TimeSeriesTable, ForecastError> {
    if interval <= TimeDelta::zero() {
        return Err(ForecastError::InvalidInput("sampling interval must be positive".to_string()));
    }
    if period == 0 {
        return Err(ForecastError::InvalidInput("seasonal period must be positive".to_string()));
    }
    let channels = ChannelSet::new(profiles.iter().map(|p| p.name.clone()))?;
    let mut rng = StdRng::seed_from_u64(seed);

    let mut values = Array2::zeros((n_samples, profiles.len()));
    for (c, profile) in profiles.iter().enumerate() {
        let noise = Normal::new(0.0, profile.noise.max(0.0))
            .map_err(|e| ForecastError::InvalidInput(format!("noise for '{}': {}", profile.name, e)))?;
        let drift: f64 = rng.random_range(-2.0..2.0);
        for t in 0..n_samples {
            let progress = if n_samples > 1 { t as f64 / (n_samples - 1) as f64 } else { 0.0 };
            let trend = profile.base + drift * progress;
            let season = profile.amplitude
                * (2.0 * std::f64::consts::PI * t as f64 / period as f64).sin();
            values[[t, c]] = trend + season + noise.sample(&mut rng);
        }
    }

    let timestamps = (0..n_samples)
        .map(|t| {
            i32::try_from(t)
                .ok()
                .and_then(|k| interval.checked_mul(k))
                .and_then(|offset| start.checked_add_signed(offset))
                .ok_or_else(|| ForecastError::InvalidInput(format!("timestamp of sample {} is out of range", t)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let table = TimeSeriesTable::new(timestamps, channels, values)?;
    if n_samples < RECOMMENDED_MIN_ROWS {
        warn!("⚠️ [Data] Synthetic table has only {} rows", n_samples);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use tempfile::tempdir;

    fn hourly(n: usize) -> Vec<DateTime<Utc>> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n).map(|i| start + TimeDelta::hours(i as i64)).collect()
    }

    #[test]
    fn test_channel_set_rejects_duplicates_and_empty() {
        assert!(ChannelSet::new(Vec::<String>::new()).is_err());
        assert!(ChannelSet::new(["a", "b", "a"]).is_err());
        let set = ChannelSet::new(["co2", "pm25"]).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.index_of("pm25"), Some(1));
    }

    #[test]
    fn test_channel_set_validates_when_deserialized() {
        let set: ChannelSet = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(serde_json::to_string(&set).unwrap(), r#"["a","b"]"#);
        assert!(serde_json::from_str::<ChannelSet>(r#"["a","a"]"#).is_err());
        assert!(serde_json::from_str::<ChannelSet>("[]").is_err());
    }

    #[test]
    fn test_table_requires_increasing_timestamps() {
        let channels = ChannelSet::new(["a"]).unwrap();
        let mut ts = hourly(3);
        ts.swap(1, 2);
        let values = Array2::zeros((3, 1));
        let result = TimeSeriesTable::new(ts, channels, values);
        assert!(matches!(result, Err(ForecastError::InvalidInput(_))));
    }

    #[test]
    fn test_tail_and_select() {
        let channels = ChannelSet::new(["a", "b"]).unwrap();
        let values = Array2::from_shape_fn((5, 2), |(r, c)| (r * 10 + c) as f64);
        let table = TimeSeriesTable::new(hourly(5), channels, values).unwrap();

        let tail = table.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail.values()[[0, 0]], 30.0);
        assert_eq!(tail.timestamps()[1], table.timestamps()[4]);

        let reordered = table.select(&ChannelSet::new(["b", "a"]).unwrap()).unwrap();
        assert_eq!(reordered[[2, 0]], 21.0);
        assert_eq!(reordered[[2, 1]], 20.0);
        assert!(table.select(&ChannelSet::new(["c"]).unwrap()).is_err());
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let a = parse_timestamp("2024-01-01 05:00:00").unwrap();
        let b = parse_timestamp("2024-01-01T05:00:00").unwrap();
        let c = parse_timestamp("2024-01-01T05:00:00+00:00").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_load_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sensors.csv");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "timestamp,temperature,co2").unwrap();
        writeln!(file, "2024-01-01 00:00:00,21.5,410").unwrap();
        writeln!(file, "2024-01-01 01:00:00,22.0,415.5").unwrap();
        drop(file);

        let table = load_table(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.channels().names(), &["temperature".to_string(), "co2".to_string()]);
        assert_eq!(table.values()[[1, 1]], 415.5);
    }

    #[test]
    fn test_load_csv_rejects_non_numeric() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "timestamp,a\n2024-01-01 00:00:00,oops\n").unwrap();
        assert!(matches!(load_csv(&path), Err(ForecastError::InvalidInput(_))));
    }

    #[test]
    fn test_blank_csv_cell_is_reported_as_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gaps.csv");
        fs::write(&path, "timestamp,a,b\n2024-01-01 00:00:00,1.0,2.0\n2024-01-01 01:00:00,,3.0\n").unwrap();

        let table = load_csv(&path).unwrap();
        assert!(table.values()[[1, 0]].is_nan());
        let report = inspect_table(&table);
        assert_eq!(report.non_finite_values, 1);
        assert!(!report.is_clean());
        assert!(crate::neural::scaler::ScalerParams::fit(&table).is_err());
    }

    #[test]
    fn test_load_json_keeps_key_order_and_nulls() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ordered.json");
        fs::write(
            &path,
            r#"[{"timestamp":"2024-01-01 00:00:00","temperature":21.0,"co2":400.0},
                {"timestamp":"2024-01-01 01:00:00","temperature":null,"co2":405.0}]"#,
        )
        .unwrap();
        let table = load_json(&path).unwrap();
        assert_eq!(table.channels().names(), &["temperature".to_string(), "co2".to_string()]);
        assert!(table.values()[[1, 0]].is_nan());
        assert_eq!(inspect_table(&table).non_finite_values, 1);
    }

    #[test]
    fn test_synthetic_table_rejects_overflowing_timestamps() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let profiles = vec![SensorProfile::new("a", 0.0, 1.0, 0.0)];
        let result = generate_synthetic_table(3, &profiles, start, TimeDelta::MAX, 24, 1);
        assert!(matches!(result, Err(ForecastError::InvalidInput(_))));
    }

    #[test]
    fn test_load_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sensors.json");
        fs::write(
            &path,
            r#"[{"timestamp":"2024-01-01 00:00:00","pm25":12.0,"co2":400.0},
                {"timestamp":"2024-01-01 01:00:00","pm25":13.0,"co2":402.0}]"#,
        )
        .unwrap();
        let table = load_table(&path).unwrap();
        assert_eq!(table.len(), 2);
        let pm = table.channels().index_of("pm25").unwrap();
        assert_eq!(table.values()[[1, pm]], 13.0);
    }

    #[test]
    fn test_csv_round_trip_through_writer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("synthetic.csv");
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let table = generate_synthetic_table(30, &default_sensor_profiles(), start, TimeDelta::hours(1), 24, 7).unwrap();
        write_csv(&table, &path).unwrap();

        let loaded = load_csv(&path).unwrap();
        assert_eq!(loaded.len(), 30);
        assert_eq!(loaded.channels(), table.channels());
        assert_eq!(loaded.timestamps(), table.timestamps());
        let max_diff = (loaded.values() - table.values()).mapv(f64::abs).fold(0.0_f64, |a, &b| a.max(b));
        assert!(max_diff < 1e-5);
    }

    #[test]
    fn test_synthetic_table_is_deterministic() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let profiles = default_sensor_profiles();
        let a = generate_synthetic_table(50, &profiles, start, TimeDelta::hours(1), 24, 42).unwrap();
        let b = generate_synthetic_table(50, &profiles, start, TimeDelta::hours(1), 24, 42).unwrap();
        assert_eq!(a.values(), b.values());
        assert_eq!(a.channels().len(), 5);
        assert_eq!(a.timestamps()[49] - a.timestamps()[0], TimeDelta::hours(49));
    }

    #[test]
    fn test_inspect_table_flags_gaps_and_short_tables() {
        let channels = ChannelSet::new(["a"]).unwrap();
        let mut ts = hourly(6);
        ts[5] = ts[4] + TimeDelta::hours(3);
        let values = Array2::from_shape_vec((6, 1), vec![1.0, 2.0, f64::NAN, 4.0, 5.0, 6.0]).unwrap();
        let table = TimeSeriesTable::new(ts, channels, values).unwrap();

        let report = inspect_table(&table);
        assert_eq!(report.median_interval_secs, Some(3600));
        assert_eq!(report.irregular_intervals, 1);
        assert_eq!(report.non_finite_values, 1);
        assert_eq!(report.issues.len(), 3);
        assert!(!report.is_clean());
    }
}
