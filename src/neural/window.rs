// projeto: lstmsensorforecast
// file: src/neural/window.rs
// Sliding (history, future) windows and the chronological train/validation split

use log::{debug, info};
use ndarray::{Array2, s};
use rayon::prelude::*;

use crate::neural::utils::ForecastError;

/// One training example cut from a scaled matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    /// Row index of the first history step in the source matrix.
    pub start: usize,
    pub history: Array2<f64>,
    pub future: Array2<f64>,
}

pub fn window_count(rows: usize, sequence_length: usize, prediction_horizon: usize) -> usize {
    (rows + 1).saturating_sub(sequence_length + prediction_horizon)
}

/// Window `i` covers history rows `[i, i+L)` and future rows `[i+L, i+L+H)`.
/// Output is ordered by start index.
pub fn build_windows(
    scaled: &Array2<f64>,
    sequence_length: usize,
    prediction_horizon: usize,
) -> Result<Vec<Window>, ForecastError> {
    if sequence_length == 0 || prediction_horizon == 0 {
        return Err(ForecastError::InvalidConfig(format!(
            "sequence_length ({}) and prediction_horizon ({}) must be positive",
            sequence_length, prediction_horizon
        )));
    }
    let required = sequence_length + prediction_horizon;
    let rows = scaled.nrows();
    if rows < required {
        return Err(ForecastError::InsufficientData { required, actual: rows });
    }

    let n = window_count(rows, sequence_length, prediction_horizon);
    let windows: Vec<Window> = (0..n)
        .into_par_iter()
        .map(|i| Window {
            start: i,
            history: scaled.slice(s![i..i + sequence_length, ..]).to_owned(),
            future: scaled
                .slice(s![i + sequence_length..i + required, ..])
                .to_owned(),
        })
        .collect();

    debug!(
        "[Windows] {} rows -> {} windows (L={}, H={})",
        rows,
        windows.len(),
        sequence_length,
        prediction_horizon
    );
    Ok(windows)
}

/// First `floor(n * train_fraction)` windows train, the rest validate.
/// No shuffling across the boundary.
pub fn chronological_split(
    mut windows: Vec<Window>,
    train_fraction: f64,
) -> Result<(Vec<Window>, Vec<Window>), ForecastError> {
    if !(train_fraction > 0.0 && train_fraction < 1.0) {
        return Err(ForecastError::InvalidConfig(format!(
            "train fraction must be in (0, 1), got {}",
            train_fraction
        )));
    }
    let n = windows.len();
    let split_idx = (n as f64 * train_fraction).floor() as usize;
    if split_idx == 0 || split_idx == n {
        return Err(ForecastError::InsufficientData { required: 2, actual: n });
    }

    let val = windows.split_off(split_idx);
    info!("📊 [Windows] Split: {} train / {} validation", windows.len(), val.len());
    Ok((windows, val))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(rows: usize, cols: usize) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |(r, c)| (r * cols + c) as f64)
    }

    #[test]
    fn test_window_count_formula() {
        for t in [36, 37, 60, 100] {
            let windows = build_windows(&ramp(t, 2), 24, 12).unwrap();
            assert_eq!(windows.len(), t - 35);
        }
    }

    #[test]
    fn test_too_short_is_insufficient_data() {
        for t in [0, 10, 35] {
            let result = build_windows(&ramp(t, 2), 24, 12);
            assert!(matches!(
                result,
                Err(ForecastError::InsufficientData { required: 36, actual }) if actual == t
            ));
        }
    }

    #[test]
    fn test_zero_lengths_rejected() {
        assert!(matches!(build_windows(&ramp(10, 1), 0, 2), Err(ForecastError::InvalidConfig(_))));
        assert!(matches!(build_windows(&ramp(10, 1), 2, 0), Err(ForecastError::InvalidConfig(_))));
    }

    #[test]
    fn test_window_contents_and_order() {
        let data = ramp(10, 3);
        let windows = build_windows(&data, 4, 2).unwrap();
        assert_eq!(windows.len(), 5);

        for (i, w) in windows.iter().enumerate() {
            assert_eq!(w.start, i);
            assert_eq!(w.history.dim(), (4, 3));
            assert_eq!(w.future.dim(), (2, 3));
            assert_eq!(w.history.row(0), data.row(i));
            assert_eq!(w.future.row(0), data.row(i + 4));
            assert_eq!(w.future.row(1), data.row(i + 5));
        }
        assert!(windows.windows(2).all(|p| p[0].start < p[1].start));
    }

    #[test]
    fn test_split_scenario_500_rows() {
        let windows = build_windows(&ramp(500, 5), 24, 12).unwrap();
        assert_eq!(windows.len(), 465);

        let (train, val) = chronological_split(windows, 0.8).unwrap();
        assert_eq!(train.len(), 372);
        assert_eq!(val.len(), 93);

        let last_train = train.last().unwrap().start;
        let first_val = val.first().unwrap().start;
        assert_eq!(last_train + 1, first_val);
        assert!(train.iter().all(|w| w.start < first_val));
    }

    #[test]
    fn test_split_rejects_bad_fraction_and_empty_partitions() {
        let windows = build_windows(&ramp(40, 1), 4, 2).unwrap();
        assert!(matches!(chronological_split(windows.clone(), 1.0), Err(ForecastError::InvalidConfig(_))));
        assert!(matches!(chronological_split(windows.clone(), 0.0), Err(ForecastError::InvalidConfig(_))));

        let one = build_windows(&ramp(6, 1), 4, 2).unwrap();
        assert_eq!(one.len(), 1);
        assert!(matches!(chronological_split(one, 0.8), Err(ForecastError::InsufficientData { .. })));
    }
}
