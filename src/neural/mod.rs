// projeto: lstmsensorforecast
// file: src/neural/mod.rs
// Module declarations for the sensor forecasting engine

pub mod utils;    // Error taxonomy, activations, optimizer and learning-rate schedule
pub mod data;     // Sensor tables, loaders, quality report and synthetic data
pub mod scaler;   // Per-channel standardization
pub mod window;   // Sliding (history, future) windows and chronological split
pub mod model;    // Stacked LSTM + attention pooling + dense head, training and inference
pub mod metrics;  // Epoch history, forecast error metrics, early stopping
pub mod forecast; // Calendar-aligned forecasts and trend summaries
pub mod storage;  // Versioned artifact set on disk

// Re-export commonly used items for convenience
pub use data::{ChannelSet, TimeSeriesTable};
pub use forecast::{Forecast, SensorForecaster, predict_future};
pub use metrics::{EarlyStopping, ForecastMetrics, TrainingLog};
pub use model::{ArchitectureConfig, EpochControl, ModelConfig, SequenceModel, TrainingOptions};
pub use scaler::ScalerParams;
pub use storage::{load_artifacts, save_artifacts};
pub use utils::ForecastError;
pub use window::{Window, build_windows, chronological_split};
