// projeto: lstmsensorforecast
// file: src/lib.rs
// Multivariate sensor forecasting: scaling, windowing, LSTM training and artifact storage

pub mod config;
pub mod neural;

pub use config::Settings;
pub use neural::*;
