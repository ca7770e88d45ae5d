// projeto: lstmsensorforecast
// file: src/neural/model.rs
// Stacked LSTM encoder with attention pooling and a dense multi-step head

use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayViewD, ArrayViewMutD, Axis, s};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use rayon::prelude::*;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::Instant;

use crate::neural::data::ChannelSet;
use crate::neural::metrics::{EpochMetrics, ForecastMetrics, TrainingLog};
use crate::neural::utils::{
    AdamOptimizer, ForecastError, LearningRateScheduler, relu, sigmoid_scalar, softmax,
    validate_input_data,
};
use crate::neural::window::Window;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    /// Hidden size of each recurrent stage, bottom to top.
    pub lstm_units: Vec<usize>,
    /// Widths of the two ReLU projection stages.
    pub dense_units: [usize; 2],
    pub attention: bool,
    /// Applied after each recurrent and projection stage while training.
    pub dropout_rate: f64,
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        ArchitectureConfig {
            lstm_units: vec![128, 64],
            dense_units: [256, 128],
            attention: true,
            dropout_rate: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub sequence_length: usize,
    pub prediction_horizon: usize,
    pub channel_count: usize,
    pub channel_names: ChannelSet,
    #[serde(default)]
    pub architecture: ArchitectureConfig,
}

impl ModelConfig {
    pub fn new(
        sequence_length: usize,
        prediction_horizon: usize,
        channel_names: ChannelSet,
        architecture: ArchitectureConfig,
    ) -> Self {
        ModelConfig {
            sequence_length,
            prediction_horizon,
            channel_count: channel_names.len(),
            channel_names,
            architecture,
        }
    }

    pub fn validate(&self) -> Result<(), ForecastError> {
        if self.sequence_length < 2 {
            return Err(ForecastError::InvalidConfig(format!(
                "sequence_length must be at least 2, got {}",
                self.sequence_length
            )));
        }
        if self.prediction_horizon == 0 {
            return Err(ForecastError::InvalidConfig("prediction_horizon must be positive".to_string()));
        }
        if self.channel_count == 0 {
            return Err(ForecastError::InvalidConfig("channel_count must be positive".to_string()));
        }
        if self.channel_count != self.channel_names.len() {
            return Err(ForecastError::InvalidConfig(format!(
                "channel_count {} but {} channel names",
                self.channel_count,
                self.channel_names.len()
            )));
        }
        let arch = &self.architecture;
        if arch.lstm_units.is_empty() || arch.lstm_units.contains(&0) {
            return Err(ForecastError::InvalidConfig(format!(
                "lstm_units must be a non-empty list of positive sizes, got {:?}",
                arch.lstm_units
            )));
        }
        if arch.dense_units.contains(&0) {
            return Err(ForecastError::InvalidConfig(format!(
                "dense_units must be positive, got {:?}",
                arch.dense_units
            )));
        }
        if !(0.0..1.0).contains(&arch.dropout_rate) {
            return Err(ForecastError::InvalidConfig(format!(
                "dropout_rate must be in [0, 1), got {}",
                arch.dropout_rate
            )));
        }
        Ok(())
    }

    pub fn input_shape(&self) -> (usize, usize) {
        (self.sequence_length, self.channel_count)
    }

    pub fn output_shape(&self) -> (usize, usize) {
        (self.prediction_horizon, self.channel_count)
    }
}

/// Gate rows are stacked as input, forget, cell, output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmLayer {
    pub w_x: Array2<f64>,
    pub w_h: Array2<f64>,
    pub b: Array1<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionLayer {
    pub w: Array1<f64>,
    pub b: Array1<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    pub w: Array2<f64>,
    pub b: Array1<f64>,
}

/// Every trainable tensor of a model. Also used as the gradient holder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWeights {
    pub lstm: Vec<LstmLayer>,
    pub attention: Option<AttentionLayer>,
    pub hidden: Vec<DenseLayer>,
    pub output: DenseLayer,
}

fn glorot_uniform(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f64> {
    let limit = (6.0 / (rows + cols) as f64).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.random_range(-limit..limit))
}

impl ModelWeights {
    pub fn initialize(config: &ModelConfig, rng: &mut StdRng) -> Self {
        let arch = &config.architecture;
        let mut input = config.channel_count;

        let mut lstm = Vec::with_capacity(arch.lstm_units.len());
        for &units in &arch.lstm_units {
            let recurrent_limit = 1.0 / (units as f64).sqrt();
            let mut b = Array1::zeros(4 * units);
            b.slice_mut(s![units..2 * units]).fill(1.0);
            lstm.push(LstmLayer {
                w_x: glorot_uniform(4 * units, input, rng),
                w_h: Array2::from_shape_fn((4 * units, units), |_| {
                    rng.random_range(-recurrent_limit..recurrent_limit)
                }),
                b,
            });
            input = units;
        }

        let attention = arch.attention.then(|| AttentionLayer {
            w: glorot_uniform(input, 1, rng).column(0).to_owned(),
            b: Array1::zeros(1),
        });

        let mut hidden = Vec::with_capacity(arch.dense_units.len());
        for &units in &arch.dense_units {
            hidden.push(DenseLayer { w: glorot_uniform(units, input, rng), b: Array1::zeros(units) });
            input = units;
        }

        let out = config.prediction_horizon * config.channel_count;
        let output = DenseLayer { w: glorot_uniform(out, input, rng), b: Array1::zeros(out) };

        ModelWeights { lstm, attention, hidden, output }
    }

    pub fn zeros_like(&self) -> Self {
        let z2 = |a: &Array2<f64>| Array2::zeros(a.raw_dim());
        let z1 = |a: &Array1<f64>| Array1::zeros(a.raw_dim());
        ModelWeights {
            lstm: self
                .lstm
                .iter()
                .map(|l| LstmLayer { w_x: z2(&l.w_x), w_h: z2(&l.w_h), b: z1(&l.b) })
                .collect(),
            attention: self.attention.as_ref().map(|a| AttentionLayer { w: z1(&a.w), b: z1(&a.b) }),
            hidden: self.hidden.iter().map(|d| DenseLayer { w: z2(&d.w), b: z1(&d.b) }).collect(),
            output: DenseLayer { w: z2(&self.output.w), b: z1(&self.output.b) },
        }
    }

    /// All tensors in a fixed order: per LSTM layer (w_x, w_h, b), attention
    /// (w, b), per dense layer (w, b), output (w, b).
    pub fn tensors(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut out = Vec::new();
        for l in &self.lstm {
            out.push(l.w_x.view().into_dyn());
            out.push(l.w_h.view().into_dyn());
            out.push(l.b.view().into_dyn());
        }
        if let Some(a) = &self.attention {
            out.push(a.w.view().into_dyn());
            out.push(a.b.view().into_dyn());
        }
        for d in self.hidden.iter().chain(std::iter::once(&self.output)) {
            out.push(d.w.view().into_dyn());
            out.push(d.b.view().into_dyn());
        }
        out
    }

    pub fn tensors_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut out = Vec::new();
        for l in &mut self.lstm {
            out.push(l.w_x.view_mut().into_dyn());
            out.push(l.w_h.view_mut().into_dyn());
            out.push(l.b.view_mut().into_dyn());
        }
        if let Some(a) = &mut self.attention {
            out.push(a.w.view_mut().into_dyn());
            out.push(a.b.view_mut().into_dyn());
        }
        for d in self.hidden.iter_mut().chain(std::iter::once(&mut self.output)) {
            out.push(d.w.view_mut().into_dyn());
            out.push(d.b.view_mut().into_dyn());
        }
        out
    }

    pub fn add_assign(&mut self, other: &ModelWeights) {
        for (mut a, b) in self.tensors_mut().into_iter().zip(other.tensors()) {
            a += &b;
        }
    }

    pub fn scale(&mut self, factor: f64) {
        for mut t in self.tensors_mut() {
            t *= factor;
        }
    }

    pub fn global_norm(&self) -> f64 {
        self.tensors()
            .iter()
            .map(|t| t.iter().map(|v| v * v).sum::<f64>())
            .sum::<f64>()
            .sqrt()
    }

    pub fn num_parameters(&self) -> usize {
        self.tensors().iter().map(|t| t.len()).sum()
    }

    pub fn is_finite(&self) -> bool {
        self.tensors().iter().all(|t| t.iter().all(|v| v.is_finite()))
    }

    /// Shapes a weight set built from `config` must have, in `tensors()` order.
    pub fn expected_shapes(config: &ModelConfig) -> Vec<Vec<usize>> {
        let arch = &config.architecture;
        let mut shapes = Vec::new();
        let mut input = config.channel_count;
        for &units in &arch.lstm_units {
            shapes.push(vec![4 * units, input]);
            shapes.push(vec![4 * units, units]);
            shapes.push(vec![4 * units]);
            input = units;
        }
        if arch.attention {
            shapes.push(vec![input]);
            shapes.push(vec![1]);
        }
        for &units in &arch.dense_units {
            shapes.push(vec![units, input]);
            shapes.push(vec![units]);
            input = units;
        }
        let out = config.prediction_horizon * config.channel_count;
        shapes.push(vec![out, input]);
        shapes.push(vec![out]);
        shapes
    }

    pub fn check_shapes(&self, config: &ModelConfig) -> Result<(), ForecastError> {
        let expected = Self::expected_shapes(config);
        let actual: Vec<Vec<usize>> = self.tensors().iter().map(|t| t.shape().to_vec()).collect();
        if expected.len() != actual.len() {
            return Err(ForecastError::ArtifactMismatch(format!(
                "weights hold {} tensors, config describes {}",
                actual.len(),
                expected.len()
            )));
        }
        for (idx, (e, a)) in expected.iter().zip(&actual).enumerate() {
            if e != a {
                return Err(ForecastError::ArtifactMismatch(format!(
                    "tensor {} has shape {:?}, config expects {:?}",
                    idx, a, e
                )));
            }
        }
        Ok(())
    }
}

struct LayerCache {
    input: Array2<f64>,
    /// Activated gates per step, same stacking as the weights.
    gates: Array2<f64>,
    c: Array2<f64>,
    h: Array2<f64>,
    /// Dropout applied to `h` before the next stage sees it.
    mask: Option<Array2<f64>>,
}

struct AttentionCache {
    scores: Array1<f64>,
    weights: Array1<f64>,
}

struct DenseCache {
    input: Array1<f64>,
    activation: Array1<f64>,
    mask: Option<Array1<f64>>,
}

struct ForwardCache {
    layers: Vec<LayerCache>,
    attention: Option<AttentionCache>,
    dense: Vec<DenseCache>,
    head_input: Array1<f64>,
    output: Array1<f64>,
}

fn outer(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> Array2<f64> {
    a.insert_axis(Axis(1)).dot(&b.insert_axis(Axis(0)))
}

fn lstm_forward(layer: &LstmLayer, input: Array2<f64>) -> LayerCache {
    let steps = input.nrows();
    let units = layer.w_h.ncols();
    let projected = input.dot(&layer.w_x.t()) + &layer.b;

    let mut gates = Array2::zeros((steps, 4 * units));
    let mut c = Array2::zeros((steps, units));
    let mut h = Array2::zeros((steps, units));
    let mut h_prev = Array1::<f64>::zeros(units);
    let mut c_prev = Array1::<f64>::zeros(units);

    for t in 0..steps {
        let z = &projected.row(t) + &layer.w_h.dot(&h_prev);
        let i = z.slice(s![0..units]).mapv(sigmoid_scalar);
        let f = z.slice(s![units..2 * units]).mapv(sigmoid_scalar);
        let g = z.slice(s![2 * units..3 * units]).mapv(f64::tanh);
        let o = z.slice(s![3 * units..]).mapv(sigmoid_scalar);

        let c_t = &f * &c_prev + &i * &g;
        let h_t = &o * &c_t.mapv(f64::tanh);

        let mut row = gates.row_mut(t);
        row.slice_mut(s![0..units]).assign(&i);
        row.slice_mut(s![units..2 * units]).assign(&f);
        row.slice_mut(s![2 * units..3 * units]).assign(&g);
        row.slice_mut(s![3 * units..]).assign(&o);
        c.row_mut(t).assign(&c_t);
        h.row_mut(t).assign(&h_t);

        h_prev = h_t;
        c_prev = c_t;
    }

    LayerCache { input, gates, c, h, mask: None }
}

/// Backpropagation through time for one layer. `d_h` is the loss gradient
/// w.r.t. every output step; returns the gradient w.r.t. every input step.
fn lstm_backward(layer: &LstmLayer, cache: &LayerCache, d_h: &Array2<f64>, grad: &mut LstmLayer) -> Array2<f64> {
    let (steps, units) = cache.h.dim();
    let mut d_z_all = Array2::<f64>::zeros((steps, 4 * units));
    let mut dh_next = Array1::<f64>::zeros(units);
    let mut dc_next = Array1::<f64>::zeros(units);

    for t in (0..steps).rev() {
        let gates = cache.gates.row(t);
        let i = gates.slice(s![0..units]);
        let f = gates.slice(s![units..2 * units]);
        let g = gates.slice(s![2 * units..3 * units]);
        let o = gates.slice(s![3 * units..]);
        let tanh_c = cache.c.row(t).mapv(f64::tanh);
        let c_prev = if t > 0 { cache.c.row(t - 1).to_owned() } else { Array1::zeros(units) };

        let dh = &d_h.row(t) + &dh_next;
        let d_o = &dh * &tanh_c;
        let dc = &dh * &o * &tanh_c.mapv(|v| 1.0 - v * v) + &dc_next;
        let d_f = &dc * &c_prev;
        let d_i = &dc * &g;
        let d_g = &dc * &i;
        dc_next = &dc * &f;

        let mut d_z = Array1::<f64>::zeros(4 * units);
        d_z.slice_mut(s![0..units]).assign(&(&d_i * &i.mapv(|v| v * (1.0 - v))));
        d_z.slice_mut(s![units..2 * units]).assign(&(&d_f * &f.mapv(|v| v * (1.0 - v))));
        d_z.slice_mut(s![2 * units..3 * units]).assign(&(&d_g * &g.mapv(|v| 1.0 - v * v)));
        d_z.slice_mut(s![3 * units..]).assign(&(&d_o * &o.mapv(|v| v * (1.0 - v))));

        dh_next = layer.w_h.t().dot(&d_z);
        d_z_all.row_mut(t).assign(&d_z);
    }

    let mut h_prev = Array2::<f64>::zeros((steps, units));
    if steps > 1 {
        h_prev.slice_mut(s![1.., ..]).assign(&cache.h.slice(s![..steps - 1, ..]));
    }
    grad.w_x += &d_z_all.t().dot(&cache.input);
    grad.w_h += &d_z_all.t().dot(&h_prev);
    grad.b += &d_z_all.sum_axis(Axis(0));

    d_z_all.dot(&layer.w_x)
}

fn attention_forward(layer: &AttentionLayer, h: &Array2<f64>) -> (Array1<f64>, AttentionCache) {
    let scores = (h.dot(&layer.w) + layer.b[0]).mapv(f64::tanh);
    let weights = softmax(&scores);
    let context = h.t().dot(&weights);
    (context, AttentionCache { scores, weights })
}

fn attention_backward(
    layer: &AttentionLayer,
    cache: &AttentionCache,
    h: &Array2<f64>,
    d_context: &Array1<f64>,
    grad: &mut AttentionLayer,
) -> Array2<f64> {
    let alpha = &cache.weights;
    let mut d_h = outer(alpha.view(), d_context.view());

    let d_alpha = h.dot(d_context);
    let expected = alpha.dot(&d_alpha);
    let d_scores = alpha * &(d_alpha - expected);
    let d_e = d_scores * &cache.scores.mapv(|v| 1.0 - v * v);

    grad.w += &h.t().dot(&d_e);
    grad.b[0] += d_e.sum();
    d_h += &outer(d_e.view(), layer.w.view());
    d_h
}

/// Deterministic per-sample seed inside a batch.
fn sample_seed(batch_seed: u64, position: usize) -> u64 {
    batch_seed ^ (position as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

pub const WEIGHTS_FORMAT_VERSION: u32 = 1;

/// Serialized form of a model's parameters.
#[derive(Serialize, Deserialize)]
struct WeightsBlob {
    format_version: u32,
    input_shape: (usize, usize),
    output_shape: (usize, usize),
    weights: ModelWeights,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochControl {
    Continue,
    Stop,
}

#[derive(Debug, Clone)]
pub struct TrainingOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Global-norm gradient clipping threshold.
    pub clip_norm: Option<f64>,
    pub scheduler: LearningRateScheduler,
    /// Reorder windows within the training partition each epoch.
    pub shuffle: bool,
    pub seed: Option<u64>,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        TrainingOptions {
            epochs: 100,
            batch_size: 32,
            learning_rate: 1e-3,
            clip_norm: Some(1.0),
            scheduler: LearningRateScheduler::ReduceOnPlateau { factor: 0.5, patience: 7, min_rate: 1e-7 },
            shuffle: true,
            seed: None,
        }
    }
}

impl TrainingOptions {
    pub fn validate(&self) -> Result<(), ForecastError> {
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(ForecastError::InvalidConfig(format!(
                "epochs ({}) and batch_size ({}) must be positive",
                self.epochs, self.batch_size
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ForecastError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if let Some(clip) = self.clip_norm {
            if !(clip.is_finite() && clip > 0.0) {
                return Err(ForecastError::InvalidConfig(format!("clip_norm must be positive, got {}", clip)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SequenceModel {
    config: ModelConfig,
    weights: ModelWeights,
}

impl SequenceModel {
    pub fn build(config: ModelConfig) -> Result<Self, ForecastError> {
        Self::build_seeded(config, rand::random())
    }

    pub fn build_seeded(config: ModelConfig, seed: u64) -> Result<Self, ForecastError> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let weights = ModelWeights::initialize(&config, &mut rng);
        let model = SequenceModel { config, weights };
        debug!(
            "[Model] Built {}x{} -> {}x{} with {} parameters",
            model.config.sequence_length,
            model.config.channel_count,
            model.config.prediction_horizon,
            model.config.channel_count,
            model.num_parameters()
        );
        Ok(model)
    }

    /// Wraps restored weights, rejecting any shape the config does not describe.
    pub fn from_weights(config: ModelConfig, weights: ModelWeights) -> Result<Self, ForecastError> {
        config.validate()?;
        weights.check_shapes(&config)?;
        if !weights.is_finite() {
            return Err(ForecastError::ArtifactMismatch("weights contain non-finite values".to_string()));
        }
        Ok(SequenceModel { config, weights })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn weights(&self) -> &ModelWeights {
        &self.weights
    }

    pub fn input_shape(&self) -> (usize, usize) {
        self.config.input_shape()
    }

    pub fn output_shape(&self) -> (usize, usize) {
        self.config.output_shape()
    }

    pub fn num_parameters(&self) -> usize {
        self.weights.num_parameters()
    }

    pub fn print_summary(&self) {
        let arch = &self.config.architecture;
        info!("🧠 [Model] Sequence model:");
        info!("   ├── Input: {:?}", self.input_shape());
        info!("   ├── LSTM units: {:?}", arch.lstm_units);
        info!("   ├── Attention: {}", arch.attention);
        info!("   ├── Dense units: {:?}", arch.dense_units);
        info!("   ├── Dropout: {}", arch.dropout_rate);
        info!("   ├── Output: {:?}", self.output_shape());
        info!("   └── Parameters: {}", self.num_parameters());
    }

    fn forward(&self, history: &Array2<f64>, mut dropout: Option<&mut StdRng>) -> ForwardCache {
        let rate = self.config.architecture.dropout_rate;
        let mut layers: Vec<LayerCache> = Vec::with_capacity(self.weights.lstm.len());
        let mut seq = history.clone();
        for layer in &self.weights.lstm {
            let mut cache = lstm_forward(layer, seq);
            cache.mask = match dropout.as_deref_mut() {
                Some(rng) if rate > 0.0 => {
                    let keep = 1.0 - rate;
                    Some(Array2::from_shape_fn(cache.h.raw_dim(), |_| {
                        if rng.random::<f64>() < keep { 1.0 / keep } else { 0.0 }
                    }))
                }
                _ => None,
            };
            seq = match &cache.mask {
                Some(m) => &cache.h * m,
                None => cache.h.clone(),
            };
            layers.push(cache);
        }

        let (context, attention) = match &self.weights.attention {
            Some(att) => {
                let (context, cache) = attention_forward(att, &seq);
                (context, Some(cache))
            }
            None => (seq.row(seq.nrows() - 1).to_owned(), None),
        };

        let mut x = context;
        let mut dense = Vec::with_capacity(self.weights.hidden.len());
        for layer in &self.weights.hidden {
            let activation = relu(&(layer.w.dot(&x) + &layer.b));
            let mask = match dropout.as_deref_mut() {
                Some(rng) if rate > 0.0 => {
                    let keep = 1.0 - rate;
                    Some(Array1::from_shape_fn(activation.len(), |_| {
                        if rng.random::<f64>() < keep { 1.0 / keep } else { 0.0 }
                    }))
                }
                _ => None,
            };
            let next = match &mask {
                Some(m) => &activation * m,
                None => activation.clone(),
            };
            dense.push(DenseCache { input: x, activation, mask });
            x = next;
        }

        let output = self.weights.output.w.dot(&x) + &self.weights.output.b;
        ForwardCache { layers, attention, dense, head_input: x, output }
    }

    fn backward(&self, cache: &ForwardCache, d_output: &Array1<f64>) -> ModelWeights {
        let mut grad = self.weights.zeros_like();

        grad.output.w += &outer(d_output.view(), cache.head_input.view());
        grad.output.b += d_output;
        let mut d_x = self.weights.output.w.t().dot(d_output);

        for (idx, (layer, dc)) in self.weights.hidden.iter().zip(&cache.dense).enumerate().rev() {
            if let Some(mask) = &dc.mask {
                d_x = d_x * mask;
            }
            let d_z = d_x * &dc.activation.mapv(|a| if a > 0.0 { 1.0 } else { 0.0 });
            grad.hidden[idx].w += &outer(d_z.view(), dc.input.view());
            grad.hidden[idx].b += &d_z;
            d_x = layer.w.t().dot(&d_z);
        }

        let top = match cache.layers.last() {
            Some(top) => top,
            None => return grad,
        };
        let top_out = match &top.mask {
            Some(m) => &top.h * m,
            None => top.h.clone(),
        };
        let mut d_seq = match (&self.weights.attention, &cache.attention, grad.attention.as_mut()) {
            (Some(att), Some(att_cache), Some(att_grad)) => {
                attention_backward(att, att_cache, &top_out, &d_x, att_grad)
            }
            _ => {
                let mut d = Array2::zeros(top_out.raw_dim());
                d.row_mut(top_out.nrows() - 1).assign(&d_x);
                d
            }
        };

        for (idx, layer) in self.weights.lstm.iter().enumerate().rev() {
            let layer_cache = &cache.layers[idx];
            if let Some(mask) = &layer_cache.mask {
                d_seq = d_seq * mask;
            }
            d_seq = lstm_backward(layer, layer_cache, &d_seq, &mut grad.lstm[idx]);
        }
        grad
    }

    /// Loss, MAE and parameter gradient of one window.
    fn sample_gradient(&self, window: &Window, dropout: Option<&mut StdRng>) -> (f64, f64, ModelWeights) {
        let cache = self.forward(&window.history, dropout);
        let target: Array1<f64> = window.future.iter().copied().collect();
        let diff = &cache.output - &target;
        let n = diff.len() as f64;
        let loss = diff.iter().map(|d| d * d).sum::<f64>() / n;
        let mae = diff.iter().map(|d| d.abs()).sum::<f64>() / n;
        let d_output = diff * (2.0 / n);
        let grad = self.backward(&cache, &d_output);
        (loss, mae, grad)
    }

    /// Batch-mean loss, MAE and gradient; samples run in parallel.
    fn batch_gradients(&self, windows: &[Window], batch: &[usize], batch_seed: u64) -> (f64, f64, ModelWeights) {
        let training_dropout = self.config.architecture.dropout_rate > 0.0;
        let (loss, mae, mut grad) = batch
            .par_iter()
            .enumerate()
            .map(|(pos, &idx)| {
                let mut rng = StdRng::seed_from_u64(sample_seed(batch_seed, pos));
                self.sample_gradient(&windows[idx], training_dropout.then_some(&mut rng))
            })
            .reduce(
                || (0.0, 0.0, self.weights.zeros_like()),
                |(la, ma, mut ga), (lb, mb, gb)| {
                    ga.add_assign(&gb);
                    (la + lb, ma + mb, ga)
                },
            );
        let n = batch.len().max(1) as f64;
        grad.scale(1.0 / n);
        (loss / n, mae / n, grad)
    }

    fn check_window(&self, window: &Window) -> Result<(), ForecastError> {
        if window.history.dim() != self.input_shape() || window.future.dim() != self.output_shape() {
            return Err(ForecastError::InvalidInput(format!(
                "window at {} is {:?} -> {:?}, model expects {:?} -> {:?}",
                window.start,
                window.history.dim(),
                window.future.dim(),
                self.input_shape(),
                self.output_shape()
            )));
        }
        Ok(())
    }

    fn diverged(&mut self, epoch: usize, loss: f64, best: ModelWeights) -> ForecastError {
        warn!("💥 [Trainer] Loss became {} at epoch {}; restoring best weights", loss, epoch);
        self.weights = best;
        ForecastError::TrainingDiverged { epoch, loss }
    }

    /// Minimizes MSE on `train`, scoring `val` after every epoch.
    ///
    /// `on_epoch` sees each epoch's metrics and may stop training. On return
    /// the model holds the weights with the lowest validation loss, whatever
    /// the last epoch produced. A non-finite loss restores those weights and
    /// fails with `TrainingDiverged`.
    pub fn fit<F>(
        &mut self,
        train: &[Window],
        val: &[Window],
        options: &TrainingOptions,
        mut on_epoch: F,
    ) -> Result<TrainingLog, ForecastError>
    where
        F: FnMut(&EpochMetrics) -> EpochControl,
    {
        options.validate()?;
        if train.is_empty() || val.is_empty() {
            return Err(ForecastError::InsufficientData {
                required: 1,
                actual: train.len().min(val.len()),
            });
        }
        for window in train.iter().chain(val) {
            self.check_window(window)?;
        }

        let seed = options.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut optimizer = AdamOptimizer::new(options.learning_rate, 0.9, 0.999, 1e-7);
        let mut order: Vec<usize> = (0..train.len()).collect();
        let mut log = TrainingLog::new();
        let mut best_weights = self.weights.clone();
        let mut current_lr = options.learning_rate;
        let mut stalled = 0usize;

        info!(
            "🚀 [Trainer] Training on {} windows, validating on {} ({} epochs, batch {})",
            train.len(),
            val.len(),
            options.epochs,
            options.batch_size
        );

        for epoch in 1..=options.epochs {
            let started = Instant::now();
            optimizer.set_learning_rate(current_lr);
            if options.shuffle {
                order.shuffle(&mut rng);
            }

            let mut loss_sum = 0.0;
            let mut mae_sum = 0.0;
            for batch in order.chunks(options.batch_size) {
                let (loss, mae, mut grad) = self.batch_gradients(train, batch, rng.random());
                if !loss.is_finite() {
                    return Err(self.diverged(epoch, loss, best_weights));
                }
                loss_sum += loss * batch.len() as f64;
                mae_sum += mae * batch.len() as f64;

                if let Some(max_norm) = options.clip_norm {
                    let norm = grad.global_norm();
                    if norm > max_norm {
                        grad.scale(max_norm / norm);
                    }
                }
                optimizer.step(self.weights.tensors_mut(), grad.tensors())?;
            }

            let val_metrics = self.evaluate(val)?;
            if !val_metrics.mse.is_finite() || !self.weights.is_finite() {
                return Err(self.diverged(epoch, val_metrics.mse, best_weights));
            }

            let improved = log.record(EpochMetrics {
                epoch,
                train_loss: loss_sum / train.len() as f64,
                train_mae: mae_sum / train.len() as f64,
                val_loss: val_metrics.mse,
                val_mae: val_metrics.mae,
                learning_rate: current_lr,
                duration_secs: started.elapsed().as_secs_f64(),
                improved: false,
            });
            if improved {
                best_weights = self.weights.clone();
                stalled = 0;
            } else {
                stalled += 1;
            }

            let control = match log.last() {
                Some(metrics) => {
                    debug!(
                        "[Trainer] Epoch {}: loss {:.6} val_loss {:.6} lr {:.2e}{}",
                        metrics.epoch,
                        metrics.train_loss,
                        metrics.val_loss,
                        metrics.learning_rate,
                        if improved { " *" } else { "" }
                    );
                    on_epoch(metrics)
                }
                None => EpochControl::Continue,
            };

            let next_lr = options.scheduler.next_rate(options.learning_rate, current_lr, epoch, &mut stalled);
            if next_lr < current_lr {
                info!("📉 [Trainer] Learning rate {:.2e} -> {:.2e}", current_lr, next_lr);
            }
            current_lr = next_lr;

            if control == EpochControl::Stop {
                log.stopped_early = true;
                info!("⏹️ [Trainer] Stop requested after epoch {}", epoch);
                break;
            }
        }

        self.weights = best_weights;
        info!(
            "✅ [Trainer] Restored best weights from epoch {} (val_loss {:.6})",
            log.best_epoch, log.best_val_loss
        );
        Ok(log)
    }

    /// Parameters as a gzip-compressed bincode blob.
    pub fn save_weights(&self) -> Result<Vec<u8>, ForecastError> {
        let blob = WeightsBlob {
            format_version: WEIGHTS_FORMAT_VERSION,
            input_shape: self.input_shape(),
            output_shape: self.output_shape(),
            weights: self.weights.clone(),
        };
        let encoded = bincode::serde::encode_to_vec(&blob, bincode::config::standard())
            .map_err(|e| ForecastError::Serialization(format!("encode weights: {}", e)))?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&encoded)?;
        Ok(encoder.finish()?)
    }

    /// Builds a model from `config` and a blob written by [`save_weights`].
    ///
    /// [`save_weights`]: SequenceModel::save_weights
    pub fn restore(config: ModelConfig, bytes: &[u8]) -> Result<Self, ForecastError> {
        config.validate()?;
        let mut decoded = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut decoded)
            .map_err(|e| ForecastError::ArtifactMismatch(format!("model blob is not valid gzip: {}", e)))?;
        let (blob, _): (WeightsBlob, usize) =
            bincode::serde::decode_from_slice(&decoded, bincode::config::standard())
                .map_err(|e| ForecastError::ArtifactMismatch(format!("model blob unreadable: {}", e)))?;

        if blob.format_version != WEIGHTS_FORMAT_VERSION {
            return Err(ForecastError::ArtifactMismatch(format!(
                "weights format version {} (expected {})",
                blob.format_version, WEIGHTS_FORMAT_VERSION
            )));
        }
        if blob.input_shape != config.input_shape() || blob.output_shape != config.output_shape() {
            return Err(ForecastError::ArtifactMismatch(format!(
                "weights were trained for {:?} -> {:?}, config says {:?} -> {:?}",
                blob.input_shape,
                blob.output_shape,
                config.input_shape(),
                config.output_shape()
            )));
        }
        Self::from_weights(config, blob.weights)
    }

    /// One deterministic forward pass: `(L, C)` history to `(H, C)` forecast.
    pub fn predict(&self, history: &Array2<f64>) -> Result<Array2<f64>, ForecastError> {
        if history.dim() != self.input_shape() {
            return Err(ForecastError::InvalidInput(format!(
                "history is {:?}, model expects {:?}",
                history.dim(),
                self.input_shape()
            )));
        }
        validate_input_data(history, "history")?;
        let output = self.forward(history, None).output;
        Ok(output.into_shape_with_order(self.output_shape())?)
    }

    pub fn predict_batch(&self, histories: &[Array2<f64>]) -> Result<Vec<Array2<f64>>, ForecastError> {
        histories.par_iter().map(|h| self.predict(h)).collect()
    }

    pub fn evaluate(&self, windows: &[Window]) -> Result<ForecastMetrics, ForecastError> {
        let histories: Vec<Array2<f64>> = windows.iter().map(|w| w.history.clone()).collect();
        let targets: Vec<Array2<f64>> = windows.iter().map(|w| w.future.clone()).collect();
        let predictions = self.predict_batch(&histories)?;
        ForecastMetrics::compute(&predictions, &targets)
    }
}
