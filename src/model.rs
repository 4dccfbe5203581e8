//! Demo forward pass: a small attention-only transformer
//!
//! Token embedding plus sinusoidal positions feed `num_layers` causal
//! multi-head attention blocks, each adding its output back into the
//! residual stream. A final projection gives vocabulary logits. There are no
//! MLP blocks and no layer norm, which keeps every layer's attention pattern
//! directly readable.
//!
//! Parameters are drawn once from a seeded `StdRng`. The per-request seed
//! drives dropout only.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    error::{MiradorError, Result},
    gateway::{ForwardPass, InferenceResult, LAYER_ACTIVATIONS},
    hyperparams::Hyperparameters,
    tensor::Tensor,
    value::{Map, Value},
};

/// Score written above the diagonal before the softmax
pub const CAUSAL_MASK: f32 = -1e30;

/// Architecture read from the hyperparameter set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelConfig {
    /// Number of token ids
    pub vocab_size: usize,
    /// Attention blocks
    pub num_layers: usize,
    /// Heads per block
    pub num_heads: usize,
    /// Query/key/value width per head
    pub key_size: usize,
    /// Residual stream width
    pub model_size: usize,
    /// Probability of zeroing an attention weight, in `[0, 1)`
    pub dropout_rate: f32,
}

impl ModelConfig {
    /// Read the architecture keys
    ///
    /// # Errors
    ///
    /// Returns error if a size is missing or zero, or the dropout rate is
    /// outside `[0, 1)`
    pub fn from_hyperparameters(hyper: &Hyperparameters) -> Result<Self> {
        let positive = |key: &str| -> Result<usize> {
            match hyper.usize(key)? {
                0 => Err(MiradorError::InvalidConfiguration(format!(
                    "Hyperparameter '{key}' must be positive"
                ))),
                n => Ok(n),
            }
        };

        let dropout_rate = hyper.f64_or("dropout_rate", 0.0)?;
        if !(0.0..1.0).contains(&dropout_rate) {
            return Err(MiradorError::InvalidConfiguration(format!(
                "dropout_rate {dropout_rate} outside [0, 1)"
            )));
        }

        Ok(Self {
            vocab_size: positive("vocab_size")?,
            num_layers: positive("num_layers")?,
            num_heads: positive("num_heads")?,
            key_size: positive("key_size")?,
            model_size: positive("model_size")?,
            dropout_rate: dropout_rate as f32,
        })
    }

    fn head_width(&self) -> usize {
        self.num_heads * self.key_size
    }
}

/// Weights of one attention block, all row-major
#[derive(Debug, Clone)]
pub struct LayerParams {
    query: Vec<f32>,
    key: Vec<f32>,
    value: Vec<f32>,
    output: Vec<f32>,
}

/// All model weights
#[derive(Debug, Clone)]
pub struct TransformerParams {
    token_embed: Vec<f32>,
    layers: Vec<LayerParams>,
    unembed: Vec<f32>,
}

impl TransformerParams {
    /// Draw weights uniformly in `±1/sqrt(fan_in)`
    #[must_use]
    pub fn init(config: &ModelConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let d = config.model_size;
        let hk = config.head_width();

        let mut draw = |fan_in: usize, len: usize| -> Vec<f32> {
            let bound = 1.0 / (fan_in as f32).sqrt();
            (0..len).map(|_| rng.gen_range(-bound..bound)).collect()
        };

        let token_embed = draw(1, config.vocab_size * d);
        let layers = (0..config.num_layers)
            .map(|_| LayerParams {
                query: draw(d, d * hk),
                key: draw(d, d * hk),
                value: draw(d, d * hk),
                output: draw(hk, hk * d),
            })
            .collect();
        let unembed = draw(d, d * config.vocab_size);

        Self {
            token_embed,
            layers,
            unembed,
        }
    }

    /// Number of attention blocks
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

/// Attention-only transformer forward pass
#[derive(Debug, Clone)]
pub struct AttentionOnlyTransformer {
    config: ModelConfig,
}

impl AttentionOnlyTransformer {
    /// Create from an architecture
    #[must_use]
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    /// Read the architecture from hyperparameters and draw seeded weights
    ///
    /// # Errors
    ///
    /// Returns error if the hyperparameters do not describe a valid model
    pub fn from_hyperparameters(
        hyper: &Hyperparameters,
        init_seed: u64,
    ) -> Result<(Self, TransformerParams)> {
        let config = ModelConfig::from_hyperparameters(hyper)?;
        Ok((Self::new(config), TransformerParams::init(&config, init_seed)))
    }

    /// Architecture
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn batch_and_time(tokens: &Tensor<i32>) -> Result<(usize, usize)> {
        let (batch, time) = match tokens.shape() {
            &[t] => (1, t),
            &[b, t] => (b, t),
            other => {
                return Err(MiradorError::InvalidShape {
                    reason: format!("Tokens must be [time] or [batch, time], got {other:?}"),
                })
            },
        };
        if batch == 0 || time == 0 {
            return Err(MiradorError::InvalidShape {
                reason: "Token array is empty".to_string(),
            });
        }
        Ok((batch, time))
    }
}

impl ForwardPass for AttentionOnlyTransformer {
    type Params = TransformerParams;

    fn apply(
        &self,
        params: &TransformerParams,
        seed: u64,
        tokens: &Tensor<i32>,
    ) -> Result<InferenceResult> {
        let c = &self.config;
        let (batch, time) = Self::batch_and_time(tokens)?;
        let (d, heads, k, hk) = (c.model_size, c.num_heads, c.key_size, c.head_width());
        let rows = batch * time;

        let mut residual = vec![0.0f32; rows * d];
        for (pos, &id) in tokens.data().iter().enumerate() {
            let id = usize::try_from(id)
                .ok()
                .filter(|&id| id < c.vocab_size)
                .ok_or_else(|| MiradorError::MalformedRequest {
                    reason: format!("Token id {id} outside vocabulary of {}", c.vocab_size),
                })?;
            let embed = &params.token_embed[id * d..(id + 1) * d];
            let t = pos % time;
            for (j, out) in residual[pos * d..(pos + 1) * d].iter_mut().enumerate() {
                *out = embed[j] + positional(t, j, d);
            }
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 1.0 / (k as f32).sqrt();
        let mut activations = Vec::with_capacity(params.layers.len());

        for layer in &params.layers {
            let q = matmul(&residual, rows, d, &layer.query, hk);
            let key = matmul(&residual, rows, d, &layer.key, hk);
            let v = matmul(&residual, rows, d, &layer.value, hk);

            // [B, H, T, T]
            let mut logits = vec![0.0f32; batch * heads * time * time];
            for b in 0..batch {
                for h in 0..heads {
                    for i in 0..time {
                        let qi = &q[(b * time + i) * hk + h * k..][..k];
                        for j in 0..time {
                            let idx = ((b * heads + h) * time + i) * time + j;
                            logits[idx] = if j > i {
                                CAUSAL_MASK
                            } else {
                                let kj = &key[(b * time + j) * hk + h * k..][..k];
                                dot(qi, kj) * scale
                            };
                        }
                    }
                }
            }

            let mut weights = logits.clone();
            softmax_rows(&mut weights, time);
            let mixing = if c.dropout_rate > 0.0 {
                dropout(&weights, c.dropout_rate, &mut rng)
            } else {
                weights.clone()
            };

            let mut mixed = vec![0.0f32; rows * hk];
            for b in 0..batch {
                for h in 0..heads {
                    for i in 0..time {
                        let out = (b * time + i) * hk + h * k;
                        for j in 0..=i {
                            let w = mixing[((b * heads + h) * time + i) * time + j];
                            let vj = (b * time + j) * hk + h * k;
                            for e in 0..k {
                                mixed[out + e] += w * v[vj + e];
                            }
                        }
                    }
                }
            }

            let update = matmul(&mixed, rows, hk, &layer.output, d);
            for (r, u) in residual.iter_mut().zip(&update) {
                *r += u;
            }

            let shape = vec![batch, heads, time, time];
            let mut layer_map = Map::new();
            let logits = Tensor::from_vec(shape.clone(), logits)?;
            layer_map.insert("attn_logits".to_string(), logits.into());
            layer_map.insert("attn_weights".to_string(), Tensor::from_vec(shape, weights)?.into());
            activations.push(Value::Map(layer_map));
        }

        let logits = matmul(&residual, rows, d, &params.unembed, c.vocab_size);

        let mut result = InferenceResult::default();
        result.insert("logits", Tensor::from_vec(vec![batch, time, c.vocab_size], logits)?);
        result.insert(LAYER_ACTIVATIONS, Value::List(activations));
        result.insert("residual", Tensor::from_vec(vec![batch, time, d], residual)?);
        Ok(result)
    }
}

/// Sinusoidal position encoding
fn positional(t: usize, j: usize, width: usize) -> f32 {
    let exponent = (2 * (j / 2)) as f32 / width as f32;
    let angle = t as f32 / 10_000f32.powf(exponent);
    if j % 2 == 0 {
        angle.sin()
    } else {
        angle.cos()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `[rows, inner] x [inner, cols]`
fn matmul(a: &[f32], rows: usize, inner: usize, b: &[f32], cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        let a_row = &a[r * inner..(r + 1) * inner];
        let out_row = &mut out[r * cols..(r + 1) * cols];
        for (i, &a_ri) in a_row.iter().enumerate() {
            let b_row = &b[i * cols..(i + 1) * cols];
            for (o, &b_ic) in out_row.iter_mut().zip(b_row) {
                *o += a_ri * b_ic;
            }
        }
    }
    out
}

/// Numerically stable softmax over each `width`-long row, in place
fn softmax_rows(data: &mut [f32], width: usize) {
    for row in data.chunks_mut(width) {
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum_exp = 0.0;
        for x in row.iter_mut() {
            *x = (*x - max_val).exp();
            sum_exp += *x;
        }
        for x in row.iter_mut() {
            *x /= sum_exp;
        }
    }
}

/// Inverted dropout
fn dropout(weights: &[f32], rate: f32, rng: &mut StdRng) -> Vec<f32> {
    let keep = 1.0 - rate;
    weights
        .iter()
        .map(|&w| if rng.gen::<f32>() < rate { 0.0 } else { w / keep })
        .collect()
}
