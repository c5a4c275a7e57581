//! Tiny recurrent reference model.
//!
//! `TinyLm` is a deterministic stand-in for a real transformer. It keeps the
//! properties the scheduler relies on:
//!
//! - Prefill consumes a padded `[rows, cols]` batch and returns one cache
//!   state per row plus the first token.
//! - Decode advances every live row with a single batched call.
//! - Rows never interact: every op is elementwise or a per-row reduction,
//!   so a row's tokens are identical whatever else shares the batch.
//!
//! ## Cell
//!
//! ```text
//! h' = tanh(W_L · … tanh(W_1 · (0.5·h + E[token])))
//! logits = W_out · h'
//! ```

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Embedding, Module};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::batch::{DeviceDecodeBatch, DevicePrefillBatch};
use crate::compute::{ComputePrimitive, DecodeOutput, PrefillOutput, Sampler};
use crate::config::ModelConfig;
use crate::error::{Error, Result};

/// Per-request cache state of [`TinyLm`].
#[derive(Debug, Clone)]
pub struct TinyLmState {
    /// Recurrent hidden state, `[hidden_size]`.
    hidden: Tensor,
    /// Request-local generator for stochastic decoding.
    rng: Option<StdRng>,
    /// Tokens consumed so far.
    position: usize,
}

impl TinyLmState {
    pub fn hidden(&self) -> &Tensor {
        &self.hidden
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

/// Deterministic recurrent language model implementing [`ComputePrimitive`].
///
/// # Example
///
/// ```
/// use candle_core::Device;
/// use nano_cb::compute::TinyLm;
/// use nano_cb::config::ModelConfig;
///
/// let model = TinyLm::new(ModelConfig::default(), &Device::Cpu).unwrap();
/// assert_eq!(model.config().vocab_size, 64);
/// ```
#[derive(Debug)]
pub struct TinyLm {
    config: ModelConfig,
    embedding: Embedding,
    /// Mixing matrices, `[hidden, hidden]` each.
    layers: Vec<Tensor>,
    /// Output projection, `[vocab, hidden]`.
    lm_head: Tensor,
    sampler: Sampler,
    device: Device,
}

impl TinyLm {
    /// Build a model with weights drawn from `config.seed`.
    pub fn new(config: ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let vocab = config.vocab_size;
        let hidden = config.hidden_size;
        let layer_scale = 2.0 / (hidden as f32).sqrt();

        let embedding = Embedding::new(random_matrix(&mut rng, vocab, hidden, 1.0, device)?, hidden);
        let layers = (0..config.num_layers)
            .map(|_| random_matrix(&mut rng, hidden, hidden, layer_scale, device))
            .collect::<Result<Vec<_>>>()?;
        let lm_head = random_matrix(&mut rng, vocab, hidden, 1.0, device)?;

        Ok(Self {
            sampler: Sampler::new(config.decoder.clone()),
            config,
            embedding,
            layers,
            lm_head,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Feed one token per row: `[rows, hidden]` × `[rows]` → `[rows, hidden]`.
    fn step(&self, hidden: &Tensor, tokens: &Tensor) -> Result<Tensor> {
        let x = self.embedding.forward(tokens)?;
        let mut h = hidden.affine(0.5, 0.0)?.add(&x)?;
        for w in &self.layers {
            h = mix(&h, w)?.tanh()?;
        }
        Ok(h)
    }

    fn logits(&self, hidden: &Tensor) -> Result<Tensor> {
        mix(hidden, &self.lm_head)
    }

    fn select(&self, logits: &Tensor, log_probs: &Tensor, rng: Option<&mut StdRng>) -> Result<(u32, f32)> {
        let token = self.sampler.sample(logits, rng)?;
        let score = log_probs.get(token as usize)?.to_scalar::<f32>()?;
        Ok((token, score))
    }
}

impl ComputePrimitive for TinyLm {
    type CacheState = TinyLmState;

    fn device(&self) -> &Device {
        &self.device
    }

    fn num_cache_slots(&self) -> Option<usize> {
        Some(self.config.num_cache_slots)
    }

    fn prefill(&self, batch: &DevicePrefillBatch) -> Result<PrefillOutput<TinyLmState>> {
        let (rows, cols) = batch.ids.dims2()?;
        let mut hidden = Tensor::zeros((rows, self.config.hidden_size), DType::F32, &self.device)?;

        // Walk the columns; padding positions keep the previous hidden state.
        for col in 0..cols {
            let tokens = batch.ids.narrow(1, col, 1)?.squeeze(1)?.contiguous()?;
            let keep = batch.paddings.narrow(1, col, 1)?;
            let take = keep.affine(-1.0, 1.0)?;
            let stepped = self.step(&hidden, &tokens)?;
            hidden = keep
                .broadcast_mul(&hidden)?
                .add(&take.broadcast_mul(&stepped)?)?;
        }

        let logits = self.logits(&hidden)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
        let ids = batch.ids.to_vec2::<u32>()?;
        let paddings = batch.paddings.to_vec2::<f32>()?;

        let mut tokens = Vec::with_capacity(rows);
        let mut scores = Vec::with_capacity(rows);
        let mut states = Vec::with_capacity(rows);
        for row in 0..rows {
            let prompt: Vec<u32> = ids[row]
                .iter()
                .zip(&paddings[row])
                .filter(|&(_, &pad)| pad == 0.0)
                .map(|(&id, _)| id)
                .collect();

            let mut rng = self.sampler.request_rng(&prompt);
            let (token, score) = self.select(&logits.get(row)?, &log_probs.get(row)?, rng.as_mut())?;
            tokens.push(token);
            scores.push(score);
            states.push(TinyLmState {
                hidden: hidden.get(row)?,
                rng,
                position: prompt.len(),
            });
        }

        Ok(PrefillOutput {
            scores: Tensor::from_vec(scores, rows, &self.device)?,
            tokens: Tensor::from_vec(tokens, rows, &self.device)?,
            states,
        })
    }

    fn decode_step(
        &self,
        batch: &DeviceDecodeBatch,
        states: &mut [Option<TinyLmState>],
    ) -> Result<DecodeOutput> {
        let rows = batch.rows.physical();
        if states.len() > self.config.num_cache_slots {
            return Err(Error::ShapeMismatch {
                what: "decode cache slots",
                expected: vec![self.config.num_cache_slots],
                actual: vec![states.len()],
            });
        }
        if states.len() != batch.rows.logical() {
            return Err(Error::ShapeMismatch {
                what: "decode cache states",
                expected: vec![batch.rows.logical()],
                actual: vec![states.len()],
            });
        }
        let mask = batch.mask.to_vec1::<u8>()?;
        if mask.len() != rows {
            return Err(Error::ShapeMismatch {
                what: "decode mask",
                expected: vec![rows],
                actual: vec![mask.len()],
            });
        }

        let zeros = Tensor::zeros(self.config.hidden_size, DType::F32, &self.device)?;
        let mut hiddens = Vec::with_capacity(rows);
        for (row, &live) in mask.iter().enumerate() {
            match states.get(row).and_then(Option::as_ref) {
                Some(state) if live != 0 => hiddens.push(state.hidden.clone()),
                None if live != 0 => {
                    return Err(Error::InvalidSlot {
                        slot: row,
                        reason: "live row has no cache state",
                    })
                }
                _ => hiddens.push(zeros.clone()),
            }
        }

        let next_hidden = self.step(&Tensor::stack(&hiddens, 0)?, &batch.tokens)?;
        let logits = self.logits(&next_hidden)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;

        let mut tokens = vec![0u32; rows];
        let mut scores = vec![0f32; rows];
        let mut done = vec![0u8; rows];
        for (row, state) in states.iter_mut().enumerate() {
            let Some(state) = state.as_mut().filter(|_| mask[row] != 0) else {
                continue;
            };
            let (token, score) =
                self.select(&logits.get(row)?, &log_probs.get(row)?, state.rng.as_mut())?;
            state.hidden = next_hidden.get(row)?;
            state.position += 1;
            tokens[row] = token;
            scores[row] = score;
            done[row] = u8::from(self.config.eos_ids.contains(&token));
        }

        Ok(DecodeOutput {
            scores: Tensor::from_vec(scores, rows, &self.device)?,
            tokens: Tensor::from_vec(tokens, rows, &self.device)?,
            done: Tensor::from_vec(done, rows, &self.device)?,
        })
    }
}

/// `[n, h]` × `[o, h]` → `[n, o]` as a per-row reduction.
fn mix(h: &Tensor, w: &Tensor) -> Result<Tensor> {
    Ok(h.unsqueeze(1)?.broadcast_mul(&w.unsqueeze(0)?)?.sum(2)?)
}

fn random_matrix(
    rng: &mut StdRng,
    rows: usize,
    cols: usize,
    scale: f32,
    device: &Device,
) -> Result<Tensor> {
    let data: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(-scale..scale)).collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}
