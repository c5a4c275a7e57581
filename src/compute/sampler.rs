//! Token selection strategies.
//!
//! This module turns one row of next-token logits into a token id:
//!
//! - **Greedy**: highest logit wins
//! - **Sample**: temperature, optional top-k and top-p, then a weighted draw
//!
//! ## Sampling Pipeline
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Temperature scaling
//! Logits / temperature
//!     │
//!     ▼ Top-k filtering (optional)
//! Keep top k tokens
//!     │
//!     ▼ Softmax
//! Probabilities
//!     │
//!     ▼ Top-p filtering (optional)
//! Cumulative prob ≤ p
//!     │
//!     ▼ Renormalize + Sample
//! Selected token
//! ```
//!
//! The random generator is passed in per call. Callers keep one generator
//! per request so that the draws a request sees never depend on which other
//! requests share its batch.

use candle_core::{Tensor, D};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::DecoderStrategy;
use crate::error::{Error, Result};

/// Per-row token sampler.
#[derive(Debug, Clone)]
pub struct Sampler {
    strategy: DecoderStrategy,
}

impl Sampler {
    /// Creates a new sampler for the given strategy.
    pub fn new(strategy: DecoderStrategy) -> Self {
        Self { strategy }
    }

    /// Whether this sampler draws random numbers.
    pub fn is_stochastic(&self) -> bool {
        matches!(self.strategy, DecoderStrategy::Sample { temperature, .. } if temperature > 0.0)
    }

    /// Build the generator for one request, seeded from the strategy seed
    /// and the request's prompt. Greedy decoding needs none.
    pub fn request_rng(&self, prompt: &[u32]) -> Option<StdRng> {
        match self.strategy {
            DecoderStrategy::Sample { seed, .. } if self.is_stochastic() => {
                Some(StdRng::seed_from_u64(request_seed(seed, prompt)))
            }
            _ => None,
        }
    }

    /// Select a token from 1D logits.
    ///
    /// `rng` is required for stochastic strategies.
    pub fn sample(&self, logits: &Tensor, rng: Option<&mut StdRng>) -> Result<u32> {
        let DecoderStrategy::Sample {
            temperature,
            top_k,
            top_p,
            ..
        } = self.strategy
        else {
            return self.argmax(logits);
        };

        // Temperature 0 degenerates to greedy decoding.
        if temperature == 0.0 {
            return self.argmax(logits);
        }
        let rng = rng.ok_or_else(|| Error::Config("sampling requires a request rng".into()))?;

        let logits = if temperature != 1.0 {
            (logits / temperature as f64)?
        } else {
            logits.clone()
        };

        let vocab_size = logits.dim(0)?;
        let (logits, indices) = if top_k > 0 && top_k < vocab_size {
            apply_top_k(&logits, top_k)?
        } else {
            (logits.to_vec1::<f32>()?, (0..vocab_size as u32).collect())
        };

        let logits = Tensor::new(logits.as_slice(), &candle_core::Device::Cpu)?;
        let probs: Vec<f32> = candle_nn::ops::softmax(&logits, D::Minus1)?.to_vec1()?;

        let (probs, indices) = if top_p > 0.0 && top_p < 1.0 {
            apply_top_p(probs, indices, top_p)
        } else {
            (probs, indices)
        };

        sample_from_probs(&probs, &indices, rng)
    }

    /// Greedy decoding: select the token with highest logit.
    fn argmax(&self, logits: &Tensor) -> Result<u32> {
        Ok(logits.argmax(D::Minus1)?.to_scalar::<u32>()?)
    }
}

/// Fold the prompt into the strategy seed. Stable across platforms and
/// toolchains.
fn request_seed(seed: u64, prompt: &[u32]) -> u64 {
    let h = prompt
        .iter()
        .fold(splitmix64(seed), |h, &token| splitmix64(h ^ u64::from(token)));
    splitmix64(h ^ prompt.len() as u64)
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Keep only the k tokens with highest logits.
fn apply_top_k(logits: &Tensor, k: usize) -> Result<(Vec<f32>, Vec<u32>)> {
    let logits_vec: Vec<f32> = logits.to_vec1()?;
    let mut indexed: Vec<(usize, f32)> = logits_vec.into_iter().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed.truncate(k);

    let indices = indexed.iter().map(|(i, _)| *i as u32).collect();
    let values = indexed.iter().map(|(_, v)| *v).collect();
    Ok((values, indices))
}

/// Keep tokens until cumulative probability exceeds p.
fn apply_top_p(probs: Vec<f32>, indices: Vec<u32>, p: f32) -> (Vec<f32>, Vec<u32>) {
    let mut indexed: Vec<(u32, f32)> = indices.into_iter().zip(probs).collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumulative = 0.0f32;
    let mut cutoff = indexed.len();
    for (i, (_, prob)) in indexed.iter().enumerate() {
        cumulative += prob;
        if cumulative > p {
            // Include the token that pushed us over
            cutoff = i + 1;
            break;
        }
    }
    indexed.truncate(cutoff);

    indexed.into_iter().map(|(i, p)| (p, i)).unzip()
}

fn sample_from_probs(probs: &[f32], indices: &[u32], rng: &mut StdRng) -> Result<u32> {
    let sum: f32 = probs.iter().sum();
    let normalized: Vec<f64> = probs.iter().map(|&p| (p / sum) as f64).collect();

    let dist = rand::distributions::WeightedIndex::new(&normalized)
        .map_err(|e| Error::Config(format!("failed to create distribution: {e}")))?;
    Ok(indices[dist.sample(rng)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn sample_strategy(top_k: usize, top_p: f32) -> DecoderStrategy {
        DecoderStrategy::Sample {
            temperature: 1.0,
            top_k,
            top_p,
            seed: 42,
        }
    }

    #[test]
    fn test_greedy_sampling() {
        let sampler = Sampler::new(DecoderStrategy::Greedy);
        let logits = Tensor::new(&[0.1f32, 0.2, 0.3, 10.0, 0.4], &Device::Cpu).unwrap();

        assert_eq!(sampler.sample(&logits, None).unwrap(), 3);
        assert!(sampler.request_rng(&[1, 2]).is_none());
    }

    #[test]
    fn test_zero_temperature_is_greedy() {
        let sampler = Sampler::new(DecoderStrategy::Sample {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            seed: 1,
        });
        let logits = Tensor::new(&[0.1f32, 5.0, 0.3], &Device::Cpu).unwrap();

        assert!(!sampler.is_stochastic());
        assert_eq!(sampler.sample(&logits, None).unwrap(), 1);
    }

    #[test]
    fn test_top_k_sampling() {
        let sampler = Sampler::new(sample_strategy(2, 1.0));
        let mut rng = sampler.request_rng(&[1]).unwrap();
        let logits = Tensor::new(&[0.1f32, 0.2, 0.3, 10.0, 9.0], &Device::Cpu).unwrap();

        for _ in 0..50 {
            let token = sampler.sample(&logits, Some(&mut rng)).unwrap();
            assert!(token == 3 || token == 4);
        }
    }

    #[test]
    fn test_top_p_sampling() {
        let sampler = Sampler::new(sample_strategy(0, 0.5));
        let mut rng = sampler.request_rng(&[1]).unwrap();
        let logits = Tensor::new(&[0.0f32, 0.0, 0.0, 10.0, 0.0], &Device::Cpu).unwrap();

        // With dominant token, should always sample that token
        for _ in 0..10 {
            assert_eq!(sampler.sample(&logits, Some(&mut rng)).unwrap(), 3);
        }
    }

    #[test]
    fn test_request_rng_reproducible() {
        let sampler = Sampler::new(sample_strategy(0, 1.0));
        let logits = Tensor::new(&[1.0f32, 1.0, 1.0, 1.0, 1.0], &Device::Cpu).unwrap();

        let mut rng1 = sampler.request_rng(&[4, 5, 6]).unwrap();
        let mut rng2 = sampler.request_rng(&[4, 5, 6]).unwrap();
        let tokens1: Vec<u32> = (0..10)
            .map(|_| sampler.sample(&logits, Some(&mut rng1)).unwrap())
            .collect();
        let tokens2: Vec<u32> = (0..10)
            .map(|_| sampler.sample(&logits, Some(&mut rng2)).unwrap())
            .collect();

        assert_eq!(tokens1, tokens2, "Same prompt and seed should produce same draws");
    }

    #[test]
    fn test_request_seed_is_fixed() {
        assert_eq!(request_seed(42, &[4, 5, 6]), 0x60b1_15de_029f_9a8b);
        assert_eq!(request_seed(0, &[]), 0xa706_dd2f_4d19_7e6f);
        assert_ne!(request_seed(42, &[4, 5, 6]), request_seed(42, &[4, 5, 7]));
        assert_ne!(request_seed(42, &[4, 5, 6]), request_seed(43, &[4, 5, 6]));
    }

    #[test]
    fn test_sampling_without_rng_fails() {
        let sampler = Sampler::new(sample_strategy(0, 1.0));
        let logits = Tensor::new(&[1.0f32, 1.0], &Device::Cpu).unwrap();

        assert!(sampler.sample(&logits, None).is_err());
    }
}
