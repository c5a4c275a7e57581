//! Configuration types for nano-cb.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Side on which prompts are padded to the physical sequence length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PadSide {
    /// Pad before the prompt so the last real token sits in the final column.
    #[default]
    Left,
    /// Pad after the prompt.
    Right,
}

/// Scheduler configuration.
///
/// Consumed by the decode scheduler and the padding/shape adapter. Load it
/// from JSON with [`SchedulerConfig::from_json_file`] or build it in code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of cache slots `S` in the pool.
    pub num_cache_slots: usize,
    /// Maximum prompt length in tokens.
    pub max_input_seq_len: usize,
    /// Default decode step limit for requests that do not set their own.
    /// The prefill-produced token counts as the first step.
    pub max_decode_steps: usize,
    /// Upper bound on admissions (and prefill calls) per tick.
    pub max_admissions_per_tick: usize,
    /// Supported physical sequence lengths for prefill.
    pub seq_len_buckets: Vec<usize>,
    /// Supported physical batch sizes.
    pub batch_size_buckets: Vec<usize>,
    /// Token id written into padding positions and free decode rows.
    pub pad_id: u32,
    /// End-of-sequence token ids.
    pub eos_ids: Vec<u32>,
    /// Padding side for prompts.
    pub pad_side: PadSide,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_cache_slots: 8,
            max_input_seq_len: 128,
            max_decode_steps: 64,
            max_admissions_per_tick: 1,
            seq_len_buckets: vec![16, 32, 64, 128],
            batch_size_buckets: vec![1, 2, 4, 8],
            pad_id: 0,
            eos_ids: vec![1],
            pad_side: PadSide::Left,
        }
    }
}

impl SchedulerConfig {
    /// Parse a configuration from a JSON string and validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration from a JSON file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.num_cache_slots == 0 {
            return Err(Error::Config("num_cache_slots must be > 0".into()));
        }
        if self.max_input_seq_len == 0 {
            return Err(Error::Config("max_input_seq_len must be > 0".into()));
        }
        if self.max_decode_steps == 0 {
            return Err(Error::Config("max_decode_steps must be > 0".into()));
        }
        if self.max_admissions_per_tick == 0 {
            return Err(Error::Config("max_admissions_per_tick must be > 0".into()));
        }
        validate_buckets("seq_len_buckets", &self.seq_len_buckets)?;
        validate_buckets("batch_size_buckets", &self.batch_size_buckets)?;

        let max_seq = self.seq_len_buckets.last().copied().unwrap_or(0);
        if max_seq < self.max_input_seq_len {
            return Err(Error::Config(format!(
                "largest seq_len bucket {max_seq} is smaller than max_input_seq_len {}",
                self.max_input_seq_len
            )));
        }
        let max_batch = self.batch_size_buckets.last().copied().unwrap_or(0);
        if max_batch < self.num_cache_slots {
            return Err(Error::Config(format!(
                "largest batch_size bucket {max_batch} is smaller than num_cache_slots {}",
                self.num_cache_slots
            )));
        }
        Ok(())
    }

    /// Whether `token_id` ends a sequence.
    pub fn is_eos(&self, token_id: u32) -> bool {
        self.eos_ids.contains(&token_id)
    }

    /// Step limit applied to a request asking for `requested` steps.
    ///
    /// 0 selects the configured default; larger values are capped by it.
    pub fn decode_limit(&self, requested: usize) -> usize {
        if requested == 0 {
            self.max_decode_steps
        } else {
            requested.min(self.max_decode_steps)
        }
    }
}

fn validate_buckets(name: &str, buckets: &[usize]) -> Result<()> {
    if buckets.is_empty() {
        return Err(Error::Config(format!("{name} must not be empty")));
    }
    if buckets[0] == 0 {
        return Err(Error::Config(format!("{name} must not contain 0")));
    }
    if buckets.windows(2).any(|w| w[0] >= w[1]) {
        return Err(Error::Config(format!("{name} must be strictly increasing")));
    }
    Ok(())
}

/// How the compute primitive turns next-token logits into a token.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecoderStrategy {
    /// Always take the highest-scoring token.
    #[default]
    Greedy,
    /// Seeded sampling with temperature, top-k (0 = off) and top-p (1.0 = off).
    Sample {
        temperature: f32,
        top_k: usize,
        top_p: f32,
        seed: u64,
    },
}

/// Configuration of the reference compute primitive.
///
/// Passed by value into [`TinyLm::new`](crate::compute::TinyLm::new).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Number of recurrent mixing layers.
    pub num_layers: usize,
    /// Number of cache slots the model serves.
    pub num_cache_slots: usize,
    /// Decoding strategy.
    pub decoder: DecoderStrategy,
    /// End-of-sequence token ids reported through the done flags.
    pub eos_ids: Vec<u32>,
    /// Seed for weight initialisation.
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 64,
            hidden_size: 16,
            num_layers: 2,
            num_cache_slots: 8,
            decoder: DecoderStrategy::Greedy,
            eos_ids: vec![1],
            seed: 1234,
        }
    }
}

impl ModelConfig {
    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size < 2 {
            return Err(Error::Config("vocab_size must be >= 2".into()));
        }
        if self.hidden_size == 0 || self.num_layers == 0 {
            return Err(Error::Config(
                "hidden_size and num_layers must be > 0".into(),
            ));
        }
        if self.num_cache_slots == 0 {
            return Err(Error::Config("num_cache_slots must be > 0".into()));
        }
        if let DecoderStrategy::Sample {
            temperature, top_p, ..
        } = self.decoder
        {
            if temperature < 0.0 {
                return Err(Error::Config("temperature must be >= 0".into()));
            }
            if !(0.0..=1.0).contains(&top_p) {
                return Err(Error::Config("top_p must be in [0, 1]".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
        assert!(ModelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_decode_limit() {
        let config = SchedulerConfig {
            max_decode_steps: 5,
            ..Default::default()
        };
        assert_eq!(config.decode_limit(0), 5);
        assert_eq!(config.decode_limit(3), 3);
        assert_eq!(config.decode_limit(9), 5);
    }

    #[test]
    fn test_rejects_unsorted_buckets() {
        let config = SchedulerConfig {
            seq_len_buckets: vec![32, 16, 128],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_bucket_smaller_than_pool() {
        let config = SchedulerConfig {
            num_cache_slots: 16,
            batch_size_buckets: vec![1, 2, 4, 8],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            SchedulerConfig::from_json_str(r#"{"num_cache_slots": 2, "pad_side": "right"}"#)
                .unwrap();
        assert_eq!(config.num_cache_slots, 2);
        assert_eq!(config.pad_side, PadSide::Right);
        assert_eq!(config.max_input_seq_len, 128);
    }

    #[test]
    fn test_decoder_strategy_json() {
        let config: ModelConfig = serde_json::from_str(
            r#"{"decoder": {"type": "sample", "temperature": 0.7, "top_k": 5, "top_p": 0.9, "seed": 7}}"#,
        )
        .unwrap();
        assert_eq!(
            config.decoder,
            DecoderStrategy::Sample {
                temperature: 0.7,
                top_k: 5,
                top_p: 0.9,
                seed: 7
            }
        );
    }
}
