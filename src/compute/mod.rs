//! Batched compute primitive.
//!
//! The scheduler never does model math itself. It hands fixed-shape
//! batches to a [`ComputePrimitive`] and gets fixed-shape outputs back:
//!
//! ```text
//! prefill(ids, paddings, segment_pos)  ──► (scores, first tokens, cache states)
//! decode_step(last tokens, mask, &mut cache states) ──► (scores, tokens, done)
//! ```
//!
//! The primitive is an explicit handle passed into the scheduler at
//! construction. [`TinyLm`] is a small deterministic reference model used by
//! the tests and the demo binary.

pub mod sampler;
pub mod tiny_lm;

use candle_core::{Device, Tensor};

use crate::batch::{DeviceDecodeBatch, DevicePrefillBatch};
use crate::error::{Error, Result};

pub use sampler::Sampler;
pub use tiny_lm::{TinyLm, TinyLmState};

/// Output of a prefill call.
#[derive(Debug)]
pub struct PrefillOutput<C> {
    /// Score of each row's first token, `[rows]` `f32`.
    pub scores: Tensor,
    /// First generated token per row, `[rows]` `u32`.
    pub tokens: Tensor,
    /// Prefix cache state per physical row.
    pub states: Vec<C>,
}

/// Output of a decode step.
#[derive(Debug)]
pub struct DecodeOutput {
    /// Score of each row's token, `[rows]` `f32`.
    pub scores: Tensor,
    /// Next token per row, `[rows]` `u32`.
    pub tokens: Tensor,
    /// 1 where the row signalled completion, `[rows]` `u8`.
    pub done: Tensor,
}

/// A fixed-shape batched model entry point.
///
/// Implementations must treat rows independently: a row's outputs may only
/// depend on that row's inputs and cache state.
pub trait ComputePrimitive {
    /// Per-request attention cache state.
    type CacheState;

    /// Device the primitive's tensors live on.
    fn device(&self) -> &Device;

    /// Most cache slots one decode call accepts, if bounded.
    fn num_cache_slots(&self) -> Option<usize> {
        None
    }

    /// Run the prompt forward pass. Returns one cache state per physical row.
    fn prefill(&self, batch: &DevicePrefillBatch) -> Result<PrefillOutput<Self::CacheState>>;

    /// Advance every live row by one token.
    ///
    /// `states` has one entry per logical row (row index == slot index).
    /// Live rows are updated in place; other entries are left untouched.
    fn decode_step(
        &self,
        batch: &DeviceDecodeBatch,
        states: &mut [Option<Self::CacheState>],
    ) -> Result<DecodeOutput>;
}

impl<P: ComputePrimitive + ?Sized> ComputePrimitive for &P {
    type CacheState = P::CacheState;

    fn device(&self) -> &Device {
        (**self).device()
    }

    fn num_cache_slots(&self) -> Option<usize> {
        (**self).num_cache_slots()
    }

    fn prefill(&self, batch: &DevicePrefillBatch) -> Result<PrefillOutput<Self::CacheState>> {
        (**self).prefill(batch)
    }

    fn decode_step(
        &self,
        batch: &DeviceDecodeBatch,
        states: &mut [Option<Self::CacheState>],
    ) -> Result<DecodeOutput> {
        (**self).decode_step(batch, states)
    }
}

/// Reject a slot pool larger than the primitive can decode in one call.
pub(crate) fn check_capacity<P>(primitive: &P, slots: usize) -> Result<()>
where
    P: ComputePrimitive + ?Sized,
{
    match primitive.num_cache_slots() {
        Some(capacity) if capacity < slots => Err(Error::Config(format!(
            "{slots} cache slots configured but the compute primitive holds {capacity}"
        ))),
        _ => Ok(()),
    }
}
