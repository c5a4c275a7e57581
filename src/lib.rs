//! nano-cb: a continuous batching decode scheduler in Rust.
//!
//! The crate keeps a fixed pool of per-request cache slots and drives a
//! batched compute primitive over them:
//! - Requests are admitted FIFO into the lowest free slot and prefilled
//! - Every tick runs one batched decode step over all active slots
//! - Finished slots are freed in the same tick and reused by the next admission
//! - Shapes are bucketed so the primitive only ever sees a fixed set of sizes

pub mod config;
pub mod error;

pub mod batch;
pub mod compute;
pub mod core;
pub mod scheduler;

pub use batch::{BatchDescriptor, ShapeBuckets};
pub use compute::{ComputePrimitive, Sampler, TinyLm};
pub use config::{DecoderStrategy, ModelConfig, PadSide, SchedulerConfig};
pub use crate::core::{FinishReason, Request, RequestId, SlotPool};
pub use error::{Error, Result};
pub use scheduler::{
    compare_results, run_alone, run_static_batch, DecodeScheduler, GenerationResult, ResultSink,
    SchedulerStats, TickOutputs,
};
