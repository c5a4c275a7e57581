//! Padding and shape adapter.
//!
//! This module handles:
//! - Shape bucketing of logical batch and sequence sizes
//! - Statically-shaped prefill and decode batch records
//! - Host/device movement of batches and outputs

pub mod padding;
pub mod shape;
pub mod transfer;

pub use padding::{assemble_decode_batch, pad_prompt, unpad, DecodeBatch, PaddedPrompt, PrefillBatch};
pub use shape::{BatchDescriptor, ShapeBuckets};
pub use transfer::{DeviceDecodeBatch, DevicePrefillBatch, HostDecodeOutput, HostPrefillOutput};
