//! Host/device data movement.
//!
//! Host batch records become candle tensors on the primitive's device, and
//! primitive outputs come back as host vectors. Every output is checked
//! against the physical shape it was computed for before it is unpadded to
//! the logical size.

use candle_core::{DType, Device, Tensor};

use crate::batch::padding::{unpad, DecodeBatch, PrefillBatch};
use crate::batch::shape::BatchDescriptor;
use crate::compute::{DecodeOutput, PrefillOutput};
use crate::error::{Error, Result};

/// Prefill input on the device. All tensors are `[rows, cols]`.
#[derive(Debug, Clone)]
pub struct DevicePrefillBatch {
    /// Token ids, `u32`.
    pub ids: Tensor,
    /// 1.0 in padding positions, 0.0 elsewhere, `f32`.
    pub paddings: Tensor,
    /// Position of each real token within its prompt, `u32`.
    pub segment_pos: Tensor,
    pub rows: BatchDescriptor,
    pub cols: BatchDescriptor,
}

/// Decode input on the device. Both tensors are `[rows]`.
#[derive(Debug, Clone)]
pub struct DeviceDecodeBatch {
    /// Last emitted token per row, `u32`.
    pub tokens: Tensor,
    /// 1 for live rows, `u8`.
    pub mask: Tensor,
    pub rows: BatchDescriptor,
}

impl PrefillBatch {
    /// Copy the batch to `device`.
    pub fn to_device(&self, device: &Device) -> Result<DevicePrefillBatch> {
        let shape = (self.rows().physical(), self.cols().physical());
        let paddings: Vec<f32> = self
            .paddings()
            .iter()
            .map(|&p| if p { 1.0 } else { 0.0 })
            .collect();

        Ok(DevicePrefillBatch {
            ids: Tensor::from_vec(self.ids().to_vec(), shape, device)?,
            paddings: Tensor::from_vec(paddings, shape, device)?,
            segment_pos: Tensor::from_vec(self.segment_pos().to_vec(), shape, device)?,
            rows: self.rows(),
            cols: self.cols(),
        })
    }
}

impl DecodeBatch {
    /// Copy the batch to `device`.
    pub fn to_device(&self, device: &Device) -> Result<DeviceDecodeBatch> {
        let rows = self.rows().physical();
        let mask: Vec<u8> = self.mask().iter().map(|&m| u8::from(m)).collect();

        Ok(DeviceDecodeBatch {
            tokens: Tensor::from_vec(self.tokens().to_vec(), rows, device)?,
            mask: Tensor::from_vec(mask, rows, device)?,
            rows: self.rows(),
        })
    }
}

/// Prefill result for the logical rows, on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostPrefillOutput {
    pub scores: Vec<f32>,
    pub tokens: Vec<u32>,
}

/// Decode result for the logical rows, on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostDecodeOutput {
    pub scores: Vec<f32>,
    pub tokens: Vec<u32>,
    pub done: Vec<bool>,
}

impl<C> PrefillOutput<C> {
    /// Copy scores and tokens to the host, keeping the logical rows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if an output does not have one entry
    /// per physical row.
    pub fn to_host(&self, rows: BatchDescriptor) -> Result<HostPrefillOutput> {
        if self.states.len() != rows.physical() {
            return Err(Error::ShapeMismatch {
                what: "prefill cache states",
                expected: vec![rows.physical()],
                actual: vec![self.states.len()],
            });
        }
        Ok(HostPrefillOutput {
            scores: column_to_host::<f32>(&self.scores, DType::F32, "prefill scores", rows)?,
            tokens: column_to_host::<u32>(&self.tokens, DType::U32, "prefill tokens", rows)?,
        })
    }
}

impl DecodeOutput {
    /// Copy scores, tokens and done flags to the host, keeping the logical
    /// rows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if an output does not have one entry
    /// per physical row.
    pub fn to_host(&self, rows: BatchDescriptor) -> Result<HostDecodeOutput> {
        let done = column_to_host::<u8>(&self.done, DType::U8, "decode done flags", rows)?;
        Ok(HostDecodeOutput {
            scores: column_to_host::<f32>(&self.scores, DType::F32, "decode scores", rows)?,
            tokens: column_to_host::<u32>(&self.tokens, DType::U32, "decode tokens", rows)?,
            done: done.into_iter().map(|d| d != 0).collect(),
        })
    }
}

fn column_to_host<T: candle_core::WithDType>(
    tensor: &Tensor,
    dtype: DType,
    what: &'static str,
    rows: BatchDescriptor,
) -> Result<Vec<T>> {
    if tensor.dims() != [rows.physical()] {
        return Err(Error::ShapeMismatch {
            what,
            expected: vec![rows.physical()],
            actual: tensor.dims().to_vec(),
        });
    }
    let values = tensor.to_dtype(dtype)?.to_vec1::<T>()?;
    unpad(&values, rows.logical())
}
