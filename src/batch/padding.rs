//! Statically-shaped batch records and padding.
//!
//! Ragged per-request data is laid out into fixed `[rows, cols]` host
//! buffers before it is moved to the device:
//!
//! ```text
//! prompts (ragged)           PrefillBatch [2, 8], left padded
//! [5 6 7]            ──►     ids      P P P P P 5 6 7
//!                            paddings 1 1 1 1 1 0 0 0
//!                            pos      0 0 0 0 0 0 1 2
//!                    ──►     (row 1 is batch padding: all P)
//!
//! slot pool                  DecodeBatch [S -> bucket], row == slot
//! slot0 Active last=9        tokens   9 P 4 P
//! slot1 Free                 mask     1 0 1 0
//! slot2 Active last=4
//! ```

use crate::batch::shape::{BatchDescriptor, ShapeBuckets};
use crate::config::PadSide;
use crate::core::slot_pool::{SlotPhase, SlotPool};
use crate::error::{Error, Result};

/// One prompt padded to a fixed length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedPrompt {
    /// Token ids, `pad_id` in padding positions.
    pub ids: Vec<u32>,
    /// `true` in padding positions.
    pub paddings: Vec<bool>,
}

/// Pad `prompt` to `target_len` on `side` with `pad_id`.
///
/// # Errors
///
/// Returns [`Error::PromptTooLong`] if the prompt is longer than `target_len`.
///
/// # Example
///
/// ```
/// use nano_cb::batch::pad_prompt;
/// use nano_cb::config::PadSide;
///
/// let padded = pad_prompt(&[5, 6], 4, 0, PadSide::Left).unwrap();
/// assert_eq!(padded.ids, vec![0, 0, 5, 6]);
/// assert_eq!(padded.paddings, vec![true, true, false, false]);
/// ```
pub fn pad_prompt(
    prompt: &[u32],
    target_len: usize,
    pad_id: u32,
    side: PadSide,
) -> Result<PaddedPrompt> {
    if prompt.len() > target_len {
        return Err(Error::PromptTooLong {
            len: prompt.len(),
            max: target_len,
        });
    }

    let num_pad = target_len - prompt.len();
    let mut ids = Vec::with_capacity(target_len);
    let mut paddings = Vec::with_capacity(target_len);

    if side == PadSide::Left {
        ids.extend(std::iter::repeat(pad_id).take(num_pad));
        paddings.extend(std::iter::repeat(true).take(num_pad));
    }
    ids.extend_from_slice(prompt);
    paddings.extend(std::iter::repeat(false).take(prompt.len()));
    if side == PadSide::Right {
        ids.extend(std::iter::repeat(pad_id).take(num_pad));
        paddings.extend(std::iter::repeat(true).take(num_pad));
    }

    Ok(PaddedPrompt { ids, paddings })
}

/// Truncate a physical buffer to its first `logical_size` entries.
pub fn unpad<T: Clone>(physical: &[T], logical_size: usize) -> Result<Vec<T>> {
    if physical.len() < logical_size {
        return Err(Error::ShapeMismatch {
            what: "unpad",
            expected: vec![logical_size],
            actual: vec![physical.len()],
        });
    }
    Ok(physical[..logical_size].to_vec())
}

/// Host-side prefill input of shape `[rows.physical, cols.physical]`.
///
/// All three buffers are row-major and validated at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefillBatch {
    ids: Vec<u32>,
    paddings: Vec<bool>,
    /// Position of each real token within its prompt, 0 on padding.
    segment_pos: Vec<u32>,
    rows: BatchDescriptor,
    cols: BatchDescriptor,
}

impl PrefillBatch {
    /// Build a batch from raw buffers, checking every buffer against the
    /// physical shape.
    pub fn new(
        ids: Vec<u32>,
        paddings: Vec<bool>,
        segment_pos: Vec<u32>,
        rows: BatchDescriptor,
        cols: BatchDescriptor,
    ) -> Result<Self> {
        let expected = rows.physical() * cols.physical();
        for (what, len) in [
            ("prefill ids", ids.len()),
            ("prefill paddings", paddings.len()),
            ("prefill segment_pos", segment_pos.len()),
        ] {
            if len != expected {
                return Err(Error::ShapeMismatch {
                    what,
                    expected: vec![rows.physical(), cols.physical()],
                    actual: vec![len],
                });
            }
        }

        // Batch padding rows carry no real tokens.
        let cols_p = cols.physical();
        if paddings[rows.logical() * cols_p..].iter().any(|&p| !p) {
            return Err(Error::ShapeMismatch {
                what: "prefill padding rows",
                expected: vec![rows.logical()],
                actual: vec![rows.physical()],
            });
        }

        Ok(Self {
            ids,
            paddings,
            segment_pos,
            rows,
            cols,
        })
    }

    /// Pad and stack `prompts` into one bucketed prefill batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PromptTooLong`] if any prompt exceeds
    /// `max_input_seq_len`.
    pub fn from_prompts(
        prompts: &[&[u32]],
        max_input_seq_len: usize,
        seq_buckets: &ShapeBuckets,
        batch_buckets: &ShapeBuckets,
        pad_id: u32,
        side: PadSide,
    ) -> Result<Self> {
        if let Some(prompt) = prompts.iter().find(|p| p.len() > max_input_seq_len) {
            return Err(Error::PromptTooLong {
                len: prompt.len(),
                max: max_input_seq_len,
            });
        }

        let longest = prompts.iter().map(|p| p.len()).max().unwrap_or(0);
        let rows = BatchDescriptor::bucketed(prompts.len(), batch_buckets)?;
        let cols = BatchDescriptor::bucketed(longest, seq_buckets)?;

        let total = rows.physical() * cols.physical();
        let mut ids = Vec::with_capacity(total);
        let mut paddings = Vec::with_capacity(total);
        let mut segment_pos = Vec::with_capacity(total);

        for prompt in prompts {
            let padded = pad_prompt(prompt, cols.physical(), pad_id, side)?;
            let mut pos = 0u32;
            for &is_pad in &padded.paddings {
                if is_pad {
                    segment_pos.push(0);
                } else {
                    segment_pos.push(pos);
                    pos += 1;
                }
            }
            ids.extend(padded.ids);
            paddings.extend(padded.paddings);
        }

        let pad_cells = rows.padding() * cols.physical();
        ids.extend(std::iter::repeat(pad_id).take(pad_cells));
        paddings.extend(std::iter::repeat(true).take(pad_cells));
        segment_pos.extend(std::iter::repeat(0).take(pad_cells));

        Self::new(ids, paddings, segment_pos, rows, cols)
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn paddings(&self) -> &[bool] {
        &self.paddings
    }

    pub fn segment_pos(&self) -> &[u32] {
        &self.segment_pos
    }

    /// Batch dimension.
    pub fn rows(&self) -> BatchDescriptor {
        self.rows
    }

    /// Sequence dimension.
    pub fn cols(&self) -> BatchDescriptor {
        self.cols
    }

    /// Token ids of one physical row.
    pub fn row_ids(&self, row: usize) -> &[u32] {
        let width = self.cols.physical();
        &self.ids[row * width..(row + 1) * width]
    }

    /// Real (non-padding) tokens of one physical row, in order.
    pub fn row_tokens(&self, row: usize) -> Vec<u32> {
        let width = self.cols.physical();
        let range = row * width..(row + 1) * width;
        self.ids[range.clone()]
            .iter()
            .zip(&self.paddings[range])
            .filter(|&(_, &is_pad)| !is_pad)
            .map(|(&id, _)| id)
            .collect()
    }
}

/// Host-side decode input: one row per slot, padded to a batch bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeBatch {
    /// Last emitted token per row, `pad_id` where the row is not live.
    tokens: Vec<u32>,
    /// `true` for live rows.
    mask: Vec<bool>,
    rows: BatchDescriptor,
}

impl DecodeBatch {
    /// Lay out `rows` (one entry per logical row, `None` when the row is
    /// not live) into a bucketed physical batch.
    pub fn from_rows(rows: &[Option<u32>], pad_id: u32, batch_buckets: &ShapeBuckets) -> Result<Self> {
        let desc = BatchDescriptor::bucketed(rows.len(), batch_buckets)?;

        let mut tokens: Vec<u32> = rows.iter().map(|r| r.unwrap_or(pad_id)).collect();
        let mut mask: Vec<bool> = rows.iter().map(Option::is_some).collect();
        tokens.resize(desc.physical(), pad_id);
        mask.resize(desc.physical(), false);

        Ok(Self {
            tokens,
            mask,
            rows: desc,
        })
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    pub fn rows(&self) -> BatchDescriptor {
        self.rows
    }

    /// Number of live rows.
    pub fn num_live(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    /// Inverse of [`DecodeBatch::from_rows`].
    pub fn unpad(&self) -> Result<Vec<Option<u32>>> {
        let tokens = unpad(&self.tokens, self.rows.logical())?;
        let mask = unpad(&self.mask, self.rows.logical())?;
        Ok(tokens
            .into_iter()
            .zip(mask)
            .map(|(token, live)| live.then_some(token))
            .collect())
    }
}

/// Lay out every slot of `pool` as one decode row, row index == slot index.
///
/// Active slots feed their last emitted token; every other row carries
/// `pad_id` and a cleared mask bit.
pub fn assemble_decode_batch<C>(
    pool: &SlotPool<C>,
    pad_id: u32,
    batch_buckets: &ShapeBuckets,
) -> Result<DecodeBatch> {
    let rows: Vec<Option<u32>> = pool
        .slots()
        .iter()
        .map(|slot| match slot.phase() {
            SlotPhase::Active => slot.last_token(),
            _ => None,
        })
        .collect();
    DecodeBatch::from_rows(&rows, pad_id, batch_buckets)
}
