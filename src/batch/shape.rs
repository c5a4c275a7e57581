//! Shape bucketing.
//!
//! The compute primitive only runs a small set of fixed shapes. Logical
//! sizes are rounded up to the nearest supported bucket so the number of
//! distinct compiled shapes stays bounded.

use crate::error::{Error, Result};

/// Sorted set of supported physical sizes along one dimension.
///
/// # Example
///
/// ```
/// use nano_cb::batch::ShapeBuckets;
///
/// let buckets = ShapeBuckets::new(vec![1, 2, 4, 8]).unwrap();
/// assert_eq!(buckets.select_physical_shape(3).unwrap(), 4);
/// assert_eq!(buckets.select_physical_shape(4).unwrap(), 4);
/// assert!(buckets.select_physical_shape(9).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeBuckets {
    sizes: Vec<usize>,
}

impl ShapeBuckets {
    /// Create buckets from strictly increasing, non-zero sizes.
    pub fn new(sizes: Vec<usize>) -> Result<Self> {
        if sizes.is_empty() {
            return Err(Error::Config("shape buckets must not be empty".into()));
        }
        if sizes[0] == 0 || sizes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Config(format!(
                "shape buckets must be non-zero and strictly increasing, got {sizes:?}"
            )));
        }
        Ok(Self { sizes })
    }

    /// Round `logical_size` up to the smallest bucket that holds it.
    ///
    /// Monotonic and deterministic: a larger logical size never maps to a
    /// smaller bucket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if `logical_size` exceeds the
    /// largest bucket.
    pub fn select_physical_shape(&self, logical_size: usize) -> Result<usize> {
        let idx = self.sizes.partition_point(|&size| size < logical_size);
        self.sizes
            .get(idx)
            .copied()
            .ok_or_else(|| Error::ShapeMismatch {
                what: "bucket selection",
                expected: vec![self.largest()],
                actual: vec![logical_size],
            })
    }

    /// Largest supported size.
    pub fn largest(&self) -> usize {
        self.sizes[self.sizes.len() - 1]
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }
}

/// Logical (real) versus physical (padded) extent of one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchDescriptor {
    logical: usize,
    physical: usize,
}

impl BatchDescriptor {
    /// Create a descriptor. `logical` must not exceed `physical`.
    pub fn new(logical: usize, physical: usize) -> Result<Self> {
        if logical > physical {
            return Err(Error::ShapeMismatch {
                what: "batch descriptor",
                expected: vec![physical],
                actual: vec![logical],
            });
        }
        Ok(Self { logical, physical })
    }

    /// Create a descriptor whose physical size is the bucket for `logical`.
    pub fn bucketed(logical: usize, buckets: &ShapeBuckets) -> Result<Self> {
        Self::new(logical, buckets.select_physical_shape(logical)?)
    }

    pub fn logical(&self) -> usize {
        self.logical
    }

    pub fn physical(&self) -> usize {
        self.physical
    }

    /// Number of padding positions.
    pub fn padding(&self) -> usize {
        self.physical - self.logical
    }

    /// Whether position `idx` is padding.
    pub fn is_padding(&self, idx: usize) -> bool {
        idx >= self.logical
    }
}
