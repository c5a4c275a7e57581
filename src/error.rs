//! Error types for nano-cb.

use thiserror::Error;

use crate::core::request::RequestId;

/// Result type alias for nano-cb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-cb.
#[derive(Error, Debug)]
pub enum Error {
    /// Prompt does not fit the maximum input length. Rejects one request only.
    #[error("prompt of {len} tokens exceeds the maximum input length of {max}")]
    PromptTooLong { len: usize, max: usize },

    /// Every cache slot is occupied. The request stays queued.
    #[error("all {capacity} cache slots are occupied")]
    PoolExhausted { capacity: usize },

    /// Slot index out of range, or not in the state the operation requires.
    #[error("invalid cache slot {slot}: {reason}")]
    InvalidSlot { slot: usize, reason: &'static str },

    /// A batched call failed. Every row of that call is affected.
    #[error("compute primitive failed for requests {requests:?} (slots {slots:?}): {message}")]
    ComputePrimitive {
        requests: Vec<RequestId>,
        slots: Vec<usize>,
        message: String,
    },

    /// Physical shape disagrees with what the scheduler laid out.
    #[error("shape mismatch in {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Request not known to the scheduler.
    #[error("request {0} not found")]
    RequestNotFound(RequestId),

    /// Request id already queued or active.
    #[error("request {0} is already submitted")]
    DuplicateRequest(RequestId),

    /// Invalid request state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Slots left undefined by a failed batched call.
    #[error("slots {0:?} hold undefined cache state and must be reset")]
    SlotsNeedReset(Vec<usize>),

    /// Scheduler stopped after an internal invariant violation.
    #[error("scheduler halted after an internal invariant violation; reset required")]
    Halted,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Errors the admission caller can recover from without touching the pool.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PromptTooLong { .. } | Self::PoolExhausted { .. })
    }

    /// Errors that stop the scheduler loop until a full reset.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ShapeMismatch { .. } | Self::Halted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::PromptTooLong { len: 9, max: 8 }.is_transient());
        assert!(Error::PoolExhausted { capacity: 2 }.is_transient());
        assert!(!Error::Halted.is_transient());

        let mismatch = Error::ShapeMismatch {
            what: "decode tokens",
            expected: vec![2],
            actual: vec![3],
        };
        assert!(mismatch.is_fatal());
        assert!(!Error::InvalidSlot { slot: 0, reason: "free" }.is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::PromptTooLong { len: 12, max: 8 };
        assert_eq!(
            err.to_string(),
            "prompt of 12 tokens exceeds the maximum input length of 8"
        );

        let err = Error::PoolExhausted { capacity: 2 };
        assert_eq!(err.to_string(), "all 2 cache slots are occupied");
    }
}
