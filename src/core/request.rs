//! Request tracking for generation work.
//!
//! A request is one prompt plus its decode step limit. It moves through
//! `Queued -> Prefilling -> Decoding -> Completed`, or ends early as
//! `Cancelled` or `Failed`.

use crate::error::{Error, Result};

/// Unique identifier for a request.
pub type RequestId = u64;

/// Status of a request in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    /// Waiting in the admission queue.
    Queued,
    /// Slot allocated, prefill call in progress.
    Prefilling,
    /// Cache state installed, taking part in decode ticks.
    Decoding,
    /// Finished (end-of-sequence or step limit).
    Completed,
    /// Cancelled by the caller.
    Cancelled,
    /// Lost to a failed batched call.
    Failed,
}

impl RequestStatus {
    /// Check if the request still holds or waits for a slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Prefilling | Self::Decoding)
    }

    /// Check if the request has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        !self.is_active()
    }

    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Prefilling => "Prefilling",
            Self::Decoding => "Decoding",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
            Self::Failed => "Failed",
        }
    }
}

/// Reason for request completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The compute primitive signalled end-of-sequence.
    EndOfSequence,
    /// The step counter reached the request's limit.
    MaxDecodeSteps,
    /// Cancelled by the caller.
    Cancelled,
    /// Lost to a failed compute call.
    Failed,
}

/// A unit of generation work.
///
/// # Example
///
/// ```
/// use nano_cb::core::request::{Request, RequestStatus};
///
/// let request = Request::new(7, vec![5, 6, 7], 3);
/// assert_eq!(request.status(), RequestStatus::Queued);
/// assert_eq!(request.prompt_len(), 3);
/// assert_eq!(request.max_decode_steps(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    id: RequestId,
    prompt: Vec<u32>,
    max_decode_steps: usize,
    /// Assigned by the admission queue on submit.
    arrival_order: u64,
    status: RequestStatus,
}

impl Request {
    /// Create a new request with the given prompt and decode step limit.
    pub fn new(id: RequestId, prompt: Vec<u32>, max_decode_steps: usize) -> Self {
        Self {
            id,
            prompt,
            max_decode_steps,
            arrival_order: 0,
            status: RequestStatus::Queued,
        }
    }

    /// Get the request ID.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Get the prompt token IDs.
    pub fn prompt(&self) -> &[u32] {
        &self.prompt
    }

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt.len()
    }

    /// Get the decode step limit.
    pub fn max_decode_steps(&self) -> usize {
        self.max_decode_steps
    }

    /// Get the arrival order assigned at submission.
    pub fn arrival_order(&self) -> u64 {
        self.arrival_order
    }

    /// Get the current status.
    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub(crate) fn set_arrival_order(&mut self, order: u64) {
        self.arrival_order = order;
    }

    pub(crate) fn set_max_decode_steps(&mut self, steps: usize) {
        self.max_decode_steps = steps;
    }

    // ========== State transitions ==========

    /// Transition to prefilling once a slot is allocated.
    pub fn set_prefilling(&mut self) -> Result<()> {
        self.transition(RequestStatus::Queued, RequestStatus::Prefilling)
    }

    /// Transition to decoding once the cache state is installed.
    pub fn set_decoding(&mut self) -> Result<()> {
        self.transition(RequestStatus::Prefilling, RequestStatus::Decoding)
    }

    /// Transition to completed.
    pub fn set_completed(&mut self) -> Result<()> {
        match self.status {
            RequestStatus::Prefilling | RequestStatus::Decoding => {
                self.status = RequestStatus::Completed;
                Ok(())
            }
            _ => Err(self.invalid(RequestStatus::Completed)),
        }
    }

    /// Mark the request cancelled. Valid from any non-terminal state.
    pub fn set_cancelled(&mut self) -> Result<()> {
        if self.status.is_finished() {
            return Err(self.invalid(RequestStatus::Cancelled));
        }
        self.status = RequestStatus::Cancelled;
        Ok(())
    }

    /// Mark the request failed.
    pub fn set_failed(&mut self) {
        self.status = RequestStatus::Failed;
    }

    fn transition(&mut self, from: RequestStatus, to: RequestStatus) -> Result<()> {
        if self.status != from {
            return Err(self.invalid(to));
        }
        self.status = to;
        Ok(())
    }

    fn invalid(&self, to: RequestStatus) -> Error {
        Error::InvalidStateTransition {
            from: self.status.as_str(),
            to: to.as_str(),
        }
    }
}
