//! FIFO admission queue.
//!
//! Requests wait here until a cache slot frees up. Order is strict arrival
//! order; there are no priority levels.

use std::collections::VecDeque;

use crate::core::request::{Request, RequestId};
use crate::error::{Error, Result};

/// Pending requests in arrival order.
#[derive(Debug, Default)]
pub struct AdmissionQueue {
    pending: VecDeque<Request>,
    /// Counter for arrival ordering.
    arrival_counter: u64,
    max_input_seq_len: usize,
}

impl AdmissionQueue {
    pub fn new(max_input_seq_len: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            arrival_counter: 0,
            max_input_seq_len,
        }
    }

    /// Enqueue a request. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PromptTooLong`] if the prompt cannot be padded to
    /// the maximum input length, or [`Error::DuplicateRequest`] if the id is
    /// already queued. The queue is unchanged on error.
    pub fn submit(&mut self, mut request: Request) -> Result<u64> {
        if request.prompt_len() > self.max_input_seq_len {
            return Err(Error::PromptTooLong {
                len: request.prompt_len(),
                max: self.max_input_seq_len,
            });
        }
        if self.contains(request.id()) {
            return Err(Error::DuplicateRequest(request.id()));
        }

        let order = self.arrival_counter;
        request.set_arrival_order(order);
        self.arrival_counter += 1;
        self.pending.push_back(request);
        Ok(order)
    }

    /// Request at the head of the queue.
    pub fn peek(&self) -> Option<&Request> {
        self.pending.front()
    }

    pub fn pop_front(&mut self) -> Option<Request> {
        self.pending.pop_front()
    }

    /// Remove a queued request by id.
    pub fn remove(&mut self, id: RequestId) -> Option<Request> {
        let pos = self.pending.iter().position(|r| r.id() == id)?;
        self.pending.remove(pos)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.pending.iter().any(|r| r.id() == id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Ids of queued requests, head first.
    pub fn ids(&self) -> Vec<RequestId> {
        self.pending.iter().map(Request::id).collect()
    }
}
