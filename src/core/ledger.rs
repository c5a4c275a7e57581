//! Per-slot record of emitted tokens.

use crate::core::request::FinishReason;

/// Ordered tokens and scores emitted for one request, plus its step counter
/// and done flag.
///
/// Owned by the scheduler and only advanced by the prefill and decode step
/// handlers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedLedger {
    tokens: Vec<u32>,
    scores: Vec<f32>,
    steps: usize,
    done: bool,
    finish_reason: Option<FinishReason>,
}

impl DecodedLedger {
    /// Start a ledger from the prefill-produced token (step 1).
    pub fn from_prefill(token_id: u32, score: f32) -> Self {
        let mut ledger = Self::default();
        ledger.record(token_id, score);
        ledger
    }

    /// Append one emitted token. Ignored once the ledger is done.
    pub fn record(&mut self, token_id: u32, score: f32) {
        if self.done {
            return;
        }
        self.tokens.push(token_id);
        self.scores.push(score);
        self.steps += 1;
    }

    /// Mark the ledger done. The first reason wins.
    pub fn mark_done(&mut self, reason: FinishReason) {
        if !self.done {
            self.done = true;
            self.finish_reason = Some(reason);
        }
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    /// Number of steps taken, the prefill step included.
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    pub fn last_token(&self) -> Option<u32> {
        self.tokens.last().copied()
    }

    /// Consume the ledger into its tokens and scores.
    pub fn into_parts(self) -> (Vec<u32>, Vec<f32>) {
        (self.tokens, self.scores)
    }
}
