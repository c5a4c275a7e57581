//! Delivery of finished requests.

use std::sync::mpsc::Sender;

use tracing::warn;

use crate::core::request::{FinishReason, RequestId};

/// Tokens and scores of one finished request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub request_id: RequestId,
    /// Emitted tokens, the prefill-produced token first.
    pub tokens: Vec<u32>,
    /// Score of each emitted token.
    pub scores: Vec<f32>,
    pub finish_reason: FinishReason,
}

impl GenerationResult {
    /// Number of steps taken, the prefill step included.
    pub fn num_steps(&self) -> usize {
        self.tokens.len()
    }
}

/// Receiver of finished requests, failed ones included. Each result is
/// delivered exactly once.
pub trait ResultSink {
    fn deliver(&mut self, result: GenerationResult);
}

impl ResultSink for Vec<GenerationResult> {
    fn deliver(&mut self, result: GenerationResult) {
        self.push(result);
    }
}

impl ResultSink for Sender<GenerationResult> {
    fn deliver(&mut self, result: GenerationResult) {
        let request_id = result.request_id;
        if self.send(result).is_err() {
            warn!(request_id, "result receiver dropped, discarding result");
        }
    }
}

impl<S: ResultSink + ?Sized> ResultSink for &mut S {
    fn deliver(&mut self, result: GenerationResult) {
        (**self).deliver(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn result(id: RequestId) -> GenerationResult {
        GenerationResult {
            request_id: id,
            tokens: vec![4, 5],
            scores: vec![-0.1, -0.2],
            finish_reason: FinishReason::MaxDecodeSteps,
        }
    }

    #[test]
    fn test_vec_sink() {
        let mut sink: Vec<GenerationResult> = Vec::new();
        sink.deliver(result(1));
        sink.deliver(result(2));

        assert_eq!(sink.len(), 2);
        assert_eq!(sink[1].request_id, 2);
        assert_eq!(sink[0].num_steps(), 2);
    }

    #[test]
    fn test_channel_sink() {
        let (mut tx, rx) = mpsc::channel();
        tx.deliver(result(3));
        drop(tx);

        let received: Vec<_> = rx.iter().collect();
        assert_eq!(received, vec![result(3)]);
    }

    #[test]
    fn test_channel_sink_with_dropped_receiver() {
        let (mut tx, rx) = mpsc::channel();
        drop(rx);
        // Must not panic.
        tx.deliver(result(4));
    }
}
