//! Static batching reference runner.
//!
//! Prefills a group of requests in one call and decodes them lock-step until
//! every row is done, with no admissions in between. Used to produce the
//! expected per-request outputs that continuous batching must reproduce.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::batch::{DecodeBatch, PrefillBatch, ShapeBuckets};
use crate::compute::{check_capacity, ComputePrimitive};
use crate::config::SchedulerConfig;
use crate::core::{DecodedLedger, FinishReason, Request, RequestId};
use crate::error::{Error, Result};
use crate::scheduler::sink::GenerationResult;

/// Scores closer than this are treated as equal.
pub const SCORE_TOLERANCE: f32 = 1e-4;

/// Run `requests` with static batching. Results come back in input order.
///
/// Requests are processed in groups of at most `num_cache_slots`, each
/// group to completion before the next starts.
pub fn run_static_batch<P: ComputePrimitive>(
    primitive: &P,
    config: &SchedulerConfig,
    requests: &[Request],
) -> Result<Vec<GenerationResult>> {
    config.validate()?;
    check_capacity(primitive, config.num_cache_slots)?;
    let seq_buckets = ShapeBuckets::new(config.seq_len_buckets.clone())?;
    let batch_buckets = ShapeBuckets::new(config.batch_size_buckets.clone())?;

    let mut results = Vec::with_capacity(requests.len());
    for group in requests.chunks(config.num_cache_slots) {
        results.extend(run_group(primitive, config, &seq_buckets, &batch_buckets, group)?);
    }
    Ok(results)
}

/// Run one request by itself: prefill, then decode to completion.
pub fn run_alone<P: ComputePrimitive>(
    primitive: &P,
    config: &SchedulerConfig,
    request: &Request,
) -> Result<GenerationResult> {
    run_static_batch(primitive, config, std::slice::from_ref(request))?
        .pop()
        .ok_or(Error::RequestNotFound(request.id()))
}

fn run_group<P: ComputePrimitive>(
    primitive: &P,
    config: &SchedulerConfig,
    seq_buckets: &ShapeBuckets,
    batch_buckets: &ShapeBuckets,
    group: &[Request],
) -> Result<Vec<GenerationResult>> {
    let prompts: Vec<&[u32]> = group.iter().map(Request::prompt).collect();
    let limits: Vec<usize> = group
        .iter()
        .map(|r| config.decode_limit(r.max_decode_steps()))
        .collect();

    let batch = PrefillBatch::from_prompts(
        &prompts,
        config.max_input_seq_len,
        seq_buckets,
        batch_buckets,
        config.pad_id,
        config.pad_side,
    )?;
    let rows = batch.rows();
    debug!(rows = rows.logical(), cols = batch.cols().physical(), "static prefill");
    let output = primitive.prefill(&batch.to_device(primitive.device())?)?;
    let host = output.to_host(rows)?;

    let mut states: Vec<Option<P::CacheState>> =
        output.states.into_iter().take(group.len()).map(Some).collect();
    let mut ledgers: Vec<DecodedLedger> = host
        .tokens
        .iter()
        .zip(&host.scores)
        .map(|(&token, &score)| DecodedLedger::from_prefill(token, score))
        .collect();
    for (i, ledger) in ledgers.iter_mut().enumerate() {
        mark_if_done(config, ledger, false, limits[i]);
        if ledger.is_done() {
            states[i] = None;
        }
    }

    while ledgers.iter().any(|l| !l.is_done()) {
        let live: Vec<Option<u32>> = ledgers
            .iter()
            .map(|l| if l.is_done() { None } else { l.last_token() })
            .collect();
        let batch = DecodeBatch::from_rows(&live, config.pad_id, batch_buckets)?;
        let rows = batch.rows();
        let output = primitive.decode_step(&batch.to_device(primitive.device())?, &mut states)?;
        let host = output.to_host(rows)?;

        for (i, ledger) in ledgers.iter_mut().enumerate() {
            if live[i].is_none() {
                continue;
            }
            ledger.record(host.tokens[i], host.scores[i]);
            mark_if_done(config, ledger, host.done[i], limits[i]);
            if ledger.is_done() {
                states[i] = None;
            }
        }
    }

    Ok(group
        .iter()
        .zip(ledgers)
        .map(|(request, ledger)| {
            let finish_reason = ledger.finish_reason().unwrap_or(FinishReason::MaxDecodeSteps);
            let (tokens, scores) = ledger.into_parts();
            GenerationResult {
                request_id: request.id(),
                tokens,
                scores,
                finish_reason,
            }
        })
        .collect())
}

fn mark_if_done(config: &SchedulerConfig, ledger: &mut DecodedLedger, primitive_done: bool, limit: usize) {
    let eos = ledger.last_token().is_some_and(|t| config.is_eos(t));
    if primitive_done || eos {
        ledger.mark_done(FinishReason::EndOfSequence);
    } else if ledger.steps() >= limit {
        ledger.mark_done(FinishReason::MaxDecodeSteps);
    }
}

/// How a continuous batching result differs from its reference.
#[derive(Debug, Clone, PartialEq)]
pub enum DivergenceKind {
    /// No continuous result for a reference request.
    Missing,
    /// Continuous result for a request with no reference.
    Unexpected,
    /// Token sequences differ, first at `index`.
    Tokens { index: usize },
    FinishReason {
        expected: FinishReason,
        actual: FinishReason,
    },
    /// Scores differ by more than [`SCORE_TOLERANCE`], first at `index`.
    Scores { index: usize, delta: f32 },
}

/// One reported mismatch. Reported, never resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Divergence {
    pub request_id: RequestId,
    pub kind: DivergenceKind,
}

/// Compare continuous batching results against reference results by
/// request id. An empty list means the runs agree.
pub fn compare_results(
    continuous: &[GenerationResult],
    reference: &[GenerationResult],
) -> Vec<Divergence> {
    let by_id: HashMap<RequestId, &GenerationResult> =
        continuous.iter().map(|r| (r.request_id, r)).collect();
    let mut divergences = Vec::new();

    for expected in reference {
        let request_id = expected.request_id;
        let Some(actual) = by_id.get(&request_id) else {
            divergences.push(Divergence {
                request_id,
                kind: DivergenceKind::Missing,
            });
            continue;
        };
        if let Some(kind) = diff(expected, actual) {
            divergences.push(Divergence { request_id, kind });
        }
    }

    let known: HashSet<RequestId> = reference.iter().map(|r| r.request_id).collect();
    divergences.extend(
        continuous
            .iter()
            .filter(|r| !known.contains(&r.request_id))
            .map(|r| Divergence {
                request_id: r.request_id,
                kind: DivergenceKind::Unexpected,
            }),
    );

    for d in &divergences {
        warn!(request_id = d.request_id, kind = ?d.kind, "result diverges from reference");
    }
    divergences
}

fn diff(expected: &GenerationResult, actual: &GenerationResult) -> Option<DivergenceKind> {
    let token_mismatch = expected
        .tokens
        .iter()
        .zip(&actual.tokens)
        .position(|(a, b)| a != b);
    if let Some(index) = token_mismatch {
        return Some(DivergenceKind::Tokens { index });
    }
    if expected.tokens.len() != actual.tokens.len() {
        return Some(DivergenceKind::Tokens {
            index: expected.tokens.len().min(actual.tokens.len()),
        });
    }
    if expected.finish_reason != actual.finish_reason {
        return Some(DivergenceKind::FinishReason {
            expected: expected.finish_reason,
            actual: actual.finish_reason,
        });
    }
    expected
        .scores
        .iter()
        .zip(&actual.scores)
        .enumerate()
        .find_map(|(index, (a, b))| {
            let delta = (a - b).abs();
            (delta > SCORE_TOLERANCE).then_some(DivergenceKind::Scores { index, delta })
        })
}
