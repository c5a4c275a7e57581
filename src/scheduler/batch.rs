//! Continuous batching decode scheduler.
//!
//! The scheduler owns the slot pool, the admission queue and one ledger per
//! occupied slot. Each call to [`DecodeScheduler::tick`] runs one iteration
//! of the control loop.
//!
//! ## Tick
//!
//! ```text
//!   submit()                                   tick()
//!      │                                         │
//!      ▼                                         ▼
//! ┌──────────┐   (2) admit head, lowest    ┌──────────────┐
//! │ Pending  │ ──── free slot, prefill ──► │ Slot pool    │
//! │ (FIFO)   │                             │ row == slot  │
//! └──────────┘                             └──────────────┘
//!                                                │ (1) one batched decode
//!                                                ▼     over ACTIVE slots
//!                                          ┌──────────────┐
//!                                          │ drain done,  │ ──► results
//!                                          │ free slots   │
//!                                          └──────────────┘
//! ```
//!
//! The decode call runs before admission, so a request admitted in tick `t`
//! gets its first token from prefill and joins the batched decode in tick
//! `t + 1`.
//!
//! ## Example
//!
//! ```
//! use candle_core::Device;
//! use nano_cb::compute::TinyLm;
//! use nano_cb::config::{ModelConfig, SchedulerConfig};
//! use nano_cb::core::Request;
//! use nano_cb::scheduler::{DecodeScheduler, GenerationResult};
//!
//! let config = SchedulerConfig {
//!     num_cache_slots: 2,
//!     max_decode_steps: 3,
//!     eos_ids: vec![],
//!     ..Default::default()
//! };
//! let model = TinyLm::new(
//!     ModelConfig { num_cache_slots: 2, eos_ids: vec![], ..Default::default() },
//!     &Device::Cpu,
//! )
//! .unwrap();
//! let mut scheduler = DecodeScheduler::new(config, model).unwrap();
//!
//! scheduler.submit(Request::new(1, vec![5, 6, 7], 3)).unwrap();
//! scheduler.submit(Request::new(2, vec![8, 9], 3)).unwrap();
//!
//! let mut results: Vec<GenerationResult> = Vec::new();
//! scheduler.run_until_idle(&mut results).unwrap();
//! assert_eq!(results.len(), 2);
//! assert!(results.iter().all(|r| r.tokens.len() == 3));
//! ```

use tracing::{debug, error, info, warn};

use crate::batch::{assemble_decode_batch, DecodeBatch, HostDecodeOutput, PrefillBatch, ShapeBuckets};
use crate::compute::{check_capacity, ComputePrimitive};
use crate::config::SchedulerConfig;
use crate::core::slot_pool::{Slot, SlotPhase, SlotPool};
use crate::core::{DecodedLedger, FinishReason, Request, RequestId, RequestStatus};
use crate::error::{Error, Result};
use crate::scheduler::admission::AdmissionQueue;
use crate::scheduler::sink::{GenerationResult, ResultSink};

/// Counters over the scheduler's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub prefill_calls: u64,
    pub decode_calls: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
}

/// A request that left the queue and received a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub request_id: RequestId,
    pub slot: usize,
    /// Token produced by prefill.
    pub first_token: u32,
}

/// What happened during one tick.
#[derive(Debug, Default)]
pub struct TickOutputs {
    /// 1-based tick index.
    pub tick: u64,
    /// Requests advanced by this tick's batched decode call.
    pub decoded: Vec<RequestId>,
    /// Requests admitted this tick, in admission order.
    pub admitted: Vec<Admission>,
    /// Requests that finished this tick. Requests lost to a failed prefill
    /// appear here with [`FinishReason::Failed`].
    pub finished: Vec<GenerationResult>,
    /// Errors of the prefill calls that failed this tick.
    pub failed: Vec<Error>,
}

impl TickOutputs {
    /// Whether the tick did no work.
    pub fn is_idle(&self) -> bool {
        self.decoded.is_empty() && self.admitted.is_empty() && self.failed.is_empty()
    }
}

/// Request and ledger held by an occupied slot.
#[derive(Debug)]
struct SlotEntry {
    request: Request,
    ledger: DecodedLedger,
}

/// Continuous batching scheduler over a fixed pool of cache slots.
///
/// Generic over the compute primitive it drives. The primitive is only ever
/// called from `&mut self` methods, so at most one batched call is in flight.
pub struct DecodeScheduler<P: ComputePrimitive> {
    config: SchedulerConfig,
    primitive: P,
    pool: SlotPool<P::CacheState>,
    /// Request and ledger per slot, indexed like the pool.
    entries: Vec<Option<SlotEntry>>,
    queue: AdmissionQueue,
    seq_buckets: ShapeBuckets,
    batch_buckets: ShapeBuckets,
    /// Finished results not yet handed out by `tick`.
    finished: Vec<GenerationResult>,
    stats: SchedulerStats,
    halted: bool,
}

impl<P: ComputePrimitive> DecodeScheduler<P> {
    /// Create a scheduler that owns `primitive`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is inconsistent or
    /// the primitive holds fewer cache slots than configured.
    pub fn new(config: SchedulerConfig, primitive: P) -> Result<Self> {
        config.validate()?;
        check_capacity(&primitive, config.num_cache_slots)?;
        let seq_buckets = ShapeBuckets::new(config.seq_len_buckets.clone())?;
        let batch_buckets = ShapeBuckets::new(config.batch_size_buckets.clone())?;
        let capacity = config.num_cache_slots;

        info!(
            slots = capacity,
            max_decode_steps = config.max_decode_steps,
            "decode scheduler created"
        );

        Ok(Self {
            queue: AdmissionQueue::new(config.max_input_seq_len),
            pool: SlotPool::new(capacity),
            entries: (0..capacity).map(|_| None).collect(),
            config,
            primitive,
            seq_buckets,
            batch_buckets,
            finished: Vec::new(),
            stats: SchedulerStats::default(),
            halted: false,
        })
    }

    /// Enqueue a request. Never blocks.
    ///
    /// A step limit of 0 selects the configured default; larger limits are
    /// capped by it.
    ///
    /// # Errors
    ///
    /// - [`Error::PromptTooLong`] if the prompt exceeds the maximum input
    ///   length. Nothing else is affected.
    /// - [`Error::DuplicateRequest`] if the id is already queued or active.
    pub fn submit(&mut self, mut request: Request) -> Result<()> {
        if self.entry_slot(request.id()).is_some() {
            return Err(Error::DuplicateRequest(request.id()));
        }
        request.set_max_decode_steps(self.config.decode_limit(request.max_decode_steps()));

        let request_id = request.id();
        let prompt_len = request.prompt_len();
        match self.queue.submit(request) {
            Ok(order) => {
                debug!(request_id, prompt_len, order, "request queued");
                Ok(())
            }
            Err(e) => {
                warn!(request_id, prompt_len, error = %e, "request rejected");
                Err(e)
            }
        }
    }

    /// Run one iteration of the control loop.
    ///
    /// # Errors
    ///
    /// - [`Error::ComputePrimitive`] if the batched decode call failed. Every
    ///   slot in that call is left faulted and its request gets a
    ///   [`FinishReason::Failed`] result.
    /// - [`Error::SlotsNeedReset`] while faulted slots remain.
    /// - [`Error::ShapeMismatch`] on an internal shape violation. The
    ///   scheduler halts and later ticks return [`Error::Halted`].
    pub fn tick(&mut self) -> Result<TickOutputs> {
        self.ensure_runnable()?;
        self.stats.ticks += 1;
        let mut outputs = TickOutputs {
            tick: self.stats.ticks,
            ..Default::default()
        };

        let result = self
            .decode_active(&mut outputs)
            .and_then(|()| self.admit(&mut outputs));
        self.guard(result)?;

        outputs.finished = std::mem::take(&mut self.finished);
        Ok(outputs)
    }

    /// Admit the head of the queue into the lowest free slot and prefill it.
    ///
    /// Returns `Ok(None)` when nothing is queued.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolExhausted`] if no slot is free. The request stays at
    ///   the head of the queue.
    /// - [`Error::ComputePrimitive`] if prefill failed. The slot is released
    ///   and the request's [`FinishReason::Failed`] result is handed out by
    ///   the next tick.
    pub fn try_admit_next(&mut self) -> Result<Option<Admission>> {
        self.ensure_runnable()?;
        let result = self.admit_next();
        self.guard(result)
    }

    /// Tick until no request is queued or occupying a slot, delivering every
    /// finished or failed request to `sink`.
    ///
    /// A failed prefill does not stop the loop. Errors that stop ticking are
    /// returned after the results gathered so far are delivered.
    pub fn run_until_idle<S: ResultSink + ?Sized>(&mut self, sink: &mut S) -> Result<()> {
        while self.has_work() {
            match self.tick() {
                Ok(outputs) => {
                    for result in outputs.finished {
                        sink.deliver(result);
                    }
                }
                Err(e) => {
                    for result in self.take_finished() {
                        sink.deliver(result);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Cancel a queued or active request.
    ///
    /// An active request's slot is freed immediately and its cache state
    /// discarded. Returns the tokens emitted so far.
    ///
    /// # Errors
    ///
    /// - [`Error::RequestNotFound`] if the id is neither queued nor active.
    /// - [`Error::SlotsNeedReset`] if the request's slot is faulted.
    pub fn cancel(&mut self, id: RequestId) -> Result<GenerationResult> {
        if let Some(mut request) = self.queue.remove(id) {
            request.set_cancelled()?;
            self.stats.cancelled += 1;
            info!(request_id = id, "queued request cancelled");
            return Ok(GenerationResult {
                request_id: id,
                tokens: Vec::new(),
                scores: Vec::new(),
                finish_reason: FinishReason::Cancelled,
            });
        }

        let slot = self.entry_slot(id).ok_or(Error::RequestNotFound(id))?;
        if self.pool.slot(slot).map(Slot::phase) == Some(SlotPhase::Faulted) {
            return Err(Error::SlotsNeedReset(vec![slot]));
        }
        let mut entry = self.entries[slot].take().ok_or(Error::RequestNotFound(id))?;
        self.pool.free(slot)?;
        entry.request.set_cancelled()?;
        entry.ledger.mark_done(FinishReason::Cancelled);
        self.stats.cancelled += 1;
        info!(
            request_id = id,
            slot,
            steps = entry.ledger.steps(),
            "active request cancelled"
        );

        let (tokens, scores) = entry.ledger.into_parts();
        Ok(GenerationResult {
            request_id: id,
            tokens,
            scores,
            finish_reason: FinishReason::Cancelled,
        })
    }

    /// Free every faulted slot. Returns the requests that held them.
    pub fn reset_faulted(&mut self) -> Vec<RequestId> {
        let mut dropped = Vec::new();
        for slot in self.pool.faulted_slots() {
            if self.pool.free(slot).is_ok() {
                if let Some(entry) = self.entries[slot].take() {
                    dropped.push(entry.request.id());
                }
            }
        }
        if !dropped.is_empty() {
            info!(requests = ?dropped, "faulted slots reset");
        }
        dropped
    }

    /// Free every slot and clear the halt.
    ///
    /// Returns every undelivered result: those finished before the halt,
    /// then a [`FinishReason::Failed`] result for each request that held a
    /// slot. Queued requests are kept.
    pub fn reset(&mut self) -> Vec<GenerationResult> {
        let mut dropped = Vec::new();
        for mut entry in self.entries.iter_mut().filter_map(Option::take) {
            dropped.push(entry.request.id());
            // Faulted requests were already reported by `fault_slots`.
            if entry.request.status() != RequestStatus::Failed {
                entry.request.set_failed();
                self.stats.failed += 1;
                self.finished.push(failed_result(entry.request.id(), &entry.ledger));
            }
        }
        self.pool.reset();
        self.halted = false;
        info!(requests = ?dropped, "scheduler reset");
        std::mem::take(&mut self.finished)
    }

    /// Results not yet handed out by a tick, such as those of a tick that
    /// then failed.
    pub fn take_finished(&mut self) -> Vec<GenerationResult> {
        std::mem::take(&mut self.finished)
    }

    /// Whether any request is queued or holds a slot.
    pub fn has_work(&self) -> bool {
        !self.queue.is_empty() || self.pool.num_occupied() > 0
    }

    pub fn num_pending(&self) -> usize {
        self.queue.len()
    }

    pub fn num_active(&self) -> usize {
        self.pool.active_slots().len()
    }

    /// Slot currently held by a request.
    pub fn slot_of(&self, id: RequestId) -> Option<usize> {
        self.pool.slot_of(id)
    }

    /// One flag per slot: `true` when occupied.
    pub fn occupied_mask(&self) -> Vec<bool> {
        self.pool.occupied_mask()
    }

    /// Tokens emitted so far by an active request.
    pub fn partial_tokens(&self, id: RequestId) -> Option<&[u32]> {
        let slot = self.entry_slot(id)?;
        self.entries[slot].as_ref().map(|e| e.ledger.tokens())
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn pool(&self) -> &SlotPool<P::CacheState> {
        &self.pool
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn primitive(&self) -> &P {
        &self.primitive
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    // ========== Tick phases ==========

    /// One batched decode call over every active slot, then drain.
    fn decode_active(&mut self, outputs: &mut TickOutputs) -> Result<()> {
        let active = self.pool.active_slots();
        if active.is_empty() {
            return Ok(());
        }

        let batch = assemble_decode_batch(&self.pool, self.config.pad_id, &self.batch_buckets)?;

        debug!(
            tick = outputs.tick,
            live = batch.num_live(),
            physical = batch.rows().physical(),
            "decode step"
        );
        self.stats.decode_calls += 1;
        let host = match call_decode(&self.primitive, &mut self.pool, &batch) {
            Ok(host) => host,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => return Err(self.fault_slots(&active, e)),
        };

        for slot in active {
            let Some(entry) = self.entries[slot].as_mut() else {
                return Err(Error::InvalidSlot {
                    slot,
                    reason: "active slot has no request",
                });
            };

            let (token, score) = (host.tokens[slot], host.scores[slot]);
            let steps = self.pool.advance(slot, token)?;
            entry.ledger.record(token, score);
            outputs.decoded.push(entry.request.id());

            let limit = entry.request.max_decode_steps();
            if let Some(reason) = check_done(&self.config, token, host.done[slot], steps, limit) {
                entry.ledger.mark_done(reason);
            }
        }

        let done: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.as_ref().is_some_and(|e| e.ledger.is_done()))
            .map(|(slot, _)| slot)
            .collect();
        for slot in done {
            self.complete(slot)?;
        }
        Ok(())
    }

    /// Up to `max_admissions_per_tick` admissions from the queue head.
    fn admit(&mut self, outputs: &mut TickOutputs) -> Result<()> {
        for _ in 0..self.config.max_admissions_per_tick {
            match self.admit_next() {
                Ok(Some(admission)) => outputs.admitted.push(admission),
                Ok(None) | Err(Error::PoolExhausted { .. }) => break,
                Err(e @ Error::ComputePrimitive { .. }) => outputs.failed.push(e),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn admit_next(&mut self) -> Result<Option<Admission>> {
        let Some(head) = self.queue.peek() else {
            return Ok(None);
        };
        let request_id = head.id();
        let slot = self.pool.allocate(request_id)?;
        let Some(mut request) = self.queue.pop_front() else {
            self.pool.free(slot)?;
            return Ok(None);
        };
        request.set_prefilling()?;

        debug!(request_id, slot, prompt_len = request.prompt_len(), "prefill");
        self.stats.prefill_calls += 1;
        let (token, score, state) = match self.run_prefill(&request) {
            Ok(out) => out,
            Err(e) => {
                self.pool.free(slot)?;
                request.set_failed();
                self.stats.failed += 1;
                self.finished.push(GenerationResult {
                    request_id,
                    tokens: Vec::new(),
                    scores: Vec::new(),
                    finish_reason: FinishReason::Failed,
                });
                error!(request_id, slot, error = %e, "prefill failed");
                if e.is_fatal() {
                    return Err(e);
                }
                return Err(compute_failure(vec![request_id], vec![slot], e));
            }
        };

        self.pool.insert(slot, state, token)?;
        request.set_decoding()?;
        let mut ledger = DecodedLedger::from_prefill(token, score);
        if let Some(reason) = check_done(&self.config, token, false, 1, request.max_decode_steps()) {
            ledger.mark_done(reason);
        }
        let done = ledger.is_done();
        self.entries[slot] = Some(SlotEntry { request, ledger });
        info!(request_id, slot, first_token = token, "request admitted");

        if done {
            self.complete(slot)?;
        }
        Ok(Some(Admission {
            request_id,
            slot,
            first_token: token,
        }))
    }

    fn run_prefill(&self, request: &Request) -> Result<(u32, f32, P::CacheState)> {
        let batch = PrefillBatch::from_prompts(
            &[request.prompt()],
            self.config.max_input_seq_len,
            &self.seq_buckets,
            &self.batch_buckets,
            self.config.pad_id,
            self.config.pad_side,
        )?;
        let rows = batch.rows();
        let output = self.primitive.prefill(&batch.to_device(self.primitive.device())?)?;
        let host = output.to_host(rows)?;

        let (Some(&token), Some(&score), Some(state)) =
            (host.tokens.first(), host.scores.first(), output.states.into_iter().next())
        else {
            return Err(Error::ShapeMismatch {
                what: "prefill output",
                expected: vec![1],
                actual: vec![0],
            });
        };
        Ok((token, score, state))
    }

    /// Drain a done slot into the finished list and free it.
    fn complete(&mut self, slot: usize) -> Result<()> {
        let Some(mut entry) = self.entries[slot].take() else {
            return Ok(());
        };
        self.pool.free(slot)?;
        entry.request.set_completed()?;
        self.stats.completed += 1;

        let request_id = entry.request.id();
        let finish_reason = entry
            .ledger
            .finish_reason()
            .unwrap_or(FinishReason::MaxDecodeSteps);
        info!(
            request_id,
            slot,
            steps = entry.ledger.steps(),
            reason = ?finish_reason,
            "request completed"
        );

        let (tokens, scores) = entry.ledger.into_parts();
        self.finished.push(GenerationResult {
            request_id,
            tokens,
            scores,
            finish_reason,
        });
        Ok(())
    }

    // ========== Fault handling ==========

    fn ensure_runnable(&self) -> Result<()> {
        if self.halted {
            return Err(Error::Halted);
        }
        let faulted = self.pool.faulted_slots();
        if !faulted.is_empty() {
            return Err(Error::SlotsNeedReset(faulted));
        }
        Ok(())
    }

    /// Halt on fatal errors.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                error!(error = %e, "scheduler halted");
                self.halted = true;
            }
        }
        result
    }

    /// Mark every slot of a failed batched call faulted.
    fn fault_slots(&mut self, slots: &[usize], e: Error) -> Error {
        let mut requests = Vec::with_capacity(slots.len());
        for &slot in slots {
            if self.pool.mark_faulted(slot).is_err() {
                continue;
            }
            if let Some(entry) = self.entries[slot].as_mut() {
                entry.request.set_failed();
                requests.push(entry.request.id());
                self.finished.push(failed_result(entry.request.id(), &entry.ledger));
            }
        }
        self.stats.failed += requests.len() as u64;
        error!(?slots, ?requests, error = %e, "decode step failed");
        compute_failure(requests, slots.to_vec(), e)
    }

    fn entry_slot(&self, id: RequestId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.request.id() == id))
    }
}

fn call_decode<P: ComputePrimitive>(
    primitive: &P,
    pool: &mut SlotPool<P::CacheState>,
    batch: &DecodeBatch,
) -> Result<HostDecodeOutput> {
    let rows = batch.rows();
    let device_batch = batch.to_device(primitive.device())?;
    let output = primitive.decode_step(&device_batch, pool.caches_mut())?;
    output.to_host(rows)
}

/// Done check after a step. End-of-sequence wins when it coincides with the
/// step limit.
fn check_done(
    config: &SchedulerConfig,
    token: u32,
    primitive_done: bool,
    steps: usize,
    max_steps: usize,
) -> Option<FinishReason> {
    if primitive_done || config.is_eos(token) {
        Some(FinishReason::EndOfSequence)
    } else if steps >= max_steps {
        Some(FinishReason::MaxDecodeSteps)
    } else {
        None
    }
}

/// Partial output of a request lost to a failure.
fn failed_result(request_id: RequestId, ledger: &DecodedLedger) -> GenerationResult {
    GenerationResult {
        request_id,
        tokens: ledger.tokens().to_vec(),
        scores: ledger.scores().to_vec(),
        finish_reason: FinishReason::Failed,
    }
}

fn compute_failure(requests: Vec<RequestId>, slots: Vec<usize>, e: Error) -> Error {
    match e {
        Error::ComputePrimitive { message, .. } => Error::ComputePrimitive {
            requests,
            slots,
            message,
        },
        other => Error::ComputePrimitive {
            requests,
            slots,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::TinyLm;
    use crate::config::ModelConfig;
    use candle_core::Device;

    fn scheduler(slots: usize, max_steps: usize) -> DecodeScheduler<TinyLm> {
        let config = SchedulerConfig {
            num_cache_slots: slots,
            max_decode_steps: max_steps,
            eos_ids: vec![],
            ..Default::default()
        };
        let model = TinyLm::new(
            ModelConfig {
                num_cache_slots: slots,
                eos_ids: vec![],
                ..Default::default()
            },
            &Device::Cpu,
        )
        .unwrap();
        DecodeScheduler::new(config, model).unwrap()
    }

    #[test]
    fn test_check_done_eos_wins_over_limit() {
        let config = SchedulerConfig::default();
        assert_eq!(
            check_done(&config, 1, false, 4, 4),
            Some(FinishReason::EndOfSequence)
        );
        assert_eq!(
            check_done(&config, 7, false, 4, 4),
            Some(FinishReason::MaxDecodeSteps)
        );
        assert_eq!(
            check_done(&config, 7, true, 2, 4),
            Some(FinishReason::EndOfSequence)
        );
        assert_eq!(check_done(&config, 7, false, 2, 4), None);
    }

    #[test]
    fn test_first_tick_only_admits() {
        let mut scheduler = scheduler(2, 4);
        scheduler.submit(Request::new(1, vec![3, 4], 4)).unwrap();

        let outputs = scheduler.tick().unwrap();
        assert_eq!(outputs.tick, 1);
        assert!(outputs.decoded.is_empty());
        assert_eq!(outputs.admitted.len(), 1);
        assert_eq!(outputs.admitted[0].slot, 0);
        assert_eq!(scheduler.stats().decode_calls, 0);
        assert_eq!(scheduler.partial_tokens(1).map(<[u32]>::len), Some(1));
    }

    #[test]
    fn test_step_limit_is_capped_by_config() {
        let mut scheduler = scheduler(1, 2);
        scheduler.submit(Request::new(1, vec![3], 10)).unwrap();

        let mut results = Vec::new();
        scheduler.run_until_idle(&mut results).unwrap();
        assert_eq!(results[0].tokens.len(), 2);
    }

    #[test]
    fn test_duplicate_of_active_request() {
        let mut scheduler = scheduler(2, 4);
        scheduler.submit(Request::new(1, vec![3], 4)).unwrap();
        scheduler.tick().unwrap();

        assert!(matches!(
            scheduler.submit(Request::new(1, vec![3], 4)),
            Err(Error::DuplicateRequest(1))
        ));
    }

    #[test]
    fn test_idle_tick() {
        let mut scheduler = scheduler(2, 4);
        let outputs = scheduler.tick().unwrap();
        assert!(outputs.is_idle());
        assert!(!scheduler.has_work());
    }
}
