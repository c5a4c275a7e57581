//! Fixed-capacity pool of cache slots.
//!
//! Each slot holds the attention cache state of exactly one request while
//! it is occupied. The pool is an arena addressed by slot index: slot `i`
//! always maps to row `i` of a batched decode call, so a request's cache
//! state never moves between physical positions.
//!
//! ## Slot lifecycle
//!
//! ```text
//!   allocate()        insert()          free()
//! Free ──────► Prefilling ──────► Active ──────► Free
//!                                   │
//!                                   │ mark_faulted()
//!                                   ▼
//!                                Faulted ──free()──► Free
//! ```
//!
//! ## Example
//!
//! ```
//! use nano_cb::core::slot_pool::SlotPool;
//!
//! let mut pool: SlotPool<Vec<f32>> = SlotPool::new(2);
//!
//! let slot = pool.allocate(42).unwrap();
//! assert_eq!(slot, 0);
//!
//! pool.insert(slot, vec![0.5; 4], 17).unwrap();
//! assert_eq!(pool.occupied_mask(), vec![true, false]);
//!
//! pool.free(slot).unwrap();
//! assert!(pool.cache(slot).is_none());
//! ```

use std::collections::BTreeSet;

use crate::core::request::RequestId;
use crate::error::{Error, Result};

/// Phase of a single slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    /// Unoccupied.
    Free,
    /// Allocated to a request whose prefill has not been inserted yet.
    Prefilling,
    /// Holding a valid cache state; takes part in decode calls.
    Active,
    /// Occupied, but the cache state is undefined after a failed call.
    Faulted,
}

/// Bookkeeping for one slot.
#[derive(Debug, Clone)]
pub struct Slot {
    index: usize,
    phase: SlotPhase,
    owner: Option<RequestId>,
    steps: usize,
    last_token: Option<u32>,
}

impl Slot {
    fn new(index: usize) -> Self {
        Self {
            index,
            phase: SlotPhase::Free,
            owner: None,
            steps: 0,
            last_token: None,
        }
    }

    fn clear(&mut self) {
        self.phase = SlotPhase::Free;
        self.owner = None;
        self.steps = 0;
        self.last_token = None;
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn phase(&self) -> SlotPhase {
        self.phase
    }

    pub fn is_occupied(&self) -> bool {
        self.phase != SlotPhase::Free
    }

    /// Request that owns the slot, if any.
    pub fn owner(&self) -> Option<RequestId> {
        self.owner
    }

    /// Steps executed so far, the prefill step included.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Token emitted by the most recent step.
    pub fn last_token(&self) -> Option<u32> {
        self.last_token
    }
}

/// Fixed pool of `S` cache slots.
///
/// Allocation always returns the lowest free index. `C` is the cache state
/// type produced by the compute primitive; the pool owns it exclusively
/// while the slot is occupied and drops it on free.
#[derive(Debug)]
pub struct SlotPool<C> {
    slots: Vec<Slot>,
    /// Cache states indexed by slot, laid out as the decode batch rows.
    caches: Vec<Option<C>>,
    free_slots: BTreeSet<usize>,
}

impl<C> SlotPool<C> {
    /// Create a pool with `capacity` free slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(Slot::new).collect(),
            caches: (0..capacity).map(|_| None).collect(),
            free_slots: (0..capacity).collect(),
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of free slots.
    pub fn num_free(&self) -> usize {
        self.free_slots.len()
    }

    /// Number of occupied slots (any phase but `Free`).
    pub fn num_occupied(&self) -> usize {
        self.capacity() - self.num_free()
    }

    pub fn has_free_slots(&self) -> bool {
        !self.free_slots.is_empty()
    }

    /// Allocate the lowest free slot to `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if every slot is occupied. The pool
    /// is left untouched.
    pub fn allocate(&mut self, owner: RequestId) -> Result<usize> {
        let index = self
            .free_slots
            .pop_first()
            .ok_or(Error::PoolExhausted {
                capacity: self.capacity(),
            })?;

        let slot = &mut self.slots[index];
        slot.phase = SlotPhase::Prefilling;
        slot.owner = Some(owner);
        Ok(index)
    }

    /// Install the prefill result into an allocated slot.
    ///
    /// The step counter starts at 1 for the prefill-produced token.
    pub fn insert(&mut self, index: usize, cache: C, first_token: u32) -> Result<()> {
        let slot = self.slot_in_phase(index, SlotPhase::Prefilling, "slot is not prefilling")?;
        slot.phase = SlotPhase::Active;
        slot.steps = 1;
        slot.last_token = Some(first_token);
        self.caches[index] = Some(cache);
        Ok(())
    }

    /// Record one decode step for an active slot. Returns the new step count.
    pub fn advance(&mut self, index: usize, token: u32) -> Result<usize> {
        let slot = self.slot_in_phase(index, SlotPhase::Active, "slot is not active")?;
        slot.steps += 1;
        slot.last_token = Some(token);
        Ok(slot.steps)
    }

    /// Mark an occupied slot's cache state undefined.
    pub fn mark_faulted(&mut self, index: usize) -> Result<()> {
        let slot = self.slot_mut(index)?;
        if slot.phase == SlotPhase::Free {
            return Err(Error::InvalidSlot {
                slot: index,
                reason: "slot is free",
            });
        }
        slot.phase = SlotPhase::Faulted;
        Ok(())
    }

    /// Free a slot and discard its cache state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSlot`] if the index is out of range or the
    /// slot is already free.
    pub fn free(&mut self, index: usize) -> Result<()> {
        let slot = self.slot_mut(index)?;
        if slot.phase == SlotPhase::Free {
            return Err(Error::InvalidSlot {
                slot: index,
                reason: "slot is already free",
            });
        }
        slot.clear();
        self.caches[index] = None;
        self.free_slots.insert(index);
        Ok(())
    }

    /// One flag per slot, in slot order: `true` when occupied.
    pub fn occupied_mask(&self) -> Vec<bool> {
        self.slots.iter().map(Slot::is_occupied).collect()
    }

    /// One flag per slot, in slot order: `true` when active.
    pub fn active_mask(&self) -> Vec<bool> {
        self.slots
            .iter()
            .map(|s| s.phase == SlotPhase::Active)
            .collect()
    }

    /// Indices of active slots in ascending order.
    pub fn active_slots(&self) -> Vec<usize> {
        self.slots_in(SlotPhase::Active)
    }

    /// Indices of faulted slots in ascending order.
    pub fn faulted_slots(&self) -> Vec<usize> {
        self.slots_in(SlotPhase::Faulted)
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Slot currently owned by `owner`.
    pub fn slot_of(&self, owner: RequestId) -> Option<usize> {
        self.slots
            .iter()
            .find(|s| s.owner == Some(owner))
            .map(Slot::index)
    }

    /// Cache state held by a slot.
    pub fn cache(&self, index: usize) -> Option<&C> {
        self.caches.get(index).and_then(Option::as_ref)
    }

    /// All cache states in slot order, for a batched decode call.
    pub fn caches_mut(&mut self) -> &mut [Option<C>] {
        &mut self.caches
    }

    /// Free every slot and drop every cache state.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
        for cache in &mut self.caches {
            *cache = None;
        }
        self.free_slots = (0..self.slots.len()).collect();
    }

    fn slots_in(&self, phase: SlotPhase) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|s| s.phase == phase)
            .map(Slot::index)
            .collect()
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut Slot> {
        self.slots.get_mut(index).ok_or(Error::InvalidSlot {
            slot: index,
            reason: "slot index out of range",
        })
    }

    fn slot_in_phase(
        &mut self,
        index: usize,
        phase: SlotPhase,
        reason: &'static str,
    ) -> Result<&mut Slot> {
        let slot = self.slot_mut(index)?;
        if slot.phase != phase {
            return Err(Error::InvalidSlot { slot: index, reason });
        }
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_creation() {
        let pool: SlotPool<u32> = SlotPool::new(4);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.num_free(), 4);
        assert_eq!(pool.num_occupied(), 0);
        assert_eq!(pool.occupied_mask(), vec![false; 4]);
    }

    #[test]
    fn test_lowest_index_first() {
        let mut pool: SlotPool<u32> = SlotPool::new(3);

        assert_eq!(pool.allocate(10).unwrap(), 0);
        assert_eq!(pool.allocate(11).unwrap(), 1);
        assert_eq!(pool.allocate(12).unwrap(), 2);

        pool.free(1).unwrap();
        pool.free(0).unwrap();

        // Lowest index regardless of free order
        assert_eq!(pool.allocate(13).unwrap(), 0);
        assert_eq!(pool.allocate(14).unwrap(), 1);
    }

    #[test]
    fn test_exhausted_leaves_pool_untouched() {
        let mut pool: SlotPool<u32> = SlotPool::new(1);
        pool.allocate(1).unwrap();

        let before = pool.occupied_mask();
        assert!(matches!(
            pool.allocate(2),
            Err(Error::PoolExhausted { capacity: 1 })
        ));
        assert_eq!(pool.occupied_mask(), before);
        assert_eq!(pool.slot(0).unwrap().owner(), Some(1));
    }

    #[test]
    fn test_insert_and_advance() {
        let mut pool: SlotPool<&str> = SlotPool::new(2);
        let slot = pool.allocate(7).unwrap();

        // Advancing before insert is a caller error
        assert!(pool.advance(slot, 3).is_err());

        pool.insert(slot, "cache", 9).unwrap();
        assert_eq!(pool.slot(slot).unwrap().steps(), 1);
        assert_eq!(pool.advance(slot, 4).unwrap(), 2);
        assert_eq!(pool.slot(slot).unwrap().last_token(), Some(4));
        assert_eq!(pool.active_slots(), vec![0]);
    }

    #[test]
    fn test_double_free_is_invalid() {
        let mut pool: SlotPool<u32> = SlotPool::new(2);
        let slot = pool.allocate(1).unwrap();

        pool.free(slot).unwrap();
        assert!(matches!(pool.free(slot), Err(Error::InvalidSlot { .. })));
        assert!(matches!(pool.free(5), Err(Error::InvalidSlot { .. })));
        assert_eq!(pool.num_free(), 2);
    }

    #[test]
    fn test_free_discards_cache() {
        let mut pool: SlotPool<Vec<u8>> = SlotPool::new(1);
        let slot = pool.allocate(1).unwrap();
        pool.insert(slot, vec![1, 2, 3], 5).unwrap();

        pool.free(slot).unwrap();
        assert!(pool.cache(slot).is_none());

        let slot = pool.allocate(2).unwrap();
        assert!(pool.cache(slot).is_none());
        assert_eq!(pool.slot(slot).unwrap().steps(), 0);
        assert_eq!(pool.slot(slot).unwrap().last_token(), None);
    }

    #[test]
    fn test_faulted_slots() {
        let mut pool: SlotPool<u32> = SlotPool::new(2);
        let slot = pool.allocate(1).unwrap();
        pool.insert(slot, 0, 1).unwrap();

        pool.mark_faulted(slot).unwrap();
        assert_eq!(pool.faulted_slots(), vec![0]);
        assert!(pool.active_slots().is_empty());
        assert!(pool.mark_faulted(1).is_err());

        pool.free(slot).unwrap();
        assert!(pool.faulted_slots().is_empty());
    }

    #[test]
    fn test_reset() {
        let mut pool: SlotPool<u32> = SlotPool::new(3);
        for owner in 0..3 {
            let slot = pool.allocate(owner).unwrap();
            pool.insert(slot, 0, 0).unwrap();
        }

        pool.reset();
        assert_eq!(pool.num_free(), 3);
        assert!(pool.caches_mut().iter().all(Option::is_none));
        assert_eq!(pool.slot_of(1), None);
    }
}
