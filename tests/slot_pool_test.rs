//! Integration tests for SlotPool.

use nano_cb::core::slot_pool::{SlotPhase, SlotPool};
use nano_cb::Error;

#[test]
fn test_pool_creation() {
    let pool: SlotPool<String> = SlotPool::new(4);
    assert_eq!(pool.capacity(), 4);
    assert_eq!(pool.num_free(), 4);
    assert_eq!(pool.num_occupied(), 0);
    assert_eq!(pool.occupied_mask(), vec![false; 4]);
}

#[test]
fn test_allocate_lowest_free_index() {
    let mut pool: SlotPool<String> = SlotPool::new(4);
    assert_eq!(pool.allocate(10).unwrap(), 0);
    assert_eq!(pool.allocate(11).unwrap(), 1);
    assert_eq!(pool.allocate(12).unwrap(), 2);

    pool.free(1).unwrap();
    pool.free(0).unwrap();

    // Lowest free index wins regardless of free order.
    assert_eq!(pool.allocate(13).unwrap(), 0);
    assert_eq!(pool.allocate(14).unwrap(), 1);
    assert_eq!(pool.allocate(15).unwrap(), 3);
    assert_eq!(pool.slot_of(15), Some(3));
}

#[test]
fn test_exhausted_pool_is_unchanged() {
    let mut pool: SlotPool<String> = SlotPool::new(2);
    pool.allocate(1).unwrap();
    pool.allocate(2).unwrap();

    let err = pool.allocate(3).unwrap_err();
    assert!(matches!(err, Error::PoolExhausted { capacity: 2 }));
    assert_eq!(pool.num_occupied(), 2);
    assert_eq!(pool.slot_of(3), None);
}

#[test]
fn test_lifecycle() {
    let mut pool: SlotPool<String> = SlotPool::new(2);
    let slot = pool.allocate(7).unwrap();
    assert_eq!(pool.slot(slot).unwrap().phase(), SlotPhase::Prefilling);
    assert!(pool.active_slots().is_empty());

    pool.insert(slot, "prefix".to_string(), 42).unwrap();
    let s = pool.slot(slot).unwrap();
    assert_eq!(s.phase(), SlotPhase::Active);
    assert_eq!(s.steps(), 1);
    assert_eq!(s.last_token(), Some(42));
    assert_eq!(pool.cache(slot).map(String::as_str), Some("prefix"));

    assert_eq!(pool.advance(slot, 43).unwrap(), 2);
    assert_eq!(pool.active_mask(), vec![true, false]);

    pool.free(slot).unwrap();
    assert!(pool.cache(slot).is_none());
    assert_eq!(pool.slot(slot).unwrap().owner(), None);
    assert_eq!(pool.slot(slot).unwrap().steps(), 0);
}

#[test]
fn test_insert_requires_prefilling() {
    let mut pool: SlotPool<String> = SlotPool::new(2);
    assert!(matches!(
        pool.insert(0, "x".into(), 1),
        Err(Error::InvalidSlot { slot: 0, .. })
    ));

    let slot = pool.allocate(1).unwrap();
    pool.insert(slot, "x".into(), 1).unwrap();
    assert!(pool.insert(slot, "y".into(), 2).is_err());
}

#[test]
fn test_double_free_and_out_of_range() {
    let mut pool: SlotPool<String> = SlotPool::new(2);
    let slot = pool.allocate(1).unwrap();
    pool.free(slot).unwrap();

    assert!(matches!(pool.free(slot), Err(Error::InvalidSlot { .. })));
    assert!(matches!(pool.free(5), Err(Error::InvalidSlot { slot: 5, .. })));
    assert_eq!(pool.num_free(), 2);
}

#[test]
fn test_faulted_slots_stay_occupied() {
    let mut pool: SlotPool<String> = SlotPool::new(3);
    for owner in 0..3 {
        let slot = pool.allocate(owner).unwrap();
        pool.insert(slot, format!("state{owner}"), 1).unwrap();
    }
    pool.mark_faulted(0).unwrap();
    pool.mark_faulted(2).unwrap();

    assert_eq!(pool.faulted_slots(), vec![0, 2]);
    assert_eq!(pool.active_slots(), vec![1]);
    assert!(!pool.has_free_slots());
    assert!(pool.advance(0, 5).is_err());

    pool.free(0).unwrap();
    assert_eq!(pool.allocate(9).unwrap(), 0);
}

#[test]
fn test_reset() {
    let mut pool: SlotPool<String> = SlotPool::new(2);
    let slot = pool.allocate(1).unwrap();
    pool.insert(slot, "x".into(), 1).unwrap();
    pool.allocate(2).unwrap();

    pool.reset();
    assert_eq!(pool.num_free(), 2);
    assert!(pool.caches_mut().iter().all(Option::is_none));
    assert_eq!(pool.allocate(3).unwrap(), 0);
}
