//! Integration tests for padding and batch assembly.

use nano_cb::batch::{assemble_decode_batch, unpad, DecodeBatch, PrefillBatch, ShapeBuckets};
use nano_cb::config::PadSide;
use nano_cb::core::SlotPool;
use nano_cb::Error;

fn buckets(sizes: &[usize]) -> ShapeBuckets {
    ShapeBuckets::new(sizes.to_vec()).unwrap()
}

#[test]
fn test_decode_round_trip_for_every_occupancy() {
    let batch_buckets = buckets(&[1, 2, 4, 8]);

    // Every occupancy pattern of a 5-slot pool.
    for pattern in 0u32..(1 << 5) {
        let mut pool: SlotPool<()> = SlotPool::new(5);
        let mut expected = vec![None; 5];
        for owner in 0..5 {
            pool.allocate(owner).unwrap();
        }
        for slot in 0..5 {
            if pattern & (1 << slot) != 0 {
                let token = 100 + slot as u32;
                pool.insert(slot, (), token).unwrap();
                expected[slot] = Some(token);
            } else {
                pool.free(slot).unwrap();
            }
        }

        let batch = assemble_decode_batch(&pool, 0, &batch_buckets).unwrap();
        assert_eq!(batch.rows().logical(), 5);
        assert_eq!(batch.rows().physical(), 8);
        assert_eq!(batch.unpad().unwrap(), expected, "pattern {pattern:05b}");
    }
}

#[test]
fn test_free_rows_carry_pad() {
    let batch = DecodeBatch::from_rows(&[None, Some(5), None], 9, &buckets(&[4])).unwrap();
    assert_eq!(batch.tokens(), &[9, 5, 9, 9]);
    assert_eq!(batch.mask(), &[false, true, false, false]);
    assert_eq!(batch.num_live(), 1);
}

#[test]
fn test_prefill_left_and_right() {
    let seq = buckets(&[4, 8]);
    let rows = buckets(&[1, 2]);

    let left = PrefillBatch::from_prompts(&[&[1, 2, 3], &[4]], 8, &seq, &rows, 0, PadSide::Left).unwrap();
    assert_eq!(left.row_ids(0), &[0, 1, 2, 3]);
    assert_eq!(left.row_ids(1), &[0, 0, 0, 4]);

    let right = PrefillBatch::from_prompts(&[&[1, 2, 3], &[4]], 8, &seq, &rows, 0, PadSide::Right).unwrap();
    assert_eq!(right.row_ids(0), &[1, 2, 3, 0]);
    assert_eq!(right.row_ids(1), &[4, 0, 0, 0]);
    assert_eq!(right.segment_pos(), &[0, 1, 2, 0, 0, 0, 0, 0]);

    for row in 0..2 {
        assert_eq!(left.row_tokens(row), right.row_tokens(row));
    }
}

#[test]
fn test_prefill_rejects_long_prompt() {
    let result = PrefillBatch::from_prompts(
        &[&[1; 9]],
        8,
        &buckets(&[8, 16]),
        &buckets(&[1]),
        0,
        PadSide::Left,
    );
    assert!(matches!(result, Err(Error::PromptTooLong { len: 9, max: 8 })));
}

#[test]
fn test_too_many_rows_for_buckets() {
    let result = DecodeBatch::from_rows(&[Some(1); 5], 0, &buckets(&[1, 2, 4]));
    assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
}

#[test]
fn test_unpad_shorter_buffer() {
    assert_eq!(unpad(&[1, 2, 3, 4], 2).unwrap(), vec![1, 2]);
    assert!(unpad(&[1, 2], 3).is_err());
}
