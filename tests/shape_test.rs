//! Integration tests for shape bucketing.

use nano_cb::batch::{BatchDescriptor, ShapeBuckets};
use nano_cb::Error;

#[test]
fn test_selection_is_monotonic() {
    let buckets = ShapeBuckets::new(vec![1, 2, 4, 8, 16, 32]).unwrap();
    for a in 0..=32 {
        for b in a..=32 {
            let pa = buckets.select_physical_shape(a).unwrap();
            let pb = buckets.select_physical_shape(b).unwrap();
            assert!(pa <= pb, "select({a}) = {pa} > select({b}) = {pb}");
        }
    }
}

#[test]
fn test_selection_is_smallest_fit() {
    let buckets = ShapeBuckets::new(vec![3, 5, 9]).unwrap();
    assert_eq!(buckets.select_physical_shape(1).unwrap(), 3);
    assert_eq!(buckets.select_physical_shape(3).unwrap(), 3);
    assert_eq!(buckets.select_physical_shape(4).unwrap(), 5);
    assert_eq!(buckets.select_physical_shape(9).unwrap(), 9);
    assert_eq!(buckets.largest(), 9);
}

#[test]
fn test_oversized_logical_shape() {
    let buckets = ShapeBuckets::new(vec![2, 4]).unwrap();
    assert!(matches!(
        buckets.select_physical_shape(5),
        Err(Error::ShapeMismatch { .. })
    ));
}

#[test]
fn test_batch_descriptor() {
    let buckets = ShapeBuckets::new(vec![1, 2, 4, 8]).unwrap();
    let desc = BatchDescriptor::bucketed(5, &buckets).unwrap();
    assert_eq!(desc.logical(), 5);
    assert_eq!(desc.physical(), 8);
    assert_eq!(desc.padding(), 3);
    assert!(!desc.is_padding(4));
    assert!(desc.is_padding(5));

    assert!(BatchDescriptor::new(5, 4).is_err());
}
