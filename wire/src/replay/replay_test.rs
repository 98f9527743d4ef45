use std::time::Duration;

use super::*;
use crate::header::{PK_ACK, PK_RESP_BODY};

#[test]
fn test_duplicate_inside_window_is_rejected() {
    let mut cache = ReplayCache::default();
    assert!(cache.observe(1, 100, 0, PK_RESP_BODY));
    assert!(!cache.observe(1, 100, 0, PK_RESP_BODY), "second sight is a replay");
}

#[test]
fn test_key_covers_all_four_fields() {
    let mut cache = ReplayCache::default();
    assert!(cache.observe(1, 100, 0, PK_RESP_BODY));
    assert!(cache.observe(2, 100, 0, PK_RESP_BODY), "different id");
    assert!(cache.observe(1, 101, 0, PK_RESP_BODY), "different timestamp");
    assert!(cache.observe(1, 100, 1, PK_RESP_BODY), "different sequence");
    assert!(cache.observe(1, 100, 0, PK_ACK), "different kind");
}

#[test]
fn test_entry_is_acceptable_again_after_the_window() {
    let mut cache = ReplayCache::new(Duration::from_millis(30));
    assert!(cache.observe(1, 100, 0, PK_RESP_BODY));
    assert!(!cache.observe(1, 100, 0, PK_RESP_BODY));

    std::thread::sleep(Duration::from_millis(50));
    assert!(
        cache.observe(1, 100, 0, PK_RESP_BODY),
        "outside the retention window acceptance is permitted again"
    );
}

#[test]
fn test_sweep_drops_aged_entries() {
    let mut cache = ReplayCache::new(Duration::from_millis(10));
    for seq in 0..64 {
        cache.observe(1, 100, seq, PK_RESP_BODY);
    }
    assert_eq!(cache.len(), 64);

    std::thread::sleep(Duration::from_millis(25));
    // Any observation after a full window triggers the sweep.
    cache.observe(2, 100, 0, PK_RESP_BODY);
    assert_eq!(cache.len(), 1, "aged entries must be swept out");
}
