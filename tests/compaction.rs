use tempfile::tempdir;

use lodekv::store::segment::{self, segment_path};
use lodekv::{KvStore, StoreConfig};

/// Two 29-byte records per segment.
fn config() -> StoreConfig {
    StoreConfig {
        max_segment_bytes: 58,
        ..StoreConfig::default()
    }
}

/// Lay out keys across three sealed segments plus one active:
///
/// ```text
/// segment-0  key-aaa key-bbb        (both stale)
/// segment-1  key-ccc key-aaa
/// segment-2  key-bbb key-ddd
/// segment-3  key-eee                (active)
/// ```
fn populate(store: &KvStore) {
    store.put("key-aaa", "aaa-seg-0").expect("put");
    store.put("key-bbb", "bbb-seg-0").expect("put");
    store.put("key-ccc", "ccc-seg-1").expect("put");
    store.put("key-aaa", "aaa-seg-1").expect("put");
    store.put("key-bbb", "bbb-seg-2").expect("put");
    store.put("key-ddd", "ddd-seg-2").expect("put");
    store.put("key-eee", "eee-seg-3").expect("put");
}

#[test]
fn merge_collapses_sealed_segments() {
    let dir = tempdir().expect("tempdir");
    let store = KvStore::open(dir.path(), config()).expect("open");
    populate(&store);

    assert_eq!(
        segment::discover_segments(dir.path()).expect("discover"),
        vec![0, 1, 2, 3]
    );
    let active_size_before = std::fs::metadata(segment_path(dir.path(), 3))
        .expect("stat active")
        .len();

    assert!(store.compact().expect("compact"));

    // Sealed segments collapse into the lowest sealed id; the active
    // segment is untouched.
    assert_eq!(
        segment::discover_segments(dir.path()).expect("discover"),
        vec![0, 3]
    );
    assert!(!segment_path(dir.path(), 1).exists());
    assert!(!segment_path(dir.path(), 2).exists());
    assert_eq!(
        std::fs::metadata(segment_path(dir.path(), 3))
            .expect("stat active")
            .len(),
        active_size_before
    );

    // Four live keys were merged, 29 bytes each.
    assert_eq!(
        std::fs::metadata(segment_path(dir.path(), 0))
            .expect("stat merged")
            .len(),
        4 * 29
    );

    assert_eq!(store.get("key-aaa").expect("get"), "aaa-seg-1");
    assert_eq!(store.get("key-bbb").expect("get"), "bbb-seg-2");
    assert_eq!(store.get("key-ccc").expect("get"), "ccc-seg-1");
    assert_eq!(store.get("key-ddd").expect("get"), "ddd-seg-2");
    assert_eq!(store.get("key-eee").expect("get"), "eee-seg-3");
}

#[test]
fn second_merge_is_a_no_op() {
    let dir = tempdir().expect("tempdir");
    let store = KvStore::open(dir.path(), config()).expect("open");
    populate(&store);

    assert!(store.compact().expect("first compact"));
    let after_first = segment::discover_segments(dir.path()).expect("discover");
    assert!(!store.compact().expect("second compact"));
    assert_eq!(
        segment::discover_segments(dir.path()).expect("discover"),
        after_first
    );
}

#[test]
fn merged_store_reopens_cleanly() {
    let dir = tempdir().expect("tempdir");
    let store = KvStore::open(dir.path(), config()).expect("open");
    populate(&store);
    assert!(store.compact().expect("compact"));
    store.close().expect("close");
    drop(store);

    let store = KvStore::open(dir.path(), config()).expect("reopen");
    assert_eq!(store.get("key-aaa").expect("get"), "aaa-seg-1");
    assert_eq!(store.get("key-bbb").expect("get"), "bbb-seg-2");
    assert_eq!(store.get("key-ccc").expect("get"), "ccc-seg-1");
    assert_eq!(store.get("key-ddd").expect("get"), "ddd-seg-2");
    assert_eq!(store.get("key-eee").expect("get"), "eee-seg-3");
}

#[test]
fn merge_with_one_sealed_segment_does_nothing() {
    let dir = tempdir().expect("tempdir");
    let store = KvStore::open(dir.path(), config()).expect("open");

    store.put("key-aaa", "aaa-seg-0").expect("put");
    store.put("key-bbb", "bbb-seg-0").expect("put");
    store.put("key-ccc", "ccc-seg-1").expect("put");

    assert!(!store.compact().expect("compact"));
    assert_eq!(
        segment::discover_segments(dir.path()).expect("discover"),
        vec![0, 1]
    );
}
