//! # Hunk Discipline Tests
//!
//! Stack behavior of the hunk: save / reset reuse, segment growth and the
//! consistency check.

use std::cell::RefCell;
use std::rc::Rc;

use ember_memory::{CacheUser, Memory, MemoryConfig, MemoryError};

fn memory(heap_kib: usize) -> Memory {
    Memory::new(MemoryConfig::with_heap_size(heap_kib * 1024).with_zone_kib(4)).unwrap()
}

/// Test: After a reset the next allocation reuses exactly the freed bytes.
#[test]
fn test_reset_reuses_exact_bytes() {
    let mut memory = memory(64);
    memory.hunk_alloc(100, Some("permanent")).unwrap();

    let mark = memory.hunk_low_mark();
    let level = memory.hunk_alloc(2000, Some("level")).unwrap();
    memory.hunk_alloc(300, Some("entities")).unwrap();
    memory.hunk_reset_to(mark).unwrap();
    assert_eq!(memory.hunk_low_mark(), mark);

    let again = memory.hunk_alloc(2000, Some("level")).unwrap();
    assert_eq!(again, level);
    assert_eq!(memory.segments().last().used(), memory.hunk_low_mark().offset());
}

/// Test: Nested marks unwind in stack order.
#[test]
fn test_nested_marks() {
    let mut memory = memory(64);
    let outer = memory.hunk_low_mark();
    memory.hunk_alloc(64, Some("a")).unwrap();
    let inner = memory.hunk_low_mark();
    memory.hunk_alloc(64, Some("b")).unwrap();

    memory.hunk_reset_to(inner).unwrap();
    assert_eq!(memory.hunk_records().unwrap().len(), 2);
    memory.hunk_reset_to(outer).unwrap();
    assert_eq!(memory.hunk_records().unwrap().len(), 1);

    // Cannot roll forward again.
    assert!(matches!(
        memory.hunk_reset_to(inner),
        Err(MemoryError::BadMark { .. })
    ));
}

/// Test: Zero-filled allocations are cleared even over reused bytes.
#[test]
fn test_zero_fill_over_reused_bytes() {
    let mut memory = memory(64);
    let mark = memory.hunk_low_mark();
    let dirty = memory.hunk_alloc_no_fill(256, None).unwrap().unwrap();
    memory.bytes_mut(dirty, 256).unwrap().fill(0xEE);
    memory.hunk_reset_to(mark).unwrap();

    let clean = memory.hunk_alloc(256, None).unwrap().unwrap();
    assert_eq!(clean, dirty);
    assert!(memory.bytes(clean, 256).unwrap().iter().all(|&b| b == 0));
}

/// Test: Outgrowing the last segment adds exactly one segment and flushes the cache first.
#[test]
fn test_growth_adds_one_segment_and_flushes_cache() {
    let mut memory = memory(64);
    let evicted = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&evicted);
    memory.set_eviction_hook(Some(Box::new(move |entry| {
        sink.borrow_mut().push(entry.name.clone());
    })));

    let sound = CacheUser::new();
    memory.cache_alloc(&sound, 1000, "sound/ambience/wind2.wav").unwrap();

    let old_last = memory.segments().last();
    let (old_base, old_size) = (old_last.base(), old_last.size());

    let requested = 100_000;
    let addr = memory.hunk_alloc(requested, Some("lightmaps")).unwrap().unwrap();

    assert_eq!(memory.segments().len(), 2);
    let new_last = memory.segments().last();
    assert_eq!(new_last.base(), old_base + old_size);
    assert!(new_last.size() >= (2 * old_size).max(requested));
    assert_eq!(memory.segments().offset_to_segment(addr.offset()).unwrap(), 1);

    assert_eq!(sound.data(), None);
    assert_eq!(*evicted.borrow(), vec!["sound/ambience/wind2.wav".to_owned()]);
}

/// Test: The segment limit is a hard failure.
#[test]
fn test_segment_limit() {
    let config = MemoryConfig {
        max_segments: 1,
        ..MemoryConfig::with_heap_size(64 * 1024).with_zone_kib(4)
    };
    let mut memory = Memory::new(config).unwrap();
    assert_eq!(
        memory.hunk_alloc(100_000, None),
        Err(MemoryError::SegmentOverflow { max: 1 })
    );
}

/// Test: A refused growth leaves the hunk and cache usable.
#[test]
fn test_failed_growth_keeps_low_mark() {
    let config = MemoryConfig {
        max_segments: 1,
        ..MemoryConfig::with_heap_size(64 * 1024).with_zone_kib(4)
    };
    let mut memory = Memory::new(config).unwrap();
    let before = memory.hunk_low_mark();

    assert_eq!(
        memory.hunk_alloc(100_000, None),
        Err(MemoryError::SegmentOverflow { max: 1 })
    );
    assert_eq!(memory.hunk_low_mark(), before);

    assert!(memory.hunk_alloc(100, Some("after")).unwrap().is_some());
    memory.hunk_check().unwrap();

    let user = CacheUser::new();
    memory.cache_alloc(&user, 100, "sound").unwrap();
    assert!(user.data().is_some());
}

/// Test: Records across two segments are all visited by the check and dump.
#[test]
fn test_report_spans_segments() {
    let mut memory = memory(64);
    memory.hunk_alloc(1000, Some("model")).unwrap();
    memory.hunk_alloc(1000, Some("model")).unwrap();
    memory.hunk_alloc(100_000, Some("world")).unwrap();
    memory.hunk_check().unwrap();

    let report = memory.hunk_report(false).unwrap();
    let names: Vec<&str> = report.rows.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["zone", "model", "world"]);
    assert_eq!(report.rows[1].count, 2);
    assert_eq!(report.segments.len(), 2);

    let text = report.to_string();
    assert!(text.contains("Segments"));
    assert!(text.contains("REMAINING"));
}

/// Test: A trashed sentinel is reported instead of walked over.
#[test]
fn test_check_detects_trashed_header() {
    let mut memory = memory(64);
    let a = memory.hunk_alloc(64, Some("a")).unwrap().unwrap();
    memory.hunk_alloc(64, Some("b")).unwrap();

    // Overrun the payload of "a" into the header of "b".
    memory.bytes_mut(a, 80).unwrap().fill(0x55);
    assert!(matches!(
        memory.hunk_check(),
        Err(MemoryError::HunkSentinel { .. })
    ));
}
