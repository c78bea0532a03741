//! # Level Load Scenario
//!
//! A 1 MiB heap filled by one big level, a cached texture squeezed into the
//! tail, and a second level that forces a new segment.

use std::cell::RefCell;
use std::rc::Rc;

use ember_memory::{CacheUser, Memory, MemoryCommand, MemoryConfig, OrFatal};

/// Test: Segment growth flushes the texture and clears its handle.
#[test]
fn test_growth_flushes_cached_texture() {
    let mut memory =
        Memory::new(MemoryConfig::with_heap_size(1 << 20).with_zone_kib(16)).or_fatal();
    let evicted = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&evicted);
    memory.set_eviction_hook(Some(Box::new(move |entry| {
        sink.borrow_mut().push(entry.name.clone());
    })));

    let big = memory.hunk_alloc(900_000, Some("big")).or_fatal();
    assert!(big.is_some());
    let mark = memory.hunk_low_mark().offset();
    let room = memory.cache_report().free_bytes;
    assert_eq!(room, (1 << 20) - mark);

    let tex = CacheUser::new();
    let addr = memory.cache_alloc(&tex, 50_000, "tex").or_fatal();
    assert!(addr.offset() >= mark);
    assert!(addr.offset() + 50_000 <= 1 << 20);
    assert_eq!(memory.segments().len(), 1);

    memory.hunk_alloc(200_000, None).or_fatal();

    assert_eq!(memory.segments().len(), 2);
    assert_eq!(tex.data(), None);
    assert_eq!(*evicted.borrow(), vec!["tex".to_owned()]);
    assert!(memory.cache_entries().or_fatal().is_empty());
    memory.hunk_check().or_fatal();
    memory.zone_check().or_fatal();
}

/// Test: The console drives the same system end to end.
#[test]
fn test_console_session() {
    let mut memory =
        Memory::new(MemoryConfig::with_heap_size(1 << 20).with_zone_kib(16)).or_fatal();
    memory.hunk_alloc(1000, Some("progs")).or_fatal();
    memory.hunk_alloc(1000, Some("progs")).or_fatal();
    let tex = CacheUser::new();
    memory.cache_alloc(&tex, 4096, "gfx/palette.lmp").or_fatal();

    let run = |memory: &mut Memory, line: &str| {
        line.parse::<MemoryCommand>().or_fatal().execute(memory).or_fatal()
    };

    let summary = run(&mut memory, "hunk_print");
    assert!(summary.contains("progs"));
    assert!(summary.contains("     2 :"));

    assert!(run(&mut memory, "cache_print").contains("gfx/palette.lmp"));
    assert!(run(&mut memory, "zone_print").contains("zone size: 16384"));
    run(&mut memory, "flush");
    assert_eq!(tex.data(), None);
}
