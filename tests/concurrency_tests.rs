//! Concurrent registration/translation: many OS threads driving
//! `register`/`unregister`/`translate` against one engine, verifying the
//! lock-free read path never observes a torn or missing translation for a
//! page that is currently held.

use std::sync::Arc;
use std::thread;

use vtophys::env::{MemorySegment, MockEnvironment};
use vtophys::Engine;

const PAGE: u64 = 1 << 21;

#[test]
fn concurrent_register_of_disjoint_regions_is_all_observed() {
    // One large segment covers every address the threads below will touch,
    // so the built-in vtophys notifier can resolve each page without
    // needing a programmed pagemap response.
    let env = MockEnvironment::with_segments(vec![MemorySegment {
        virt_base: 0x10_0000_0000,
        phys_base: 0x20_0000_0000,
        length: PAGE * 16 * 8,
    }]);
    let engine = Arc::new(Engine::bootstrap(env).unwrap());

    let handles: Vec<_> = (0..8u64)
        .map(|i| {
            let engine = engine.clone();
            thread::spawn(move || {
                let base = 0x10_0000_0000u64 + i * PAGE * 16;
                engine.register(base, PAGE * 16).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for i in 0..8u64 {
        let base = 0x10_0000_0000u64 + i * PAGE * 16;
        for p in 0..16 {
            assert_eq!(engine.registration_map().translate(base + p * PAGE), 1);
        }
    }
}

#[test]
fn translate_reads_never_see_a_torn_or_missing_page_once_registered() {
    let env = MockEnvironment::with_segments(vec![MemorySegment {
        virt_base: 0x400000,
        phys_base: 0x8000_0000,
        length: PAGE,
    }]);
    // 0xA00000 isn't in the segment table; this constant pagemap answer
    // (never queued/exhausted, since the sequence has one element) lets
    // the writer toggle it on and off repeatedly via the fallback path.
    env.program_pagemap(0xA00000, [0x9000_0000]);
    let engine = Arc::new(Engine::bootstrap(env).unwrap());
    // the boot segment is already registered by bootstrap; spin up readers
    // that hammer the lock-free fast path while a writer toggles another
    // page on and off.
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let reader = {
        let engine = engine.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let v = engine.vtophys(0x400123);
                assert_eq!(v, 0x8000_0123);
            }
        })
    };

    let writer = {
        let engine = engine.clone();
        thread::spawn(move || {
            for _ in 0..2000 {
                engine.register(0xA00000, PAGE).unwrap();
                engine.unregister(0xA00000, PAGE).unwrap();
            }
        })
    };

    writer.join().unwrap();
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    reader.join().unwrap();
}

#[test]
fn derived_map_creation_is_serialized_with_registration() {
    let env = MockEnvironment::new();
    // No segment table; every page is resolved through the pagemap
    // fallback, so give each one a fixed answer up front.
    for i in 1..=50u64 {
        env.program_pagemap(i * PAGE, [0x40_0000_0000 + i * PAGE]);
    }
    let engine = Arc::new(Engine::bootstrap(env).unwrap());

    let writer = {
        let engine = engine.clone();
        thread::spawn(move || {
            for i in 1..=50u64 {
                engine.register(i * PAGE, PAGE).unwrap();
            }
        })
    };
    writer.join().unwrap();

    assert_eq!(engine.registration_map().translate(50 * PAGE), 1);

    // A map created strictly after registration completes is replayed
    // with the whole contiguous range as a single coalesced run.
    struct Recorder(Arc<std::sync::Mutex<Vec<(u64, u64)>>>);
    impl vtophys::Notifier for Recorder {
        fn notify(
            &self,
            _map: &vtophys::MemMap,
            action: vtophys::Action,
            vaddr: u64,
            len: u64,
        ) -> Result<(), vtophys::Error> {
            assert_eq!(action, vtophys::Action::Register);
            self.0.lock().unwrap().push((vaddr, len));
            Ok(())
        }
    }
    let recorded = Arc::new(std::sync::Mutex::new(Vec::new()));
    engine
        .create_derived_map(0, Some(Arc::new(Recorder(recorded.clone()))))
        .unwrap();
    assert_eq!(*recorded.lock().unwrap(), vec![(PAGE, 50 * PAGE)]);
}
