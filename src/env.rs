//! Environment abstraction: the engine's external collaborators.
//!
//! The core never discovers hugepage memory or walks `/proc/self/pagemap`
//! itself; it consumes two small traits. `RealEnvironment` backs them with
//! the host's actual Linux pagemap; `MockEnvironment` is a programmable
//! stand-in used by every test in this crate. This mirrors the split this
//! codebase already used for time/cpu access.

use std::collections::HashMap;
use std::sync::Mutex;

/// One contiguous virtual-to-physical region known up front (e.g. a
/// hugepage segment handed to the engine at start-up).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySegment {
    pub virt_base: u64,
    pub phys_base: u64,
    pub length: u64,
}

/// Supplies the engine with the set of pre-known virtual/physical regions.
///
/// A `virt_base == 0` entry terminates the list early, mirroring how a
/// fixed-size segment table signals "no more entries" without requiring a
/// separate length.
pub trait SegmentSource: Send + Sync {
    fn segments(&self) -> &[MemorySegment];
}

/// Supplies the engine with an OS-level virtual-to-physical oracle for
/// addresses outside the known segment table.
pub trait PagemapOracle: Send + Sync {
    /// Resolve `vaddr` to a physical address, or `0` if the page is not
    /// currently backed (not yet faulted in).
    fn virt_to_phys(&self, vaddr: u64) -> u64;

    /// Touch `vaddr` (e.g. a volatile read) to force the page to be
    /// faulted in before a retried `virt_to_phys` call.
    fn touch(&self, vaddr: u64);
}

/// The production environment: a caller-supplied segment table plus the
/// real OS pagemap.
pub struct RealEnvironment {
    segments: Vec<MemorySegment>,
}

impl RealEnvironment {
    pub fn new(segments: Vec<MemorySegment>) -> Self {
        Self { segments }
    }
}

impl SegmentSource for RealEnvironment {
    fn segments(&self) -> &[MemorySegment] {
        &self.segments
    }
}

#[cfg(all(target_os = "linux", feature = "hugepage-env"))]
impl PagemapOracle for RealEnvironment {
    fn virt_to_phys(&self, vaddr: u64) -> u64 {
        linux_pagemap::read(vaddr).unwrap_or(0)
    }

    fn touch(&self, vaddr: u64) {
        unsafe {
            let ptr = vaddr as *const u8;
            std::ptr::read_volatile(ptr);
        }
    }
}

#[cfg(not(all(target_os = "linux", feature = "hugepage-env")))]
impl PagemapOracle for RealEnvironment {
    fn virt_to_phys(&self, _vaddr: u64) -> u64 {
        0
    }

    fn touch(&self, _vaddr: u64) {}
}

#[cfg(all(target_os = "linux", feature = "hugepage-env"))]
mod linux_pagemap {
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom};

    const PAGEMAP_PAGE_SHIFT: u32 = 12;
    const PRESENT_BIT: u64 = 1 << 63;
    const PFN_MASK: u64 = (1 << 55) - 1;

    /// Reads `/proc/self/pagemap` for `vaddr`, returning the resolved
    /// physical address or `None` if the page isn't present.
    pub fn read(vaddr: u64) -> Option<u64> {
        let page_index = vaddr >> PAGEMAP_PAGE_SHIFT;
        let offset = page_index * 8;
        let mut file = File::open("/proc/self/pagemap").ok()?;
        file.seek(SeekFrom::Start(offset)).ok()?;
        let mut buf = [0u8; 8];
        file.read_exact(&mut buf).ok()?;
        let entry = u64::from_le_bytes(buf);
        if entry & PRESENT_BIT == 0 {
            return None;
        }
        let pfn = entry & PFN_MASK;
        Some((pfn << PAGEMAP_PAGE_SHIFT) | (vaddr & ((1 << PAGEMAP_PAGE_SHIFT) - 1)))
    }
}

/// A scripted environment for tests: a fixed segment table plus a queue of
/// pagemap responses per address, so a test can reproduce the
/// "unfaulted, then present after touch" sequence.
///
/// The segment table is fixed at construction time (mirroring how a real
/// hugepage segment table is built once before the engine starts); only
/// the pagemap responses and touch log use interior mutability, since
/// those are queried from the lock-free-ish notify path.
pub struct MockEnvironment {
    segments: Vec<MemorySegment>,
    responses: Mutex<HashMap<u64, Vec<u64>>>,
    touches: Mutex<Vec<u64>>,
}

impl MockEnvironment {
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            responses: Mutex::new(HashMap::new()),
            touches: Mutex::new(Vec::new()),
        }
    }

    pub fn with_segments(segments: Vec<MemorySegment>) -> Self {
        Self {
            segments,
            responses: Mutex::new(HashMap::new()),
            touches: Mutex::new(Vec::new()),
        }
    }

    pub fn push_segment(&mut self, segment: MemorySegment) {
        self.segments.push(segment);
    }

    /// Program the sequence of `virt_to_phys(vaddr)` results. The last
    /// value in the sequence repeats once exhausted.
    pub fn program_pagemap(&self, vaddr: u64, responses: impl IntoIterator<Item = u64>) {
        self.responses
            .lock()
            .unwrap()
            .insert(vaddr, responses.into_iter().collect());
    }

    pub fn touch_count(&self, vaddr: u64) -> usize {
        self.touches.lock().unwrap().iter().filter(|&&v| v == vaddr).count()
    }
}

impl Default for MockEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentSource for MockEnvironment {
    fn segments(&self) -> &[MemorySegment] {
        &self.segments
    }
}

impl PagemapOracle for MockEnvironment {
    fn virt_to_phys(&self, vaddr: u64) -> u64 {
        let mut responses = self.responses.lock().unwrap();
        match responses.get_mut(&vaddr) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) => queue[0],
            None => 0,
        }
    }

    fn touch(&self, vaddr: u64) {
        self.touches.lock().unwrap().push(vaddr);
    }
}
