//! `MemMap`: a sparse, two-level virtual-address-keyed translation table.
//!
//! The top-level table has one slot per 1 GiB region of the 128 TiB
//! address space; mid-tables are allocated lazily, one per populated
//! 1 GiB region, each holding 512 page-granular translation slots. The
//! fast path (`translate`) never locks: mid-table publication goes
//! through an `AtomicPtr`, and slot values through an `AtomicU64`.

use std::sync::atomic::{AtomicPtr, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::addr::{self, MID_ENTRIES, TOP_ENTRIES};
use crate::error::Error;

/// Whether a coalesced run is appearing for the first time or disappearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Register,
    Unregister,
}

/// Observes presence transitions on the registration map.
///
/// `map` is the observing `MemMap` itself, passed explicitly rather than
/// stored inside the notifier; that sidesteps any `MemMap -> Notifier ->
/// MemMap` reference cycle entirely instead of requiring a non-owning
/// back-reference.
pub trait Notifier: Send + Sync {
    fn notify(&self, map: &MemMap, action: Action, vaddr: u64, len: u64) -> Result<(), Error>;
}

struct Slot {
    translation: AtomicU64,
    ref_count: AtomicU16,
}

impl Slot {
    fn new(default: u64) -> Self {
        Self {
            translation: AtomicU64::new(default),
            ref_count: AtomicU16::new(0),
        }
    }
}

struct MidTable {
    slots: Box<[Slot]>,
}

impl MidTable {
    fn new(default: u64) -> Box<Self> {
        let slots = (0..MID_ENTRIES).map(|_| Slot::new(default)).collect();
        Box::new(Self { slots })
    }
}

/// An independently owned translation map.
///
/// One instance (the registration map) tracks which pages are live; every
/// other instance is a *derived* map that mirrors a subset of that state
/// through a [`Notifier`].
pub struct MemMap {
    top: Vec<AtomicPtr<MidTable>>,
    alloc_lock: Mutex<()>,
    default_translation: u64,
    notifier: Option<Arc<dyn Notifier>>,
}

impl MemMap {
    pub fn new(default_translation: u64, notifier: Option<Arc<dyn Notifier>>) -> Self {
        let top = (0..TOP_ENTRIES)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        Self {
            top,
            alloc_lock: Mutex::new(()),
            default_translation,
            notifier,
        }
    }

    pub fn default_translation(&self) -> u64 {
        self.default_translation
    }

    pub fn has_notifier(&self) -> bool {
        self.notifier.is_some()
    }

    /// Lock-free read of the translation for a single page.
    pub fn translate(&self, vaddr: u64) -> u64 {
        if addr::has_high_bits(vaddr) {
            return self.default_translation;
        }
        let vfn = addr::vfn(vaddr);
        let ptr = self.top[addr::top_index(vfn)].load(Ordering::Acquire);
        if ptr.is_null() {
            return self.default_translation;
        }
        let mid = unsafe { &*ptr };
        mid.slots[addr::mid_index(vfn)].translation.load(Ordering::Acquire)
    }

    fn get_or_create_mid(&self, top_idx: usize) -> Result<&MidTable, Error> {
        let existing = self.top[top_idx].load(Ordering::Acquire);
        if !existing.is_null() {
            return Ok(unsafe { &*existing });
        }
        let _guard = self.alloc_lock.lock().unwrap();
        let existing = self.top[top_idx].load(Ordering::Acquire);
        if !existing.is_null() {
            return Ok(unsafe { &*existing });
        }
        let raw = Box::into_raw(MidTable::new(self.default_translation));
        self.top[top_idx].store(raw, Ordering::Release);
        Ok(unsafe { &*raw })
    }

    /// Write `value` to every 2 MiB page in `[vaddr, vaddr + size)`,
    /// allocating mid-tables as needed and bumping each slot's per-page
    /// reference count. Pages already written before a `Busy` failure
    /// keep their new value; there is no rollback.
    pub fn set_translation(&self, vaddr: u64, size: u64, value: u64) -> Result<(), Error> {
        addr::validate_range(vaddr, size)?;
        let mut cur = vaddr;
        let mut remaining = size;
        while remaining > 0 {
            let vfn = addr::vfn(cur);
            let mid = self.get_or_create_mid(addr::top_index(vfn))?;
            let slot = &mid.slots[addr::mid_index(vfn)];
            slot.ref_count
                .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |c| {
                    if c == u16::MAX {
                        None
                    } else {
                        Some(c + 1)
                    }
                })
                .map_err(|_| {
                    log::error!("ref count saturated at vaddr=0x{cur:x}");
                    Error::Busy
                })?;
            slot.translation.store(value, Ordering::Release);
            cur += addr::PAGE_SIZE;
            remaining -= addr::PAGE_SIZE;
        }
        Ok(())
    }

    /// Decrement the reference count for every 2 MiB page in
    /// `[vaddr, vaddr + size)`; a slot whose count reaches zero is reset
    /// to this map's default translation.
    pub fn clear_translation(&self, vaddr: u64, size: u64) -> Result<(), Error> {
        addr::validate_range(vaddr, size)?;
        let mut cur = vaddr;
        let mut remaining = size;
        while remaining > 0 {
            let vfn = addr::vfn(cur);
            let top_idx = addr::top_index(vfn);
            let ptr = self.top[top_idx].load(Ordering::Acquire);
            if ptr.is_null() {
                return Err(Error::InvalidArg);
            }
            let mid = unsafe { &*ptr };
            let slot = &mid.slots[addr::mid_index(vfn)];
            let prev = slot
                .ref_count
                .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |c| {
                    if c == 0 {
                        None
                    } else {
                        Some(c - 1)
                    }
                })
                .map_err(|_| Error::InvalidArg)?;
            if prev == 1 {
                slot.translation.store(self.default_translation, Ordering::Release);
            }
            cur += addr::PAGE_SIZE;
            remaining -= addr::PAGE_SIZE;
        }
        Ok(())
    }

    /// Decrement a single page's per-slot ref-count and overwrite its
    /// translation with `value` in the same step, requiring the mid-table
    /// to already exist and the ref-count to be non-zero.
    ///
    /// Unlike `set_translation`/`clear_translation` (which always move the
    /// ref-count in one fixed direction — up on a write, down to the
    /// default on a clear — this lets a caller write an arbitrary
    /// translation value *while* decrementing, which the registration map
    /// needs: its translation field doubles as the logical outstanding-
    /// registration count, so `unregister` must decrement the ref-count
    /// and the translation together or the two diverge.
    pub(crate) fn decrement_and_store(&self, vaddr: u64, size: u64, value: u64) -> Result<(), Error> {
        addr::validate_range(vaddr, size)?;
        let mut cur = vaddr;
        let mut remaining = size;
        while remaining > 0 {
            let vfn = addr::vfn(cur);
            let top_idx = addr::top_index(vfn);
            let ptr = self.top[top_idx].load(Ordering::Acquire);
            if ptr.is_null() {
                return Err(Error::InvalidArg);
            }
            let mid = unsafe { &*ptr };
            let slot = &mid.slots[addr::mid_index(vfn)];
            slot.ref_count
                .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |c| {
                    if c == 0 { None } else { Some(c - 1) }
                })
                .map_err(|_| Error::InvalidArg)?;
            slot.translation.store(value, Ordering::Release);
            cur += addr::PAGE_SIZE;
            remaining -= addr::PAGE_SIZE;
        }
        Ok(())
    }

    /// The per-slot ref-count backing a page, or 0 if its mid-table was
    /// never allocated. Test-only: production code never needs to read
    /// this counter directly, only `translate`'s 64-bit value.
    #[cfg(test)]
    pub(crate) fn ref_count(&self, vaddr: u64) -> u16 {
        let vfn = addr::vfn(vaddr);
        let ptr = self.top[addr::top_index(vfn)].load(Ordering::Acquire);
        if ptr.is_null() {
            return 0;
        }
        let mid = unsafe { &*ptr };
        mid.slots[addr::mid_index(vfn)].ref_count.load(Ordering::Acquire)
    }

    /// Dispatch a presence transition to this map's notifier, if any.
    pub(crate) fn notify(&self, action: Action, vaddr: u64, len: u64) -> Result<(), Error> {
        match &self.notifier {
            Some(n) => n.notify(self, action, vaddr, len),
            None => Ok(()),
        }
    }

    /// Walk the sparse table in ascending address order, coalescing
    /// contiguous present pages (translation != default) into runs and
    /// invoking `f` once per run. Used to replay the registration map's
    /// current state onto a freshly created or about-to-be-destroyed
    /// derived map.
    pub(crate) fn for_each_present_run(
        &self,
        mut f: impl FnMut(u64, u64) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let mut run_start: Option<u64> = None;
        let mut run_len: u64 = 0;
        for top_idx in 0..TOP_ENTRIES {
            let ptr = self.top[top_idx].load(Ordering::Acquire);
            let Some(mid) = (unsafe { ptr.as_ref() }) else {
                if let Some(start) = run_start.take() {
                    f(start, run_len)?;
                    run_len = 0;
                }
                continue;
            };
            for mid_idx in 0..MID_ENTRIES {
                let present =
                    mid.slots[mid_idx].translation.load(Ordering::Acquire) != self.default_translation;
                let vaddr = addr::vaddr_from(top_idx, mid_idx);
                if present {
                    if run_start.is_none() {
                        run_start = Some(vaddr);
                    }
                    run_len += addr::PAGE_SIZE;
                } else if let Some(start) = run_start.take() {
                    f(start, run_len)?;
                    run_len = 0;
                }
            }
        }
        if let Some(start) = run_start {
            f(start, run_len)?;
        }
        Ok(())
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        log::debug!("freeing memory map, notifier={}", self.notifier.is_some());
        for slot in &self.top {
            let ptr = slot.load(Ordering::Acquire);
            if !ptr.is_null() {
                unsafe {
                    drop(Box::from_raw(ptr));
                }
            }
        }
    }
}

/// Replay the registration map's current presence state onto `target` as
/// a sequence of `action` notifications, in ascending address order.
pub(crate) fn replay(registration_map: &MemMap, target: &MemMap, action: Action) -> Result<(), Error> {
    registration_map.for_each_present_run(|vaddr, len| target.notify(action, vaddr, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_map_returns_default() {
        let map = MemMap::new(0xDEAD, None);
        assert_eq!(map.translate(0), 0xDEAD);
        assert_eq!(map.translate(addr::PAGE_SIZE * 1000), 0xDEAD);
    }

    #[test]
    fn set_and_translate_round_trip() {
        let map = MemMap::new(0, None);
        map.set_translation(addr::PAGE_SIZE, addr::PAGE_SIZE, 0x9000).unwrap();
        assert_eq!(map.translate(addr::PAGE_SIZE), 0x9000);
        assert_eq!(map.translate(0), 0);
    }

    #[test]
    fn clear_without_prior_set_is_invalid() {
        let map = MemMap::new(0, None);
        assert_eq!(
            map.clear_translation(addr::PAGE_SIZE, addr::PAGE_SIZE),
            Err(Error::InvalidArg)
        );
    }

    #[test]
    fn clear_resets_to_default_only_at_zero() {
        let map = MemMap::new(0, None);
        map.set_translation(0, addr::PAGE_SIZE, 1).unwrap();
        map.set_translation(0, addr::PAGE_SIZE, 2).unwrap();
        map.clear_translation(0, addr::PAGE_SIZE).unwrap();
        // ref_count went 0->1->2->1, translation is still whatever was last written
        assert_eq!(map.translate(0), 2);
        map.clear_translation(0, addr::PAGE_SIZE).unwrap();
        assert_eq!(map.translate(0), 0);
    }

    #[test]
    fn spans_a_mid_table_boundary() {
        let map = MemMap::new(0, None);
        let vaddr = addr::vaddr_from(0, addr::MID_ENTRIES - 1);
        map.set_translation(vaddr, addr::PAGE_SIZE * 2, 7).unwrap();
        assert_eq!(map.translate(vaddr), 7);
        assert_eq!(map.translate(vaddr + addr::PAGE_SIZE), 7);
    }

    #[test]
    fn for_each_present_run_coalesces() {
        let map = MemMap::new(0, None);
        map.set_translation(0, addr::PAGE_SIZE * 3, 1).unwrap();
        map.set_translation(addr::PAGE_SIZE * 10, addr::PAGE_SIZE, 1).unwrap();
        let mut runs = Vec::new();
        map.for_each_present_run(|vaddr, len| {
            runs.push((vaddr, len));
            Ok(())
        })
        .unwrap();
        assert_eq!(runs, vec![(0, addr::PAGE_SIZE * 3), (addr::PAGE_SIZE * 10, addr::PAGE_SIZE)]);
    }
}
