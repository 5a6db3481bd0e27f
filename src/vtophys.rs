//! The vtophys map: a derived map whose notifier resolves each newly
//! registered page's physical address, first by scanning the known
//! segment table, then by falling back to the OS pagemap.

use std::sync::Arc;

use crate::addr;
use crate::env::{PagemapOracle, SegmentSource};
use crate::error::Error;
use crate::mem_map::{Action, MemMap, Notifier};

/// Default translation for the vtophys map: preserved by `vtophys()`'s OR
/// so an unresolved address reads back as all-ones rather than a
/// plausible-looking zero.
pub const ALL_ONES: u64 = addr::ALL_ONES;

/// Resolve the physical address of a single already-validated 2 MiB page.
fn resolve_phys<E: SegmentSource + PagemapOracle + ?Sized>(env: &E, vaddr: u64) -> Result<u64, Error> {
    for seg in env.segments() {
        if seg.virt_base == 0 {
            break;
        }
        if vaddr >= seg.virt_base && vaddr < seg.virt_base + seg.length {
            return Ok(seg.phys_base + (vaddr - seg.virt_base));
        }
    }

    let mut phys = env.virt_to_phys(vaddr);
    if phys == 0 {
        log::warn!("vaddr=0x{vaddr:x} not yet faulted in, touching and retrying pagemap lookup");
        env.touch(vaddr);
        phys = env.virt_to_phys(vaddr);
    }
    if phys == 0 || phys == addr::ALL_ONES {
        log::error!("vaddr=0x{vaddr:x} has no resolvable physical address");
        return Err(Error::Fault);
    }
    if !addr::is_page_aligned(phys) {
        return Err(Error::InvalidArg);
    }
    Ok(phys)
}

/// The vtophys map's notifier: on `Register`, resolves and writes each
/// page's physical address; on `Unregister`, just clears the slot.
pub struct VtophysNotifier<E> {
    env: Arc<E>,
}

impl<E> VtophysNotifier<E> {
    pub fn new(env: Arc<E>) -> Self {
        Self { env }
    }
}

impl<E: SegmentSource + PagemapOracle> Notifier for VtophysNotifier<E> {
    fn notify(&self, map: &MemMap, action: Action, vaddr: u64, len: u64) -> Result<(), Error> {
        let mut cur = vaddr;
        let mut remaining = len;
        while remaining > 0 {
            match action {
                Action::Register => {
                    let phys = resolve_phys(&*self.env, cur)?;
                    map.set_translation(cur, addr::PAGE_SIZE, phys)?;
                }
                Action::Unregister => {
                    map.clear_translation(cur, addr::PAGE_SIZE)?;
                }
            }
            cur += addr::PAGE_SIZE;
            remaining -= addr::PAGE_SIZE;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{MemorySegment, MockEnvironment};

    #[test]
    fn resolves_from_segment_table() {
        let env = MockEnvironment::with_segments(vec![MemorySegment {
            virt_base: 0x1000_0000,
            phys_base: 0x2000_0000,
            length: addr::PAGE_SIZE * 4,
        }]);
        let phys = resolve_phys(&env, 0x1000_0000 + addr::PAGE_SIZE).unwrap();
        assert_eq!(phys, 0x2000_0000 + addr::PAGE_SIZE);
    }

    #[test]
    fn falls_back_to_pagemap_with_touch_retry() {
        let env = MockEnvironment::new();
        let vaddr = 0x5000_0000u64;
        env.program_pagemap(vaddr, [0, 0x9000_0000]);
        let phys = resolve_phys(&env, vaddr).unwrap();
        assert_eq!(phys, 0x9000_0000);
        assert_eq!(env.touch_count(vaddr), 1);
    }

    #[test]
    fn misaligned_pagemap_result_is_rejected() {
        let env = MockEnvironment::new();
        let vaddr = 0x5000_0000u64;
        env.program_pagemap(vaddr, [0x9000_1000]);
        assert_eq!(resolve_phys(&env, vaddr), Err(Error::InvalidArg));
    }

    #[test]
    fn persistent_fault_is_reported() {
        let env = MockEnvironment::new();
        let vaddr = 0x5000_0000u64;
        env.program_pagemap(vaddr, [0]);
        assert_eq!(resolve_phys(&env, vaddr), Err(Error::Fault));
    }
}
