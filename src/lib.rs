//! A page-granular virtual-to-physical translation engine for a userspace
//! storage data path that pins DMA-capable memory and must resolve
//! process-local virtual addresses to bus addresses at I/O submission time.
//!
//! The engine keeps one authoritative [`mem_map::MemMap`] of currently
//! pinned 2 MiB pages (the *registration map*) and fans out presence
//! changes to any number of *derived maps*, each of which maintains its own
//! per-page translation. The one derived map this crate ships is
//! [`vtophys`], which resolves physical addresses from a segment table or
//! an OS pagemap fallback.
//!
//! # Quick start
//!
//! ```no_run
//! use vtophys::env::{MemorySegment, RealEnvironment};
//!
//! let env = RealEnvironment::new(vec![MemorySegment {
//!     virt_base: 0x20_0000,
//!     phys_base: 0x4000_0000,
//!     length: 0x40_0000,
//! }]);
//! vtophys::engine_init(env).expect("engine bring-up failed");
//!
//! let phys = vtophys::vtophys(0x20_0123);
//! assert_eq!(phys, 0x4000_0123);
//! ```

pub mod addr;
pub mod engine;
pub mod env;
pub mod error;
pub mod mem_map;
pub mod vtophys;

pub use engine::{Engine, engine, engine_init};
pub use env::{MemorySegment, PagemapOracle, RealEnvironment, SegmentSource};
pub use error::Error;
pub use mem_map::{Action, MemMap, Notifier};
pub use vtophys::ALL_ONES;

/// Register `[vaddr, vaddr + len)` as live DMA-capable memory with the
/// process-wide engine. See [`Engine::register`].
pub fn register(vaddr: u64, len: u64) -> Result<(), Error> {
    engine().register(vaddr, len)
}

/// Unregister `[vaddr, vaddr + len)`. See [`Engine::unregister`].
pub fn unregister(vaddr: u64, len: u64) -> Result<(), Error> {
    engine().unregister(vaddr, len)
}

/// Resolve the physical address backing `buf`, or [`ALL_ONES`] if `buf`
/// falls outside any registered region. See [`Engine::vtophys`].
pub fn vtophys(buf: u64) -> u64 {
    engine().vtophys(buf)
}
