//! The engine facade: the registration map, the observer set of derived
//! maps, and the `register`/`unregister`/`vtophys` protocol that ties
//! them together.

use std::sync::{Arc, Mutex, OnceLock};

use crate::addr;
use crate::env::{PagemapOracle, SegmentSource};
use crate::error::Error;
use crate::mem_map::{self, Action, MemMap, Notifier};
use crate::vtophys::{VtophysNotifier, ALL_ONES};

static ENGINE: OnceLock<Engine> = OnceLock::new();

/// The process-wide translation engine.
///
/// Holds the registration map (the authoritative "is this page live"
/// record), the built-in vtophys derived map, and the ordered set of
/// every other derived map currently registered for notifications.
pub struct Engine {
    registration_map: Arc<MemMap>,
    vtophys_map: OnceLock<Arc<MemMap>>,
    observers: Mutex<Vec<Arc<MemMap>>>,
}

impl Engine {
    /// Build a standalone engine over `env`, independent of the
    /// process-wide singleton. [`engine_init`] is the only public entry
    /// point that wires an `Engine` into that singleton; this constructor
    /// exists so tests can hold several independent engines side by side
    /// instead of fighting over one global.
    pub fn bootstrap<E>(env: E) -> Result<Engine, Error>
    where
        E: SegmentSource + PagemapOracle + Send + Sync + 'static,
    {
        let engine = Engine {
            registration_map: Arc::new(MemMap::new(0, None)),
            vtophys_map: OnceLock::new(),
            observers: Mutex::new(Vec::new()),
        };

        for seg in env.segments() {
            if seg.virt_base == 0 {
                break;
            }
            log::debug!(
                "registering boot segment vaddr=0x{:x} len=0x{:x}",
                seg.virt_base,
                seg.length
            );
            engine.register(seg.virt_base, seg.length)?;
        }

        let env = Arc::new(env);
        let notifier: Arc<dyn Notifier> = Arc::new(VtophysNotifier::new(env));
        let vtophys_map = engine.create_derived_map(ALL_ONES, Some(notifier))?;
        engine
            .vtophys_map
            .set(vtophys_map)
            .unwrap_or_else(|_| panic!("vtophys map initialized twice"));

        Ok(engine)
    }

    /// Create a new derived map. If `notifier` is present, the map is
    /// immediately replayed with `Register` for every page the
    /// registration map currently considers live, then added to the
    /// observer set under the same registry lock.
    pub fn create_derived_map(
        &self,
        default_translation: u64,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Result<Arc<MemMap>, Error> {
        let mut observers = self.observers.lock().unwrap();
        let map = Arc::new(MemMap::new(default_translation, notifier));
        log::debug!(
            "creating derived map default=0x{:x} notifier={}",
            default_translation,
            map.has_notifier()
        );
        if map.has_notifier() {
            mem_map::replay(&self.registration_map, &map, Action::Register).inspect_err(|e| {
                log::error!("derived map replay on creation failed: {e}");
            })?;
        }
        observers.push(map.clone());
        Ok(map)
    }

    /// Remove a derived map from the observer set and, if it had a
    /// notifier, replay `Unregister` for every page still live so the
    /// observer's external state (e.g. an IOMMU mapping) is torn down
    /// cleanly before the map itself is dropped.
    pub fn destroy_derived_map(&self, map: &Arc<MemMap>) -> Result<(), Error> {
        let mut observers = self.observers.lock().unwrap();
        log::debug!("destroying derived map notifier={}", map.has_notifier());
        if let Some(pos) = observers.iter().position(|m| Arc::ptr_eq(m, map)) {
            observers.remove(pos);
        }
        if map.has_notifier() {
            mem_map::replay(&self.registration_map, map, Action::Unregister).inspect_err(|e| {
                log::error!("derived map replay on destruction failed: {e}");
            })?;
        }
        Ok(())
    }

    /// Register `[vaddr, vaddr + len)` as live DMA-capable memory.
    ///
    /// Holds the registry lock for the whole call: the registration map
    /// is updated page by page, and contiguous 0-\>1 transitions are
    /// coalesced into a single notification per observer, dispatched in
    /// the observers' insertion order. A failure partway through leaves
    /// every page touched so far registered; there is no rollback.
    pub fn register(&self, vaddr: u64, len: u64) -> Result<(), Error> {
        addr::validate_range(vaddr, len)?;
        let observers = self.observers.lock().unwrap();

        let mut cur = vaddr;
        let mut remaining = len;
        let mut run_start: Option<u64> = None;
        let mut run_len: u64 = 0;

        while remaining > 0 {
            let count = self.registration_map.translate(cur);
            self.registration_map
                .set_translation(cur, addr::PAGE_SIZE, count + 1)?;
            if count == 0 {
                if run_start.is_none() {
                    run_start = Some(cur);
                }
                run_len += addr::PAGE_SIZE;
            } else {
                dispatch(&observers, Action::Register, run_start.take(), run_len)?;
                run_len = 0;
            }
            cur += addr::PAGE_SIZE;
            remaining -= addr::PAGE_SIZE;
        }
        dispatch(&observers, Action::Register, run_start, run_len)?;
        log::trace!("registered vaddr=0x{:x} len=0x{:x}", vaddr, len);
        Ok(())
    }

    /// Unregister `[vaddr, vaddr + len)`.
    ///
    /// Validates that every page in the range is currently registered
    /// before mutating anything, so a malformed range fails atomically
    /// rather than partially unregistering.
    pub fn unregister(&self, vaddr: u64, len: u64) -> Result<(), Error> {
        addr::validate_range(vaddr, len)?;
        let observers = self.observers.lock().unwrap();

        let mut cur = vaddr;
        let mut remaining = len;
        while remaining > 0 {
            if self.registration_map.translate(cur) == 0 {
                return Err(Error::InvalidArg);
            }
            cur += addr::PAGE_SIZE;
            remaining -= addr::PAGE_SIZE;
        }

        cur = vaddr;
        remaining = len;
        let mut run_start: Option<u64> = None;
        let mut run_len: u64 = 0;
        while remaining > 0 {
            let count = self.registration_map.translate(cur);
            self.registration_map
                .decrement_and_store(cur, addr::PAGE_SIZE, count - 1)?;
            if count == 1 {
                if run_start.is_none() {
                    run_start = Some(cur);
                }
                run_len += addr::PAGE_SIZE;
            } else {
                dispatch(&observers, Action::Unregister, run_start.take(), run_len)?;
                run_len = 0;
            }
            cur += addr::PAGE_SIZE;
            remaining -= addr::PAGE_SIZE;
        }
        dispatch(&observers, Action::Unregister, run_start, run_len)?;
        log::trace!("unregistered vaddr=0x{:x} len=0x{:x}", vaddr, len);
        Ok(())
    }

    /// Translate `buf` through the built-in vtophys map. The intra-page
    /// offset is ORed back in, and `vaddr` is never itself a valid bit
    /// pattern for the all-ones sentinel, so an unresolved address still
    /// reads back as all-ones rather than a plausible-looking value.
    pub fn vtophys(&self, buf: u64) -> u64 {
        let map = self
            .vtophys_map
            .get()
            .expect("vtophys map missing after bootstrap");
        map.translate(buf) | (buf & addr::MASK_2MB)
    }

    pub fn registration_map(&self) -> &Arc<MemMap> {
        &self.registration_map
    }

    pub fn vtophys_map(&self) -> &Arc<MemMap> {
        self.vtophys_map.get().expect("vtophys map missing after bootstrap")
    }
}

fn dispatch(
    observers: &[Arc<MemMap>],
    action: Action,
    run_start: Option<u64>,
    run_len: u64,
) -> Result<(), Error> {
    let Some(start) = run_start else {
        return Ok(());
    };
    if run_len == 0 {
        return Ok(());
    }
    for observer in observers {
        log::trace!(
            "dispatching {action:?} vaddr=0x{start:x} len=0x{run_len:x} to observer"
        );
        observer.notify(action, start, run_len).inspect_err(|e| {
            log::error!("observer notify failed for {action:?} vaddr=0x{start:x}: {e}");
        })?;
    }
    Ok(())
}

/// Initialize the process-wide engine from `env`. Idempotent: once the
/// engine has been initialized, later calls return the existing instance
/// without re-running bootstrap.
pub fn engine_init<E>(env: E) -> Result<&'static Engine, Error>
where
    E: SegmentSource + PagemapOracle + Send + Sync + 'static,
{
    if let Some(engine) = ENGINE.get() {
        return Ok(engine);
    }
    log::info!("initializing translation engine");
    let built = Engine::bootstrap(env)?;
    Ok(ENGINE.get_or_init(|| built))
}

/// Borrow the process-wide engine.
///
/// # Panics
/// Panics if [`engine_init`] has not yet completed successfully.
pub fn engine() -> &'static Engine {
    ENGINE.get().expect("engine_init must run before using the translation engine")
}
