//! Process-wide plugin state
//!
//! The host gives us raw tables and raw `AMX` pointers; everything derived
//! from them lives behind one `HostPluginState`: the installed exec hook,
//! the shared executable-memory manager, the per-AMX engine registry, the
//! opcode relocation table, and the sleep continuation queue. There is
//! exactly one instance, created in `Load`.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use amxjit_engine::amx::raw::{Amx, Cell};
use amxjit_engine::bytecode::OpcodeTable;
use amxjit_engine::exec::{ExecEngine, SharedMemory};
use amxjit_engine::VirtualMemoryManager;

use crate::hook::ExecHook;
use crate::timers::TimerQueue;

static STATE: OnceCell<HostPluginState> = OnceCell::new();

struct EngineSlot(Box<ExecEngine>);

/// Everything the exported ABI functions reach for.
pub struct HostPluginState {
    hook: ExecHook,
    memory: SharedMemory,
    engines: Mutex<FxHashMap<usize, EngineSlot>>,
    opcode_table: Option<Vec<Cell>>,
    timers: Mutex<TimerQueue>,
}

// The host drives every entry point from its single script thread; the
// raw pointers inside never cross threads.
unsafe impl Send for HostPluginState {}
unsafe impl Sync for HostPluginState {}

impl HostPluginState {
    /// Build the state around an installed hook.
    pub fn new(hook: ExecHook, opcode_table: Option<Vec<Cell>>) -> HostPluginState {
        HostPluginState {
            hook,
            memory: Arc::new(Mutex::new(VirtualMemoryManager::new())),
            engines: Mutex::new(FxHashMap::default()),
            opcode_table,
            timers: Mutex::new(TimerQueue::new()),
        }
    }

    /// Publish the state. Fails if `Load` somehow ran twice.
    pub fn install(state: HostPluginState) -> bool {
        STATE.set(state).is_ok()
    }

    /// The installed state, if `Load` succeeded.
    pub fn get() -> Option<&'static HostPluginState> {
        STATE.get()
    }

    /// The exec hook.
    pub fn hook(&self) -> &ExecHook {
        &self.hook
    }

    /// Engine for `amx`, created on first use.
    ///
    /// The returned pointer stays valid until [`HostPluginState::drop_engine`];
    /// it is a raw pointer so a nested `amx_Exec` from a native can fetch
    /// the same engine without holding the registry lock.
    pub fn engine(&self, amx: *mut Amx) -> *const ExecEngine {
        let mut engines = self.engines.lock();
        let slot = engines.entry(amx as usize).or_insert_with(|| {
            log::debug!("creating JIT engine for AMX at {amx:p}");
            let reloc = self.opcode_table.clone().map(OpcodeTable::new);
            EngineSlot(Box::new(unsafe {
                ExecEngine::new(amx, Arc::clone(&self.memory), reloc)
            }))
        });
        &*slot.0 as *const ExecEngine
    }

    /// Engine for `amx` only if one exists already.
    pub fn existing_engine(&self, amx: usize) -> Option<*const ExecEngine> {
        self.engines
            .lock()
            .get(&amx)
            .map(|slot| &*slot.0 as *const ExecEngine)
    }

    /// Tear down the engine and any continuation for an unloading AMX.
    pub fn drop_engine(&self, amx: usize) {
        self.timers.lock().cancel(amx);
        if self.engines.lock().remove(&amx).is_some() {
            log::debug!("destroyed JIT engine for AMX at {amx:#x}");
        }
    }

    /// Drop every engine (plugin unload).
    pub fn drop_all_engines(&self) {
        self.timers.lock().cancel_all();
        self.engines.lock().clear();
    }

    /// Queue a sleep continuation.
    pub fn schedule_continuation(&self, amx: usize, delay_ms: u32) {
        log::debug!("scheduling continuation of {amx:#x} in {delay_ms} ms");
        self.timers.lock().schedule(amx, delay_ms);
    }

    /// Continuations whose deadline has passed.
    pub fn take_due_continuations(&self) -> Vec<usize> {
        self.timers.lock().take_due(std::time::Instant::now())
    }

    /// Live engine count, for diagnostics.
    pub fn engine_count(&self) -> usize {
        self.engines.lock().len()
    }
}
