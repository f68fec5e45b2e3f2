//! AMX JIT server plugin
//!
//! The C-linkage surface the host loads: `Supports`/`Load`/`Unload`, the
//! per-AMX load/unload notifications, and `ProcessTick`. The real work is
//! one hook: the interpreter's `Exec` export is rerouted into the JIT
//! engine, with the original kept as a trampoline for browse-mode queries
//! and for programs the compiler declines.

#![allow(non_snake_case)]

use std::os::raw::c_void;

use amxjit_engine::amx::raw::{Amx, AmxError, Cell, AMX_FLAG_BROWSE};

mod hook;
mod logger;
mod state;
mod timers;

pub use hook::{module_name, probe_detour, ExecHook};
pub use state::HostPluginState;
pub use timers::TimerQueue;

/// Plugin ABI version the host expects.
const SUPPORTS_VERSION: u32 = 0x0200;
/// The plugin wants `AmxLoad`/`AmxUnload` notifications.
const SUPPORTS_AMX_NATIVES: u32 = 0x10000;
/// The plugin wants `ProcessTick`.
const SUPPORTS_PROCESS_TICK: u32 = 0x20000;

/// `ppData` index of the host's `logprintf`.
const PLUGIN_DATA_LOGPRINTF: usize = 0x00;
/// `ppData` index of the AMX export table.
const PLUGIN_DATA_AMX_EXPORTS: usize = 0x10;

/// Longest sleep the plugin will schedule a continuation for; anything
/// larger is treated as a sentinel value, not a delay.
const MAX_SLEEP_MS: Cell = 3_600_000;

/// The hooked `amx_Exec`.
///
/// Browse-mode queries (the interpreter being asked for its opcode table)
/// pass straight through. A JIT refusal (`AMX_ERR_INIT_JIT`) falls back to
/// the original interpreter; a sleep schedules its continuation.
unsafe extern "C" fn amx_exec_jit(amx: *mut Amx, retval: *mut Cell, index: i32) -> i32 {
    let state = match HostPluginState::get() {
        Some(state) => state,
        None => return AmxError::InitJit as i32,
    };
    if (*amx).flags as u16 & AMX_FLAG_BROWSE != 0 {
        return (state.hook().original())(amx, retval, index);
    }

    let engine = &*state.engine(amx);
    let code = engine.exec(retval.as_mut(), index);
    if code == AmxError::InitJit as i32 {
        return (state.hook().original())(amx, retval, index);
    }
    if code == AmxError::Sleep as i32 {
        let delay = (*amx).pri;
        if (0..=MAX_SLEEP_MS).contains(&delay) {
            state.schedule_continuation(amx as usize, delay as u32);
        }
    }
    code
}

/// Query the stock interpreter for its opcode relocation table.
///
/// Computed-goto builds of the interpreter rewrite opcode cells into jump
/// addresses at load time; running a browse-mode exec before the hook is
/// installed hands back the table needed to undo that.
#[cfg(all(unix, target_arch = "x86"))]
unsafe fn query_opcode_table(exports: *mut *mut c_void) -> Option<Vec<Cell>> {
    use amxjit_engine::amx::raw::AmxExec;
    use amxjit_engine::bytecode::opcode::NUM_OPCODES;

    let exec: AmxExec = std::mem::transmute(*exports.add(hook::EXPORT_EXEC));
    let mut amx: Amx = std::mem::zeroed();
    amx.flags = AMX_FLAG_BROWSE as i32;
    let mut table_ptr: Cell = 0;
    exec(&mut amx, &mut table_ptr, 0);
    if table_ptr == 0 {
        return None;
    }
    let table = std::slice::from_raw_parts(table_ptr as usize as *const Cell, NUM_OPCODES);
    Some(table.to_vec())
}

#[cfg(not(all(unix, target_arch = "x86")))]
unsafe fn query_opcode_table(_exports: *mut *mut c_void) -> Option<Vec<Cell>> {
    None
}

/// Capability mask.
#[no_mangle]
pub extern "system" fn Supports() -> u32 {
    SUPPORTS_VERSION | SUPPORTS_AMX_NATIVES | SUPPORTS_PROCESS_TICK
}

/// Plugin entry point: wire the logger, refuse to load behind another exec
/// detour, grab the opcode table, and install the hook.
///
/// # Safety
///
/// Called by the host with its plugin data table.
#[no_mangle]
pub unsafe extern "system" fn Load(pp_data: *mut *mut c_void) -> bool {
    let logprintf: logger::Logprintf = std::mem::transmute(*pp_data.add(PLUGIN_DATA_LOGPRINTF));
    logger::init(logprintf);

    let exports = *pp_data.add(PLUGIN_DATA_AMX_EXPORTS) as *mut *mut c_void;
    let exec_entry = *exports.add(hook::EXPORT_EXEC) as *const u8;
    if let Some(target) = probe_detour(exec_entry) {
        match module_name(target) {
            Some(name) => log::error!("the JIT plugin must be loaded before '{name}'"),
            None => log::error!("another module already hooked the interpreter"),
        }
        return false;
    }

    let opcode_table = query_opcode_table(exports);
    let hook = ExecHook::install(exports, amx_exec_jit);
    if !HostPluginState::install(HostPluginState::new(hook, opcode_table)) {
        log::error!("plugin loaded twice");
        return false;
    }

    log::info!("JIT plugin v{} loaded", env!("CARGO_PKG_VERSION"));
    true
}

/// Plugin teardown: restore the exec export and drop every engine.
#[no_mangle]
pub extern "system" fn Unload() {
    if let Some(state) = HostPluginState::get() {
        state.drop_all_engines();
        state.hook().remove();
    }
    log::info!("JIT plugin unloaded");
}

/// A program was loaded. Compilation stays lazy; this only logs.
///
/// # Safety
///
/// Called by the host with a loaded AMX.
#[no_mangle]
pub unsafe extern "system" fn AmxLoad(amx: *mut Amx) -> i32 {
    log::debug!("AMX loaded at {amx:p}");
    AmxError::None as i32
}

/// A program is going away: free its engine and generated code.
///
/// # Safety
///
/// Called by the host with an AMX previously passed to `AmxLoad`.
#[no_mangle]
pub unsafe extern "system" fn AmxUnload(amx: *mut Amx) -> i32 {
    if let Some(state) = HostPluginState::get() {
        state.drop_engine(amx as usize);
    }
    AmxError::None as i32
}

/// Server tick: continue any script whose sleep has elapsed.
#[no_mangle]
pub extern "system" fn ProcessTick() {
    let state = match HostPluginState::get() {
        Some(state) => state,
        None => return,
    };
    for amx in state.take_due_continuations() {
        let engine = match state.existing_engine(amx) {
            Some(engine) => engine,
            None => continue,
        };
        let code = unsafe { (*engine).resume(None) };
        if code == AmxError::Sleep as i32 {
            let delay = unsafe { (*(amx as *mut Amx)).pri };
            if (0..=MAX_SLEEP_MS).contains(&delay) {
                state.schedule_continuation(amx, delay as u32);
            }
        } else if code != AmxError::None as i32 {
            log::warn!("continuation of {amx:#x} failed with error {code}");
        }
    }
}
