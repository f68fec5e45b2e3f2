//! Runtime helpers called from generated code
//!
//! These run on the native stack after the calling template has parked the
//! VM registers in the context block. They are the only way generated code
//! re-enters Rust.

use crate::amx::raw::{AmxError, Cell};
use crate::compiler::context::JitContext;

/// Generic `SYSREQ` dispatch: route a native call through the AMX callback.
///
/// The calling template has already stored ALT/FRM/STK into the context and
/// switched to the native stack. Mirrors the VM registers into the `AMX` for
/// the native's benefit, invokes the callback, and mirrors the heap pointer
/// back (natives allocate through `amx_Allot`). A non-zero callback result
/// lands in `ctx.error`, which the template turns into a halt; sleeps
/// additionally capture the resume address.
///
/// # Safety
///
/// `ctx` must be the context of the currently running JIT execution; called
/// from generated code only.
pub unsafe extern "C" fn jit_sysreq(ctx: *mut JitContext, index: Cell, next_ip: Cell) -> Cell {
    let ctx = &mut *ctx;
    let amx = &mut *ctx.amx;

    amx.frm = ctx.frm;
    amx.stk = ctx.stk;
    amx.hea = ctx.hea;
    amx.alt = ctx.alt;
    amx.error = AmxError::None as i32;

    let params = ctx.data.add(ctx.stk as usize) as *mut Cell;
    let mut result: Cell = 0;
    let error = match amx.callback {
        Some(callback) => callback(amx, index, &mut result, params),
        None => AmxError::Callback as i32,
    };

    ctx.hea = amx.hea;
    if error != AmxError::None as i32 {
        ctx.error = error;
        if error == AmxError::Sleep as i32 {
            ctx.cip = next_ip;
            ctx.pri = result;
        }
    }
    result
}

/// Resolve a runtime-computed jump target through the code map.
///
/// Returns the absolute native address for the AMX address in `PRI`, or zero
/// when the address does not start an instruction; the template halts with
/// an invalid-instruction error on zero.
///
/// # Safety
///
/// `ctx` must be a live context whose `code_map`/`code_base` describe the
/// published program; called from generated code only.
pub unsafe extern "C" fn jit_jump_lookup(ctx: *mut JitContext, address: Cell) -> usize {
    let ctx = &*ctx;
    let map = &*ctx.code_map;
    match map.native_offset(address) {
        Some(offset) => ctx.code_base as usize + offset as usize,
        None => 0,
    }
}
