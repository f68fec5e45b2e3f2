//! Per-execution runtime context
//!
//! The control block generated code addresses through its pinned context
//! register. Everything the templates need at run time lives here: the VM
//! register mirrors, the saved native stack pointers the halt path unwinds
//! to, and the helper function table native calls go through.
//!
//! The layout is `repr(C)` and the field offsets below are baked into
//! emitted instructions, so this struct is ABI, not just state.

use crate::amx::raw::{Amx, Cell};
use crate::compiler::code_map::CodeMap;
use crate::compiler::runtime;

/// Native-call helper: `(ctx, native_index, next_ip) -> PRI`.
pub type SysreqFn = unsafe extern "C" fn(*mut JitContext, Cell, Cell) -> Cell;

/// Computed-jump helper: `(ctx, amx_address) -> native address or 0`.
pub type JumpLookupFn = unsafe extern "C" fn(*mut JitContext, Cell) -> usize;

/// Function pointers generated code calls through the context register.
#[repr(C)]
pub struct HelperTable {
    /// Generic `SYSREQ` dispatch.
    pub sysreq: SysreqFn,
    /// `JUMP.pri` / `SCTRL 6` target lookup.
    pub jump_lookup: JumpLookupFn,
}

/// The control block pinned to the context register while JIT code runs.
#[repr(C)]
pub struct JitContext {
    /// The AMX this execution belongs to.
    pub amx: *mut Amx,
    /// Data section base; also pinned in a register.
    pub data: *mut u8,
    /// Base of the published native code.
    pub code_base: *const u8,
    /// Code map for runtime-computed jumps.
    pub code_map: *const CodeMap,
    /// PRI mirror: loaded at entry, stored at exit and around sleeps.
    pub pri: Cell,
    /// ALT mirror.
    pub alt: Cell,
    /// FRM mirror, data-relative.
    pub frm: Cell,
    /// STK mirror, data-relative.
    pub stk: Cell,
    /// Live heap top, data-relative.
    pub hea: Cell,
    /// Resume address captured when a sleep unwinds.
    pub cip: Cell,
    /// Error code the halt path reports; zero while running.
    pub error: i32,
    /// Native stack pointer saved by the entry trampoline.
    pub saved_esp: usize,
    /// Native frame pointer saved by the entry trampoline.
    pub saved_ebp: usize,
    /// Runtime helpers.
    pub helpers: HelperTable,
}

/// VM-visible context fields, saved around nested executions.
#[derive(Clone, Copy)]
pub struct ContextSnapshot {
    pri: Cell,
    alt: Cell,
    frm: Cell,
    stk: Cell,
    hea: Cell,
    cip: Cell,
    error: i32,
    saved_esp: usize,
    saved_ebp: usize,
}

impl JitContext {
    /// Fresh context for a published program.
    pub fn new(
        amx: *mut Amx,
        data: *mut u8,
        code_base: *const u8,
        code_map: *const CodeMap,
    ) -> JitContext {
        JitContext {
            amx,
            data,
            code_base,
            code_map,
            pri: 0,
            alt: 0,
            frm: 0,
            stk: 0,
            hea: 0,
            cip: 0,
            error: 0,
            saved_esp: 0,
            saved_ebp: 0,
            helpers: HelperTable {
                sysreq: runtime::jit_sysreq,
                jump_lookup: runtime::jit_jump_lookup,
            },
        }
    }

    /// Save the mutable fields before a nested entry clobbers them.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            pri: self.pri,
            alt: self.alt,
            frm: self.frm,
            stk: self.stk,
            hea: self.hea,
            cip: self.cip,
            error: self.error,
            saved_esp: self.saved_esp,
            saved_ebp: self.saved_ebp,
        }
    }

    /// Restore fields saved by [`JitContext::snapshot`].
    pub fn restore(&mut self, snapshot: ContextSnapshot) {
        self.pri = snapshot.pri;
        self.alt = snapshot.alt;
        self.frm = snapshot.frm;
        self.stk = snapshot.stk;
        self.hea = snapshot.hea;
        self.cip = snapshot.cip;
        self.error = snapshot.error;
        self.saved_esp = snapshot.saved_esp;
        self.saved_ebp = snapshot.saved_ebp;
    }
}

/// Field offsets the templates encode as displacements off the context
/// register.
pub mod offsets {
    use super::JitContext;
    use std::mem::offset_of;

    /// `ctx.pri`
    pub const PRI: i32 = offset_of!(JitContext, pri) as i32;
    /// `ctx.alt`
    pub const ALT: i32 = offset_of!(JitContext, alt) as i32;
    /// `ctx.frm`
    pub const FRM: i32 = offset_of!(JitContext, frm) as i32;
    /// `ctx.stk`
    pub const STK: i32 = offset_of!(JitContext, stk) as i32;
    /// `ctx.hea`
    pub const HEA: i32 = offset_of!(JitContext, hea) as i32;
    /// `ctx.cip`
    pub const CIP: i32 = offset_of!(JitContext, cip) as i32;
    /// `ctx.error`
    pub const ERROR: i32 = offset_of!(JitContext, error) as i32;
    /// `ctx.saved_esp`
    pub const SAVED_ESP: i32 = offset_of!(JitContext, saved_esp) as i32;
    /// `ctx.saved_ebp`
    pub const SAVED_EBP: i32 = offset_of!(JitContext, saved_ebp) as i32;
    /// `ctx.data`
    pub const DATA: i32 = offset_of!(JitContext, data) as i32;
    /// `ctx.helpers.sysreq`
    pub const HELPER_SYSREQ: i32 = offset_of!(JitContext, helpers.sysreq) as i32;
    /// `ctx.helpers.jump_lookup`
    pub const HELPER_JUMP_LOOKUP: i32 = offset_of!(JitContext, helpers.jump_lookup) as i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_fit_disp8() {
        // Templates rely on every context access fitting an 8-bit
        // displacement.
        for off in [
            offsets::PRI,
            offsets::ALT,
            offsets::FRM,
            offsets::STK,
            offsets::HEA,
            offsets::CIP,
            offsets::ERROR,
            offsets::SAVED_ESP,
            offsets::SAVED_EBP,
            offsets::DATA,
            offsets::HELPER_SYSREQ,
            offsets::HELPER_JUMP_LOOKUP,
        ] {
            assert!((0..=127).contains(&off), "offset {off} exceeds disp8");
        }
    }

    #[test]
    fn test_register_mirror_order() {
        // The exit path stores pri..stk as a group; keep them contiguous.
        assert_eq!(offsets::ALT, offsets::PRI + 4);
        assert_eq!(offsets::FRM, offsets::ALT + 4);
        assert_eq!(offsets::STK, offsets::FRM + 4);
        assert_eq!(offsets::HEA, offsets::STK + 4);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut ctx = JitContext::new(
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null(),
            std::ptr::null(),
        );
        ctx.pri = 1;
        ctx.alt = 2;
        ctx.hea = 3;
        let saved = ctx.snapshot();
        ctx.pri = 100;
        ctx.error = 12;
        ctx.restore(saved);
        assert_eq!(ctx.pri, 1);
        assert_eq!(ctx.alt, 2);
        assert_eq!(ctx.hea, 3);
        assert_eq!(ctx.error, 0);
    }
}
