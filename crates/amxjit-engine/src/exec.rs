//! Execution engine
//!
//! Owns the compiled form of one AMX program and drives it: compile on first
//! use, enter through the generated trampoline, and keep the VM-visible
//! register state consistent across returns, faults, sleeps and nested
//! entries.
//!
//! The engine is single-threaded by host contract. Interior mutability keeps
//! `exec` reentrant: a native called from generated code may call back into
//! the same engine, so no `&mut self` may be held across a run.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::amx::program::Program;
use crate::amx::raw::{Amx, AmxError, Cell, AMX_EXEC_CONT};
use crate::bytecode::opcode::OpcodeTable;
use crate::compiler::code_map::CodeMap;
use crate::compiler::context::JitContext;
use crate::compiler::{CompileError, Compiler};
use crate::memory::VirtualMemoryManager;

const CELL_SIZE: Cell = 4;

/// Executable memory shared by every engine in the process.
pub type SharedMemory = Arc<Mutex<VirtualMemoryManager>>;

/// Generated trampoline signature: `(ctx, entry) -> error code`.
#[cfg(target_arch = "x86")]
type TrampolineFn = unsafe extern "C" fn(*mut JitContext, *const u8) -> i32;

struct ReadyProgram {
    base: NonNull<u8>,
    code_map: *mut CodeMap,
    ctx: *mut JitContext,
}

impl Drop for ReadyProgram {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(self.ctx));
            drop(Box::from_raw(self.code_map));
        }
    }
}

enum State {
    Uncompiled,
    Ready(ReadyProgram),
    /// Compilation failed; the stored code is reported on every exec.
    Failed(i32),
}

/// Per-program JIT execution engine.
pub struct ExecEngine {
    amx: *mut Amx,
    memory: SharedMemory,
    reloc: Option<OpcodeTable>,
    state: RefCell<State>,
}

impl ExecEngine {
    /// Engine for `amx`, drawing code memory from `memory`.
    ///
    /// # Safety
    ///
    /// `amx` must stay loaded and unmodified (code and tables) for the
    /// engine's lifetime, and all calls must come from the host thread.
    pub unsafe fn new(
        amx: *mut Amx,
        memory: SharedMemory,
        reloc: Option<OpcodeTable>,
    ) -> ExecEngine {
        ExecEngine {
            amx,
            memory,
            reloc,
            state: RefCell::new(State::Uncompiled),
        }
    }

    /// The AMX this engine runs.
    pub fn amx(&self) -> *mut Amx {
        self.amx
    }

    /// Whether the program has been compiled and published.
    pub fn is_ready(&self) -> bool {
        matches!(&*self.state.borrow(), State::Ready(_))
    }

    /// Compile the program now if it never was. Returns the AMX error code
    /// a subsequent exec would report for a failed compilation.
    pub fn prepare(&self) -> Result<(), i32> {
        if !matches!(&*self.state.borrow(), State::Uncompiled) {
            return match &*self.state.borrow() {
                State::Failed(code) => Err(*code),
                _ => Ok(()),
            };
        }

        let program = unsafe { Program::new(self.amx) };
        let compiler = Compiler::new(program, self.reloc.as_ref());
        let result = compiler.compile(&mut self.memory.lock());
        match result {
            Ok(compiled) => {
                let (base, len, code_map) = compiled.into_parts();
                log::info!("program compiled: {len} bytes of native code");
                let code_map = Box::into_raw(Box::new(code_map));
                let ctx = Box::into_raw(Box::new(JitContext::new(
                    self.amx,
                    program.data(),
                    base.as_ptr(),
                    code_map,
                )));
                *self.state.borrow_mut() = State::Ready(ReadyProgram { base, code_map, ctx });
                Ok(())
            }
            Err(err) => {
                let code = compile_error_code(&err);
                log::warn!("compilation failed, falling back to the interpreter: {err}");
                *self.state.borrow_mut() = State::Failed(code);
                Err(code)
            }
        }
    }

    /// Run a public function (or `main`); the counterpart of the hooked
    /// `amx_Exec`. Returns the AMX error code and writes the return value
    /// through `retval`.
    pub fn exec(&self, retval: Option<&mut Cell>, index: i32) -> i32 {
        if !cfg!(target_arch = "x86") {
            // The templates produce 32-bit code; on any other host the
            // caller must fall back to the interpreter.
            return AmxError::InitJit as i32;
        }
        if let Err(code) = self.prepare() {
            return code;
        }

        let state = self.state.borrow();
        let ready = match &*state {
            State::Ready(ready) => ready,
            _ => return AmxError::InitJit as i32,
        };
        // Raw pointers below stay valid without the borrow; drop it so a
        // nested exec from a native can take its own.
        let base = ready.base;
        let code_map = ready.code_map;
        let ctx = ready.ctx;
        drop(state);

        unsafe { self.run(base, code_map, ctx, retval, index) }
    }

    /// Continue a slept execution from the saved `cip`.
    pub fn resume(&self, retval: Option<&mut Cell>) -> i32 {
        self.exec(retval, AMX_EXEC_CONT)
    }

    unsafe fn run(
        &self,
        base: NonNull<u8>,
        code_map: *mut CodeMap,
        ctx: *mut JitContext,
        retval: Option<&mut Cell>,
        index: i32,
    ) -> i32 {
        let ctx = &mut *ctx;
        let snapshot = ctx.snapshot();

        let public_address = if index == AMX_EXEC_CONT {
            None
        } else {
            let program = Program::new(self.amx);
            match program.public_address(index) {
                Some(address) => Some(address),
                None => return AmxError::Index as i32,
            }
        };

        // Borrow the AMX only between entries: the generated code mutates
        // it through its own pointer while it runs.
        let entry_ip;
        let reset_stk;
        let reset_hea;
        {
            let amx = &mut *self.amx;
            match public_address {
                None => {
                    entry_ip = amx.cip;
                    reset_stk = amx.reset_stk;
                    reset_hea = amx.reset_hea;
                    ctx.pri = amx.pri;
                    ctx.alt = amx.alt;
                    ctx.frm = amx.frm;
                    ctx.stk = amx.stk;
                    ctx.hea = amx.hea;
                }
                Some(address) => {
                    entry_ip = address;
                    let arg_bytes = amx.paramcount * CELL_SIZE;
                    reset_stk = amx.stk + arg_bytes;
                    reset_hea = amx.hea;
                    amx.stk -= CELL_SIZE;
                    (ctx.data.add(amx.stk as usize) as *mut Cell).write_unaligned(arg_bytes);
                    amx.paramcount = 0;
                    ctx.pri = 0;
                    ctx.alt = 0;
                    ctx.frm = amx.frm;
                    ctx.stk = amx.stk;
                    ctx.hea = amx.hea;
                }
            }
        }
        ctx.cip = 0;
        ctx.error = AmxError::None as i32;

        let offset = match (*code_map).native_offset(entry_ip) {
            Some(offset) => offset,
            None => {
                ctx.restore(snapshot);
                return AmxError::InvInstr as i32;
            }
        };
        let entry = base.as_ptr().add(offset as usize);
        let code = Self::enter(base.as_ptr(), ctx, entry);

        let result = ctx.pri;
        let amx = &mut *self.amx;
        if code == AmxError::None as i32 {
            amx.stk = reset_stk;
            amx.hea = reset_hea;
        } else if code == AmxError::Sleep as i32 {
            amx.pri = ctx.pri;
            amx.alt = ctx.alt;
            amx.frm = ctx.frm;
            amx.stk = ctx.stk;
            amx.hea = ctx.hea;
            amx.cip = ctx.cip;
            amx.reset_stk = reset_stk;
            amx.reset_hea = reset_hea;
        } else {
            amx.stk = reset_stk;
            amx.hea = reset_hea;
        }
        amx.error = code;
        if let Some(retval) = retval {
            *retval = result;
        }
        ctx.restore(snapshot);
        code
    }

    #[cfg(target_arch = "x86")]
    unsafe fn enter(base: *const u8, ctx: &mut JitContext, entry: *const u8) -> i32 {
        let trampoline: TrampolineFn = std::mem::transmute(base);
        trampoline(ctx, entry)
    }

    #[cfg(not(target_arch = "x86"))]
    unsafe fn enter(_base: *const u8, _ctx: &mut JitContext, _entry: *const u8) -> i32 {
        // exec() bails out long before this on non-x86 hosts.
        AmxError::InitJit as i32
    }
}

impl Drop for ExecEngine {
    fn drop(&mut self) {
        if let State::Ready(ready) = &*self.state.borrow() {
            self.memory.lock().free(ready.base);
        }
    }
}

/// Map a compilation failure onto the AMX error code the host sees.
///
/// Unsupported-but-valid programs request interpreter fallback; malformed
/// ones report an invalid instruction outright.
fn compile_error_code(err: &CompileError) -> i32 {
    match err {
        CompileError::UnsupportedInstruction { .. }
        | CompileError::Emit(_)
        | CompileError::OutOfMemory => AmxError::InitJit as i32,
        CompileError::InvalidInstruction { .. } | CompileError::Decode(_) => {
            AmxError::InvInstr as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amx::image::ImageBuilder;
    use crate::bytecode::opcode::Opcode as Op;

    fn shared_memory() -> SharedMemory {
        Arc::new(Mutex::new(VirtualMemoryManager::new()))
    }

    #[test]
    fn test_prepare_compiles_once() {
        let mut image = ImageBuilder::new()
            .public("go", 0)
            .code(vec![Op::Proc as Cell, Op::ConstPri as Cell, 7, Op::Retn as Cell])
            .build();
        let engine = unsafe { ExecEngine::new(image.amx_mut(), shared_memory(), None) };
        assert!(!engine.is_ready());
        engine.prepare().unwrap();
        assert!(engine.is_ready());
        engine.prepare().unwrap();
    }

    #[test]
    fn test_prepare_maps_unsupported_to_init_jit() {
        let mut image = ImageBuilder::new()
            .public("go", 0)
            .code(vec![Op::Proc as Cell, Op::CallPri as Cell])
            .build();
        let engine = unsafe { ExecEngine::new(image.amx_mut(), shared_memory(), None) };
        assert_eq!(engine.prepare(), Err(AmxError::InitJit as i32));
        // The failure is sticky; no recompilation attempt.
        assert_eq!(engine.prepare(), Err(AmxError::InitJit as i32));
    }

    #[test]
    fn test_prepare_maps_invalid_to_invinstr() {
        let mut image = ImageBuilder::new()
            .public("go", 0)
            .code(vec![Op::Proc as Cell, Op::LodbI as Cell, 3])
            .build();
        let engine = unsafe { ExecEngine::new(image.amx_mut(), shared_memory(), None) };
        assert_eq!(engine.prepare(), Err(AmxError::InvInstr as i32));
    }

    #[test]
    fn test_code_memory_freed_on_drop() {
        let memory = shared_memory();
        let mut image = ImageBuilder::new()
            .public("go", 0)
            .code(vec![Op::Proc as Cell, Op::Retn as Cell])
            .build();
        {
            let engine =
                unsafe { ExecEngine::new(image.amx_mut(), Arc::clone(&memory), None) };
            engine.prepare().unwrap();
            assert!(memory.lock().used_bytes() > 0);
        }
        assert_eq!(memory.lock().used_bytes(), 0);
    }

    #[cfg(not(target_arch = "x86"))]
    #[test]
    fn test_exec_requests_fallback_on_foreign_host() {
        let mut image = ImageBuilder::new()
            .public("go", 0)
            .code(vec![Op::Proc as Cell, Op::Retn as Cell])
            .build();
        let engine = unsafe { ExecEngine::new(image.amx_mut(), shared_memory(), None) };
        assert_eq!(engine.exec(None, 0), AmxError::InitJit as i32);
    }
}
