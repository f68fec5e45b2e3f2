//! Opcode templates and program translation
//!
//! One pass over the instruction stream, one fixed template per opcode. The
//! register convention for generated code:
//!
//! - `eax` — PRI
//! - `ecx` — ALT
//! - `ebx` — data section base
//! - `edi` — the [`JitContext`] control block
//! - `ebp` — `data + FRM` (the VM frame, usable as a native frame)
//! - `esp` — `data + STK` (the VM stack, usable as a native stack)
//! - `edx`, `esi` — template scratch
//!
//! The entry trampoline at offset zero performs the native↔VM stack switch;
//! runtime faults funnel through shared stubs into its exit path. Intra-
//! program control flow goes through labels keyed by [`TaggedAddress`], so a
//! branch can target any instruction before it is emitted.

use std::ptr::NonNull;

use rustc_hash::FxHashMap;

use crate::amx::program::Program;
use crate::amx::raw::{AmxError, Cell};
use crate::asm::{CodeBuffer, Cond, Emitter, EmitError, Label, Mem, Mode, Reg};
use crate::bytecode::decoder::{DecodeError, Decoder, Instruction};
use crate::bytecode::opcode::{Opcode, OpcodeTable};
use crate::compiler::code_map::{CodeMap, LabelTag, TaggedAddress};
use crate::compiler::context::offsets;
use crate::compiler::intrinsics::{self, NativeOverride};
use crate::memory::VirtualMemoryManager;

const MODE: Mode = Mode::Protected32;
const CELL_SIZE: i32 = 4;

/// Why a program could not be translated.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The opcode is valid AMX but has no JIT template.
    #[error("unsupported instruction {opcode:?} at ip {ip:#x}")]
    UnsupportedInstruction {
        /// The offending opcode.
        opcode: Opcode,
        /// Code offset of the instruction.
        ip: Cell,
    },
    /// The instruction is malformed (bad operand, bad case table, stray
    /// `NONE` cell).
    #[error("invalid instruction {opcode:?} at ip {ip:#x}")]
    InvalidInstruction {
        /// The offending opcode.
        opcode: Opcode,
        /// Code offset of the instruction.
        ip: Cell,
    },
    /// The decoder rejected the stream.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// Label or displacement trouble while emitting.
    #[error(transparent)]
    Emit(#[from] EmitError),
    /// The memory manager could not supply code memory.
    #[error("executable memory exhausted")]
    OutOfMemory,
}

/// A published, executable translation of one program.
pub struct CompiledCode {
    base: NonNull<u8>,
    len: usize,
    code_map: CodeMap,
}

impl CompiledCode {
    /// Base of the published code; the entry trampoline lives at offset 0.
    pub fn base(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// Published code size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether any code was published (always false for real programs).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The AMX→native offset map.
    pub fn code_map(&self) -> &CodeMap {
        &self.code_map
    }

    /// Split into raw parts for the execution engine.
    pub fn into_parts(self) -> (NonNull<u8>, usize, CodeMap) {
        (self.base, self.len, self.code_map)
    }
}

/// Single-pass AMX→x86 translator.
pub struct Compiler<'a> {
    program: Program<'a>,
    reloc: Option<&'a OpcodeTable>,
    buf: CodeBuffer,
    labels: FxHashMap<TaggedAddress, Label>,
    code_map: CodeMap,
    overrides: FxHashMap<&'static str, NativeOverride>,
}

fn ctx(off: i32) -> Mem {
    Mem::base_disp(Reg::Edi, off)
}

impl<'a> Compiler<'a> {
    /// Compiler for one program. The override registry is frozen here.
    pub fn new(program: Program<'a>, reloc: Option<&'a OpcodeTable>) -> Compiler<'a> {
        Compiler {
            program,
            reloc,
            buf: CodeBuffer::new(),
            labels: FxHashMap::default(),
            code_map: CodeMap::new(),
            overrides: intrinsics::registry(),
        }
    }

    /// Translate the whole code section and publish it through `memory`.
    pub fn compile(
        mut self,
        memory: &mut VirtualMemoryManager,
    ) -> Result<CompiledCode, CompileError> {
        self.emit_trampoline();

        let code = self.program.code_cells();
        for item in Decoder::over(code, self.reloc) {
            let instr = item?;
            let entry = self.label(TaggedAddress::entry(instr.ip));
            self.buf.bind(entry)?;
            self.code_map.insert(instr.ip, self.buf.offset() as u32);
            self.translate(&instr)?;
        }

        self.buf.finalise()?;
        let bytes = self.buf.into_bytes();
        let base = memory.alloc(bytes.len()).ok_or(CompileError::OutOfMemory)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.as_ptr(), bytes.len());
        }
        if !memory.commit(base, bytes.len()) {
            memory.free(base);
            return Err(CompileError::OutOfMemory);
        }
        log::debug!(
            "compiled {} AMX instructions into {} bytes of native code",
            self.code_map.len(),
            bytes.len()
        );
        Ok(CompiledCode { base, len: bytes.len(), code_map: self.code_map })
    }

    fn label(&mut self, addr: TaggedAddress) -> Label {
        match self.labels.get(&addr) {
            Some(&label) => label,
            None => {
                let label = self.buf.label();
                self.labels.insert(addr, label);
                label
            }
        }
    }

    fn entry_label(&mut self, operand: Cell) -> Label {
        let target = self.program.branch_target(operand);
        self.label(TaggedAddress::entry(target))
    }

    /// The native entry trampoline: `extern "C" fn(ctx, entry) -> error`.
    ///
    /// Saves the native stack, pins the convention registers, switches onto
    /// the VM stack and calls the entry point. The exit path is shared with
    /// every halt: it parks the VM registers back into the context and
    /// returns the recorded error code. Fault stubs follow it.
    fn emit_trampoline(&mut self) {
        let exit = self.label(TaggedAddress::stub(LabelTag::Exit));
        let divide = self.label(TaggedAddress::stub(LabelTag::DivideError));
        let bounds = self.label(TaggedAddress::stub(LabelTag::BoundsError));
        let heap = self.label(TaggedAddress::stub(LabelTag::HeapError));
        let jump = self.label(TaggedAddress::stub(LabelTag::JumpError));

        let mut e = Emitter::new(&mut self.buf, MODE);
        e.push_r(Reg::Ebp);
        e.mov_rr(Reg::Ebp, Reg::Esp);
        e.push_r(Reg::Ebx);
        e.push_r(Reg::Esi);
        e.push_r(Reg::Edi);
        e.mov_rm(Reg::Edi, Mem::base_disp(Reg::Ebp, 8));
        e.mov_rm(Reg::Esi, Mem::base_disp(Reg::Ebp, 12));
        e.mov_mr(ctx(offsets::SAVED_ESP), Reg::Esp);
        e.mov_mr(ctx(offsets::SAVED_EBP), Reg::Ebp);
        e.mov_rm(Reg::Ebx, ctx(offsets::DATA));
        e.mov_rm(Reg::Eax, ctx(offsets::PRI));
        e.mov_rm(Reg::Ecx, ctx(offsets::ALT));
        e.mov_rm(Reg::Edx, ctx(offsets::FRM));
        e.lea(Reg::Ebp, Mem::base_index(Reg::Ebx, Reg::Edx, 1));
        e.mov_rm(Reg::Edx, ctx(offsets::STK));
        e.lea(Reg::Esp, Mem::base_index(Reg::Ebx, Reg::Edx, 1));
        e.call_r(Reg::Esi);

        e.bind(exit);
        e.mov_mr(ctx(offsets::PRI), Reg::Eax);
        e.mov_mr(ctx(offsets::ALT), Reg::Ecx);
        e.mov_rr(Reg::Edx, Reg::Ebp);
        e.sub_rr(Reg::Edx, Reg::Ebx);
        e.mov_mr(ctx(offsets::FRM), Reg::Edx);
        e.mov_rr(Reg::Edx, Reg::Esp);
        e.sub_rr(Reg::Edx, Reg::Ebx);
        e.mov_mr(ctx(offsets::STK), Reg::Edx);
        e.mov_rm(Reg::Esp, ctx(offsets::SAVED_ESP));
        e.mov_rm(Reg::Ebp, ctx(offsets::SAVED_EBP));
        e.mov_rm(Reg::Eax, ctx(offsets::ERROR));
        e.pop_r(Reg::Edi);
        e.pop_r(Reg::Esi);
        e.pop_r(Reg::Ebx);
        e.pop_r(Reg::Ebp);
        e.ret();

        for (stub, code) in [
            (divide, AmxError::Divide),
            (bounds, AmxError::Bounds),
            (heap, AmxError::HeapLow),
            (jump, AmxError::InvInstr),
        ] {
            e.bind(stub);
            e.mov_mi(ctx(offsets::ERROR), code as i32);
            e.jmp(exit);
        }
    }

    /// Park ALT/STK/FRM in the context and switch to the native stack.
    fn begin_external(e: &mut Emitter<'_>) {
        e.mov_mr(ctx(offsets::ALT), Reg::Ecx);
        e.mov_rr(Reg::Edx, Reg::Esp);
        e.sub_rr(Reg::Edx, Reg::Ebx);
        e.mov_mr(ctx(offsets::STK), Reg::Edx);
        e.mov_rr(Reg::Edx, Reg::Ebp);
        e.sub_rr(Reg::Edx, Reg::Ebx);
        e.mov_mr(ctx(offsets::FRM), Reg::Edx);
        e.mov_rm(Reg::Esp, ctx(offsets::SAVED_ESP));
        e.mov_rm(Reg::Ebp, ctx(offsets::SAVED_EBP));
    }

    /// Switch back onto the VM stack and reload ALT.
    fn end_external(e: &mut Emitter<'_>) {
        e.mov_rm(Reg::Edx, ctx(offsets::STK));
        e.lea(Reg::Esp, Mem::base_index(Reg::Ebx, Reg::Edx, 1));
        e.mov_rm(Reg::Edx, ctx(offsets::FRM));
        e.lea(Reg::Ebp, Mem::base_index(Reg::Ebx, Reg::Edx, 1));
        e.mov_rm(Reg::Ecx, ctx(offsets::ALT));
    }

    /// `SYSREQ` template: an inline override when the native has one, the
    /// generic callback trampoline otherwise.
    fn emit_sysreq(&mut self, index: Cell, next_ip: Cell) {
        if let Some(name) = self.program.native_name(index as usize) {
            if let Some(&emit_override) = self.overrides.get(name) {
                log::trace!("inlining native '{name}'");
                let mut e = Emitter::new(&mut self.buf, MODE);
                emit_override(&mut e);
                return;
            }
        }
        let exit = self.label(TaggedAddress::stub(LabelTag::Exit));
        let mut e = Emitter::new(&mut self.buf, MODE);
        Self::begin_external(&mut e);
        e.push_i(next_ip);
        e.push_i(index);
        e.push_r(Reg::Edi);
        e.call_m(ctx(offsets::HELPER_SYSREQ));
        e.add_ri(Reg::Esp, 12);
        Self::end_external(&mut e);
        e.cmp_mi(ctx(offsets::ERROR), 0);
        e.jcc(Cond::Ne, exit);
    }

    /// Runtime-computed jump (`JUMP.pri`, `SCTRL 6`): resolve the target
    /// through the code map on the native stack, then jump to it.
    fn emit_jump_pri(&mut self) {
        let bad_jump = self.label(TaggedAddress::stub(LabelTag::JumpError));
        let mut e = Emitter::new(&mut self.buf, MODE);
        e.mov_mr(ctx(offsets::PRI), Reg::Eax);
        Self::begin_external(&mut e);
        e.push_r(Reg::Eax);
        e.push_r(Reg::Edi);
        e.call_m(ctx(offsets::HELPER_JUMP_LOOKUP));
        e.add_ri(Reg::Esp, 8);
        e.mov_rr(Reg::Esi, Reg::Eax);
        Self::end_external(&mut e);
        e.mov_rm(Reg::Eax, ctx(offsets::PRI));
        e.test_rr(Reg::Esi, Reg::Esi);
        e.jcc(Cond::E, bad_jump);
        e.jmp_r(Reg::Esi);
    }

    /// `PRI = condition(PRI, ALT)` comparison template.
    fn emit_compare(&mut self, cond: Cond) {
        let mut e = Emitter::new(&mut self.buf, MODE);
        e.cmp_rr(Reg::Eax, Reg::Ecx);
        e.setcc(cond, Reg::Eax);
        e.movzx_rr8(Reg::Eax, Reg::Eax);
    }

    /// Conditional jump template over `cmp PRI, ALT`.
    fn emit_jcc(&mut self, cond: Cond, operand: Cell) {
        let target = self.entry_label(operand);
        let mut e = Emitter::new(&mut self.buf, MODE);
        e.cmp_rr(Reg::Eax, Reg::Ecx);
        e.jcc(cond, target);
    }

    fn translate(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        use Opcode::*;

        let op = instr.operand;
        let invalid = || CompileError::InvalidInstruction {
            opcode: instr.opcode,
            ip: instr.ip,
        };

        match instr.opcode {
            Opcode::None => return Err(invalid()),

            LoadPri => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_rm(Reg::Eax, Mem::base_disp(Reg::Ebx, op));
            }
            LoadAlt => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_rm(Reg::Ecx, Mem::base_disp(Reg::Ebx, op));
            }
            LoadSPri => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_rm(Reg::Eax, Mem::base_disp(Reg::Ebp, op));
            }
            LoadSAlt => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_rm(Reg::Ecx, Mem::base_disp(Reg::Ebp, op));
            }
            LrefPri | LrefAlt | LrefSPri | LrefSAlt => {
                let base = if matches!(instr.opcode, LrefPri | LrefAlt) {
                    Reg::Ebx
                } else {
                    Reg::Ebp
                };
                let dst = if matches!(instr.opcode, LrefPri | LrefSPri) {
                    Reg::Eax
                } else {
                    Reg::Ecx
                };
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_rm(Reg::Edx, Mem::base_disp(base, op));
                e.mov_rm(dst, Mem::base_index(Reg::Ebx, Reg::Edx, 1));
            }
            LoadI => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_rm(Reg::Eax, Mem::base_index(Reg::Ebx, Reg::Eax, 1));
            }
            LodbI => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                let mem = Mem::base_index(Reg::Ebx, Reg::Eax, 1);
                match op {
                    1 => e.movzx_rm8(Reg::Eax, mem),
                    2 => e.movzx_rm16(Reg::Eax, mem),
                    4 => e.mov_rm(Reg::Eax, mem),
                    _ => return Err(invalid()),
                }
            }
            ConstPri => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_ri(Reg::Eax, op as i64);
            }
            ConstAlt => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_ri(Reg::Ecx, op as i64);
            }
            AddrPri => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.lea(Reg::Eax, Mem::base_disp(Reg::Ebp, op));
                e.sub_rr(Reg::Eax, Reg::Ebx);
            }
            AddrAlt => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.lea(Reg::Ecx, Mem::base_disp(Reg::Ebp, op));
                e.sub_rr(Reg::Ecx, Reg::Ebx);
            }
            StorPri => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_mr(Mem::base_disp(Reg::Ebx, op), Reg::Eax);
            }
            StorAlt => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_mr(Mem::base_disp(Reg::Ebx, op), Reg::Ecx);
            }
            StorSPri => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_mr(Mem::base_disp(Reg::Ebp, op), Reg::Eax);
            }
            StorSAlt => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_mr(Mem::base_disp(Reg::Ebp, op), Reg::Ecx);
            }
            SrefPri | SrefAlt | SrefSPri | SrefSAlt => {
                let base = if matches!(instr.opcode, SrefPri | SrefAlt) {
                    Reg::Ebx
                } else {
                    Reg::Ebp
                };
                let src = if matches!(instr.opcode, SrefPri | SrefSPri) {
                    Reg::Eax
                } else {
                    Reg::Ecx
                };
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_rm(Reg::Edx, Mem::base_disp(base, op));
                e.mov_mr(Mem::base_index(Reg::Ebx, Reg::Edx, 1), src);
            }
            StorI => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_mr(Mem::base_index(Reg::Ebx, Reg::Ecx, 1), Reg::Eax);
            }
            StrbI => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                let mem = Mem::base_index(Reg::Ebx, Reg::Ecx, 1);
                match op {
                    1 => e.mov_m8r(mem, Reg::Eax),
                    2 => e.mov_m16r(mem, Reg::Eax),
                    4 => e.mov_mr(mem, Reg::Eax),
                    _ => return Err(invalid()),
                }
            }
            Lidx => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.lea(Reg::Edx, Mem::base_index(Reg::Ecx, Reg::Eax, 4));
                e.mov_rm(Reg::Eax, Mem::base_index(Reg::Ebx, Reg::Edx, 1));
            }
            LidxB => {
                let shift = u8::try_from(op).map_err(|_| invalid())?;
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_rr(Reg::Edx, Reg::Eax);
                e.shl_ri(Reg::Edx, shift);
                e.add_rr(Reg::Edx, Reg::Ecx);
                e.mov_rm(Reg::Eax, Mem::base_index(Reg::Ebx, Reg::Edx, 1));
            }
            Idxaddr => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.lea(Reg::Eax, Mem::base_index(Reg::Ecx, Reg::Eax, 4));
            }
            IdxaddrB => {
                let shift = u8::try_from(op).map_err(|_| invalid())?;
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.shl_ri(Reg::Eax, shift);
                e.add_rr(Reg::Eax, Reg::Ecx);
            }
            AlignPri => {
                if (0..CELL_SIZE).contains(&op) {
                    let mut e = Emitter::new(&mut self.buf, MODE);
                    e.xor_ri(Reg::Eax, CELL_SIZE - op);
                }
            }
            AlignAlt => {
                if (0..CELL_SIZE).contains(&op) {
                    let mut e = Emitter::new(&mut self.buf, MODE);
                    e.xor_ri(Reg::Ecx, CELL_SIZE - op);
                }
            }
            Lctrl => match op {
                0 => {
                    let cod = self.program.header().cod;
                    let mut e = Emitter::new(&mut self.buf, MODE);
                    e.mov_ri(Reg::Eax, cod as i64);
                }
                1 => {
                    let dat = self.program.header().dat;
                    let mut e = Emitter::new(&mut self.buf, MODE);
                    e.mov_ri(Reg::Eax, dat as i64);
                }
                2 => {
                    let mut e = Emitter::new(&mut self.buf, MODE);
                    e.mov_rm(Reg::Eax, ctx(offsets::HEA));
                }
                3 => {
                    let stp = unsafe { (*self.program.amx()).stp };
                    let mut e = Emitter::new(&mut self.buf, MODE);
                    e.mov_ri(Reg::Eax, stp as i64);
                }
                4 => {
                    let mut e = Emitter::new(&mut self.buf, MODE);
                    e.mov_rr(Reg::Eax, Reg::Esp);
                    e.sub_rr(Reg::Eax, Reg::Ebx);
                }
                5 => {
                    let mut e = Emitter::new(&mut self.buf, MODE);
                    e.mov_rr(Reg::Eax, Reg::Ebp);
                    e.sub_rr(Reg::Eax, Reg::Ebx);
                }
                6 => {
                    let next = instr.next_ip();
                    let mut e = Emitter::new(&mut self.buf, MODE);
                    e.mov_ri(Reg::Eax, next as i64);
                }
                _ => {
                    return Err(CompileError::UnsupportedInstruction {
                        opcode: instr.opcode,
                        ip: instr.ip,
                    })
                }
            },
            Sctrl => match op {
                2 => {
                    let mut e = Emitter::new(&mut self.buf, MODE);
                    e.mov_mr(ctx(offsets::HEA), Reg::Eax);
                }
                4 => {
                    let mut e = Emitter::new(&mut self.buf, MODE);
                    e.lea(Reg::Esp, Mem::base_index(Reg::Ebx, Reg::Eax, 1));
                }
                5 => {
                    let mut e = Emitter::new(&mut self.buf, MODE);
                    e.lea(Reg::Ebp, Mem::base_index(Reg::Ebx, Reg::Eax, 1));
                }
                6 => self.emit_jump_pri(),
                _ => {
                    return Err(CompileError::UnsupportedInstruction {
                        opcode: instr.opcode,
                        ip: instr.ip,
                    })
                }
            },
            MovePri => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_rr(Reg::Eax, Reg::Ecx);
            }
            MoveAlt => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_rr(Reg::Ecx, Reg::Eax);
            }
            Xchg => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.xchg_rr(Reg::Eax, Reg::Ecx);
            }
            PushPri => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.push_r(Reg::Eax);
            }
            PushAlt => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.push_r(Reg::Ecx);
            }
            PushC => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.push_i(op);
            }
            Push => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.push_m(Mem::base_disp(Reg::Ebx, op));
            }
            PushS => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.push_m(Mem::base_disp(Reg::Ebp, op));
            }
            PopPri => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.pop_r(Reg::Eax);
            }
            PopAlt => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.pop_r(Reg::Ecx);
            }
            Stack => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_rr(Reg::Ecx, Reg::Esp);
                e.sub_rr(Reg::Ecx, Reg::Ebx);
                e.add_ri(Reg::Esp, op);
            }
            Heap => {
                let hlw = unsafe { (*self.program.amx()).hlw };
                let heap_err = self.label(TaggedAddress::stub(LabelTag::HeapError));
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_rm(Reg::Ecx, ctx(offsets::HEA));
                e.add_mi(ctx(offsets::HEA), op);
                if op < 0 {
                    e.cmp_mi(ctx(offsets::HEA), hlw);
                    e.jcc(Cond::L, heap_err);
                }
            }
            Proc => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.push_r(Reg::Ebp);
                e.mov_rr(Reg::Ebp, Reg::Esp);
            }
            Ret => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.pop_r(Reg::Ebp);
                e.ret();
            }
            Retn => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.pop_r(Reg::Ebp);
                e.pop_r(Reg::Edx);
                e.add_rm(Reg::Esp, Mem::base(Reg::Esp));
                e.add_ri(Reg::Esp, CELL_SIZE);
                e.jmp_r(Reg::Edx);
            }
            Call => {
                let target = self.entry_label(op);
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.call(target);
            }
            CallPri | SysreqPri => {
                return Err(CompileError::UnsupportedInstruction {
                    opcode: instr.opcode,
                    ip: instr.ip,
                })
            }
            Jump => {
                let target = self.entry_label(op);
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.jmp(target);
            }
            Jzer | Jnz => {
                let cond = if instr.opcode == Jzer { Cond::E } else { Cond::Ne };
                let target = self.entry_label(op);
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.test_rr(Reg::Eax, Reg::Eax);
                e.jcc(cond, target);
            }
            Jeq => self.emit_jcc(Cond::E, op),
            Jneq => self.emit_jcc(Cond::Ne, op),
            Jless => self.emit_jcc(Cond::B, op),
            Jleq => self.emit_jcc(Cond::Be, op),
            Jgrtr => self.emit_jcc(Cond::A, op),
            Jgeq => self.emit_jcc(Cond::Ae, op),
            Jsless => self.emit_jcc(Cond::L, op),
            Jsleq => self.emit_jcc(Cond::Le, op),
            Jsgrtr => self.emit_jcc(Cond::G, op),
            Jsgeq => self.emit_jcc(Cond::Ge, op),
            Shl => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.shl_r_cl(Reg::Eax);
            }
            Shr => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.shr_r_cl(Reg::Eax);
            }
            Sshr => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.sar_r_cl(Reg::Eax);
            }
            ShlCPri => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.shl_ri(Reg::Eax, (op & 31) as u8);
            }
            ShlCAlt => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.shl_ri(Reg::Ecx, (op & 31) as u8);
            }
            ShrCPri => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.shr_ri(Reg::Eax, (op & 31) as u8);
            }
            ShrCAlt => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.shr_ri(Reg::Ecx, (op & 31) as u8);
            }
            Smul => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.imul_rr(Reg::Eax, Reg::Ecx);
            }
            Sdiv | SdivAlt => {
                let divide = self.label(TaggedAddress::stub(LabelTag::DivideError));
                let mut e = Emitter::new(&mut self.buf, MODE);
                if instr.opcode == SdivAlt {
                    e.xchg_rr(Reg::Eax, Reg::Ecx);
                }
                e.test_rr(Reg::Ecx, Reg::Ecx);
                e.jcc(Cond::E, divide);
                e.cdq();
                e.idiv_r(Reg::Ecx);
                e.mov_rr(Reg::Ecx, Reg::Edx);
            }
            Umul => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mul_r(Reg::Ecx);
            }
            Udiv | UdivAlt => {
                let divide = self.label(TaggedAddress::stub(LabelTag::DivideError));
                let mut e = Emitter::new(&mut self.buf, MODE);
                if instr.opcode == UdivAlt {
                    e.xchg_rr(Reg::Eax, Reg::Ecx);
                }
                e.test_rr(Reg::Ecx, Reg::Ecx);
                e.jcc(Cond::E, divide);
                e.xor_rr(Reg::Edx, Reg::Edx);
                e.div_r(Reg::Ecx);
                e.mov_rr(Reg::Ecx, Reg::Edx);
            }
            Add => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.add_rr(Reg::Eax, Reg::Ecx);
            }
            Sub => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.sub_rr(Reg::Eax, Reg::Ecx);
            }
            SubAlt => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.neg_r(Reg::Eax);
                e.add_rr(Reg::Eax, Reg::Ecx);
            }
            And => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.and_rr(Reg::Eax, Reg::Ecx);
            }
            Or => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.or_rr(Reg::Eax, Reg::Ecx);
            }
            Xor => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.xor_rr(Reg::Eax, Reg::Ecx);
            }
            Not => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.test_rr(Reg::Eax, Reg::Eax);
                e.setcc(Cond::E, Reg::Eax);
                e.movzx_rr8(Reg::Eax, Reg::Eax);
            }
            Neg => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.neg_r(Reg::Eax);
            }
            Invert => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.not_r(Reg::Eax);
            }
            AddC => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.add_ri(Reg::Eax, op);
            }
            SmulC => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.imul_rri(Reg::Eax, Reg::Eax, op);
            }
            ZeroPri => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.xor_rr(Reg::Eax, Reg::Eax);
            }
            ZeroAlt => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.xor_rr(Reg::Ecx, Reg::Ecx);
            }
            Zero => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_mi(Mem::base_disp(Reg::Ebx, op), 0);
            }
            ZeroS => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_mi(Mem::base_disp(Reg::Ebp, op), 0);
            }
            SignPri => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.movsx_rr8(Reg::Eax, Reg::Eax);
            }
            SignAlt => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.movsx_rr8(Reg::Ecx, Reg::Ecx);
            }
            Eq => self.emit_compare(Cond::E),
            Neq => self.emit_compare(Cond::Ne),
            Less => self.emit_compare(Cond::B),
            Leq => self.emit_compare(Cond::Be),
            Grtr => self.emit_compare(Cond::A),
            Geq => self.emit_compare(Cond::Ae),
            Sless => self.emit_compare(Cond::L),
            Sleq => self.emit_compare(Cond::Le),
            Sgrtr => self.emit_compare(Cond::G),
            Sgeq => self.emit_compare(Cond::Ge),
            EqCPri => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.cmp_ri(Reg::Eax, op);
                e.setcc(Cond::E, Reg::Eax);
                e.movzx_rr8(Reg::Eax, Reg::Eax);
            }
            EqCAlt => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.cmp_ri(Reg::Ecx, op);
                e.setcc(Cond::E, Reg::Eax);
                e.movzx_rr8(Reg::Eax, Reg::Eax);
            }
            IncPri => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.inc_r(Reg::Eax);
            }
            IncAlt => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.inc_r(Reg::Ecx);
            }
            Inc => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.inc_m(Mem::base_disp(Reg::Ebx, op));
            }
            IncS => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.inc_m(Mem::base_disp(Reg::Ebp, op));
            }
            IncI => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.inc_m(Mem::base_index(Reg::Ebx, Reg::Eax, 1));
            }
            DecPri => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.dec_r(Reg::Eax);
            }
            DecAlt => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.dec_r(Reg::Ecx);
            }
            Dec => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.dec_m(Mem::base_disp(Reg::Ebx, op));
            }
            DecS => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.dec_m(Mem::base_disp(Reg::Ebp, op));
            }
            DecI => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.dec_m(Mem::base_index(Reg::Ebx, Reg::Eax, 1));
            }
            Movs => {
                if op < 0 {
                    return Err(invalid());
                }
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.push_r(Reg::Edi);
                e.lea(Reg::Esi, Mem::base_index(Reg::Ebx, Reg::Eax, 1));
                e.lea(Reg::Edi, Mem::base_index(Reg::Ebx, Reg::Ecx, 1));
                e.push_r(Reg::Ecx);
                e.cld();
                if op / CELL_SIZE > 0 {
                    e.mov_ri(Reg::Ecx, (op / CELL_SIZE) as i64);
                    e.rep_movsd();
                }
                if op % CELL_SIZE > 0 {
                    e.mov_ri(Reg::Ecx, (op % CELL_SIZE) as i64);
                    e.rep_movsb();
                }
                e.pop_r(Reg::Ecx);
                e.pop_r(Reg::Edi);
            }
            Cmps => {
                if op < 0 {
                    return Err(invalid());
                }
                let mut e = Emitter::new(&mut self.buf, MODE);
                if op == 0 {
                    e.xor_rr(Reg::Eax, Reg::Eax);
                } else {
                    let above = e.label();
                    let below = e.label();
                    let done = e.label();
                    e.push_r(Reg::Edi);
                    e.lea(Reg::Edi, Mem::base_index(Reg::Ebx, Reg::Eax, 1));
                    e.lea(Reg::Esi, Mem::base_index(Reg::Ebx, Reg::Ecx, 1));
                    e.push_r(Reg::Ecx);
                    e.cld();
                    e.mov_ri(Reg::Ecx, op as i64);
                    e.repe_cmpsb();
                    e.jcc(Cond::A, above);
                    e.jcc(Cond::B, below);
                    e.xor_rr(Reg::Eax, Reg::Eax);
                    e.jmp(done);
                    e.bind(above);
                    e.mov_ri(Reg::Eax, 1);
                    e.jmp(done);
                    e.bind(below);
                    e.mov_ri(Reg::Eax, -1);
                    e.bind(done);
                    e.pop_r(Reg::Ecx);
                    e.pop_r(Reg::Edi);
                }
            }
            Fill => {
                if op < 0 {
                    return Err(invalid());
                }
                if op / CELL_SIZE > 0 {
                    let mut e = Emitter::new(&mut self.buf, MODE);
                    e.push_r(Reg::Edi);
                    e.lea(Reg::Edi, Mem::base_index(Reg::Ebx, Reg::Ecx, 1));
                    e.push_r(Reg::Ecx);
                    e.cld();
                    e.mov_ri(Reg::Ecx, (op / CELL_SIZE) as i64);
                    e.rep_stosd();
                    e.pop_r(Reg::Ecx);
                    e.pop_r(Reg::Edi);
                }
            }
            Halt => {
                let exit = self.label(TaggedAddress::stub(LabelTag::Exit));
                let next = instr.next_ip();
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.mov_mi(ctx(offsets::CIP), next);
                e.mov_mi(ctx(offsets::ERROR), op);
                e.jmp(exit);
            }
            Bounds => {
                let bounds = self.label(TaggedAddress::stub(LabelTag::BoundsError));
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.cmp_ri(Reg::Eax, op);
                e.jcc(Cond::A, bounds);
            }
            SysreqC => self.emit_sysreq(op, instr.next_ip()),
            SysreqD => {
                let index = self
                    .program
                    .find_native(op)
                    .ok_or_else(invalid)?;
                self.emit_sysreq(index as Cell, instr.next_ip());
            }
            JumpPri => self.emit_jump_pri(),
            Switch => {
                self.emit_switch(instr)?;
            }
            Casetbl => {
                // Data for the preceding SWITCH; nothing executes here.
            }
            SwapPri => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.xchg_mr(Mem::base(Reg::Esp), Reg::Eax);
            }
            SwapAlt => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.xchg_mr(Mem::base(Reg::Esp), Reg::Ecx);
            }
            PushAdr => {
                let mut e = Emitter::new(&mut self.buf, MODE);
                e.lea(Reg::Edx, Mem::base_disp(Reg::Ebp, op));
                e.sub_rr(Reg::Edx, Reg::Ebx);
                e.push_r(Reg::Edx);
            }
            Nop | Break => {}

            // The decoder rejects obsolete opcodes before they get here.
            PushR | Jrel | File | Line | Symbol | Srange | Symtag => {
                return Err(invalid())
            }
        }
        Ok(())
    }

    /// `SWITCH`: compare PRI against every case value, falling through to
    /// the default. The table layout is `CASETBL, count, default, (value,
    /// target)*`.
    fn emit_switch(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        let invalid = || CompileError::InvalidInstruction {
            opcode: instr.opcode,
            ip: instr.ip,
        };
        let code = self.program.code_cells();
        let table_ip = self.program.branch_target(instr.operand);
        if table_ip < 0 || table_ip % CELL_SIZE != 0 {
            return Err(invalid());
        }
        let table = (table_ip / CELL_SIZE) as usize;
        let count = *code.get(table + 1).ok_or_else(invalid)?;
        if count < 0 || count as usize > code.len() {
            return Err(invalid());
        }
        let count = count as usize;
        let default = *code.get(table + 2).ok_or_else(invalid)?;
        if code.len() < table + 3 + count * 2 {
            return Err(invalid());
        }

        let mut cases = Vec::with_capacity(count);
        for record in 0..count {
            let value = code[table + 3 + record * 2];
            let target = code[table + 3 + record * 2 + 1];
            let label = self.entry_label(target);
            cases.push((value, label));
        }
        let default_label = self.entry_label(default);

        let mut e = Emitter::new(&mut self.buf, MODE);
        for (value, label) in cases {
            e.cmp_ri(Reg::Eax, value);
            e.jcc(Cond::E, label);
        }
        e.jmp(default_label);
        Ok(())
    }
}
