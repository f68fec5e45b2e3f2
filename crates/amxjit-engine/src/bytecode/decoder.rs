//! Linear bytecode decoder
//!
//! Walks a half-open `[start, end)` range of the code section and yields one
//! `Instruction` per opcode, applying the host's opcode relocation when one
//! is in effect. The decoder is lazy: nothing is buffered, and a malformed
//! stream surfaces as an error item that ends the sequence.

use crate::amx::raw::Cell;
use crate::bytecode::opcode::{Opcode, OpcodeTable};

const CELL: usize = std::mem::size_of::<Cell>();

/// Error while decoding the instruction stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The cell at `ip` is not a known opcode.
    #[error("unknown opcode {value:#x} at ip {ip:#x}")]
    UnknownOpcode {
        /// Raw cell value after relocation.
        value: Cell,
        /// Code offset of the opcode cell.
        ip: Cell,
    },
    /// The opcode is part of the obsolete subset the core no longer emits.
    #[error("obsolete instruction {opcode:?} at ip {ip:#x}")]
    ObsoleteInstruction {
        /// The obsolete opcode.
        opcode: Opcode,
        /// Code offset of the opcode cell.
        ip: Cell,
    },
    /// The stream ended in the middle of an instruction.
    #[error("truncated instruction at ip {ip:#x}")]
    Truncated {
        /// Code offset of the opcode cell.
        ip: Cell,
    },
}

/// One decoded instruction.
///
/// `operand` is the single inline cell for opcodes that carry one, zero
/// otherwise. For `CASETBL` it holds the record count; the table payload is
/// read from the code section by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Byte offset of the opcode cell within the code section.
    pub ip: Cell,
    /// The opcode.
    pub opcode: Opcode,
    /// Inline operand, or zero.
    pub operand: Cell,
}

impl Instruction {
    /// Byte offset of the instruction that follows this one.
    pub fn next_ip(&self) -> Cell {
        self.ip + self.size() as Cell
    }

    /// Encoded size in bytes, including the variable `CASETBL` payload.
    pub fn size(&self) -> usize {
        match self.opcode {
            // opcode, num, default address, num (value, address) pairs
            Opcode::Casetbl => (3 + 2 * self.operand as usize) * CELL,
            op => (1 + op.operand_count()) * CELL,
        }
    }
}

/// Lazy instruction sequence over a code range.
pub struct Decoder<'a> {
    code: &'a [Cell],
    reloc: Option<&'a OpcodeTable>,
    ip: usize,
    end: usize,
    failed: bool,
}

impl<'a> Decoder<'a> {
    /// Decode `[start, end)` byte offsets of `code`. Offsets must be
    /// cell-aligned; `end` is clamped to the section size.
    pub fn new(
        code: &'a [Cell],
        reloc: Option<&'a OpcodeTable>,
        start: usize,
        end: usize,
    ) -> Decoder<'a> {
        debug_assert!(start % CELL == 0 && end % CELL == 0);
        Decoder {
            code,
            reloc,
            ip: start / CELL,
            end: (end / CELL).min(code.len()),
            failed: false,
        }
    }

    /// Decode an entire code section.
    pub fn over(code: &'a [Cell], reloc: Option<&'a OpcodeTable>) -> Decoder<'a> {
        Decoder::new(code, reloc, 0, code.len() * CELL)
    }

    fn fail(&mut self, err: DecodeError) -> Option<Result<Instruction, DecodeError>> {
        self.failed = true;
        Some(Err(err))
    }
}

impl<'a> Iterator for Decoder<'a> {
    type Item = Result<Instruction, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.ip >= self.end {
            return None;
        }
        let ip = (self.ip * CELL) as Cell;
        let raw = self.code[self.ip];
        let resolved = match self.reloc {
            Some(table) => table.lookup(raw),
            None => raw,
        };
        let opcode = match Opcode::from_cell(resolved) {
            Some(op) => op,
            None => return self.fail(DecodeError::UnknownOpcode { value: resolved, ip }),
        };
        if opcode.is_obsolete() {
            return self.fail(DecodeError::ObsoleteInstruction { opcode, ip });
        }

        let operand = if opcode.operand_count() > 0 || opcode == Opcode::Casetbl {
            match self.code.get(self.ip + 1) {
                Some(&cell) => cell,
                None => return self.fail(DecodeError::Truncated { ip }),
            }
        } else {
            0
        };
        if opcode == Opcode::Casetbl && operand < 0 {
            return self.fail(DecodeError::Truncated { ip });
        }

        let instr = Instruction { ip, opcode, operand };
        let cells = instr.size() / CELL;
        if self.ip + cells > self.end {
            return self.fail(DecodeError::Truncated { ip });
        }
        self.ip += cells;
        Some(Ok(instr))
    }
}
