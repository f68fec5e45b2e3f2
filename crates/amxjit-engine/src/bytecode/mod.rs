//! AMX bytecode: opcode repertoire and instruction decoding.

pub mod decoder;
pub mod opcode;

pub use decoder::{DecodeError, Decoder, Instruction};
pub use opcode::{Opcode, OpcodeTable};
