//! The JIT compiler
//!
//! Single-pass translation of an AMX program into x86 machine code, plus the
//! runtime plumbing generated code leans on: the per-execution context
//! block, the native-call helpers, and the inline native overrides.

pub mod code_map;
pub mod context;
pub mod intrinsics;
pub mod runtime;
mod translate;

pub use code_map::{CodeMap, LabelTag, TaggedAddress};
pub use context::JitContext;
pub use translate::{CompileError, CompiledCode, Compiler};
