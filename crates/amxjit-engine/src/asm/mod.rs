//! Machine-code assembly: growable code buffer, labels, and x86 encoders.

pub mod buffer;
pub mod x86;

pub use buffer::{CodeBuffer, EmitError, Label};
pub use x86::{Emitter, Mem, Mode, Reg, Cond};
