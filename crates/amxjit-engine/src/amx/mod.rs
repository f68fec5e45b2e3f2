//! AMX virtual machine structures
//!
//! Raw `#[repr(C)]` mirrors of the loaded AMX image, the read-only
//! `Program` view the rest of the engine works through, and a builder for
//! synthetic in-memory images.

pub mod image;
pub mod program;
pub mod raw;

pub use image::{AmxImage, ImageBuilder};
pub use program::Program;
pub use raw::{Amx, AmxError, AmxHeader, Cell, FuncStub, Ucell};
