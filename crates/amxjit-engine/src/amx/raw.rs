//! Raw AMX ABI types
//!
//! Field-for-field mirrors of the structures the host runtime hands us. The
//! engine never parses `.amx` files; it consumes images the host has already
//! loaded and relocated, so these layouts must match the C ABI exactly.

use std::os::raw::c_void;

/// The AMX machine word: a signed 32-bit integer.
pub type Cell = i32;

/// Unsigned view of a [`Cell`].
pub type Ucell = u32;

/// Native function signature: `cell AMX_NATIVE_CALL f(AMX *amx, cell *params)`.
pub type AmxNative = unsafe extern "C" fn(amx: *mut Amx, params: *mut Cell) -> Cell;

/// Callback the interpreter routes `SYSREQ` through:
/// `int amx_Callback(AMX *amx, cell index, cell *result, cell *params)`.
pub type AmxCallback =
    unsafe extern "C" fn(amx: *mut Amx, index: Cell, result: *mut Cell, params: *mut Cell) -> i32;

/// Debug hook signature. The JIT never invokes it; the field only exists to
/// keep the struct layout intact.
pub type AmxDebug = unsafe extern "C" fn(amx: *mut Amx) -> i32;

/// `amx_Exec` signature, both the hooked export and its trampoline.
pub type AmxExec =
    unsafe extern "C" fn(amx: *mut Amx, retval: *mut Cell, index: i32) -> i32;

/// Number of user data slots in the AMX struct.
pub const AMX_USERNUM: usize = 4;

/// Run the program's `main` function.
pub const AMX_EXEC_MAIN: i32 = -1;
/// Continue a previously slept execution.
pub const AMX_EXEC_CONT: i32 = -2;

/// `amx->flags`: the image carries debug information.
pub const AMX_FLAG_DEBUG: u16 = 0x02;
/// `amx->flags`: compact encoding (not supported by the JIT).
pub const AMX_FLAG_COMPACT: u16 = 0x04;
/// `amx->flags`: opcodes are single bytes (not supported by the JIT).
pub const AMX_FLAG_BYTEOPC: u16 = 0x08;
/// `amx->flags`: no array bound checks were compiled in.
pub const AMX_FLAG_NOCHECKS: u16 = 0x10;
/// `amx->flags`: the interpreter is being queried for its opcode table.
pub const AMX_FLAG_BROWSE: u16 = 0x4000;
/// `amx->flags`: branch targets were relocated to absolute addresses.
pub const AMX_FLAG_RELOC: u16 = 0x8000;

/// AMX error codes as the host ABI defines them.
///
/// These are wire values, not a Rust error type; the engine's own failures
/// live in their modules and are mapped onto these at the host boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AmxError {
    /// No error.
    None = 0,
    /// Forced exit.
    Exit = 1,
    /// Assertion failed.
    Assert = 2,
    /// Stack or frame register out of range.
    StackErr = 3,
    /// Array index out of bounds.
    Bounds = 4,
    /// Invalid memory access.
    MemAccess = 5,
    /// Invalid instruction.
    InvInstr = 6,
    /// Stack underflow.
    StackLow = 7,
    /// Heap underflow.
    HeapLow = 8,
    /// No (or invalid) native callback.
    Callback = 9,
    /// Native function failed.
    Native = 10,
    /// Division by zero.
    Divide = 11,
    /// The program requested to go to sleep.
    Sleep = 12,
    /// Invalid state for this access.
    InvState = 13,
    /// Out of memory.
    Memory = 16,
    /// Invalid file format.
    Format = 17,
    /// File is for a newer version of the AMX.
    Version = 18,
    /// Function not found.
    NotFound = 19,
    /// Invalid index parameter.
    Index = 20,
    /// Debugger cannot run.
    Debug = 21,
    /// AMX not initialized or doubly initialized.
    Init = 22,
    /// Unable to set user data field.
    UserData = 23,
    /// Cannot initialize the JIT.
    InitJit = 24,
    /// Parameter error.
    Params = 25,
    /// Domain error.
    Domain = 26,
    /// General failure.
    General = 27,
}

impl AmxError {
    /// Recover an error enum from a raw host value. Unknown values collapse
    /// to [`AmxError::General`].
    pub fn from_raw(code: i32) -> AmxError {
        match code {
            0 => AmxError::None,
            1 => AmxError::Exit,
            2 => AmxError::Assert,
            3 => AmxError::StackErr,
            4 => AmxError::Bounds,
            5 => AmxError::MemAccess,
            6 => AmxError::InvInstr,
            7 => AmxError::StackLow,
            8 => AmxError::HeapLow,
            9 => AmxError::Callback,
            10 => AmxError::Native,
            11 => AmxError::Divide,
            12 => AmxError::Sleep,
            13 => AmxError::InvState,
            16 => AmxError::Memory,
            17 => AmxError::Format,
            18 => AmxError::Version,
            19 => AmxError::NotFound,
            20 => AmxError::Index,
            21 => AmxError::Debug,
            22 => AmxError::Init,
            23 => AmxError::UserData,
            24 => AmxError::InitJit,
            25 => AmxError::Params,
            26 => AmxError::Domain,
            _ => AmxError::General,
        }
    }
}

/// The in-memory AMX instance, as `amx.h` lays it out.
#[repr(C)]
pub struct Amx {
    /// Points to the image: header followed by code and data.
    pub base: *mut u8,
    /// Separate data block, or null when data follows code in `base`.
    pub data: *mut u8,
    /// Native dispatch callback.
    pub callback: Option<AmxCallback>,
    /// Debug hook.
    pub debug: Option<AmxDebug>,
    /// Instruction pointer, saved on sleep.
    pub cip: Cell,
    /// Frame pointer, relative to the data section.
    pub frm: Cell,
    /// Heap top, relative to the data section.
    pub hea: Cell,
    /// Heap bottom.
    pub hlw: Cell,
    /// Stack pointer, relative to the data section.
    pub stk: Cell,
    /// Stack top.
    pub stp: Cell,
    /// `AMX_FLAG_*` bits (widened to `int` in the C struct).
    pub flags: i32,
    /// User tag slots.
    pub usertags: [isize; AMX_USERNUM],
    /// User data slots.
    pub userdata: [*mut c_void; AMX_USERNUM],
    /// Error set by natives (notably `AMX_ERR_SLEEP`).
    pub error: i32,
    /// Number of cells pushed by `amx_Push` since the last `amx_Exec`.
    pub paramcount: i32,
    /// Primary register, saved on sleep.
    pub pri: Cell,
    /// Alternate register, saved on sleep.
    pub alt: Cell,
    /// Stack pointer to restore when a slept execution finishes.
    pub reset_stk: Cell,
    /// Heap top to restore when a slept execution finishes.
    pub reset_hea: Cell,
    /// Relocated address of `amx_exec_sysreq_d`, unused here.
    pub sysreq_d: Cell,
}

/// The fixed 56-byte header at the start of every AMX image.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AmxHeader {
    /// Size of the memory image, excluding stack and heap.
    pub size: i32,
    /// `0xF1E0` for cell sizes of 32 bits.
    pub magic: u16,
    /// File format version.
    pub file_version: u8,
    /// Required VM version.
    pub amx_version: u8,
    /// Flags.
    pub flags: i16,
    /// Size of a public/native record; 8 for the name-table format.
    pub defsize: i16,
    /// File offset of the code section.
    pub cod: i32,
    /// File offset of the data section.
    pub dat: i32,
    /// Initial heap top; doubles as the heap bottom bound.
    pub hea: i32,
    /// Stack top.
    pub stp: i32,
    /// Entry point of `main`, or < 0 if none.
    pub cip: i32,
    /// File offset of the public function table.
    pub publics: i32,
    /// File offset of the native function table.
    pub natives: i32,
    /// File offset of the library table.
    pub libraries: i32,
    /// File offset of the public variable table.
    pub pubvars: i32,
    /// File offset of the tag table.
    pub tags: i32,
    /// File offset of the name table.
    pub nametable: i32,
}

/// One record of the public or native function table.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FuncStub {
    /// Function address: a code offset for publics, a registered function
    /// pointer for natives.
    pub address: Ucell,
    /// Image offset of the zero-terminated name.
    pub nameofs: Ucell,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(std::mem::size_of::<AmxHeader>(), 56);
        assert_eq!(std::mem::offset_of!(AmxHeader, cod), 12);
        assert_eq!(std::mem::offset_of!(AmxHeader, dat), 16);
        assert_eq!(std::mem::offset_of!(AmxHeader, cip), 28);
        assert_eq!(std::mem::offset_of!(AmxHeader, nametable), 52);
    }

    #[test]
    fn test_funcstub_layout() {
        assert_eq!(std::mem::size_of::<FuncStub>(), 8);
    }

    #[test]
    fn test_error_round_trip() {
        assert_eq!(AmxError::from_raw(0), AmxError::None);
        assert_eq!(AmxError::from_raw(12), AmxError::Sleep);
        assert_eq!(AmxError::from_raw(24), AmxError::InitJit);
        assert_eq!(AmxError::from_raw(99), AmxError::General);
        assert_eq!(AmxError::Sleep as i32, 12);
    }
}
