//! Read-only view over a loaded AMX image
//!
//! `Program` borrows an `Amx` the host has already initialized and exposes
//! the code/data bounds and the public/native tables. It copies nothing and
//! never writes through the pointer.

use std::ffi::CStr;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::amx::raw::{
    Amx, AmxHeader, Cell, FuncStub, Ucell, AMX_EXEC_MAIN, AMX_FLAG_RELOC,
};

/// Thin read-only borrow of a loaded AMX instance.
#[derive(Clone, Copy)]
pub struct Program<'a> {
    amx: NonNull<Amx>,
    _marker: PhantomData<&'a Amx>,
}

impl<'a> Program<'a> {
    /// Wrap a loaded AMX.
    ///
    /// # Safety
    ///
    /// `amx` must point to an initialized AMX whose `base` image stays alive
    /// and unmodified for the lifetime of the view.
    pub unsafe fn new(amx: *mut Amx) -> Program<'a> {
        Program {
            amx: NonNull::new(amx).expect("null AMX"),
            _marker: PhantomData,
        }
    }

    /// The underlying AMX pointer.
    pub fn amx(&self) -> *mut Amx {
        self.amx.as_ptr()
    }

    fn amx_ref(&self) -> &Amx {
        unsafe { self.amx.as_ref() }
    }

    /// The image header.
    pub fn header(&self) -> &AmxHeader {
        unsafe { &*(self.amx_ref().base as *const AmxHeader) }
    }

    /// `AMX_FLAG_*` bits of the instance.
    pub fn flags(&self) -> u16 {
        self.amx_ref().flags as u16
    }

    /// Whether branch operands hold absolute (relocated) addresses.
    pub fn is_relocated(&self) -> bool {
        self.flags() & AMX_FLAG_RELOC != 0
    }

    /// Base pointer of the code section.
    pub fn code(&self) -> *const u8 {
        unsafe { self.amx_ref().base.add(self.header().cod as usize) }
    }

    /// Code section size in bytes.
    pub fn code_size(&self) -> usize {
        (self.header().dat - self.header().cod) as usize
    }

    /// The code section as a cell slice.
    pub fn code_cells(&self) -> &'a [Cell] {
        unsafe {
            std::slice::from_raw_parts(
                self.code() as *const Cell,
                self.code_size() / std::mem::size_of::<Cell>(),
            )
        }
    }

    /// Base pointer of the data section.
    pub fn data(&self) -> *mut u8 {
        let amx = self.amx_ref();
        if amx.data.is_null() {
            unsafe { amx.base.add(self.header().dat as usize) }
        } else {
            amx.data
        }
    }

    /// Size of the static data section (excluding heap and stack growth).
    pub fn data_size(&self) -> usize {
        (self.header().hea - self.header().dat) as usize
    }

    /// Number of public functions.
    pub fn num_publics(&self) -> usize {
        let hdr = self.header();
        ((hdr.natives - hdr.publics) / hdr.defsize as i32) as usize
    }

    /// Number of native functions.
    pub fn num_natives(&self) -> usize {
        let hdr = self.header();
        ((hdr.libraries - hdr.natives) / hdr.defsize as i32) as usize
    }

    fn publics(&self) -> &'a [FuncStub] {
        unsafe {
            std::slice::from_raw_parts(
                self.amx_ref().base.add(self.header().publics as usize) as *const FuncStub,
                self.num_publics(),
            )
        }
    }

    fn natives(&self) -> &'a [FuncStub] {
        unsafe {
            std::slice::from_raw_parts(
                self.amx_ref().base.add(self.header().natives as usize) as *const FuncStub,
                self.num_natives(),
            )
        }
    }

    fn name_at(&self, offset: Ucell) -> &'a str {
        unsafe {
            let ptr = self.amx_ref().base.add(offset as usize);
            CStr::from_ptr(ptr as *const _).to_str().unwrap_or("")
        }
    }

    /// Code address of a public function. `AMX_EXEC_MAIN` resolves through
    /// the header `cip`; returns `None` for a bad index or a missing `main`.
    pub fn public_address(&self, index: i32) -> Option<Cell> {
        if index == AMX_EXEC_MAIN {
            let cip = self.header().cip;
            if cip > 0 {
                return Some(cip);
            }
            return None;
        }
        self.publics().get(index as usize).map(|s| s.address as Cell)
    }

    /// Name of a public function.
    pub fn public_name(&self, index: usize) -> Option<&'a str> {
        self.publics().get(index).map(|s| self.name_at(s.nameofs))
    }

    /// Index of the public function at `address`.
    pub fn find_public(&self, address: Cell) -> Option<usize> {
        self.publics()
            .iter()
            .position(|s| s.address == address as Ucell)
    }

    /// Registered address of a native function.
    pub fn native_address(&self, index: usize) -> Option<Ucell> {
        self.natives().get(index).map(|s| s.address)
    }

    /// Name of a native function.
    pub fn native_name(&self, index: usize) -> Option<&'a str> {
        self.natives().get(index).map(|s| self.name_at(s.nameofs))
    }

    /// Index of the native function registered at `address`.
    pub fn find_native(&self, address: Cell) -> Option<usize> {
        self.natives()
            .iter()
            .position(|s| s.address == address as Ucell)
    }

    /// Translate a branch operand into a code-section offset.
    ///
    /// Relocated images store absolute machine addresses in `CALL`/`JUMP`/
    /// `SWITCH` operands; unrelocated ones already hold code offsets.
    pub fn branch_target(&self, operand: Cell) -> Cell {
        if self.is_relocated() {
            operand.wrapping_sub(self.code() as usize as Cell)
        } else {
            operand
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amx::raw::AMX_USERNUM;
    use std::os::raw::c_void;

    // A minimal image: header, one public ("go" at 0x20), one native
    // ("clock" at fake address 0xBEEF), a name table, 64 bytes of code
    // and 32 bytes of data.
    fn build_image() -> (Vec<u8>, Amx) {
        let publics_ofs = 56;
        let natives_ofs = publics_ofs + 8;
        let libraries_ofs = natives_ofs + 8;
        let name_ofs = libraries_ofs;
        let cod = name_ofs + 16;
        let dat = cod + 64;
        let hea = dat + 32;
        let stp = hea + 256;

        let mut image = vec![0u8; hea as usize];
        let hdr = AmxHeader {
            size: hea,
            magic: 0xF1E0,
            file_version: 8,
            amx_version: 8,
            flags: 0,
            defsize: 8,
            cod,
            dat,
            hea,
            stp,
            cip: -1,
            publics: publics_ofs,
            natives: natives_ofs,
            libraries: libraries_ofs,
            pubvars: libraries_ofs,
            tags: libraries_ofs,
            nametable: name_ofs,
        };
        unsafe {
            std::ptr::copy_nonoverlapping(
                &hdr as *const AmxHeader as *const u8,
                image.as_mut_ptr(),
                56,
            );
        }
        let public = FuncStub { address: 0x20, nameofs: name_ofs as Ucell };
        let native = FuncStub { address: 0xBEEF, nameofs: name_ofs as Ucell + 3 };
        unsafe {
            std::ptr::copy_nonoverlapping(
                &public as *const FuncStub as *const u8,
                image.as_mut_ptr().add(publics_ofs as usize),
                8,
            );
            std::ptr::copy_nonoverlapping(
                &native as *const FuncStub as *const u8,
                image.as_mut_ptr().add(natives_ofs as usize),
                8,
            );
        }
        image[name_ofs as usize..name_ofs as usize + 3].copy_from_slice(b"go\0");
        image[name_ofs as usize + 3..name_ofs as usize + 9].copy_from_slice(b"clock\0");

        let amx = Amx {
            base: std::ptr::null_mut(),
            data: std::ptr::null_mut(),
            callback: None,
            debug: None,
            cip: 0,
            frm: 0,
            hea: 0,
            hlw: 0,
            stk: 0,
            stp: 0,
            flags: 0,
            usertags: [0; AMX_USERNUM],
            userdata: [std::ptr::null_mut::<c_void>(); AMX_USERNUM],
            error: 0,
            paramcount: 0,
            pri: 0,
            alt: 0,
            reset_stk: 0,
            reset_hea: 0,
            sysreq_d: 0,
        };
        (image, amx)
    }

    #[test]
    fn test_tables_and_names() {
        let (mut image, mut amx) = build_image();
        amx.base = image.as_mut_ptr();
        let program = unsafe { Program::new(&mut amx) };

        assert_eq!(program.num_publics(), 1);
        assert_eq!(program.num_natives(), 1);
        assert_eq!(program.public_name(0), Some("go"));
        assert_eq!(program.native_name(0), Some("clock"));
        assert_eq!(program.public_address(0), Some(0x20));
        assert_eq!(program.find_public(0x20), Some(0));
        assert_eq!(program.find_public(0x24), None);
        assert_eq!(program.find_native(0xBEEF), Some(0));
        assert_eq!(program.code_size(), 64);
        assert_eq!(program.data_size(), 32);
    }

    #[test]
    fn test_main_entry_missing() {
        let (mut image, mut amx) = build_image();
        amx.base = image.as_mut_ptr();
        let program = unsafe { Program::new(&mut amx) };
        // Header cip is -1: no main.
        assert_eq!(program.public_address(AMX_EXEC_MAIN), None);
    }

    #[test]
    fn test_branch_target_unrelocated() {
        let (mut image, mut amx) = build_image();
        amx.base = image.as_mut_ptr();
        let program = unsafe { Program::new(&mut amx) };
        assert!(!program.is_relocated());
        assert_eq!(program.branch_target(0x40), 0x40);
    }
}
