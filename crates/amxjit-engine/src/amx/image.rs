//! Synthetic AMX images
//!
//! Builds a complete in-memory AMX instance from raw code and data cells,
//! laid out exactly as a loaded `.amx` file: header, public/native tables,
//! name table, code, data, then heap and stack space. Used by the test
//! suites and by host-less tooling; production programs come from the host
//! already loaded.

use crate::amx::raw::{
    Amx, AmxCallback, AmxHeader, Cell, FuncStub, AMX_USERNUM,
};

const CELL: usize = std::mem::size_of::<Cell>();
const HEADER_SIZE: usize = std::mem::size_of::<AmxHeader>();

/// Builder for a synthetic AMX image.
pub struct ImageBuilder {
    code: Vec<Cell>,
    data: Vec<Cell>,
    publics: Vec<(String, Cell)>,
    natives: Vec<String>,
    main: Option<Cell>,
    arena: usize,
}

impl ImageBuilder {
    /// Empty program with a 4 KiB heap/stack arena.
    pub fn new() -> ImageBuilder {
        ImageBuilder {
            code: Vec::new(),
            data: Vec::new(),
            publics: Vec::new(),
            natives: Vec::new(),
            main: None,
            arena: 4096,
        }
    }

    /// Set the code section.
    pub fn code(mut self, code: Vec<Cell>) -> ImageBuilder {
        self.code = code;
        self
    }

    /// Set the static data section.
    pub fn data(mut self, data: Vec<Cell>) -> ImageBuilder {
        self.data = data;
        self
    }

    /// Add a public function.
    pub fn public(mut self, name: &str, address: Cell) -> ImageBuilder {
        self.publics.push((name.to_string(), address));
        self
    }

    /// Add a native function slot (resolved by index at run time).
    pub fn native(mut self, name: &str) -> ImageBuilder {
        self.natives.push(name.to_string());
        self
    }

    /// Set the `main` entry point.
    pub fn main(mut self, address: Cell) -> ImageBuilder {
        self.main = Some(address);
        self
    }

    /// Heap plus stack arena size in bytes.
    pub fn arena(mut self, bytes: usize) -> ImageBuilder {
        self.arena = bytes;
        self
    }

    /// Lay the image out and initialize the AMX registers the way the host
    /// loader would.
    pub fn build(self) -> AmxImage {
        let publics_ofs = HEADER_SIZE;
        let natives_ofs = publics_ofs + self.publics.len() * 8;
        let name_ofs = natives_ofs + self.natives.len() * 8;

        let mut names = Vec::new();
        let mut public_stubs = Vec::new();
        for (name, address) in &self.publics {
            public_stubs.push(FuncStub {
                address: *address as u32,
                nameofs: (name_ofs + names.len()) as u32,
            });
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }
        let mut native_stubs = Vec::new();
        for name in &self.natives {
            native_stubs.push(FuncStub {
                address: 0,
                nameofs: (name_ofs + names.len()) as u32,
            });
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }

        let cod = (name_ofs + names.len()).div_ceil(CELL) * CELL;
        let dat = cod + self.code.len() * CELL;
        let hea = dat + self.data.len() * CELL;
        let stp = hea + self.arena;

        let mut image = vec![0u8; stp].into_boxed_slice();
        let header = AmxHeader {
            size: hea as i32,
            magic: 0xF1E0,
            file_version: 8,
            amx_version: 8,
            flags: 0,
            defsize: 8,
            cod: cod as i32,
            dat: dat as i32,
            hea: hea as i32,
            stp: stp as i32,
            cip: self.main.unwrap_or(-1),
            publics: publics_ofs as i32,
            natives: natives_ofs as i32,
            libraries: name_ofs as i32,
            pubvars: name_ofs as i32,
            tags: name_ofs as i32,
            nametable: name_ofs as i32,
        };
        unsafe {
            std::ptr::copy_nonoverlapping(
                &header as *const AmxHeader as *const u8,
                image.as_mut_ptr(),
                HEADER_SIZE,
            );
            for (i, stub) in public_stubs.iter().enumerate() {
                std::ptr::copy_nonoverlapping(
                    stub as *const FuncStub as *const u8,
                    image.as_mut_ptr().add(publics_ofs + i * 8),
                    8,
                );
            }
            for (i, stub) in native_stubs.iter().enumerate() {
                std::ptr::copy_nonoverlapping(
                    stub as *const FuncStub as *const u8,
                    image.as_mut_ptr().add(natives_ofs + i * 8),
                    8,
                );
            }
        }
        image[name_ofs..name_ofs + names.len()].copy_from_slice(&names);
        for (i, &cell) in self.code.iter().enumerate() {
            image[cod + i * CELL..cod + (i + 1) * CELL].copy_from_slice(&cell.to_le_bytes());
        }
        for (i, &cell) in self.data.iter().enumerate() {
            image[dat + i * CELL..dat + (i + 1) * CELL].copy_from_slice(&cell.to_le_bytes());
        }

        let hlw = (hea - dat) as Cell;
        let stk = (stp - dat - CELL) as Cell;
        let mut amx = Box::new(Amx {
            base: std::ptr::null_mut(),
            data: std::ptr::null_mut(),
            callback: None,
            debug: None,
            cip: 0,
            frm: 0,
            hea: hlw,
            hlw,
            stk,
            stp: stk,
            flags: 0,
            usertags: [0; AMX_USERNUM],
            userdata: [std::ptr::null_mut(); AMX_USERNUM],
            error: 0,
            paramcount: 0,
            pri: 0,
            alt: 0,
            reset_stk: stk,
            reset_hea: hlw,
            sysreq_d: 0,
        });
        amx.base = image.as_mut_ptr();
        AmxImage { _image: image, amx }
    }
}

impl Default for ImageBuilder {
    fn default() -> Self {
        ImageBuilder::new()
    }
}

/// A built image and its AMX instance. The heap allocations keep their
/// addresses when the struct moves, so the AMX pointers stay valid.
pub struct AmxImage {
    _image: Box<[u8]>,
    /// The initialized VM instance.
    pub amx: Box<Amx>,
}

impl AmxImage {
    /// The AMX, as the host would hand it to the plugin.
    pub fn amx_mut(&mut self) -> *mut Amx {
        self.amx.as_mut() as *mut Amx
    }

    /// Install a native dispatch callback.
    pub fn set_callback(&mut self, callback: AmxCallback) {
        self.amx.callback = Some(callback);
    }

    fn data_ptr(&self) -> *mut u8 {
        let header = unsafe { &*(self.amx.base as *const AmxHeader) };
        unsafe { self.amx.base.add(header.dat as usize) }
    }

    /// Read a data cell at a data-relative address.
    pub fn data_cell(&self, address: Cell) -> Cell {
        unsafe { (self.data_ptr().add(address as usize) as *const Cell).read_unaligned() }
    }

    /// Push a call argument the way `amx_Push` does.
    pub fn push(&mut self, value: Cell) {
        self.amx.stk -= CELL as Cell;
        let stk = self.amx.stk;
        unsafe {
            (self.data_ptr().add(stk as usize) as *mut Cell).write_unaligned(value);
        }
        self.amx.paramcount += 1;
    }
}
