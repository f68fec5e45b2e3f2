//! Interpreter exec hook
//!
//! The host publishes its AMX API as a table of function pointers; the JIT
//! takes over by swapping the `Exec` slot and keeping the original pointer
//! as the fallback trampoline. Before installing, the exec entry is probed
//! for an inline detour left by another plugin: loading behind one would
//! silently bypass the JIT, so that is reported and refused.

use std::os::raw::c_void;

use amxjit_engine::amx::raw::AmxExec;

/// Index of `amx_Exec` in the host's AMX export table.
pub const EXPORT_EXEC: usize = 7;

/// The `Exec` slot swap. Dropping does not unhook; call [`ExecHook::remove`]
/// from the plugin's unload path.
pub struct ExecHook {
    exports: *mut *mut c_void,
    original: AmxExec,
}

impl ExecHook {
    /// Replace the exec export with `replacement`, keeping the original as
    /// the trampoline.
    ///
    /// # Safety
    ///
    /// `exports` must be the host's AMX export table, valid for the plugin's
    /// lifetime.
    pub unsafe fn install(exports: *mut *mut c_void, replacement: AmxExec) -> ExecHook {
        let slot = exports.add(EXPORT_EXEC);
        let original: AmxExec = std::mem::transmute(*slot);
        *slot = replacement as *mut c_void;
        ExecHook { exports, original }
    }

    /// The interpreter's own exec, used for browse queries and fallback.
    pub fn original(&self) -> AmxExec {
        self.original
    }

    /// Put the original exec back.
    pub fn remove(&self) {
        unsafe {
            *self.exports.add(EXPORT_EXEC) = self.original as *mut c_void;
        }
    }
}

/// If `exec` starts with a `jmp rel32` detour, return where it leads.
///
/// # Safety
///
/// `exec` must point to at least five readable bytes of code.
pub unsafe fn probe_detour(exec: *const u8) -> Option<*const u8> {
    if exec.read() != 0xE9 {
        return None;
    }
    let rel = (exec.add(1) as *const i32).read_unaligned();
    Some(exec.add(5).offset(rel as isize))
}

/// Name of the shared object or DLL containing `address`, for the
/// load-order diagnostic.
pub fn module_name(address: *const u8) -> Option<String> {
    #[cfg(unix)]
    {
        use std::ffi::CStr;
        unsafe {
            let mut info: libc::Dl_info = std::mem::zeroed();
            if libc::dladdr(address as *const _, &mut info) != 0 && !info.dli_fname.is_null() {
                let path = CStr::from_ptr(info.dli_fname).to_string_lossy().into_owned();
                return Some(file_name(&path));
            }
        }
        None
    }
    #[cfg(windows)]
    {
        use windows_sys::Win32::System::LibraryLoader::GetModuleFileNameA;
        use windows_sys::Win32::System::Memory::{VirtualQuery, MEMORY_BASIC_INFORMATION};
        unsafe {
            let mut mbi: MEMORY_BASIC_INFORMATION = std::mem::zeroed();
            if VirtualQuery(
                address as *const _,
                &mut mbi,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            ) == 0
            {
                return None;
            }
            let mut buffer = [0u8; 1024];
            let len = GetModuleFileNameA(
                mbi.AllocationBase as _,
                buffer.as_mut_ptr(),
                buffer.len() as u32,
            ) as usize;
            if len == 0 {
                return None;
            }
            let path = String::from_utf8_lossy(&buffer[..len]).into_owned();
            Some(file_name(&path))
        }
    }
}

fn file_name(path: &str) -> String {
    path.rsplit(['/', '\\']).next().unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use amxjit_engine::amx::raw::{Amx, Cell};

    unsafe extern "C" fn fake_exec(_amx: *mut Amx, _retval: *mut Cell, _index: i32) -> i32 {
        17
    }

    unsafe extern "C" fn fake_jit(_amx: *mut Amx, _retval: *mut Cell, _index: i32) -> i32 {
        42
    }

    #[test]
    fn test_install_swaps_and_remove_restores() {
        let mut exports = [std::ptr::null_mut::<c_void>(); 16];
        exports[EXPORT_EXEC] = fake_exec as *mut c_void;

        let hook = unsafe { ExecHook::install(exports.as_mut_ptr(), fake_jit) };
        assert_eq!(exports[EXPORT_EXEC], fake_jit as *mut c_void);
        let original = hook.original();
        assert_eq!(
            unsafe { original(std::ptr::null_mut(), std::ptr::null_mut(), 0) },
            17
        );

        hook.remove();
        assert_eq!(exports[EXPORT_EXEC], fake_exec as *mut c_void);
    }

    #[test]
    fn test_probe_detour_reads_jmp_target() {
        // jmp +0x10 followed by padding.
        let mut code = [0x90u8; 32];
        code[0] = 0xE9;
        code[1..5].copy_from_slice(&0x10i32.to_le_bytes());
        let target = unsafe { probe_detour(code.as_ptr()) };
        assert_eq!(target, Some(unsafe { code.as_ptr().add(0x15) }));
    }

    #[test]
    fn test_probe_detour_ignores_plain_code() {
        let code = [0x55u8, 0x8B, 0xEC, 0x90, 0x90];
        assert_eq!(unsafe { probe_detour(code.as_ptr()) }, None);
    }

    #[test]
    fn test_file_name_strips_directories() {
        assert_eq!(file_name("/srv/plugins/crashdetect.so"), "crashdetect.so");
        assert_eq!(file_name("C:\\server\\plugins\\other.dll"), "other.dll");
        assert_eq!(file_name("bare.so"), "bare.so");
    }
}
