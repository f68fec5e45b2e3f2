//! OS virtual-memory primitives
//!
//! Page reservation and protection for the region allocator. Reservation
//! asks for read-write-execute pages and falls back to read-write where the
//! platform enforces W^X; such regions are flipped to read-execute at
//! publication time.

use std::io;

/// How a freshly reserved region can be written and executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Writable and executable at once; nothing to do at publication.
    ReadWriteExec,
    /// Writable only; must be switched to read-execute before running.
    ReadWrite,
}

/// Marks a published region as code for external tooling.
///
/// Some profilers and debuggers want to be told about dynamically generated
/// code. The manager calls `mark` once per region the first time code is
/// committed into it.
pub trait CodeMarker {
    /// Report `len` bytes at `base` as generated code.
    fn mark(&self, base: *const u8, len: usize);
}

/// Marker that reports nothing.
pub struct NopMarker;

impl CodeMarker for NopMarker {
    fn mark(&self, _base: *const u8, _len: usize) {}
}

/// System page size in bytes.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }
    #[cfg(windows)]
    {
        use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
        unsafe {
            let mut info: SYSTEM_INFO = std::mem::zeroed();
            GetSystemInfo(&mut info);
            info.dwPageSize as usize
        }
    }
}

/// Reserve `size` bytes of page-aligned memory, preferring RWX.
///
/// Returns the base pointer and the protection actually obtained.
pub fn reserve(size: usize) -> io::Result<(*mut u8, Protection)> {
    #[cfg(unix)]
    {
        unsafe {
            let rwx = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                size,
                rwx,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if ptr != libc::MAP_FAILED {
                return Ok((ptr as *mut u8, Protection::ReadWriteExec));
            }
            // W^X kernels refuse PROT_WRITE|PROT_EXEC; retry writable-only.
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok((ptr as *mut u8, Protection::ReadWrite))
        }
    }
    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Memory::{
            VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
        };
        unsafe {
            let ptr = VirtualAlloc(
                std::ptr::null(),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            );
            if ptr.is_null() {
                return Err(io::Error::last_os_error());
            }
            Ok((ptr as *mut u8, Protection::ReadWriteExec))
        }
    }
}

/// Switch a reserved region to read-execute.
pub fn protect_rx(base: *mut u8, size: usize) -> io::Result<()> {
    #[cfg(unix)]
    {
        unsafe {
            if libc::mprotect(base as *mut _, size, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_EXECUTE_READ};
        unsafe {
            let mut old = 0u32;
            if VirtualProtect(base as *mut _, size, PAGE_EXECUTE_READ, &mut old) == 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

/// Return a reserved region to the OS.
pub fn release(base: *mut u8, size: usize) {
    #[cfg(unix)]
    {
        unsafe {
            libc::munmap(base as *mut _, size);
        }
    }
    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
        let _ = size;
        unsafe {
            VirtualFree(base as *mut _, 0, MEM_RELEASE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        let ps = page_size();
        assert!(ps >= 4096);
        assert!(ps.is_power_of_two());
    }

    #[test]
    fn test_reserve_write_release() {
        let ps = page_size();
        let (base, _prot) = reserve(ps).unwrap();
        assert!(!base.is_null());
        assert_eq!(base as usize % ps, 0);
        unsafe {
            base.write(0xC3);
            assert_eq!(base.read(), 0xC3);
        }
        release(base, ps);
    }
}
