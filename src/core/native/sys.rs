// Raw FFI: dynamic loader calls, native crasher symbol names, and the raw address write.
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::path::Path;
use std::ptr::NonNull;

use crate::core::error::{Error, ErrorKind};

pub const ABI_VERSION: c_int = 1;

pub const SYM_ABI_VERSION: &CStr = c"nativecrasher_abi_version";
pub const SYM_CRASH_ABORT: &CStr = c"nativecrasher_crash_with_abort";
pub const SYM_CRASH_INVALID_FREE: &CStr = c"nativecrasher_crash_with_invalid_free";
pub const SYM_CRASH_NULL_POINTER: &CStr = c"nativecrasher_crash_with_null_pointer";

pub type AbiVersionFn = unsafe extern "C" fn() -> c_int;
pub type CrashFn = unsafe extern "C" fn() -> *const c_char;

// Inside the never-mapped first page. Null itself would trip the debug-build
// precondition check in `write_volatile` and abort instead of faulting.
pub const UNMAPPED_ADDRESS: usize = 0x8;

/// Owned `dlopen` handle; closed on drop.
#[derive(Debug)]
pub struct LibraryHandle {
    handle: NonNull<c_void>,
}

// dlopen handles are process-global and safe to use from any thread.
unsafe impl Send for LibraryHandle {}
unsafe impl Sync for LibraryHandle {}

impl LibraryHandle {
    #[cfg(unix)]
    pub fn open(path: &Path) -> Result<Self, Error> {
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|err| {
            Error::new(ErrorKind::NativeLoad)
                .with_message("library path contains a nul byte")
                .with_path(path)
                .with_source(err)
        })?;
        let raw = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        match NonNull::new(raw) {
            Some(handle) => Ok(Self { handle }),
            None => Err(Error::new(ErrorKind::NativeLoad)
                .with_message(format!("dynamic loader rejected library: {}", last_dl_error()))
                .with_path(path)),
        }
    }

    #[cfg(not(unix))]
    pub fn open(path: &Path) -> Result<Self, Error> {
        Err(Error::new(ErrorKind::NativeLoad)
            .with_message("dynamic loading is not supported on this platform")
            .with_path(path))
    }

    #[cfg(unix)]
    pub fn symbol(&self, name: &CStr) -> Result<NonNull<c_void>, Error> {
        // Clear any stale error so a null result can be told apart from a failure.
        unsafe { libc::dlerror() };
        let raw = unsafe { libc::dlsym(self.handle.as_ptr(), name.as_ptr()) };
        NonNull::new(raw).ok_or_else(|| {
            Error::new(ErrorKind::NativeLoad).with_message(format!(
                "missing symbol {}: {}",
                name.to_string_lossy(),
                last_dl_error()
            ))
        })
    }

    #[cfg(not(unix))]
    pub fn symbol(&self, name: &CStr) -> Result<NonNull<c_void>, Error> {
        Err(Error::new(ErrorKind::NativeLoad)
            .with_message(format!("missing symbol {}", name.to_string_lossy())))
    }
}

impl Drop for LibraryHandle {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::dlclose(self.handle.as_ptr());
        }
    }
}

#[cfg(unix)]
fn last_dl_error() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        return "unknown error".to_string();
    }
    unsafe { CStr::from_ptr(message) }
        .to_string_lossy()
        .into_owned()
}

/// Writes `value` straight to `address`.
///
/// # Safety
///
/// Any address the process does not own corrupts memory or faults. Callers use
/// this only to terminate the process.
pub unsafe fn put_address(address: usize, value: u64) {
    unsafe { std::ptr::write_volatile(address as *mut u64, value) }
}
