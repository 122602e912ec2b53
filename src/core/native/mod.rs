//! Purpose: Load the native crasher library once per process and expose its crash operations.
//! Exports: `NativeBridge`, `LazyBridge`, `CrashKind`, `global`, `configure_global`, `crash_unsafe_write`.
//! Role: Foreign-function boundary for every crash path, with or without the loaded library.
//! Invariants: A `LazyBridge` runs its init function at most once, even under concurrent callers.
//! Invariants: A failed init is cached and returned to every later caller; it is never retried.
//! Invariants: All FFI interaction is confined to this module + `sys`.
use std::ffi::CStr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::error::{Error, ErrorKind};
use crate::core::materialize::Materializer;
use crate::core::platform::{LibraryTarget, host_platform_identifier};

pub mod sys;

use sys::{AbiVersionFn, CrashFn, LibraryHandle};

#[derive(Debug)]
pub struct NativeBridge {
    path: PathBuf,
    target: LibraryTarget,
    abi_version: i32,
    crash_abort: CrashFn,
    crash_invalid_free: CrashFn,
    crash_null_pointer: CrashFn,
    // Declared last so the function pointers above never outlive the mapping.
    _library: LibraryHandle,
}

impl NativeBridge {
    /// Materializes the library for `platform_identifier` and loads it.
    pub fn load(materializer: &Materializer, platform_identifier: &str) -> Result<Self, Error> {
        let target = LibraryTarget::from_identifier(platform_identifier)?;
        let path = materializer.materialize(platform_identifier)?;
        Self::open(&path, target)
    }

    pub fn open(path: &Path, target: LibraryTarget) -> Result<Self, Error> {
        let library = LibraryHandle::open(path)?;

        let abi_version = library
            .symbol(sys::SYM_ABI_VERSION)
            .map_err(|err| err.with_path(path))?;
        let abi_version: AbiVersionFn = unsafe { std::mem::transmute(abi_version.as_ptr()) };
        let abi_version = unsafe { abi_version() };
        check_abi_version(abi_version, path)?;

        let bind = |name: &CStr| -> Result<CrashFn, Error> {
            let symbol = library
                .symbol(name)
                .map_err(|err| err.with_path(path))?;
            Ok(unsafe { std::mem::transmute::<*mut std::ffi::c_void, CrashFn>(symbol.as_ptr()) })
        };
        let crash_abort = bind(sys::SYM_CRASH_ABORT)?;
        let crash_invalid_free = bind(sys::SYM_CRASH_INVALID_FREE)?;
        let crash_null_pointer = bind(sys::SYM_CRASH_NULL_POINTER)?;

        tracing::info!(path = %path.display(), abi_version, "loaded native crasher library");
        Ok(Self {
            path: path.to_path_buf(),
            target,
            abi_version,
            crash_abort,
            crash_invalid_free,
            crash_null_pointer,
            _library: library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn target(&self) -> LibraryTarget {
        self.target
    }

    pub fn abi_version(&self) -> i32 {
        self.abi_version
    }

    pub fn crash_invalid_free(&self) -> String {
        invoke("crash_invalid_free", self.crash_invalid_free)
    }

    pub fn crash_null_pointer(&self) -> String {
        invoke("crash_null_pointer", self.crash_null_pointer)
    }

    pub fn crash_abort(&self) -> String {
        invoke("crash_abort", self.crash_abort)
    }
}

fn check_abi_version(found: i32, path: &Path) -> Result<(), Error> {
    if found == sys::ABI_VERSION {
        return Ok(());
    }
    Err(Error::new(ErrorKind::NativeLoad)
        .with_message(format!(
            "native library ABI version {found}, expected {}",
            sys::ABI_VERSION
        ))
        .with_path(path))
}

fn invoke(operation: &'static str, function: CrashFn) -> String {
    tracing::warn!(operation, "invoking native crash");
    let returned = unsafe { function() };
    let returned = if returned.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(returned) }
            .to_string_lossy()
            .into_owned()
    };
    tracing::error!(operation, returned = %returned, "native crash returned without terminating the process");
    returned
}

/// Writes to an unmapped address without going through the loaded library.
pub fn crash_unsafe_write() -> String {
    tracing::warn!(address = sys::UNMAPPED_ADDRESS, "writing to unmapped address");
    unsafe { sys::put_address(sys::UNMAPPED_ADDRESS, 0) };
    tracing::error!("raw address write returned without terminating the process");
    "unreachable".to_string()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CrashKind {
    InvalidFree,
    NullPointer,
    Abort,
    UnsafeWrite,
}

impl CrashKind {
    pub fn name(self) -> &'static str {
        match self {
            CrashKind::InvalidFree => "free",
            CrashKind::NullPointer => "null",
            CrashKind::Abort => "abort",
            CrashKind::UnsafeWrite => "unsafe",
        }
    }

    /// Runs the crash. `Ok` carries whatever the crash returned, which only
    /// happens when it failed to terminate the process.
    pub fn trigger<F>(self, bridge: &LazyBridge<F>) -> Result<String, Error>
    where
        F: Fn() -> Result<NativeBridge, Error>,
    {
        match self {
            CrashKind::InvalidFree => Ok(bridge.get()?.crash_invalid_free()),
            CrashKind::NullPointer => Ok(bridge.get()?.crash_null_pointer()),
            CrashKind::Abort => Ok(bridge.get()?.crash_abort()),
            CrashKind::UnsafeWrite => Ok(crash_unsafe_write()),
        }
    }

    /// The error reported when `trigger` comes back with `returned` instead of
    /// terminating the process.
    pub fn returned_error(self, returned: &str) -> Error {
        Error::new(ErrorKind::Internal).with_message(format!(
            "crash `{}` returned without terminating the process: {returned}",
            self.name()
        ))
    }
}

pub type InitFn = fn() -> Result<NativeBridge, Error>;

/// One-time initialization wrapper around the materialize-then-load sequence.
pub struct LazyBridge<F = InitFn> {
    cell: OnceLock<Result<NativeBridge, Error>>,
    init: F,
    init_count: AtomicUsize,
}

impl<F> LazyBridge<F>
where
    F: Fn() -> Result<NativeBridge, Error>,
{
    pub const fn new(init: F) -> Self {
        Self {
            cell: OnceLock::new(),
            init,
            init_count: AtomicUsize::new(0),
        }
    }

    pub fn get(&self) -> Result<&NativeBridge, Error> {
        let result = self.cell.get_or_init(|| {
            self.init_count.fetch_add(1, Ordering::SeqCst);
            (self.init)()
        });
        match result {
            Ok(bridge) => Ok(bridge),
            Err(err) => Err(err.detached()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }

    /// How many times the init function has run (0 or 1).
    pub fn init_count(&self) -> usize {
        self.init_count.load(Ordering::SeqCst)
    }
}

static GLOBAL_MATERIALIZER: OnceLock<Materializer> = OnceLock::new();
static GLOBAL: LazyBridge = LazyBridge::new(load_global as InitFn);

fn load_global() -> Result<NativeBridge, Error> {
    let materializer = GLOBAL_MATERIALIZER.get_or_init(Materializer::embedded);
    NativeBridge::load(materializer, host_platform_identifier())
}

/// Process-wide bridge used by the server and CLI.
pub fn global() -> &'static LazyBridge {
    &GLOBAL
}

/// Replaces the default materializer for the global bridge. Must run before first use.
pub fn configure_global(materializer: Materializer) -> Result<(), Error> {
    if GLOBAL.is_initialized() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("native bridge already initialized"));
    }
    GLOBAL_MATERIALIZER.set(materializer).map_err(|_| {
        Error::new(ErrorKind::Usage).with_message("native bridge already configured")
    })
}
