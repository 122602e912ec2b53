//! Purpose: Best-effort removal of materialized files when the process exits.
//! Exports: `schedule_removal`, `remove_scheduled`.
//! Invariants: The exit hook is installed at most once per process (`libc::atexit`).
//! Invariants: Removal failures are ignored; abnormal termination skips removal entirely.
use std::path::PathBuf;
use std::sync::{Mutex, Once};

static PENDING: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());
static INSTALL_HOOK: Once = Once::new();

pub fn schedule_removal(path: impl Into<PathBuf>) {
    INSTALL_HOOK.call_once(|| {
        let rc = unsafe { libc::atexit(remove_at_exit) };
        if rc != 0 {
            tracing::warn!("failed to register exit cleanup hook; temp files will be left behind");
        }
    });
    PENDING
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
        .push(path.into());
}

/// Removes every scheduled path now and forgets it. Returns how many files were removed.
pub fn remove_scheduled() -> usize {
    let paths = std::mem::take(&mut *PENDING.lock().unwrap_or_else(|poison| poison.into_inner()));
    let mut removed = 0;
    for path in paths {
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) => tracing::debug!(path = %path.display(), error = %err, "temp file not removed"),
        }
    }
    removed
}

/// Serializes tests that schedule files or drain the registry.
#[cfg(test)]
pub(crate) fn registry_test_guard() -> std::sync::MutexGuard<'static, ()> {
    static GUARD: Mutex<()> = Mutex::new(());
    GUARD.lock().unwrap_or_else(|poison| poison.into_inner())
}

extern "C" fn remove_at_exit() {
    // No logging here: the subscriber may already be torn down.
    let paths = match PENDING.try_lock() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(_) => return,
    };
    for path in paths {
        let _ = std::fs::remove_file(path);
    }
}
