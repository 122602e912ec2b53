//! Purpose: Library crate backing the `nativecrash` binary and its integration tests.
//! Exports: `core` (platform selection, embedded resources, materialization, native bridge, errors).
//! Role: Crash harness for exercising crash-reporting and observability tooling.
//! Invariants: Every crash path goes through `core::native`; nothing else touches FFI.
pub mod core;

pub use crate::core::error::{Error, ErrorKind, to_exit_code};
