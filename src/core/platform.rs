//! Purpose: Map a host operating-system identifier to the native library it needs.
//! Exports: `LibraryTarget`, `host_platform_identifier`.
//! Invariants: Matching is a case-insensitive substring test ("mac"/"darwin", then "linux").
//! Invariants: Identifiers matching neither pattern are `UnsupportedPlatform`.
use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LibraryTarget {
    MacOs,
    Linux,
}

impl LibraryTarget {
    pub fn from_identifier(identifier: &str) -> Result<Self, Error> {
        let lowered = identifier.to_lowercase();
        if lowered.contains("mac") || lowered.contains("darwin") {
            Ok(LibraryTarget::MacOs)
        } else if lowered.contains("linux") {
            Ok(LibraryTarget::Linux)
        } else {
            Err(Error::new(ErrorKind::UnsupportedPlatform)
                .with_message(format!("unsupported OS: {lowered}"))
                .with_hint("Native crash routes are available on macOS and Linux only."))
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            LibraryTarget::MacOs => "libnativecrasher.dylib",
            LibraryTarget::Linux => "libnativecrasher.so",
        }
    }

    pub fn file_suffix(self) -> &'static str {
        match self {
            LibraryTarget::MacOs => ".dylib",
            LibraryTarget::Linux => ".so",
        }
    }
}

/// Identifier of the running host, as reported by the standard library (`macos`, `linux`, ...).
pub fn host_platform_identifier() -> &'static str {
    std::env::consts::OS
}

#[cfg(test)]
mod tests {
    use super::{LibraryTarget, host_platform_identifier};
    use crate::core::error::ErrorKind;

    #[test]
    fn mac_and_darwin_select_dylib_in_any_case() {
        for identifier in ["macos", "Mac OS X", "MACOS", "darwin", "Darwin 23.1", "x86_64-apple-DARWIN"] {
            let target = LibraryTarget::from_identifier(identifier).expect("supported");
            assert_eq!(target, LibraryTarget::MacOs, "{identifier}");
            assert_eq!(target.file_name(), "libnativecrasher.dylib");
            assert_eq!(target.file_suffix(), ".dylib");
        }
    }

    #[test]
    fn linux_selects_shared_object_in_any_case() {
        for identifier in ["linux", "Linux", "GNU/LINUX", "x86_64-unknown-linux-gnu"] {
            let target = LibraryTarget::from_identifier(identifier).expect("supported");
            assert_eq!(target, LibraryTarget::Linux, "{identifier}");
            assert_eq!(target.file_name(), "libnativecrasher.so");
            assert_eq!(target.file_suffix(), ".so");
        }
    }

    #[test]
    fn other_identifiers_are_unsupported() {
        for identifier in ["windows", "Windows 11", "freebsd", "", "solaris"] {
            let err = LibraryTarget::from_identifier(identifier).expect_err("unsupported");
            assert_eq!(err.kind(), ErrorKind::UnsupportedPlatform, "{identifier}");
        }
    }

    #[test]
    fn host_identifier_is_not_empty() {
        assert!(!host_platform_identifier().is_empty());
    }
}
