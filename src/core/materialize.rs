//! Purpose: Extract the embedded native library for a platform into a loadable temp file.
//! Exports: `Materializer`.
//! Role: Leaf of the bootstrap; the native bridge calls it once per process.
//! Invariants: The resource lookup happens before any file is created.
//! Invariants: Each call creates a new uniquely named file and schedules it for removal at exit.
//! Invariants: A failed copy removes the partially written file.
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::cleanup;
use crate::core::error::{Error, ErrorKind};
use crate::core::platform::LibraryTarget;
use crate::core::resources::Resources;

const TEMP_PREFIX: &str = "libnativecrasher";

#[derive(Clone, Debug)]
pub struct Materializer {
    resources: Resources,
    temp_dir: Option<PathBuf>,
}

impl Materializer {
    pub fn new(resources: Resources) -> Self {
        Self {
            resources,
            temp_dir: None,
        }
    }

    pub fn embedded() -> Self {
        Self::new(Resources::embedded())
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn materialize(&self, platform_identifier: &str) -> Result<PathBuf, Error> {
        let target = LibraryTarget::from_identifier(platform_identifier)?;
        let name = target.file_name();
        let bytes = self.resources.get(name).ok_or_else(|| {
            Error::new(ErrorKind::ResourceNotFound)
                .with_message(format!("native library not embedded: {name}"))
                .with_hint("Rebuild without NATIVECRASH_SKIP_NATIVE, or provide NATIVECRASH_PREBUILT_DIR.")
        })?;

        let path = self.write_temp(target, bytes)?;
        cleanup::schedule_removal(&path);
        tracing::info!(library = name, path = %path.display(), "materialized native library");
        Ok(path)
    }

    fn write_temp(&self, target: LibraryTarget, bytes: &[u8]) -> Result<PathBuf, Error> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(TEMP_PREFIX).suffix(target.file_suffix());
        let created = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        };
        let mut file = created.map_err(|err| {
            let err = Error::new(ErrorKind::Io)
                .with_message("failed to create temp file for native library")
                .with_source(err);
            match &self.temp_dir {
                Some(dir) => err.with_path(dir),
                None => err,
            }
        })?;

        // Dropping `file` on the error paths below deletes the partial copy.
        if let Err(err) = file.write_all(bytes).and_then(|()| file.flush()) {
            return Err(io_error("failed to copy native library", file.path(), err));
        }

        file.into_temp_path()
            .keep()
            .map_err(|err| {
                let path = err.path.to_path_buf();
                io_error("failed to persist native library", &path, err.error)
            })
    }
}

fn io_error(message: &str, path: &Path, err: std::io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message(message)
        .with_path(path)
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::Materializer;
    use crate::core::cleanup::registry_test_guard;
    use crate::core::error::ErrorKind;
    use crate::core::resources::Resources;

    fn fixture() -> Resources {
        Resources::empty()
            .with("libnativecrasher.so", b"linux-bytes".to_vec())
            .with("libnativecrasher.dylib", b"mac-bytes".to_vec())
    }

    fn entries(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).expect("read_dir").count()
    }

    #[test]
    fn copies_selected_resource_into_temp_dir() {
        let _guard = registry_test_guard();
        let temp = tempfile::tempdir().expect("tempdir");
        let materializer = Materializer::new(fixture()).with_temp_dir(temp.path());

        let linux = materializer.materialize("Linux").expect("linux");
        assert!(linux.starts_with(temp.path()));
        let name = linux.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("libnativecrasher"));
        assert!(name.ends_with(".so"));
        assert_eq!(std::fs::read(&linux).expect("read"), b"linux-bytes");

        let mac = materializer.materialize("Mac OS X").expect("mac");
        assert!(mac.to_string_lossy().ends_with(".dylib"));
        assert_eq!(std::fs::read(&mac).expect("read"), b"mac-bytes");
    }

    #[test]
    fn repeated_calls_produce_distinct_paths() {
        let _guard = registry_test_guard();
        let temp = tempfile::tempdir().expect("tempdir");
        let materializer = Materializer::new(fixture()).with_temp_dir(temp.path());

        let first = materializer.materialize("linux").expect("first");
        let second = materializer.materialize("linux").expect("second");
        assert_ne!(first, second);
        assert!(first.exists());
        assert!(second.exists());
    }

    #[test]
    fn missing_resource_leaves_no_file_behind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let materializer = Materializer::new(
            Resources::empty().with("libnativecrasher.dylib", b"mac-bytes".to_vec()),
        )
        .with_temp_dir(temp.path());

        let err = materializer.materialize("linux").expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::ResourceNotFound);
        assert_eq!(entries(temp.path()), 0);
    }

    #[test]
    fn unsupported_platform_is_rejected_before_lookup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let materializer = Materializer::new(fixture()).with_temp_dir(temp.path());

        let err = materializer.materialize("windows").expect_err("unsupported");
        assert_eq!(err.kind(), ErrorKind::UnsupportedPlatform);
        assert_eq!(entries(temp.path()), 0);
    }

    #[test]
    fn missing_temp_dir_is_an_io_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("does-not-exist");
        let materializer = Materializer::new(fixture()).with_temp_dir(&missing);

        let err = materializer.materialize("linux").expect_err("io");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.path(), Some(missing.as_path()));
    }
}
