//! Purpose: Expose the native libraries embedded into the binary at build time.
//! Exports: `EmbeddedLibrary`, `Resources`.
//! Role: Read-only name -> bytes lookup backing the materializer.
//! Invariants: The embedded table is generated by build.rs and never mutated at runtime.
use std::borrow::Cow;

#[derive(Clone, Copy, Debug)]
pub struct EmbeddedLibrary {
    pub name: &'static str,
    pub bytes: &'static [u8],
}

include!(concat!(env!("OUT_DIR"), "/embedded_libraries.rs"));

#[derive(Clone, Debug, Default)]
pub struct Resources {
    entries: Vec<(Cow<'static, str>, Cow<'static, [u8]>)>,
}

impl Resources {
    /// Libraries compiled into this binary.
    pub fn embedded() -> Self {
        Self {
            entries: EMBEDDED
                .iter()
                .map(|lib| (Cow::Borrowed(lib.name), Cow::Borrowed(lib.bytes)))
                .collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.entries
            .push((Cow::Owned(name.into()), Cow::Owned(bytes.into())));
        self
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(entry, _)| entry.as_ref() == name)
            .map(|(_, bytes)| bytes.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}
