//! Purpose: Compile the native crasher C source into a shared library and embed it.
//! Role: Cargo build-script; drives the `cc`-detected compiler and generates the resource table.
//! Invariants: `cargo:rerun-if-changed` covers the C source and every env var read here.
//! Invariants: Generates `$OUT_DIR/embedded_libraries.rs`, included by `core::resources`.
//! Invariants: `NATIVECRASH_SKIP_NATIVE=1` produces an empty table instead of compiling.
//! Invariants: `NATIVECRASH_PREBUILT_DIR` may supply libraries for other platforms.
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const LIBRARY_NAMES: [&str; 2] = ["libnativecrasher.dylib", "libnativecrasher.so"];

fn main() {
    let target = env::var("TARGET").unwrap_or_default();
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR"));
    let source = manifest_dir.join("c").join("native_crasher.c");

    println!("cargo:rerun-if-changed=c/native_crasher.c");
    println!("cargo:rerun-if-env-changed=NATIVECRASH_SKIP_NATIVE");
    println!("cargo:rerun-if-env-changed=NATIVECRASH_PREBUILT_DIR");

    let mut embedded: Vec<(String, PathBuf)> = Vec::new();

    if let Some(prebuilt) = env::var_os("NATIVECRASH_PREBUILT_DIR") {
        let prebuilt = PathBuf::from(prebuilt);
        for name in LIBRARY_NAMES {
            let candidate = prebuilt.join(name);
            if candidate.is_file() {
                println!("cargo:rerun-if-changed={}", candidate.display());
                embedded.push((name.to_string(), candidate));
            }
        }
    }

    if skip_native() {
        println!("cargo:warning=NATIVECRASH_SKIP_NATIVE is set; building without the native library");
    } else if let Some(name) = library_name_for_target(&target) {
        if !embedded.iter().any(|(existing, _)| existing == name) {
            let output = out_dir.join(name);
            compile_shared_library(&source, &output, &target);
            embedded.push((name.to_string(), output));
        }
    } else {
        println!(
            "cargo:warning=no native crasher library for target `{target}`; crash routes will report ResourceNotFound"
        );
    }

    write_resource_table(&out_dir.join("embedded_libraries.rs"), &embedded);
}

fn skip_native() -> bool {
    env::var("NATIVECRASH_SKIP_NATIVE")
        .map(|value| !value.is_empty() && value != "0")
        .unwrap_or(false)
}

fn library_name_for_target(target: &str) -> Option<&'static str> {
    if target.contains("apple-darwin") {
        Some("libnativecrasher.dylib")
    } else if target.contains("linux") {
        Some("libnativecrasher.so")
    } else {
        None
    }
}

fn compile_shared_library(source: &Path, output: &Path, target: &str) {
    let compiler = cc::Build::new()
        .cargo_metadata(false)
        .opt_level(0)
        .warnings(false)
        .get_compiler();

    let mut command = compiler.to_command();
    if target.contains("apple-darwin") {
        command.arg("-dynamiclib");
    } else {
        command.arg("-shared").arg("-fPIC");
    }
    command.arg("-o").arg(output).arg(source);

    let status = match command.status() {
        Ok(status) => status,
        Err(err) => panic!(
            "failed to run C compiler `{}` for the native crasher library: {err}\n\
             Fix: install a C toolchain (set `CC` to override), or set NATIVECRASH_SKIP_NATIVE=1.",
            compiler.path().display()
        ),
    };
    if !status.success() {
        panic!(
            "C compiler `{}` failed to build {} ({status})\n\
             Fix: check the compiler output above, or set NATIVECRASH_SKIP_NATIVE=1.",
            compiler.path().display(),
            output.display()
        );
    }
}

fn write_resource_table(path: &Path, embedded: &[(String, PathBuf)]) {
    let mut table = String::from("static EMBEDDED: &[EmbeddedLibrary] = &[\n");
    for (name, file) in embedded {
        let file = file.to_str().expect("library path is valid utf-8");
        table.push_str(&format!(
            "    EmbeddedLibrary {{ name: {name:?}, bytes: include_bytes!({file:?}) }},\n"
        ));
    }
    table.push_str("];\n");
    fs::write(path, table).expect("failed to write embedded library table");
}
