//! Purpose: `nativecrash` CLI entry point.
//! Role: Binary crate root; parses args, runs the crash server or a one-shot command.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `to_exit_code` unless a crash ends the process first.
//! Invariants: The global native bridge is configured before its first use.
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};

mod serve;

use nativecrash::core::materialize::Materializer;
use nativecrash::core::native::{self, CrashKind};
use nativecrash::core::platform::{LibraryTarget, host_platform_identifier};
use nativecrash::{Error, ErrorKind, to_exit_code};
use serve::{ServeConfig, init_tracing, serve};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

#[derive(Parser)]
#[command(
    name = "nativecrash",
    version,
    about = "Crash the process on purpose through a native library",
    long_about = None,
    after_help = r#"EXAMPLES
  $ nativecrash serve
  $ curl http://127.0.0.1:8080/crash/null      # server dies with SIGSEGV
  $ nativecrash check
  $ nativecrash crash abort

NOTES
  - Crash routes: /crash/free, /crash/null, /crash/abort, /crash/unsafe
  - Set RUST_LOG=debug for more detail"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Directory for the extracted native library (default: system temp dir)",
        value_hint = ValueHint::DirPath
    )]
    temp_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Run the HTTP crash server",
        after_help = r#"EXAMPLES
  $ nativecrash serve
  $ nativecrash serve --bind 127.0.0.1:9000 --preload
  $ nativecrash serve --bind 0.0.0.0:8080 --allow-non-loopback"#
    )]
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080", help = "Address to listen on")]
        bind: SocketAddr,
        #[arg(long, help = "Allow binding to a non-loopback address")]
        allow_non_loopback: bool,
        #[arg(long, help = "Load the native library before accepting connections")]
        preload: bool,
    },
    #[command(
        about = "Extract and load the native library, then report what was loaded",
        after_help = r#"NOTES
  - Exits non-zero when the library cannot be extracted or loaded
  - Human-readable output is the default; use --json for machine output"#
    )]
    Check {
        #[arg(long, help = "Emit JSON instead of human-readable output")]
        json: bool,
    },
    #[command(
        arg_required_else_help = true,
        about = "Trigger one crash directly, without HTTP"
    )]
    Crash {
        #[arg(value_enum, help = "Which crash to trigger")]
        kind: CrashKindCli,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum CrashKindCli {
    Free,
    Null,
    Abort,
    Unsafe,
}

impl From<CrashKindCli> for CrashKind {
    fn from(value: CrashKindCli) -> Self {
        match value {
            CrashKindCli::Free => CrashKind::InvalidFree,
            CrashKindCli::Null => CrashKind::NullPointer,
            CrashKindCli::Abort => CrashKind::Abort,
            CrashKindCli::Unsafe => CrashKind::UnsafeWrite,
        }
    }
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Run `nativecrash --help` for usage."));
            }
        },
    };

    let mut materializer = Materializer::embedded();
    if let Some(dir) = cli.temp_dir {
        materializer = materializer.with_temp_dir(dir);
    }
    native::configure_global(materializer)?;

    match cli.command {
        Command::Serve {
            bind,
            allow_non_loopback,
            preload,
        } => {
            let config = ServeConfig {
                bind,
                allow_non_loopback,
                preload,
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start async runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve(config))?;
            Ok(RunOutcome::ok())
        }
        Command::Check { json } => {
            init_tracing();
            let report = check_report()?;
            if json {
                emit_json(&report)?;
            } else {
                println!("{}", check_text(&report));
            }
            Ok(RunOutcome::ok())
        }
        Command::Crash { kind } => {
            init_tracing();
            let kind = CrashKind::from(kind);
            let returned = kind.trigger(native::global())?;
            Err(kind.returned_error(&returned))
        }
    }
}

fn check_report() -> Result<Value, Error> {
    let platform = host_platform_identifier();
    let target = LibraryTarget::from_identifier(platform)?;
    let bridge = native::global().get()?;
    Ok(json!({
        "platform": platform,
        "library": target.file_name(),
        "path": bridge.path().display().to_string(),
        "abi_version": bridge.abi_version(),
    }))
}

fn check_text(report: &Value) -> String {
    let field = |key: &str| match report.get(key) {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => "-".to_string(),
    };
    format!(
        "platform: {}\nlibrary: {}\nloaded from: {}\nabi version: {}",
        field("platform"),
        field("library"),
        field("path"),
        field("abi_version")
    )
}

fn emit_json(value: &Value) -> Result<(), Error> {
    let json = serde_json::to_string_pretty(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode json")
            .with_source(err)
    })?;
    println!("{json}");
    Ok(())
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::UnsupportedPlatform => "unsupported platform".to_string(),
        ErrorKind::ResourceNotFound => "native library not found".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::NativeLoad => "native library failed to load".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
