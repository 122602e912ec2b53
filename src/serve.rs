//! Purpose: Provide the HTTP crash server.
//! Exports: `ServeConfig`, `serve`.
//! Role: Axum server whose crash routes pass straight through to the native bridge.
//! Invariants: Loopback-only unless explicitly allowed.
//! Invariants: Bridge initialization and native calls run on the blocking pool.
//! Notes: A crash route that answers at all is reporting a bootstrap error or a crash that failed to crash.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use nativecrash::core::cleanup;
use nativecrash::core::native::{self, CrashKind, LazyBridge};
use nativecrash::core::platform::host_platform_identifier;
use nativecrash::{Error, ErrorKind};

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub allow_non_loopback: bool,
    pub preload: bool,
}

#[derive(Clone, Copy)]
struct AppState {
    bridge: &'static LazyBridge,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let state = AppState {
        bridge: native::global(),
    };

    if config.preload {
        let bridge = state.bridge;
        let loaded = tokio::task::spawn_blocking(move || {
            bridge.get().map(|loaded| loaded.path().to_path_buf())
        })
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("preload task failed")
                .with_source(err)
        })??;
        tracing::info!(path = %loaded.display(), "native library preloaded");
    }

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "crash server listening");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    let result = tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                }),
                Err(_) => Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out")),
            }
        }
    };

    let removed = cleanup::remove_scheduled();
    tracing::info!(removed, "removed materialized native libraries");
    result
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/native", get(native_status))
        .route("/crash/free", get(crash_free))
        .route("/crash/null", get(crash_null))
        .route("/crash/abort", get(crash_abort))
        .route("/crash/unsafe", get(crash_unsafe))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }
    Ok(())
}

pub(crate) fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

async fn healthz() -> Response {
    Json(json!({ "ok": true })).into_response()
}

async fn native_status(State(state): State<Arc<AppState>>) -> Response {
    let bridge = state.bridge;
    let result = tokio::task::spawn_blocking(move || {
        bridge.get().map(|loaded| {
            json!({
                "platform": host_platform_identifier(),
                "library": loaded.target().file_name(),
                "path": loaded.path().display().to_string(),
                "abi_version": loaded.abi_version(),
            })
        })
    })
    .await;
    match result {
        Ok(Ok(body)) => Json(json!({ "native": body })).into_response(),
        Ok(Err(err)) => error_response(err),
        Err(err) => error_response(
            Error::new(ErrorKind::Internal)
                .with_message("bootstrap task failed")
                .with_source(err),
        ),
    }
}

async fn crash_free(State(state): State<Arc<AppState>>) -> Response {
    trigger(&state, CrashKind::InvalidFree).await
}

async fn crash_null(State(state): State<Arc<AppState>>) -> Response {
    trigger(&state, CrashKind::NullPointer).await
}

async fn crash_abort(State(state): State<Arc<AppState>>) -> Response {
    trigger(&state, CrashKind::Abort).await
}

async fn crash_unsafe(State(state): State<Arc<AppState>>) -> Response {
    trigger(&state, CrashKind::UnsafeWrite).await
}

async fn trigger(state: &AppState, kind: CrashKind) -> Response {
    let bridge = state.bridge;
    let result = tokio::task::spawn_blocking(move || kind.trigger(bridge)).await;
    match result {
        Ok(Ok(returned)) => error_response(kind.returned_error(&returned)),
        Ok(Err(err)) => {
            tracing::warn!(crash = kind.name(), error = %err, "crash route failed before crashing");
            error_response(err)
        }
        Err(err) => error_response(
            Error::new(ErrorKind::Internal)
                .with_message("crash task failed")
                .with_source(err),
        ),
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Usage => StatusCode::BAD_REQUEST,
        ErrorKind::UnsupportedPlatform => StatusCode::NOT_IMPLEMENTED,
        ErrorKind::ResourceNotFound | ErrorKind::NativeLoad => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Io | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: Error) -> Response {
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: format!("{:?}", err.kind()),
            message: err.message().unwrap_or("error").to_string(),
            path: err.path().map(|path| path.to_string_lossy().to_string()),
            hint: err.hint().map(str::to_string),
        },
    };
    (status_for(err.kind()), Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::{AppState, ServeConfig, error_response, router, serve, status_for, validate_config};
    use axum::http::StatusCode;
    use nativecrash::core::native::{CrashKind, InitFn, LazyBridge, NativeBridge};
    use nativecrash::{Error, ErrorKind};
    use serde_json::Value;
    use std::net::SocketAddr;

    fn missing_library() -> Result<NativeBridge, Error> {
        Err(Error::new(ErrorKind::ResourceNotFound)
            .with_message("native library not embedded: libnativecrasher.so"))
    }

    fn rejected_library() -> Result<NativeBridge, Error> {
        Err(Error::new(ErrorKind::NativeLoad)
            .with_message("dynamic loader rejected library: invalid ELF header")
            .with_path("/tmp/libnativecrasher1234.so"))
    }

    static MISSING: LazyBridge = LazyBridge::new(missing_library as InitFn);
    static REJECTED: LazyBridge = LazyBridge::new(rejected_library as InitFn);

    async fn spawn_router(bridge: &'static LazyBridge) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = router(AppState { bridge });
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    async fn get(addr: SocketAddr, path: &str) -> (u16, Value) {
        let url = format!("http://{addr}{path}");
        tokio::task::spawn_blocking(move || {
            let response = match ureq::get(&url).call() {
                Ok(response) => response,
                Err(ureq::Error::Status(_, response)) => response,
                Err(err) => panic!("request failed: {err}"),
            };
            let status = response.status();
            let text = response.into_string().expect("body");
            let body: Value = serde_json::from_str(&text).expect("json body");
            (status, body)
        })
        .await
        .expect("request task")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn crash_routes_report_missing_library_instead_of_crashing() {
        let addr = spawn_router(&MISSING).await;

        for path in ["/crash/free", "/crash/null", "/crash/abort"] {
            let (status, body) = get(addr, path).await;
            assert_eq!(status, 503, "{path}");
            assert_eq!(body["error"]["kind"], "ResourceNotFound", "{path}");
        }
        assert_eq!(MISSING.init_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn native_status_reports_load_failure() {
        let addr = spawn_router(&REJECTED).await;

        let (status, body) = get(addr, "/native").await;
        assert_eq!(status, 503);
        assert_eq!(body["error"]["kind"], "NativeLoad");
        assert_eq!(body["error"]["path"], "/tmp/libnativecrasher1234.so");

        let (status, body) = get(addr, "/crash/null").await;
        assert_eq!(status, 503);
        assert_eq!(body["error"]["kind"], "NativeLoad");
        assert_eq!(REJECTED.init_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn healthz_is_ok() {
        let addr = spawn_router(&MISSING).await;
        let (status, body) = get(addr, "/healthz").await;
        assert_eq!(status, 200);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn serve_rejects_non_loopback_bind() {
        let config = ServeConfig {
            bind: "0.0.0.0:0".parse().expect("bind"),
            allow_non_loopback: false,
            preload: false,
        };
        let err = serve(config).await.expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn non_loopback_allowed_with_flag() {
        let config = ServeConfig {
            bind: "0.0.0.0:0".parse().expect("bind"),
            allow_non_loopback: true,
            preload: false,
        };
        validate_config(&config).expect("config ok");
    }

    #[test]
    fn loopback_v6_needs_no_flag() {
        let config = ServeConfig {
            bind: "[::1]:8080".parse().expect("bind"),
            allow_non_loopback: false,
            preload: false,
        };
        validate_config(&config).expect("config ok");
    }

    #[test]
    fn bootstrap_errors_map_to_stable_statuses() {
        let cases = [
            (ErrorKind::Usage, StatusCode::BAD_REQUEST),
            (ErrorKind::UnsupportedPlatform, StatusCode::NOT_IMPLEMENTED),
            (ErrorKind::ResourceNotFound, StatusCode::SERVICE_UNAVAILABLE),
            (ErrorKind::NativeLoad, StatusCode::SERVICE_UNAVAILABLE),
            (ErrorKind::Io, StatusCode::INTERNAL_SERVER_ERROR),
            (ErrorKind::Internal, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (kind, status) in cases {
            assert_eq!(status_for(kind), status);
        }
    }

    #[tokio::test]
    async fn returned_crash_is_reported_as_internal_error() {
        let response = error_response(CrashKind::Abort.returned_error("unreachable"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body: Value = serde_json::from_slice(&bytes).expect("json body");
        assert_eq!(body["error"]["kind"], "Internal");
        assert_eq!(
            body["error"]["message"],
            "crash `abort` returned without terminating the process: unreachable"
        );
        assert!(body["error"].get("path").is_none());
    }
}
