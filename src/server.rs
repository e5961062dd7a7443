//! Health and metrics HTTP endpoints
//!
//! `/healthz` and `/readyz` are served in plain HTTP on the health address.
//! `/metrics` is served over TLS when a certificate directory holds
//! `tls.crt` and `tls.key`, and in plain HTTP (with a warning) otherwise.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use prometheus_client::encoding::text::encode;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::controller::metrics;
use crate::engine::ShutdownSignal;
use crate::error::{Error, Result};

/// Environment variable overriding the metrics port
pub const METRICS_PORT_ENV: &str = "METRICS_PORT";

const TLS_CERT_FILE: &str = "tls.crt";
const TLS_KEY_FILE: &str = "tls.key";

/// Grace period for in-flight requests at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Readiness shared between the controllers and the health endpoint
#[derive(Clone, Debug, Default)]
pub struct Readiness {
    ready: Arc<AtomicBool>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// Parse a Go-style bind address (`:8080`, `127.0.0.1:9440`).
pub fn parse_bind_address(addr: &str) -> Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|e| Error::ConfigError(format!("invalid bind address {addr:?}: {e}")))
}

/// Metrics address, with the port replaced by `port_override` when set.
pub fn metrics_address(bind: &str, port_override: Option<&str>) -> Result<SocketAddr> {
    let mut addr = parse_bind_address(bind)?;
    if let Some(port) = port_override.filter(|p| !p.is_empty()) {
        let port: u16 = port
            .parse()
            .map_err(|e| Error::ConfigError(format!("invalid {METRICS_PORT_ENV} {port:?}: {e}")))?;
        addr.set_port(port);
    }
    Ok(addr)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(readiness): State<Readiness>) -> (StatusCode, &'static str) {
    if readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "caches not synced")
    }
}

async fn metrics_handler() -> (StatusCode, String) {
    let mut buffer = String::new();
    match encode(&mut buffer, &metrics::REGISTRY) {
        Ok(()) => (StatusCode::OK, buffer),
        Err(e) => {
            error!("Failed to encode metrics: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

pub fn health_router(readiness: Readiness) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(readiness)
}

pub fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
}

async fn serve_plain(addr: SocketAddr, app: Router, mut shutdown: ShutdownSignal) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {addr}: {e}")))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.recv().await })
        .await
        .map_err(|e| Error::ConfigError(format!("Server error on {addr}: {e}")))
}

/// Serve `/healthz` and `/readyz` until shutdown.
pub async fn serve_health(
    addr: SocketAddr,
    readiness: Readiness,
    shutdown: ShutdownSignal,
) -> Result<()> {
    info!(%addr, "Health server listening");
    serve_plain(addr, health_router(readiness), shutdown).await
}

/// Certificate and key paths under `dir`, if both exist.
pub fn tls_files(dir: &Path) -> Option<(PathBuf, PathBuf)> {
    let cert = dir.join(TLS_CERT_FILE);
    let key = dir.join(TLS_KEY_FILE);
    (cert.is_file() && key.is_file()).then_some((cert, key))
}

/// Serve `/metrics` until shutdown, over TLS when `cert_dir` has a key pair.
pub async fn serve_metrics(
    addr: SocketAddr,
    cert_dir: Option<&Path>,
    mut shutdown: ShutdownSignal,
) -> Result<()> {
    let app = metrics_router();
    let Some((cert, key)) = cert_dir.and_then(tls_files) else {
        warn!(%addr, "No TLS certificate configured, serving metrics over plain HTTP");
        return serve_plain(addr, app, shutdown).await;
    };

    // Already installed when a second server starts in the same process.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let tls = RustlsConfig::from_pem_file(&cert, &key)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to load metrics certificate: {e}")))?;
    let handle = axum_server::Handle::new();
    let stopper = handle.clone();
    tokio::spawn(async move {
        shutdown.recv().await;
        stopper.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    info!(%addr, "Metrics server listening with TLS");
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| Error::ConfigError(format!("Metrics server error: {e}")))
}
