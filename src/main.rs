//! Simple file server binary.
//!
//! Serves the data directory over plain HTTP and exposes token-protected
//! admin endpoints under `/_admin/` for chunked multipart uploads, whole
//! file uploads and basic file management. A background reaper clears
//! stale temp files and abandoned upload sessions.

mod atomic;
mod auth;
mod background;
mod config;
mod error;
mod files;
mod http;
mod locking;
mod logging;
mod multipart;
mod reaper;
mod response;
mod storage;
mod upload;

use axum::extract::{DefaultBodyLimit, Extension};
use axum::routing::{get, post};
use axum::{Router, middleware};
use clap::Parser;
use serde_json::Value;
use shadow_rs::shadow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, warn};

use crate::auth::AuthConfig;
use crate::background::{Scheduler, spawn_reload_on_hangup};
use crate::config::{AppConfig, Args};
use crate::locking::LockManager;
use crate::multipart::UploadManager;
use crate::reaper::{Reaper, ReaperConfig};
use crate::response::Envelope;
use crate::storage::Storage;

shadow!(build);

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), io::Error> {
    let args = Args::parse();
    let (config, created) = AppConfig::load_or_create(&args.config).map_err(|err| {
        eprintln!("failed to load config {}: {err}", args.config.display());
        io::Error::other(err.to_string())
    })?;
    logging::init_logging(config.debug);
    if created {
        info!(path = ?args.config, "default config created");
    }
    if config.api_token.is_empty() {
        warn!("apiToken is empty, every admin request will be rejected");
    }

    let storage = Arc::new(Storage::new(config.data_root()));
    let locks = Arc::new(LockManager::new());
    let uploads = Arc::new(UploadManager::new(
        &config.temp_root(),
        storage.clone(),
        locks.clone(),
    ));
    let auth_config = Arc::new(AuthConfig {
        api_token: config.api_token.clone(),
    });
    if let Err(err) = storage.ensure_root().await {
        error!(path = ?storage.root_path(), error = %err, "failed to create data directory");
        return Err(err);
    }
    if let Err(err) = uploads.ensure_root().await {
        error!(path = ?uploads.multipart_root(), error = %err, "failed to create temp directory");
        return Err(err);
    }

    let reaper = Arc::new(Reaper::new(
        config.temp_root(),
        locks.clone(),
        ReaperConfig {
            temp_retention: config.temp_retention(),
            multipart_expire: config.multipart_expire(),
        },
    ));
    let scheduler = Arc::new(Scheduler::new());
    scheduler
        .schedule_reaper(reaper.clone(), config.clean_interval())
        .await;
    spawn_reload_on_hangup(args.config.clone(), scheduler.clone(), reaper);

    let app = build_router(storage, locks, uploads, auth_config);

    let host = config
        .host
        .parse::<IpAddr>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, config.port);
    let listener = TcpListener::bind(addr).await?;
    info!("Starting HTTP server at {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    scheduler.cancel_reaper().await;
    info!("server stopped");
    Ok(())
}

/// 组装全部路由与中间件。
fn build_router(
    storage: Arc<Storage>,
    locks: Arc<LockManager>,
    uploads: Arc<UploadManager>,
    auth_config: Arc<AuthConfig>,
) -> Router {
    Router::new()
        .route("/_admin/ping", get(ping))
        .route(
            "/_admin/upload/multipart_init",
            post(upload::init_multipart),
        )
        .route(
            "/_admin/upload/multipart_upload",
            post(upload::upload_part).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/_admin/upload/multipart_end",
            post(upload::complete_multipart),
        )
        .route("/_admin/upload/abort", post(upload::abort_multipart))
        .route(
            "/_admin/upload",
            post(upload::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/_admin/move", post(files::move_entry))
        .route("/_admin/delete", post(files::delete_entry))
        .route("/_admin/has", post(files::has_entry))
        .route("/_admin/size", post(files::entry_size))
        .route("/_admin/get", post(files::fetch_bytes))
        .fallback(files::serve_static)
        .layer(middleware::from_fn(auth::admin_token_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(http::make_request_span)
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(locks))
        .layer(Extension(uploads))
        .layer(Extension(auth_config))
}

async fn ping() -> Envelope<Value> {
    Envelope::ok()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
}
