//! HTTP API (C8) and application state composition.
//!
//! A thin shell over C1/C3/C5/C6/scanner: one `AppState` shared through
//! every handler, a router wiring health/scan/sync/media/playback routes
//! alongside the VR adapters and the WebSocket upgrade endpoint.

pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::catalog::MediaCatalog;
use crate::config::Config;
use crate::deovr_heartbeat::DeovrHeartbeat;
use crate::error::{MediaViewerError, MediaViewerResult};
use crate::scanner::Scanner;
use crate::sync_store::SyncStore;
use crate::vr;
use crate::ws::{self, WsConnectionManager};

/// Broadcast channel capacity for `sync:state` fan-out. Slow subscribers
/// drop the oldest frames (`RecvError::Lagged`) rather than stall senders.
const BROADCAST_CAPACITY: usize = 256;

/// Shared application state, cloned cheaply (every field is an `Arc` or a
/// `Sender`) into every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<MediaCatalog>,
    pub sync_store: Arc<SyncStore>,
    pub ws_manager: Arc<WsConnectionManager>,
    pub broadcast_tx: broadcast::Sender<String>,
    pub scanner: Arc<Scanner>,
    pub deovr_heartbeat: Arc<DeovrHeartbeat>,
    pub config: Arc<Config>,
}

impl AppState {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        let catalog = Arc::new(MediaCatalog::new());
        let sync_store = Arc::new(SyncStore::new());
        let ws_manager = Arc::new(WsConnectionManager::new());
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let scanner = Arc::new(Scanner::new(
            config.media_root.clone(),
            config.ffprobe_path.clone(),
            Arc::clone(&catalog),
        ));
        let deovr_heartbeat = Arc::new(DeovrHeartbeat::new(
            Arc::clone(&sync_store),
            broadcast_tx.clone(),
        ));

        Self {
            catalog,
            sync_store,
            ws_manager,
            broadcast_tx,
            scanner,
            deovr_heartbeat,
            config,
        }
    }
}

/// Builds the full router: `/api/*` handlers, `/ws`, the two VR adapter
/// groups, the SVG placeholder, and a static-file catch-all that must not
/// shadow any of the above.
#[must_use]
pub fn create_router(state: AppState) -> Router {
    let cors = match &state.config.cors_origin {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin.parse::<axum::http::HeaderValue>().unwrap())
            .allow_methods(Any)
            .allow_headers(Any),
        None => CorsLayer::new(),
    };

    let api_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/scan", post(handlers::start_scan))
        .route("/scan/progress", get(handlers::scan_progress))
        .route("/cache/clear", post(handlers::clear_cache))
        .route("/sync", get(handlers::get_sync).put(handlers::put_sync))
        .route("/media", get(handlers::search_media))
        .route(
            "/media/{id}/stream",
            get(handlers::stream_media).head(handlers::stream_media),
        )
        .route("/media/{id}/thumb", get(handlers::thumb))
        .route("/media/{id}/funscript", get(handlers::funscript))
        .route("/media/{id}/fileinfo", get(handlers::fileinfo))
        .route("/media/{id}/probe", get(handlers::probe))
        .route("/playback", get(handlers::get_playback).put(handlers::put_playback));

    Router::new()
        .nest("/api", api_routes)
        .route("/ws", get(ws::ws_handler))
        .route("/deovr", get(vr::deovr::library).post(vr::deovr::library))
        .route(
            "/deovr/video/{id}",
            get(vr::deovr::video).post(vr::deovr::video),
        )
        .route(
            "/heresphere",
            get(vr::heresphere::library).post(vr::heresphere::library),
        )
        .route(
            "/heresphere/video/{id}",
            get(vr::heresphere::video).post(vr::heresphere::video),
        )
        .route("/heresphere/event", post(vr::heresphere::event))
        .route(
            "/heresphere/auth",
            get(vr::heresphere::auth).post(vr::heresphere::auth),
        )
        .route(
            "/heresphere/scan",
            get(vr::heresphere::scan).post(vr::heresphere::scan),
        )
        .route("/thumb/{name}", get(handlers::thumb_placeholder))
        .fallback_service(tower_http::services::ServeDir::new("web/dist"))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves the router, honoring graceful shutdown on SIGINT/
/// SIGTERM. TLS is layered on by the caller (`tls::serve_with_tls`) when
/// `use_ssl` is set; this path always binds plain HTTP.
pub async fn start_server(addr: SocketAddr, router: Router, ws_manager: Arc<WsConnectionManager>) -> MediaViewerResult<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| MediaViewerError::Fatal(format!("failed to bind {addr}: {e}")))?;

    log::info!("[server] listening on http://{addr}");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_and_close_sockets(ws_manager))
    .await
    .map_err(|e| MediaViewerError::Fatal(format!("server error: {e}")))
}

/// Waits for the shutdown signal, then force-closes every live WebSocket
/// connection so the hub goes down cleanly rather than leaving clients to
/// time out (spec.md §5: "Server shutdown closes all sockets cleanly").
pub async fn shutdown_and_close_sockets(ws_manager: Arc<WsConnectionManager>) {
    shutdown_signal().await;
    ws_manager.close_all();
}

/// Resolves on Ctrl+C or SIGTERM. Shared by the plain-HTTP and TLS
/// listeners so both shut down gracefully.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::info!("[server] shutdown signal received");
}
