//! Bootstrap & Configuration (C9): the composition root.
//!
//! Wires C1-C8 together in dependency order (catalog -> scanner -> sync
//! store -> ws connection manager -> DeoVR heartbeat -> HTTP router) and
//! exposes a single handle the binary crate drives.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;

use crate::api::{self, AppState};
use crate::config::Config;
use crate::error::MediaViewerResult;

/// Everything the binary crate needs after bootstrap: the application
/// state (for tests or programmatic access) and the assembled router.
pub struct BootstrappedServices {
    pub state: AppState,
    pub router: Router,
    pub config: Arc<Config>,
}

/// Builds the catalog, sync store, scanner, ws connection manager, DeoVR
/// heartbeat inferrer, and HTTP router from a loaded `Config`. Does not
/// bind a listener — that's `run()`'s job, so tests can inspect the
/// router without opening a socket.
#[must_use]
pub fn bootstrap_services(config: Config) -> BootstrappedServices {
    let config = Arc::new(config);
    let state = AppState::new(Arc::clone(&config));

    state.deovr_heartbeat.spawn_background_loop();

    let router = api::create_router(state.clone());

    BootstrappedServices {
        state,
        router,
        config,
    }
}

/// Binds and serves the composed router, over TLS if `use_ssl` is set.
/// Blocks until a shutdown signal is received.
pub async fn run(services: BootstrappedServices) -> MediaViewerResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], services.config.port));

    if services.config.use_ssl {
        crate::tls::serve_with_tls(addr, &services.config, services.router, services.state.ws_manager).await
    } else {
        api::start_server(addr, services.router, services.state.ws_manager).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_wires_a_usable_router() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.media_root = dir.path().to_path_buf();
        let services = bootstrap_services(config);
        assert_eq!(services.state.catalog.all_rel_paths().len(), 0);
    }
}
