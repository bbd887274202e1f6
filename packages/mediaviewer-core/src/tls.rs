//! TLS Bootstrap (C11).
//!
//! Optional HTTPS with self-signed certificate generation. Startup-only:
//! no certificate rotation while the server is running.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;

use crate::config::Config;
use crate::error::{MediaViewerError, MediaViewerResult};
use crate::ws::WsConnectionManager;

/// Loads (or generates) a TLS key/cert pair and serves `router` over
/// HTTPS at `addr`. Generation happens only when both configured paths
/// are absent and `https_auto_self_signed` is set; the generated PEM
/// bytes are loaded directly into the acceptor without a disk round-trip.
pub async fn serve_with_tls(
    addr: SocketAddr,
    config: &Config,
    router: Router,
    ws_manager: Arc<WsConnectionManager>,
) -> MediaViewerResult<()> {
    let (cert_pem, key_pem) = match (&config.https_cert_path, &config.https_key_path) {
        (Some(cert_path), Some(key_path)) => (
            tokio::fs::read(cert_path)
                .await
                .map_err(|e| MediaViewerError::Fatal(format!("failed to read TLS cert: {e}")))?,
            tokio::fs::read(key_path)
                .await
                .map_err(|e| MediaViewerError::Fatal(format!("failed to read TLS key: {e}")))?,
        ),
        _ if config.https_auto_self_signed => {
            log::info!("[tls] generating self-signed certificate for localhost/127.0.0.1");
            let (cert, key) = generate_self_signed()?;
            if let (Some(cert_path), Some(key_path)) =
                (&config.https_cert_path, &config.https_key_path)
            {
                let _ = write_generated_pair(cert_path, key_path, &cert, &key).await;
            }
            (cert, key)
        }
        _ => {
            return Err(MediaViewerError::Fatal(
                "USE_SSL is set but no cert/key configured and auto self-signed is disabled".into(),
            ));
        }
    };

    let tls_config = RustlsConfig::from_pem(cert_pem, key_pem)
        .await
        .map_err(|e| MediaViewerError::Fatal(format!("failed to load TLS config: {e}")))?;

    log::info!("[server] listening on https://{addr}");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        crate::api::shutdown_and_close_sockets(ws_manager).await;
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
    });

    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| MediaViewerError::Fatal(format!("TLS server error: {e}")))
}

fn generate_self_signed() -> MediaViewerResult<(Vec<u8>, Vec<u8>)> {
    let cert = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .map_err(|e| MediaViewerError::Fatal(format!("self-signed cert generation failed: {e}")))?;

    let cert_pem = cert.cert.pem().into_bytes();
    let key_pem = cert.signing_key.serialize_pem().into_bytes();
    Ok((cert_pem, key_pem))
}

async fn write_generated_pair(
    cert_path: &Path,
    key_path: &Path,
    cert_pem: &[u8],
    key_pem: &[u8],
) -> MediaViewerResult<()> {
    if let Some(parent) = cert_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    tokio::fs::write(cert_path, cert_pem)
        .await
        .map_err(|e| MediaViewerError::Internal(format!("failed to persist generated cert: {e}")))?;
    tokio::fs::write(key_path, key_pem)
        .await
        .map_err(|e| MediaViewerError::Internal(format!("failed to persist generated key: {e}")))?;
    Ok(())
}
