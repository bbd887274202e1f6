//! VR Adapters (C7): DeoVR and HereSphere library/video JSON dialects.

pub mod deovr;
pub mod heresphere;

use crate::api::AppState;
use crate::catalog::VrStereo;
use crate::sync_store::SessionState;

const THUMBNAIL_PLACEHOLDER_SUFFIX: &str = "/thumb/placeholder.svg";

/// Limits VR library listings to the 1,000 most-recently-modified videos,
/// per spec.md §4.7.
pub const VR_LIBRARY_LIMIT: usize = 1_000;

/// Infers stereo layout from filename tokens when the catalog row has no
/// stored value (spec.md §4.7 FOV/stereo inference).
#[must_use]
pub fn infer_stereo_from_filename(name: &str) -> VrStereo {
    let lower = name.to_ascii_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    if tokens.iter().any(|t| matches!(*t, "sbs" | "lr" | "rl" | "3dh")) {
        VrStereo::Sbs
    } else if tokens.iter().any(|t| matches!(*t, "tb" | "bt" | "ou" | "overunder" | "3dv")) {
        VrStereo::Tb
    } else {
        VrStereo::Mono
    }
}

/// Infers FOV from filename tokens when the catalog row has no stored
/// value; defaults to 360 per spec.md §4.7.
#[must_use]
pub fn infer_fov_from_filename(name: &str) -> u16 {
    let lower = name.to_ascii_lowercase();
    if lower.contains("180") {
        180
    } else if lower.contains("360") {
        360
    } else {
        360
    }
}

/// Builds an absolute URL from the request's scheme/host, honoring a
/// forwarded-proto header so the server can sit behind a reverse proxy.
#[must_use]
pub fn absolute_url(scheme: &str, host: &str, path: &str) -> String {
    format!("{scheme}://{host}{path}")
}

#[must_use]
pub fn thumbnail_placeholder_url(scheme: &str, host: &str) -> String {
    absolute_url(scheme, host, THUMBNAIL_PLACEHOLDER_SUFFIX)
}

/// Broadcasts the current session state to every WebSocket client, the
/// same shape the hub emits after committing a `sync:update`. Used by
/// the VR adapters' "on open" hint updates and HereSphere's explicit
/// event callback, which commit outside the hub but must still fan out.
pub fn broadcast_session(state: &AppState, session: &SessionState) {
    let clients = state.sync_store.all_presence();
    let message = serde_json::json!({
        "type": "sync:state",
        "state": {
            "mediaId": session.media_id,
            "timeMs": session.time_ms,
            "paused": session.paused,
            "fps": session.fps,
            "frame": session.frame,
            "fromClientId": session.from_client_id,
        },
        "clients": clients.iter().map(|c| serde_json::json!({
            "clientId": c.client_id,
            "userAgent": c.user_agent,
            "ipAddress": c.ip_address,
            "uiView": c.ui_view,
            "uiMediaId": c.ui_media_id,
        })).collect::<Vec<_>>(),
    });
    if let Ok(text) = serde_json::to_string(&message) {
        let _ = state.broadcast_tx.send(text);
    }
}
