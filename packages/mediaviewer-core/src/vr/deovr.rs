//! DeoVR library/video JSON endpoints.

use axum::extract::{Path as AxumPath, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::sync_store::{SessionUpdate, DEFAULT_SESSION_ID};
use crate::util::fnv1a_32_positive;

use super::{infer_fov_from_filename, infer_stereo_from_filename, VR_LIBRARY_LIMIT};

fn request_origin(headers: &HeaderMap) -> (String, String) {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http")
        .to_string();
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(axum::http::header::HOST))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost")
        .to_string();
    (scheme, host)
}

/// `GET|POST /deovr`.
pub async fn library(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let (scheme, host) = request_origin(&headers);
    let items = state.catalog.list_vr(VR_LIBRARY_LIMIT);

    let list: Vec<Value> = items
        .iter()
        .map(|item| {
            json!({
                "title": item.title,
                "videoLength": 0,
                "thumbnailUrl": super::absolute_url(&scheme, &host, &format!("/api/media/{}/thumb", item.id)),
                "video_url": super::absolute_url(&scheme, &host, &format!("/deovr/video/{}", item.id)),
            })
        })
        .collect();

    Json(json!({
        "authorized": "0",
        "scenes": [{ "name": "Library", "list": list }],
    }))
}

/// `GET|POST /deovr/video/{id}`.
pub async fn video(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> Json<Value> {
    let (scheme, host) = request_origin(&headers);

    let Some(item) = state.catalog.get(&id) else {
        return Json(json!({ "error": "not found" }));
    };

    let fov = item.vr_fov.unwrap_or_else(|| infer_fov_from_filename(&item.filename));
    let stereo = item
        .vr_stereo
        .unwrap_or_else(|| infer_stereo_from_filename(&item.filename));
    let stereo_mode = match stereo {
        crate::catalog::VrStereo::Sbs => "sbs",
        crate::catalog::VrStereo::Tb => "tb",
        crate::catalog::VrStereo::Mono => "off",
    };
    let screen_type = if fov == 180 { "dome" } else { "sphere" };
    let video_length_secs = item
        .duration_ms
        .map(|ms| (ms as f64 / 1000.0).round() as u64)
        .unwrap_or(0);

    let stream_url = super::absolute_url(&scheme, &host, &format!("/api/media/{}/stream", item.id));
    let thumbnail_url = super::absolute_url(&scheme, &host, &format!("/api/media/{}/thumb", item.id));

    let update = SessionUpdate {
        session_id: DEFAULT_SESSION_ID.to_string(),
        media_id: Some(item.id.clone()),
        time_ms: 0,
        paused: false,
        fps: 30,
        frame: 0,
        from_client_id: "vr:deovr".to_string(),
        play_at: None,
        play_at_local_ms: None,
        captured_at_local_ms: None,
    };
    if let Ok(committed) = state.sync_store.upsert_session(update) {
        super::broadcast_session(&state, &committed);
    }

    Json(json!({
        "id": fnv1a_32_positive(&item.id),
        "title": item.title,
        "videoLength": video_length_secs,
        "is3d": true,
        "screenType": screen_type,
        "stereoMode": stereo_mode,
        "encodings": [{
            "name": "h264",
            "videoSources": [{ "resolution": 1080, "url": stream_url }],
        }],
        "thumbnailUrl": thumbnail_url,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_id_is_stable() {
        assert_eq!(fnv1a_32_positive("m1"), fnv1a_32_positive("m1"));
    }
}
