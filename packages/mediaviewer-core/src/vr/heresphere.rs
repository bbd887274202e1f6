//! HereSphere library/video/event JSON endpoints.
//!
//! Every response carries the mandatory `HereSphere-JSON-Version: 1`
//! header (installed via a thin response wrapper rather than per-handler
//! boilerplate).

use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::sync_store::{SessionUpdate, DEFAULT_SESSION_ID};

use super::{infer_fov_from_filename, infer_stereo_from_filename, VR_LIBRARY_LIMIT};

const HERESPHERE_VERSION_HEADER: &str = "HereSphere-JSON-Version";

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

fn versioned_json(body: Value) -> Response {
    let mut response = Json(body).into_response();
    response
        .headers_mut()
        .insert(HERESPHERE_VERSION_HEADER, HeaderValue::from_static("1"));
    response
}

/// `GET|POST /heresphere`.
pub async fn library(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let (scheme, host) = request_origin(&headers);
    let items = state.catalog.list_vr(VR_LIBRARY_LIMIT);

    let list: Vec<String> = items
        .iter()
        .map(|item| super::absolute_url(&scheme, &host, &format!("/heresphere/video/{}", item.id)))
        .collect();

    versioned_json(json!({
        "access": 1,
        "library": [{ "name": "Library", "list": list }],
    }))
}

/// `GET|POST /heresphere/video/{id}`.
pub async fn video(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let (scheme, host) = request_origin(&headers);

    let Some(item) = state.catalog.get(&id) else {
        return (StatusCode::NOT_FOUND, "media not found").into_response();
    };

    let fov = item.vr_fov.unwrap_or_else(|| infer_fov_from_filename(&item.filename));
    let stereo = item
        .vr_stereo
        .unwrap_or_else(|| infer_stereo_from_filename(&item.filename));
    let stereo_str = match stereo {
        crate::catalog::VrStereo::Sbs => "sbs",
        crate::catalog::VrStereo::Tb => "tb",
        crate::catalog::VrStereo::Mono => "mono",
    };
    let duration_ms = item.duration_ms.unwrap_or(0);

    let stream_url = super::absolute_url(&scheme, &host, &format!("/api/media/{}/stream", item.id));
    let thumbnail_url = super::absolute_url(&scheme, &host, &format!("/api/media/{}/thumb", item.id));
    let event_server = super::absolute_url(&scheme, &host, "/heresphere/event");

    let mut body = json!({
        "access": 1,
        "title": item.title,
        "description": item.title,
        "thumbnailImage": thumbnail_url,
        "eventServer": event_server,
        "duration": duration_ms,
        "projection": "equirectangular",
        "stereo": stereo_str,
        "fov": fov,
        "media": [{
            "name": "h264",
            "sources": [{ "resolution": item.height.unwrap_or(1080), "url": stream_url }],
        }],
    });

    if item.has_funscript {
        body["scripts"] = json!([{
            "name": format!("{}.funscript", item.filename),
            "url": super::absolute_url(&scheme, &host, &format!("/api/media/{}/funscript", item.id)),
        }]);
    }

    let update = SessionUpdate {
        session_id: DEFAULT_SESSION_ID.to_string(),
        media_id: Some(item.id.clone()),
        time_ms: 0,
        paused: false,
        fps: 30,
        frame: 0,
        from_client_id: "vr:heresphere".to_string(),
        play_at: None,
        play_at_local_ms: None,
        captured_at_local_ms: None,
    };
    if let Ok(committed) = state.sync_store.upsert_session(update) {
        super::broadcast_session(&state, &committed);
    }

    versioned_json(body)
}

#[derive(Debug, Deserialize)]
pub struct HeresphereEventBody {
    id: String,
    time: u64,
    event: u32,
    #[serde(rename = "connectionKey")]
    connection_key: Option<String>,
}

/// Extracts the trailing `{id}` segment from a HereSphere `id` URL, per
/// spec.md §4.7's `…/heresphere/video/{id}` pattern.
fn extract_media_id(url: &str) -> Option<String> {
    url.rsplit_once("/heresphere/video/")
        .map(|(_, id)| id.to_string())
        .filter(|id| !id.is_empty())
}

/// `POST /heresphere/event`.
pub async fn event(State(state): State<AppState>, Json(body): Json<HeresphereEventBody>) -> Response {
    let Some(media_id) = extract_media_id(&body.id) else {
        return (StatusCode::BAD_REQUEST, "unrecognized id").into_response();
    };

    let paused = matches!(body.event, 0 | 2 | 3);
    let fps = 30u32;
    let frame = (body.time as f64 / 1000.0 * f64::from(fps)).floor() as u64;
    let from_client_id = match &body.connection_key {
        Some(key) => format!("vr:heresphere:{key}"),
        None => "vr:heresphere".to_string(),
    };

    let update = SessionUpdate {
        session_id: DEFAULT_SESSION_ID.to_string(),
        media_id: Some(media_id),
        time_ms: body.time,
        paused,
        fps,
        frame,
        from_client_id,
        play_at: None,
        play_at_local_ms: None,
        captured_at_local_ms: None,
    };

    if let Ok(committed) = state.sync_store.upsert_session(update) {
        super::broadcast_session(&state, &committed);
    }

    StatusCode::NO_CONTENT.into_response()
}

/// `GET|POST /heresphere/auth`.
pub async fn auth() -> Response {
    versioned_json(json!({ "access": 1, "auth-token": "local" }))
}

/// `GET|POST /heresphere/scan`.
pub async fn scan(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let (scheme, host) = request_origin(&headers);
    let items = state.catalog.list_vr(VR_LIBRARY_LIMIT);

    let scan_data: Vec<Value> = items
        .iter()
        .map(|item| {
            json!({
                "link": super::absolute_url(&scheme, &host, &format!("/heresphere/video/{}", item.id)),
                "title": item.title,
                "duration": 0,
                "tags": [],
            })
        })
        .collect();

    versioned_json(json!({ "scanData": scan_data }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_media_id_reads_trailing_segment() {
        let url = "http://h/heresphere/video/m7";
        assert_eq!(extract_media_id(url), Some("m7".to_string()));
    }

    #[test]
    fn extract_media_id_rejects_unrelated_url() {
        assert_eq!(extract_media_id("http://h/other/m7"), None);
    }
}
