//! Handler functions for the `/api/*` HTTP surface (C8).

use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::catalog::{Filters, MediaType, Sort, SortDirection, SortKey};
use crate::error::{MediaViewerError, MediaViewerResult};
use crate::streaming;
use crate::sync_store::{SessionUpdate, DEFAULT_SESSION_ID};

use super::AppState;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

pub async fn start_scan(State(state): State<AppState>) -> Response {
    match state.scanner.spawn_rescan() {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e @ MediaViewerError::Busy(_)) => e.into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn scan_progress(State(state): State<AppState>) -> Json<serde_json::Value> {
    let progress = state.scanner.progress().await;
    Json(json!({
        "isScanning": progress.is_scanning,
        "scanned": progress.scanned,
        "message": progress.message,
    }))
}

pub async fn clear_cache(State(state): State<AppState>) -> Response {
    match tokio::fs::remove_dir_all(&state.config.thumb_cache_dir).await {
        Ok(()) | Err(_) => StatusCode::NO_CONTENT.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

pub async fn get_sync(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Json<serde_json::Value> {
    let session_id = query.session_id.unwrap_or_else(|| DEFAULT_SESSION_ID.to_string());
    let session = state.sync_store.get_session(&session_id);
    Json(json!({
        "sessionId": session.session_id,
        "mediaId": session.media_id,
        "timeMs": session.time_ms,
        "paused": session.paused,
        "fps": session.fps,
        "frame": session.frame,
        "fromClientId": session.from_client_id,
        "updatedAt": session.updated_at,
        "playAt": session.play_at,
        "playAtLocalMs": session.play_at_local_ms,
        "capturedAtLocalMs": session.captured_at_local_ms,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PutSyncBody {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(rename = "clientId")]
    client_id: String,
    #[serde(rename = "mediaId", default)]
    media_id: Option<String>,
    #[serde(rename = "timeMs")]
    time_ms: u64,
    paused: bool,
    fps: u32,
    frame: u64,
}

pub async fn put_sync(
    State(state): State<AppState>,
    Json(body): Json<PutSyncBody>,
) -> MediaViewerResult<Json<serde_json::Value>> {
    let update = SessionUpdate {
        session_id: body.session_id.unwrap_or_else(|| DEFAULT_SESSION_ID.to_string()),
        media_id: body.media_id,
        time_ms: body.time_ms,
        paused: body.paused,
        fps: body.fps,
        frame: body.frame,
        from_client_id: body.client_id,
        play_at: None,
        play_at_local_ms: None,
        captured_at_local_ms: None,
    };

    let committed = state.sync_store.upsert_session(update)?;
    crate::vr::broadcast_session(&state, &committed);

    Ok(Json(json!({
        "sessionId": committed.session_id,
        "mediaId": committed.media_id,
        "timeMs": committed.time_ms,
        "paused": committed.paused,
        "fps": committed.fps,
        "frame": committed.frame,
    })))
}

#[derive(Debug, Deserialize, Default)]
pub struct SearchQuery {
    q: Option<String>,
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
    #[serde(rename = "hasFunscript")]
    has_funscript: Option<bool>,
    #[serde(rename = "isVr")]
    is_vr: Option<bool>,
    #[serde(rename = "durationMsMin")]
    duration_ms_min: Option<u64>,
    #[serde(rename = "durationMsMax")]
    duration_ms_max: Option<u64>,
    #[serde(rename = "funscriptAvgSpeedMin")]
    funscript_avg_speed_min: Option<f64>,
    #[serde(rename = "funscriptAvgSpeedMax")]
    funscript_avg_speed_max: Option<f64>,
    #[serde(rename = "widthMin")]
    width_min: Option<u32>,
    #[serde(rename = "widthMax")]
    width_max: Option<u32>,
    #[serde(rename = "heightMin")]
    height_min: Option<u32>,
    #[serde(rename = "heightMax")]
    height_max: Option<u32>,
    sort: Option<String>,
    direction: Option<String>,
    page: Option<usize>,
    #[serde(rename = "pageSize")]
    page_size: Option<usize>,
}

/// Combines a `*Min`/`*Max` query pair into a closed range, defaulting
/// to the type's full span when one side is absent.
fn range_pair<T: Copy>(min: Option<T>, max: Option<T>, lo: T, hi: T) -> Option<(T, T)> {
    if min.is_none() && max.is_none() {
        None
    } else {
        Some((min.unwrap_or(lo), max.unwrap_or(hi)))
    }
}

pub async fn search_media(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Json<serde_json::Value> {
    let filters = Filters {
        query: query.q,
        media_type: query.media_type.as_deref().and_then(parse_media_type),
        has_funscript: query.has_funscript,
        is_vr: query.is_vr,
        duration_ms_range: range_pair(query.duration_ms_min, query.duration_ms_max, 0, u64::MAX),
        funscript_avg_speed_range: range_pair(
            query.funscript_avg_speed_min,
            query.funscript_avg_speed_max,
            0.0,
            f64::MAX,
        ),
        width_range: range_pair(query.width_min, query.width_max, 0, u32::MAX),
        height_range: range_pair(query.height_min, query.height_max, 0, u32::MAX),
    };

    let sort = Sort {
        key: query.sort.as_deref().map(parse_sort_key).unwrap_or(SortKey::Modified),
        direction: match query.direction.as_deref() {
            Some("asc") => SortDirection::Asc,
            _ => SortDirection::Desc,
        },
    };

    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(50).clamp(1, 100);

    let result = state.catalog.search(&filters, &sort, page, page_size);
    Json(json!({
        "items": result.items,
        "total": result.total,
        "page": page,
        "pageSize": page_size,
    }))
}

fn parse_media_type(value: &str) -> Option<MediaType> {
    match value {
        "video" => Some(MediaType::Video),
        "image" => Some(MediaType::Image),
        "other" => Some(MediaType::Other),
        _ => None,
    }
}

fn parse_sort_key(value: &str) -> SortKey {
    match value {
        "title" => SortKey::Title,
        "filename" => SortKey::Filename,
        "duration" => SortKey::Duration,
        "speed" => SortKey::Speed,
        "resolution" => SortKey::Resolution,
        _ => SortKey::Modified,
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct StreamQuery {
    transcode: Option<String>,
    #[serde(rename = "mvFrom")]
    mv_from: Option<String>,
}

pub async fn stream_media(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<StreamQuery>,
    method: Method,
    headers: HeaderMap,
) -> MediaViewerResult<Response> {
    let item = state
        .catalog
        .get(&id)
        .ok_or_else(|| MediaViewerError::NotFound(format!("unknown media id {id}")))?;

    let absolute_path = state.config.media_root.join(&item.rel_path);
    let transcode = query.transcode.as_deref() == Some("h264");
    let is_head = method == Method::HEAD;

    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    let is_deovr = (user_agent.contains(&state.config.deovr_ua_token)
        || query.mv_from.as_deref() == Some("deovr"))
        && query.mv_from.as_deref() != Some("desktop");

    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .unwrap_or("unknown")
        .trim()
        .to_string();

    if is_deovr {
        state
            .deovr_heartbeat
            .on_stream_request(DEFAULT_SESSION_ID, &client_ip, &item.id, false);
    }

    let response = streaming::serve_range(
        &item,
        &absolute_path,
        &state.config.ffmpeg_path,
        &headers,
        is_head,
        transcode,
    )
    .await?;

    if is_deovr {
        let heartbeat = Arc::clone(&state.deovr_heartbeat);
        let data_ip = client_ip.clone();
        let close_heartbeat = Arc::clone(&state.deovr_heartbeat);
        Ok(streaming::instrument_stream_response(
            response,
            move || heartbeat.on_data(DEFAULT_SESSION_ID, &data_ip),
            move || close_heartbeat.on_response_close(DEFAULT_SESSION_ID, &client_ip),
        ))
    } else {
        Ok(response)
    }
}

pub async fn thumb(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Response {
    let Some(item) = state.catalog.get(&id) else {
        return Redirect::to("/thumb/placeholder.svg?err=1").into_response();
    };

    let thumb_path = state.config.thumb_cache_dir.join(format!("{}.jpg", item.id));
    match tokio::fs::read(&thumb_path).await {
        Ok(bytes) => (
            [(axum::http::header::CONTENT_TYPE, "image/jpeg")],
            bytes,
        )
            .into_response(),
        Err(_) => Redirect::to("/thumb/placeholder.svg?err=1").into_response(),
    }
}

pub async fn thumb_placeholder(AxumPath(_name): AxumPath<String>) -> Response {
    let svg = r#"<svg xmlns="http://www.w3.org/2000/svg" width="320" height="180"><rect width="100%" height="100%" fill="#222"/><text x="50%" y="50%" fill="#888" text-anchor="middle">no preview</text></svg>"#;
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "image/svg+xml; charset=utf-8",
        )],
        svg,
    )
        .into_response()
}

pub async fn funscript(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> MediaViewerResult<Response> {
    let item = state
        .catalog
        .get(&id)
        .ok_or_else(|| MediaViewerError::NotFound(format!("unknown media id {id}")))?;

    if !item.has_funscript {
        return Err(MediaViewerError::NotFound("no funscript for this media item".into()));
    }

    let path = state
        .config
        .media_root
        .join(&item.rel_path)
        .with_extension("funscript");
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| MediaViewerError::NotFound("funscript file missing".into()))?;

    Ok((
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        content,
    )
        .into_response())
}

pub async fn fileinfo(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> MediaViewerResult<Json<serde_json::Value>> {
    let item = state
        .catalog
        .get(&id)
        .ok_or_else(|| MediaViewerError::NotFound(format!("unknown media id {id}")))?;
    Ok(Json(serde_json::to_value(item).unwrap_or_default()))
}

pub async fn probe(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> MediaViewerResult<Json<serde_json::Value>> {
    let item = state
        .catalog
        .get(&id)
        .ok_or_else(|| MediaViewerError::NotFound(format!("unknown media id {id}")))?;
    Ok(Json(json!({
        "width": item.width,
        "height": item.height,
        "durationMs": item.duration_ms,
        "isVr": item.is_vr,
        "vrFov": item.vr_fov,
        "vrStereo": item.vr_stereo,
        "vrProjection": item.vr_projection,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PlaybackQuery {
    #[serde(rename = "clientId")]
    client_id: String,
    #[serde(rename = "mediaId")]
    media_id: String,
}

pub async fn get_playback(
    State(state): State<AppState>,
    Query(query): Query<PlaybackQuery>,
) -> Json<serde_json::Value> {
    match state.sync_store.get_playback(&query.client_id, &query.media_id) {
        Some(playback) => Json(json!({
            "timeMs": playback.time_ms,
            "fps": playback.fps,
            "frame": playback.frame,
            "updatedAt": playback.updated_at,
        })),
        None => Json(json!(null)),
    }
}

#[derive(Debug, Deserialize)]
pub struct PutPlaybackBody {
    #[serde(rename = "clientId")]
    client_id: String,
    #[serde(rename = "mediaId")]
    media_id: String,
    #[serde(rename = "timeMs")]
    time_ms: u64,
    fps: u32,
    frame: u64,
}

pub async fn put_playback(State(state): State<AppState>, Json(body): Json<PutPlaybackBody>) -> StatusCode {
    state
        .sync_store
        .upsert_playback(&body.client_id, &body.media_id, body.time_ms, body.fps, body.frame);
    StatusCode::NO_CONTENT
}
