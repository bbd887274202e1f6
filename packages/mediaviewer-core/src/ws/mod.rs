//! WebSocket Hub (C4).
//!
//! Serves a single `/ws` endpoint. On connect it captures the User-Agent
//! and client IP (honoring `X-Forwarded-For`'s first entry), sends a
//! `hello` greeting with server time, then handles text JSON messages.
//!
//! Every accepted session update commits to the sync store under its lock,
//! then the socket list is snapshotted and released before any socket
//! write — a single misbehaving client must never stall a broadcast.

pub mod connection;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::time::{interval, MissedTickBehavior};

pub use connection::{ConnectionGuard, SocketHandle, WsConnectionManager};

use crate::api::AppState;
use crate::sync_store::{ClientPresence, SessionState, SessionUpdate};
use crate::util::now_millis;

const HEARTBEAT_CHECK_INTERVAL_SECS: u64 = 1;

/// Deserializes a present-but-possibly-null field into `Option<Option<T>>`,
/// distinguishing "field omitted" (outer `None`, via `#[serde(default)]`)
/// from "field present and explicitly null" (`Some(None)`).
fn deserialize_some<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum WsIncoming {
    #[serde(rename = "sync:hello")]
    SyncHello {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "sessionId")]
        session_id: Option<String>,
    },
    #[serde(rename = "client:status")]
    ClientStatus {
        #[serde(rename = "uiView")]
        ui_view: Option<String>,
        #[serde(
            rename = "mediaId",
            default,
            deserialize_with = "deserialize_some"
        )]
        ui_media_id: Option<Option<String>>,
    },
    #[serde(rename = "sync:update")]
    SyncUpdate {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "sessionId")]
        session_id: Option<String>,
        #[serde(rename = "mediaId", default)]
        media_id: Option<String>,
        #[serde(rename = "timeMs")]
        time_ms: u64,
        paused: bool,
        fps: u32,
        frame: u64,
        #[serde(rename = "playAt")]
        play_at: Option<String>,
        #[serde(rename = "playAtLocalMs")]
        play_at_local_ms: Option<u64>,
        #[serde(rename = "capturedAtLocalMs")]
        captured_at_local_ms: Option<u64>,
        #[serde(rename = "toClientId")]
        to_client_id: Option<String>,
        #[serde(rename = "openInUi")]
        open_in_ui: Option<bool>,
        #[serde(rename = "seekToken")]
        seek_token: Option<String>,
        #[serde(rename = "seekPhase")]
        seek_phase: Option<String>,
        #[serde(rename = "seekWantPlay")]
        seek_want_play: Option<bool>,
        #[serde(rename = "seekTargetClientId")]
        seek_target_client_id: Option<String>,
    },
    #[serde(rename = "ws:ping")]
    WsPing {
        nonce: Option<String>,
        #[serde(rename = "clientSentAt")]
        client_sent_at: Option<u64>,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionStateWire {
    media_id: Option<String>,
    time_ms: u64,
    paused: bool,
    fps: u32,
    frame: u64,
    from_client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    play_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    play_at_local_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    captured_at_local_ms: Option<u64>,
}

impl From<&SessionState> for SessionStateWire {
    fn from(state: &SessionState) -> Self {
        Self {
            media_id: state.media_id.clone(),
            time_ms: state.time_ms,
            paused: state.paused,
            fps: state.fps,
            frame: state.frame,
            from_client_id: state.from_client_id.clone(),
            play_at: state.play_at.clone(),
            play_at_local_ms: state.play_at_local_ms,
            captured_at_local_ms: state.captured_at_local_ms,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientPresenceWire {
    client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ui_view: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ui_media_id: Option<String>,
}

impl From<&ClientPresence> for ClientPresenceWire {
    fn from(p: &ClientPresence) -> Self {
        Self {
            client_id: p.client_id.clone(),
            user_agent: p.user_agent.clone(),
            ip_address: p.ip_address.clone(),
            ui_view: p.ui_view.clone(),
            ui_media_id: p.ui_media_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum WsOutgoing {
    #[serde(rename = "hello")]
    Hello { server_time: u64 },
    #[serde(rename = "sync:state")]
    SyncState {
        state: SessionStateWire,
        clients: Vec<ClientPresenceWire>,
        #[serde(skip_serializing_if = "Option::is_none")]
        from_client_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        open_in_ui: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seek_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seek_phase: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seek_want_play: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seek_target_client_id: Option<String>,
    },
    #[serde(rename = "ws:pong")]
    WsPong {
        nonce: Option<String>,
        client_sent_at: Option<u64>,
        server_received_at: u64,
    },
}

impl WsOutgoing {
    fn into_message(self) -> Message {
        Message::Text(serde_json::to_string(&self).unwrap_or_default().into())
    }
}

fn build_sync_state_message(state: &SessionState, clients: &[ClientPresence]) -> WsOutgoing {
    WsOutgoing::SyncState {
        state: SessionStateWire::from(state),
        clients: clients.iter().map(ClientPresenceWire::from).collect(),
        from_client_id: None,
        open_in_ui: None,
        seek_token: None,
        seek_phase: None,
        seek_want_play: None,
        seek_target_client_id: None,
    }
}

/// Upgrade entrypoint: `GET /ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let ip_address = client_ip(&headers, addr);

    ws.on_upgrade(move |socket| handle_ws(socket, state, user_agent, ip_address))
}

fn client_ip(headers: &HeaderMap, fallback: SocketAddr) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .or_else(|| Some(fallback.ip().to_string()))
}

async fn handle_ws(
    socket: WebSocket,
    state: AppState,
    user_agent: Option<String>,
    ip_address: Option<String>,
) {
    let (mut sender, mut receiver) = futures::StreamExt::split(socket);

    let (handle, mut direct_rx, _guard) = state.ws_manager.register();
    let mut broadcast_rx = state.broadcast_tx.subscribe();
    let cancel_token = _guard.cancel_token().clone();

    let mut heartbeat = interval(std::time::Duration::from_secs(HEARTBEAT_CHECK_INTERVAL_SECS));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut current_client_id: Option<String> = None;

    let hello = WsOutgoing::Hello {
        server_time: now_millis(),
    };
    if sender
        .send(hello.into_message())
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                break;
            }
            direct = direct_rx.recv() => {
                match direct {
                    Some(msg) => {
                        if sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            broadcast = broadcast_rx.recv() => {
                match broadcast {
                    Ok(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = heartbeat.tick() => {
                // Reserved for future idle-connection detection; the
                // client drives ws:ping/pong explicitly today.
            }
            incoming = futures::StreamExt::next(&mut receiver) => {
                let Some(Ok(msg)) = incoming else { break; };
                match msg {
                    Message::Text(text) => {
                        handle_incoming_text(
                            &text,
                            &state,
                            handle,
                            &mut current_client_id,
                            &user_agent,
                            &ip_address,
                            &mut sender,
                        )
                        .await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    if let Some(client_id) = current_client_id {
        finalize_disconnect(&state, &client_id, handle).await;
    }
}

async fn handle_incoming_text(
    text: &str,
    state: &AppState,
    handle: SocketHandle,
    current_client_id: &mut Option<String>,
    user_agent: &Option<String>,
    ip_address: &Option<String>,
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
) {
    let Ok(incoming) = serde_json::from_str::<WsIncoming>(text) else {
        log::debug!("[ws] dropping malformed message");
        return;
    };

    match incoming {
        WsIncoming::SyncHello {
            client_id,
            session_id: _,
        } => {
            if let Some(previous) = current_client_id.as_ref() {
                if previous != &client_id {
                    let orphaned = state.sync_store.detach_socket(previous, handle);
                    if orphaned {
                        state.sync_store.drop_presence(previous);
                    }
                }
            }
            state
                .sync_store
                .upsert_presence(&client_id, user_agent.clone(), ip_address.clone());
            state.sync_store.attach_socket(&client_id, handle);
            *current_client_id = Some(client_id);
            broadcast_state(state, crate::sync_store::DEFAULT_SESSION_ID);
        }
        WsIncoming::ClientStatus {
            ui_view,
            ui_media_id,
        } => {
            if let Some(client_id) = current_client_id.as_ref() {
                state
                    .sync_store
                    .update_ui_status(client_id, ui_view, ui_media_id);
                broadcast_state(state, crate::sync_store::DEFAULT_SESSION_ID);
            }
        }
        WsIncoming::SyncUpdate {
            client_id,
            session_id,
            media_id,
            time_ms,
            paused,
            fps,
            frame,
            play_at,
            play_at_local_ms,
            captured_at_local_ms,
            to_client_id,
            open_in_ui,
            seek_token,
            seek_phase,
            seek_want_play,
            seek_target_client_id,
        } => {
            if client_id.is_empty() {
                return;
            }
            let session_id = session_id.unwrap_or_else(|| crate::sync_store::DEFAULT_SESSION_ID.to_string());

            if let Some(target) = to_client_id {
                let state_snapshot = state.sync_store.get_session(&session_id);
                let mut wire = build_sync_state_message(&state_snapshot, &[]);
                if let WsOutgoing::SyncState {
                    state: ref mut s,
                    from_client_id,
                    open_in_ui: oiu,
                    seek_token: st,
                    seek_phase: sp,
                    seek_want_play: swp,
                    seek_target_client_id: stc,
                    ..
                } = wire
                {
                    s.media_id = media_id;
                    s.time_ms = time_ms;
                    s.paused = paused;
                    s.fps = fps.max(1);
                    s.frame = frame;
                    if paused || play_at.is_none() {
                        s.play_at = None;
                        s.play_at_local_ms = None;
                        s.captured_at_local_ms = None;
                    } else {
                        s.play_at = play_at;
                        s.play_at_local_ms = play_at_local_ms;
                        s.captured_at_local_ms = captured_at_local_ms;
                    }
                    *from_client_id = Some(client_id);
                    *oiu = open_in_ui;
                    *st = seek_token;
                    *sp = seek_phase;
                    *swp = seek_want_play;
                    *stc = seek_target_client_id;
                }

                let message = wire.into_message();
                for socket in state.sync_store.sockets_for(&target) {
                    let _ = state.ws_manager.send_to(socket, message.clone());
                }
            } else {
                let update = SessionUpdate {
                    session_id: session_id.clone(),
                    media_id,
                    time_ms,
                    paused,
                    fps,
                    frame,
                    from_client_id: client_id,
                    play_at,
                    play_at_local_ms,
                    captured_at_local_ms,
                };
                if state.sync_store.upsert_session(update).is_ok() {
                    broadcast_state(state, &session_id);
                }
            }
        }
        WsIncoming::WsPing {
            nonce,
            client_sent_at,
        } => {
            let pong = WsOutgoing::WsPong {
                nonce,
                client_sent_at,
                server_received_at: now_millis(),
            };
            let _ = sender.send(pong.into_message()).await;
        }
    }
}

/// Broadcasts the current state of `session_id`. Callers that just
/// committed a `sync:update` pass the session they committed to, so the
/// fan-out reflects that write rather than a hardcoded default (§5
/// read-your-writes-for-broadcasts); presence-only events (`sync:hello`,
/// `client:status`, disconnect) have no session of their own and use the
/// default session's state.
fn broadcast_state(state: &AppState, session_id: &str) {
    let session = state.sync_store.get_session(session_id);
    let clients = state.sync_store.all_presence();
    let message = build_sync_state_message(&session, &clients);
    if let Ok(text) = serde_json::to_string(&message) {
        let _ = state.broadcast_tx.send(text);
    }
}

async fn finalize_disconnect(state: &AppState, client_id: &str, handle: SocketHandle) {
    let orphaned = state.sync_store.detach_socket(client_id, handle);
    if orphaned {
        state.sync_store.drop_presence(client_id);
        broadcast_state(state, crate::sync_store::DEFAULT_SESSION_ID);
    }
}

