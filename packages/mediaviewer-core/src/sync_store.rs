//! Sync State Store (C3).
//!
//! In-memory authoritative per-session playback state, plus per-client
//! presence and per-viewer resume cursors. No persistence by design —
//! state is lost on restart (see spec.md's "ephemeral by design" non-goal).
//!
//! Follows the same concurrent-map shape as a session store: primary maps
//! guarded individually (one coarse lock conceptually, implemented as one
//! lock per logical map so read-modify-write of a session never blocks
//! presence bookkeeping), never held across socket or disk I/O.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::error::{MediaViewerError, MediaViewerResult};
use crate::util::now_millis;

pub const DEFAULT_SESSION_ID: &str = "default";

/// Authoritative playback cursor for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub session_id: String,
    pub media_id: Option<String>,
    pub time_ms: u64,
    pub paused: bool,
    pub fps: u32,
    pub frame: u64,
    pub from_client_id: String,
    pub updated_at: u64,
    /// Coordinated-start ephemerals. Cleared whenever `paused` or the
    /// update omits them.
    pub play_at: Option<String>,
    pub play_at_local_ms: Option<u64>,
    pub captured_at_local_ms: Option<u64>,
}

impl SessionState {
    fn default_for(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            media_id: None,
            time_ms: 0,
            paused: true,
            fps: 30,
            frame: 0,
            from_client_id: String::new(),
            updated_at: now_millis(),
            play_at: None,
            play_at_local_ms: None,
            captured_at_local_ms: None,
        }
    }
}

/// Fields accepted by `upsert_session`; unset ephemerals are treated as
/// "not provided", which is significant for `playAt` clearing semantics.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub session_id: String,
    pub media_id: Option<String>,
    pub time_ms: u64,
    pub paused: bool,
    pub fps: u32,
    pub frame: u64,
    pub from_client_id: String,
    pub play_at: Option<String>,
    pub play_at_local_ms: Option<u64>,
    pub captured_at_local_ms: Option<u64>,
}

/// Presence record for a connected client. A client may have several live
/// sockets; the socket set lives in a separate map keyed by the same id.
#[derive(Debug, Clone)]
pub struct ClientPresence {
    pub client_id: String,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub ui_view: Option<String>,
    pub ui_media_id: Option<String>,
}

/// Opaque per-viewer resume cursor. Does not participate in the broadcast
/// protocol.
#[derive(Debug, Clone)]
pub struct PerClientPlayback {
    pub time_ms: u64,
    pub fps: u32,
    pub frame: u64,
    pub updated_at: u64,
}

/// An opaque handle identifying one live WebSocket connection for a client.
pub type SocketHandle = u64;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionState>,
    presence: HashMap<String, ClientPresence>,
    sockets: HashMap<String, HashSet<SocketHandle>>,
    playback: HashMap<(String, String), PerClientPlayback>,
}

/// The in-memory authoritative state store.
pub struct SyncStore {
    inner: Mutex<Inner>,
}

impl Default for SyncStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Returns the stored session state, or a fresh default if none exists.
    #[must_use]
    pub fn get_session(&self, session_id: &str) -> SessionState {
        let inner = self.inner.lock();
        inner
            .sessions
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| SessionState::default_for(session_id))
    }

    /// Validates, clamps, commits, and returns the stored session state.
    ///
    /// Clamping: `time_ms >= 0` (unsigned already), `fps >= 1`, `frame >= 0`
    /// (unsigned already), `media_id` must be `None` or non-empty.
    /// `updated_at` is always `now()`, which is monotonic per session since
    /// the lock serializes writers.
    pub fn upsert_session(&self, update: SessionUpdate) -> MediaViewerResult<SessionState> {
        if let Some(media_id) = &update.media_id {
            if media_id.is_empty() {
                return Err(MediaViewerError::Validation(
                    "mediaId must not be an empty string".into(),
                ));
            }
        }

        let session_id = if update.session_id.is_empty() {
            DEFAULT_SESSION_ID.to_string()
        } else {
            update.session_id
        };

        let mut play_at = update.play_at;
        let mut play_at_local_ms = update.play_at_local_ms;
        let mut captured_at_local_ms = update.captured_at_local_ms;

        // paused=true clears playAt; paused=false with no playAt also clears.
        if update.paused || play_at.is_none() {
            play_at = None;
            play_at_local_ms = None;
            captured_at_local_ms = None;
        }

        let state = SessionState {
            session_id: session_id.clone(),
            media_id: update.media_id,
            time_ms: update.time_ms,
            paused: update.paused,
            fps: update.fps.max(1),
            frame: update.frame,
            from_client_id: update.from_client_id,
            updated_at: now_millis(),
            play_at,
            play_at_local_ms,
            captured_at_local_ms,
        };

        let mut inner = self.inner.lock();
        inner.sessions.insert(session_id, state.clone());
        Ok(state)
    }

    /// Clears the coordinated-start ephemerals for a session without
    /// otherwise touching its state.
    pub fn clear_play_at(&self, session_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.sessions.get_mut(session_id) {
            state.play_at = None;
            state.play_at_local_ms = None;
            state.captured_at_local_ms = None;
        }
    }

    /// Registers or updates presence for a client id. Returns `true` if
    /// this was a brand new client (first socket).
    pub fn upsert_presence(
        &self,
        client_id: &str,
        user_agent: Option<String>,
        ip_address: Option<String>,
    ) -> bool {
        let mut inner = self.inner.lock();
        let is_new = !inner.presence.contains_key(client_id);
        let entry = inner
            .presence
            .entry(client_id.to_string())
            .or_insert_with(|| ClientPresence {
                client_id: client_id.to_string(),
                user_agent: None,
                ip_address: None,
                ui_view: None,
                ui_media_id: None,
            });
        if user_agent.is_some() {
            entry.user_agent = user_agent;
        }
        if ip_address.is_some() {
            entry.ip_address = ip_address;
        }
        is_new
    }

    /// Updates a client's UI status fields. `media_id = Some(None)` (i.e.
    /// an explicit `null` in the wire message) clears `ui_media_id`; a
    /// bare omission (`None`) leaves it untouched — callers distinguish
    /// these by only calling this when the field was present on the wire.
    pub fn update_ui_status(
        &self,
        client_id: &str,
        ui_view: Option<String>,
        ui_media_id: Option<Option<String>>,
    ) {
        let mut inner = self.inner.lock();
        if let Some(presence) = inner.presence.get_mut(client_id) {
            if ui_view.is_some() {
                presence.ui_view = ui_view;
            }
            if let Some(media_id) = ui_media_id {
                presence.ui_media_id = media_id;
            }
        }
    }

    /// Removes a client's presence entirely (last socket closed).
    pub fn drop_presence(&self, client_id: &str) {
        let mut inner = self.inner.lock();
        inner.presence.remove(client_id);
        inner.sockets.remove(client_id);
    }

    /// Attaches a socket handle to a client id's socket set.
    pub fn attach_socket(&self, client_id: &str, socket: SocketHandle) {
        let mut inner = self.inner.lock();
        inner
            .sockets
            .entry(client_id.to_string())
            .or_default()
            .insert(socket);
    }

    /// Detaches a socket handle. Returns `true` if the client id now has
    /// zero remaining sockets (the caller should then drop presence).
    pub fn detach_socket(&self, client_id: &str, socket: SocketHandle) -> bool {
        let mut inner = self.inner.lock();
        if let Some(set) = inner.sockets.get_mut(client_id) {
            set.remove(&socket);
            return set.is_empty();
        }
        true
    }

    /// Returns the socket handles currently registered for a client id.
    #[must_use]
    pub fn sockets_for(&self, client_id: &str) -> HashSet<SocketHandle> {
        let inner = self.inner.lock();
        inner.sockets.get(client_id).cloned().unwrap_or_default()
    }

    /// Snapshots all current presences, for the `clients` field of a
    /// broadcast `sync:state` message.
    #[must_use]
    pub fn all_presence(&self) -> Vec<ClientPresence> {
        let inner = self.inner.lock();
        inner.presence.values().cloned().collect()
    }

    /// Upserts a per-viewer resume cursor.
    pub fn upsert_playback(&self, client_id: &str, media_id: &str, time_ms: u64, fps: u32, frame: u64) {
        let mut inner = self.inner.lock();
        inner.playback.insert(
            (client_id.to_string(), media_id.to_string()),
            PerClientPlayback {
                time_ms,
                fps: fps.max(1),
                frame,
                updated_at: now_millis(),
            },
        );
    }

    #[must_use]
    pub fn get_playback(&self, client_id: &str, media_id: &str) -> Option<PerClientPlayback> {
        let inner = self.inner.lock();
        inner
            .playback
            .get(&(client_id.to_string(), media_id.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_then_get_returns_clamped_state() {
        let store = SyncStore::new();
        let update = SessionUpdate {
            session_id: "s1".into(),
            media_id: Some("m1".into()),
            time_ms: 12345,
            paused: false,
            fps: 0,
            frame: 370,
            from_client_id: "A".into(),
            play_at: Some("2026-01-01T00:00:00Z".into()),
            play_at_local_ms: Some(1),
            captured_at_local_ms: Some(1),
        };
        let committed = store.upsert_session(update).unwrap();
        assert_eq!(committed.fps, 1); // clamped up from 0
        assert_eq!(store.get_session("s1").time_ms, 12345);
    }

    #[test]
    fn empty_media_id_is_rejected() {
        let store = SyncStore::new();
        let update = SessionUpdate {
            session_id: "s1".into(),
            media_id: Some(String::new()),
            fps: 30,
            ..Default::default()
        };
        assert!(store.upsert_session(update).is_err());
    }

    #[test]
    fn paused_clears_play_at() {
        let store = SyncStore::new();
        let update = SessionUpdate {
            session_id: "s1".into(),
            paused: true,
            fps: 30,
            play_at: Some("2026-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        let committed = store.upsert_session(update).unwrap();
        assert!(committed.play_at.is_none());
    }

    #[test]
    fn unpaused_without_play_at_also_clears() {
        let store = SyncStore::new();
        let update = SessionUpdate {
            session_id: "s1".into(),
            paused: false,
            fps: 30,
            play_at: None,
            ..Default::default()
        };
        let committed = store.upsert_session(update).unwrap();
        assert!(committed.play_at.is_none());
    }

    #[test]
    fn presence_lifecycle_tracks_last_socket() {
        let store = SyncStore::new();
        assert!(store.upsert_presence("A", None, None));
        store.attach_socket("A", 1);
        store.attach_socket("A", 2);
        assert!(!store.detach_socket("A", 1));
        assert!(store.detach_socket("A", 2));
        store.drop_presence("A");
        assert!(store.all_presence().is_empty());
    }

    #[test]
    fn updated_at_is_monotonic_across_commits() {
        let store = SyncStore::new();
        let first = store
            .upsert_session(SessionUpdate {
                session_id: "s1".into(),
                fps: 30,
                ..Default::default()
            })
            .unwrap();
        let second = store
            .upsert_session(SessionUpdate {
                session_id: "s1".into(),
                fps: 30,
                time_ms: 10,
                ..Default::default()
            })
            .unwrap();
        assert!(second.updated_at >= first.updated_at);
    }
}
