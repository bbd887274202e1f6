//! DeoVR Heartbeat Inferrer (C6).
//!
//! DeoVR issues no explicit playback events; this module reconstructs
//! play/pause/time updates from the timing of its Range requests against
//! `/media/{id}/stream`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use crate::sync_store::{SessionUpdate, SyncStore, DEFAULT_SESSION_ID};
use crate::util::now_millis;

pub const DEOVR_FPS: u32 = 30;
pub const DEOVR_PUBLISH_MIN_MS: u64 = 750;
pub const DEOVR_INSTANT_PAUSE_DEBOUNCE_MS: u64 = 125;
pub const DEOVR_IDLE_PAUSE_MS: u64 = 650;
pub const DEOVR_TICK_MS: u64 = 1000;
pub const DEOVR_FORGET_MS: u64 = 60_000;
const FORGET_SWEEP_INTERVAL_SECS: u64 = 5;
/// Cadence of the dedicated pause-debounce/idle check, kept well under
/// `DEOVR_INSTANT_PAUSE_DEBOUNCE_MS` so an armed debounce fires close to
/// its deadline rather than waiting for the next 1s "still playing" tick.
const DEOVR_PAUSE_CHECK_MS: u64 = 25;

#[derive(Debug, Clone)]
struct DeovrStreamState {
    media_id: String,
    started_at: Instant,
    last_time_ms: u64,
    paused: bool,
    in_flight: u32,
    last_data_at: Instant,
    last_published_at: Option<Instant>,
    pause_debounce_deadline: Option<Instant>,
}

impl DeovrStreamState {
    fn new(media_id: String) -> Self {
        let now = Instant::now();
        Self {
            media_id,
            started_at: now,
            last_time_ms: 0,
            paused: false,
            in_flight: 0,
            last_data_at: now,
            last_published_at: None,
            pause_debounce_deadline: None,
        }
    }

    fn current_time_ms(&self) -> u64 {
        if self.paused {
            self.last_time_ms
        } else {
            self.started_at.elapsed().as_millis() as u64
        }
    }
}

/// Owns all live `(sessionId, deovrClientId)` heartbeat states and
/// publishes inferred updates into the sync store.
pub struct DeovrHeartbeat {
    states: Mutex<HashMap<(String, String), DeovrStreamState>>,
    sync_store: Arc<SyncStore>,
    broadcast: tokio::sync::broadcast::Sender<String>,
}

impl DeovrHeartbeat {
    #[must_use]
    pub fn new(sync_store: Arc<SyncStore>, broadcast: tokio::sync::broadcast::Sender<String>) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            sync_store,
            broadcast,
        }
    }

    /// Spawns the pause-check/tick/forget background loop. Returns its
    /// handle so the caller can abort it on shutdown.
    ///
    /// Three independent timers, matching the spec's timer trio: a fast
    /// `pause_check` sweep that honors the 125ms instant-pause debounce
    /// and the idle-bytes detector, a 1s `tick` that republishes "still
    /// playing" at the rate-limited cadence, and a 5s `forget_sweep` that
    /// evicts silent state.
    pub fn spawn_background_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut pause_check = interval(Duration::from_millis(DEOVR_PAUSE_CHECK_MS));
            pause_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut tick = interval(Duration::from_millis(DEOVR_TICK_MS));
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut forget_sweep = interval(Duration::from_secs(FORGET_SWEEP_INTERVAL_SECS));
            forget_sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = pause_check.tick() => this.on_pause_check(),
                    _ = tick.tick() => this.on_tick(),
                    _ = forget_sweep.tick() => this.sweep_forgotten(),
                }
            }
        })
    }

    /// Called when a VR-UA range request for `media_id` arrives.
    pub fn on_stream_request(&self, session_id: &str, client_id: &str, media_id: &str, paused_hint: bool) {
        let key = (session_id.to_string(), client_id.to_string());
        let mut states = self.states.lock();

        let is_new = !states.contains_key(&key);
        let same_media = states
            .get(&key)
            .map(|s| s.media_id == media_id)
            .unwrap_or(false);

        if !is_new && !same_media {
            states.remove(&key);
        }

        let state = states
            .entry(key)
            .or_insert_with(|| DeovrStreamState::new(media_id.to_string()));

        state.pause_debounce_deadline = None;
        state.in_flight += 1;

        if state.paused && !paused_hint {
            state.started_at = Instant::now() - Duration::from_millis(state.last_time_ms);
            state.paused = false;
        }
        state.last_time_ms = state.current_time_ms();

        let should_publish = is_new
            || !same_media
            || state
                .last_published_at
                .map(|t| t.elapsed() >= Duration::from_millis(DEOVR_PUBLISH_MIN_MS))
                .unwrap_or(true);

        if should_publish {
            let snapshot = state.clone();
            state.last_published_at = Some(Instant::now());
            drop(states);
            self.publish(session_id, client_id, &snapshot);
        }
    }

    /// Called when a streaming response for `(session, client)` closes.
    pub fn on_response_close(&self, session_id: &str, client_id: &str) {
        let key = (session_id.to_string(), client_id.to_string());
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(&key) {
            state.in_flight = state.in_flight.saturating_sub(1);
            if state.in_flight == 0 {
                state.pause_debounce_deadline =
                    Some(Instant::now() + Duration::from_millis(DEOVR_INSTANT_PAUSE_DEBOUNCE_MS));
            }
        }
    }

    /// Called whenever bytes are written to an open streaming response.
    pub fn on_data(&self, session_id: &str, client_id: &str) {
        let key = (session_id.to_string(), client_id.to_string());
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(&key) else {
            return;
        };
        state.last_data_at = Instant::now();
        if state.paused {
            state.started_at = Instant::now() - Duration::from_millis(state.last_time_ms);
            state.paused = false;
            let snapshot = state.clone();
            state.last_published_at = Some(Instant::now());
            drop(states);
            self.publish(session_id, client_id, &snapshot);
        }
    }

    /// Fast sweep (`DEOVR_PAUSE_CHECK_MS` cadence): fires the armed
    /// instant-pause debounce close to its 125ms deadline and detects
    /// idle bytes on an otherwise-open request. Kept separate from
    /// `on_tick` so neither bound is at the mercy of the other's cadence.
    fn on_pause_check(&self) {
        let mut to_publish = Vec::new();
        {
            let mut states = self.states.lock();
            let now = Instant::now();
            for ((session_id, client_id), state) in states.iter_mut() {
                if let Some(deadline) = state.pause_debounce_deadline {
                    if now >= deadline && state.in_flight == 0 && !state.paused {
                        state.last_time_ms = state.current_time_ms();
                        state.paused = true;
                        state.pause_debounce_deadline = None;
                        state.last_published_at = Some(now);
                        to_publish.push((session_id.clone(), client_id.clone(), state.clone()));
                        continue;
                    }
                }

                if !state.paused
                    && state.in_flight > 0
                    && now.duration_since(state.last_data_at) >= Duration::from_millis(DEOVR_IDLE_PAUSE_MS)
                {
                    state.last_time_ms = state.current_time_ms();
                    state.paused = true;
                    state.last_published_at = Some(now);
                    to_publish.push((session_id.clone(), client_id.clone(), state.clone()));
                }
            }
        }

        for (session_id, client_id, state) in to_publish {
            self.publish(&session_id, &client_id, &state);
        }
    }

    /// Periodic (`DEOVR_TICK_MS`) "still playing" republish, rate-limited
    /// by `DEOVR_PUBLISH_MIN_MS`.
    fn on_tick(&self) {
        let mut to_publish = Vec::new();
        {
            let mut states = self.states.lock();
            let now = Instant::now();
            for ((session_id, client_id), state) in states.iter_mut() {
                if !state.paused && state.in_flight > 0 {
                    let should_publish = state
                        .last_published_at
                        .map(|t| now.duration_since(t) >= Duration::from_millis(DEOVR_PUBLISH_MIN_MS))
                        .unwrap_or(true);
                    if should_publish {
                        state.last_time_ms = state.current_time_ms();
                        state.last_published_at = Some(now);
                        to_publish.push((session_id.clone(), client_id.clone(), state.clone()));
                    }
                }
            }
        }

        for (session_id, client_id, state) in to_publish {
            self.publish(&session_id, &client_id, &state);
        }
    }

    fn sweep_forgotten(&self) {
        let mut states = self.states.lock();
        let before = states.len();
        states.retain(|_, state| state.last_data_at.elapsed() < Duration::from_millis(DEOVR_FORGET_MS));
        let removed = before - states.len();
        if removed > 0 {
            log::debug!("[deovr] forgot {removed} idle heartbeat state(s)");
        }
    }

    fn publish(&self, session_id: &str, client_id: &str, state: &DeovrStreamState) {
        let time_ms = state.current_time_ms();
        let frame = (time_ms as f64 / 1000.0 * f64::from(DEOVR_FPS)).floor() as u64;

        let update = SessionUpdate {
            session_id: if session_id.is_empty() {
                DEFAULT_SESSION_ID.to_string()
            } else {
                session_id.to_string()
            },
            media_id: Some(state.media_id.clone()),
            time_ms,
            paused: state.paused,
            fps: DEOVR_FPS,
            frame,
            from_client_id: format!("vr:deovr:{client_id}"),
            play_at: None,
            play_at_local_ms: None,
            captured_at_local_ms: None,
        };

        if let Ok(committed) = self.sync_store.upsert_session(update) {
            let clients = self.sync_store.all_presence();
            let message = serde_json::json!({
                "type": "sync:state",
                "state": {
                    "mediaId": committed.media_id,
                    "timeMs": committed.time_ms,
                    "paused": committed.paused,
                    "fps": committed.fps,
                    "frame": committed.frame,
                    "fromClientId": committed.from_client_id,
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
                let _ = self.broadcast.send(text);
            }
            log::debug!(
                "[deovr] published {} paused={} timeMs={} for {}",
                state.media_id,
                committed.paused,
                committed.time_ms,
                client_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness() -> Arc<DeovrHeartbeat> {
        let (tx, _rx) = tokio::sync::broadcast::channel(16);
        Arc::new(DeovrHeartbeat::new(Arc::new(SyncStore::new()), tx))
    }

    #[test]
    fn first_stream_request_creates_playing_state() {
        let hb = harness();
        hb.on_stream_request("default", "1.2.3.4", "m1", false);
        let states = hb.states.lock();
        let state = states.get(&("default".to_string(), "1.2.3.4".to_string())).unwrap();
        assert!(!state.paused);
        assert_eq!(state.in_flight, 1);
    }

    #[test]
    fn differing_media_id_replaces_state() {
        let hb = harness();
        hb.on_stream_request("default", "c1", "m1", false);
        hb.on_stream_request("default", "c1", "m2", false);
        let states = hb.states.lock();
        let state = states.get(&("default".to_string(), "c1".to_string())).unwrap();
        assert_eq!(state.media_id, "m2");
    }

    #[test]
    fn response_close_arms_pause_debounce() {
        let hb = harness();
        hb.on_stream_request("default", "c1", "m1", false);
        hb.on_response_close("default", "c1");
        let states = hb.states.lock();
        let state = states.get(&("default".to_string(), "c1".to_string())).unwrap();
        assert_eq!(state.in_flight, 0);
        assert!(state.pause_debounce_deadline.is_some());
    }
}
