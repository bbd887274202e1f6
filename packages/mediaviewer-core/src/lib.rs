//! MediaViewer Core - shared library for the MediaViewer server.
//!
//! A single-host media server that indexes a local media tree and acts as
//! a multi-client playback coordinator: web UI, desktop, and VR player
//! clients (DeoVR, HereSphere) attach to a shared session and observe or
//! drive a single authoritative playback cursor.
//!
//! # Architecture
//!
//! - [`catalog`]: authoritative record of discovered media items (C1)
//! - [`scanner`]: media-root walk, `ffprobe` probing, VR classification (C2)
//! - [`sync_store`]: in-memory session/presence/playback state (C3)
//! - [`ws`]: WebSocket hub - connection routing, broadcast/unicast (C4)
//! - [`streaming`]: byte-range media serving, transcode fallback (C5)
//! - [`deovr_heartbeat`]: Range-request-driven play/pause inference (C6)
//! - [`vr`]: DeoVR and HereSphere JSON adapters (C7)
//! - [`api`]: HTTP surface and application state (C8)
//! - [`bootstrap`]: composition root (C9)
//! - [`config`]: layered configuration (C9)
//! - [`error`]: centralized error types (C10)
//! - [`tls`]: optional HTTPS bootstrap (C11)

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod catalog;
pub mod config;
pub mod deovr_heartbeat;
pub mod error;
pub mod scanner;
pub mod streaming;
pub mod sync_store;
pub mod tls;
pub mod util;
pub mod vr;
pub mod ws;

pub use api::{start_server, AppState};
pub use bootstrap::{bootstrap_services, BootstrappedServices};
pub use catalog::{MediaCatalog, MediaItem, MediaType};
pub use config::Config;
pub use error::{ErrorCode, MediaViewerError, MediaViewerResult};
pub use sync_store::{SessionState, SyncStore};
pub use ws::{ConnectionGuard, WsConnectionManager};
