//! WebSocket connection tracking and direct-send routing.
//!
//! Two responsibilities live here, mirroring the hub's two delivery modes:
//! - A force-close mechanism for graceful shutdown (`close_all`).
//! - A direct per-connection sender registry, used for targeted unicast
//!   (`toClientId`) delivery without going through the broadcast channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Opaque per-connection identifier. Re-exported from the sync store so
/// the hub's two delivery-side maps (senders here, client->sockets there)
/// share one definition of "which socket is this".
pub use crate::sync_store::SocketHandle;

/// Manages all active WebSocket connections: force-close and direct send.
pub struct WsConnectionManager {
    senders: DashMap<SocketHandle, mpsc::UnboundedSender<Message>>,
    next_id: AtomicU64,
    global_cancel: RwLock<CancellationToken>,
}

impl WsConnectionManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            senders: DashMap::new(),
            next_id: AtomicU64::new(1),
            global_cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Registers a new connection, returning its handle, the receiver end
    /// of its direct-send channel, and an RAII guard that unregisters it
    /// on drop.
    pub fn register(self: &Arc<Self>) -> (SocketHandle, mpsc::UnboundedReceiver<Message>, ConnectionGuard) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(id, tx);
        let cancel_token = self.global_cancel.read().child_token();
        log::debug!("[ws] connection registered: {id} (total: {})", self.senders.len());

        (
            id,
            rx,
            ConnectionGuard {
                id,
                manager: Arc::clone(self),
                cancel_token,
            },
        )
    }

    fn unregister(&self, id: SocketHandle) {
        if self.senders.remove(&id).is_some() {
            log::debug!("[ws] connection unregistered: {id} (remaining: {})", self.senders.len());
        }
    }

    /// Sends a message directly to one connection's outbound channel.
    /// Returns `false` if the connection no longer exists or its channel
    /// is closed — callers treat this as "socket write failure, only that
    /// socket dies", never a reason to abort the rest of a broadcast.
    pub fn send_to(&self, handle: SocketHandle, message: Message) -> bool {
        match self.senders.get(&handle) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.senders.len()
    }

    /// Force-closes all connections for graceful shutdown. Cancels the
    /// current token (signaling every handler loop to exit) and installs
    /// a fresh one so new connections can still be accepted afterward.
    pub fn close_all(&self) -> usize {
        let count = self.senders.len();
        if count > 0 {
            log::info!("[ws] force-closing {count} connection(s)");
            let mut guard = self.global_cancel.write();
            guard.cancel();
            *guard = CancellationToken::new();
        }
        count
    }
}

impl Default for WsConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that unregisters a connection when dropped, and exposes the
/// connection's cancellation token for use in its `tokio::select!` loop.
pub struct ConnectionGuard {
    id: SocketHandle,
    manager: Arc<WsConnectionManager>,
    cancel_token: CancellationToken,
}

impl ConnectionGuard {
    #[must_use]
    pub fn id(&self) -> SocketHandle {
        self.id
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.unregister(self.id);
    }
}
