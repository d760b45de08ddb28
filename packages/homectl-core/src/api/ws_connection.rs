//! WebSocket connection table.
//!
//! Every live event stream registers here and holds a [`ConnectionGuard`]
//! that removes it again on drop. Server shutdown closes all of them through
//! a shared cancellation token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::utils::now_millis;

/// What the table knows about one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    /// Unix timestamp in milliseconds.
    pub connected_at: u64,
    /// Commands invoked over this connection so far.
    pub commands: u64,
}

/// Tracks active WebSocket connections.
pub struct WsConnectionManager {
    connections: DashMap<u64, ConnectionInfo>,
    next_id: AtomicU64,
    /// Parent of every connection's token. Replaced after `close_all` so
    /// new connections can still be accepted.
    global_cancel: RwLock<CancellationToken>,
}

impl WsConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            global_cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Registers a new connection; dropping the guard unregisters it.
    pub fn register(self: &Arc<Self>) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel_token = self.global_cancel.read().child_token();

        self.connections.insert(
            id,
            ConnectionInfo {
                connected_at: now_millis(),
                commands: 0,
            },
        );
        log::info!(
            "[WS] Connection registered: ws-{} (total: {})",
            id,
            self.connections.len()
        );

        ConnectionGuard {
            id,
            manager: Arc::clone(self),
            cancel_token,
        }
    }

    fn unregister(&self, id: u64) {
        if self.connections.remove(&id).is_some() {
            log::info!(
                "[WS] Connection unregistered: ws-{} (remaining: {})",
                id,
                self.connections.len()
            );
        }
    }

    fn record_command(&self, id: u64) {
        if let Some(mut info) = self.connections.get_mut(&id) {
            info.commands += 1;
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn info(&self, id: u64) -> Option<ConnectionInfo> {
        self.connections.get(&id).map(|info| *info)
    }

    /// Signals every open connection to close. Returns how many were open.
    pub fn close_all(&self) -> usize {
        let count = self.connections.len();
        if count > 0 {
            log::info!("[WS] Force-closing {} connection(s)", count);
        }
        let mut token = self.global_cancel.write();
        token.cancel();
        *token = CancellationToken::new();
        count
    }
}

impl Default for WsConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Unregisters its connection when dropped.
pub struct ConnectionGuard {
    id: u64,
    manager: Arc<WsConnectionManager>,
    cancel_token: CancellationToken,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancelled when the server force-closes connections.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn record_command(&self) {
        self.manager.record_command(self.id);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_unregister_on_drop() {
        let manager = Arc::new(WsConnectionManager::new());
        let a = manager.register();
        let b = manager.register();
        assert_ne!(a.id(), b.id());
        assert_eq!(manager.connection_count(), 2);

        drop(a);
        assert_eq!(manager.connection_count(), 1);
        drop(b);
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn close_all_cancels_existing_connections_only() {
        let manager = Arc::new(WsConnectionManager::new());
        let old = manager.register();
        assert_eq!(manager.close_all(), 1);
        assert!(old.cancel_token().is_cancelled());

        let new = manager.register();
        assert!(!new.cancel_token().is_cancelled());
    }

    #[test]
    fn commands_are_counted_per_connection() {
        let manager = Arc::new(WsConnectionManager::new());
        let guard = manager.register();
        guard.record_command();
        guard.record_command();
        assert_eq!(manager.info(guard.id()).unwrap().commands, 2);
        assert!(manager.info(guard.id() + 100).is_none());
    }
}
