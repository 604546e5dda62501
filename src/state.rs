use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::ConfigStore;
use crate::engine::MediaEngine;
use crate::server::RoomManager;

/// Application-wide state shared across handlers
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Rooms and their connections
    pub rooms: Arc<RoomManager>,
    /// Media engine shared by every room
    pub engine: Arc<dyn MediaEngine>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: ConfigStore,
        rooms: Arc<RoomManager>,
        engine: Arc<dyn MediaEngine>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            rooms,
            engine,
            shutdown_tx,
        })
    }

    /// WebSocket ping interval
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.config.get().server.heartbeat_secs.max(1))
    }

    /// Subscribe to the shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}
