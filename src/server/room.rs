//! Rooms and the room manager
//!
//! A room groups the connections that see each other's producers. It owns
//! the shared [`ResourceRegistry`] and the outbound sender of every peer.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::ServerSession;
use crate::engine::MediaEngine;
use crate::registry::{ClosedResources, ConnectionId, RegistryStats, ResourceRegistry};
use crate::signaling::{Envelope, NotificationKind, ProducerNotification};

/// Room joined when the WebSocket path names none
pub const DEFAULT_ROOM: &str = "default";

pub struct Room {
    name: String,
    engine: Arc<dyn MediaEngine>,
    registry: Mutex<ResourceRegistry>,
    peers: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<String>>>,
}

impl Room {
    pub fn new(name: impl Into<String>, engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            name: name.into(),
            engine,
            registry: Mutex::new(ResourceRegistry::new()),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    /// Run `f` with the registry locked
    ///
    /// The closure is synchronous, so the lock can never be held across an
    /// engine call or a broadcast.
    pub fn with_registry<R>(&self, f: impl FnOnce(&mut ResourceRegistry) -> R) -> R {
        f(&mut self.registry.lock())
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.lock().stats()
    }

    pub fn add_peer(&self, connection_id: &str, outbound: mpsc::UnboundedSender<String>) {
        self.peers.write().insert(connection_id.to_string(), outbound);
        debug!("Peer {} joined room {}", connection_id, self.name);
    }

    pub fn remove_peer(&self, connection_id: &str) -> bool {
        self.peers.write().remove(connection_id).is_some()
    }

    pub fn peer_ids(&self) -> Vec<ConnectionId> {
        self.peers.read().keys().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Send a notification to every peer except `from`
    ///
    /// Returns the number of peers it was delivered to.
    pub fn broadcast(&self, from: &str, envelope: &Envelope) -> usize {
        let text = match envelope.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode broadcast: {}", e);
                return 0;
            }
        };

        let targets: Vec<mpsc::UnboundedSender<String>> = self
            .peers
            .read()
            .iter()
            .filter(|(id, _)| id.as_str() != from)
            .map(|(_, tx)| tx.clone())
            .collect();

        targets
            .iter()
            .filter(|tx| tx.send(text.clone()).is_ok())
            .count()
    }

    pub fn announce_producer_closed(&self, from: &str, producer_id: &str) {
        let payload = ProducerNotification {
            producer_id: producer_id.to_string(),
            kind: None,
        };
        match serde_json::to_value(&payload) {
            Ok(data) => {
                self.broadcast(from, &Envelope::notification(NotificationKind::ProducerClosed, data));
            }
            Err(e) => warn!("Failed to encode producerClosed: {}", e),
        }
    }

    /// Tear down everything a connection owns
    ///
    /// The registry cascade runs under the lock in one step; the peer is then
    /// removed, other peers learn about the closed producers, and finally the
    /// engine releases the resources. Safe to call more than once.
    pub async fn close_connection(&self, connection_id: &str) -> ClosedResources {
        let closed = self.with_registry(|registry| registry.close_cascade(connection_id));
        self.remove_peer(connection_id);

        for producer in &closed.producers {
            self.announce_producer_closed(connection_id, &producer.id);
        }
        for producer in &closed.producers {
            self.engine.close_producer(&producer.id).await;
        }
        for transport in &closed.transports {
            self.engine.close_transport(&transport.id).await;
        }

        if !closed.is_empty() {
            info!(
                "Connection {} left room {}: closed {} transports, {} producers, {} consumers",
                connection_id,
                self.name,
                closed.transports.len(),
                closed.producers.len(),
                closed.consumers.len()
            );
        }
        closed
    }
}

/// Room overview returned by the HTTP API
#[derive(Debug, Clone, Serialize)]
pub struct RoomInfo {
    pub name: String,
    pub peers: usize,
    pub stats: RegistryStats,
}

/// Rooms by name
///
/// Rooms are created on first join and dropped when their last peer leaves.
pub struct RoomManager {
    engine: Arc<dyn MediaEngine>,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    shutdown: CancellationToken,
}

impl RoomManager {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            engine,
            rooms: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    /// Join a connection to a room, creating the room on first use
    ///
    /// The peer is added while the room map is locked, so a concurrent
    /// [`release`](Self::release) either sees the new peer or removed the
    /// room before it was looked up.
    pub fn join(&self, name: &str, outbound: mpsc::UnboundedSender<String>) -> ServerSession {
        let mut rooms = self.rooms.lock();
        let room = rooms
            .entry(name.to_string())
            .or_insert_with(|| {
                info!("Creating room {}", name);
                Arc::new(Room::new(name, self.engine.clone()))
            })
            .clone();
        ServerSession::join(room, outbound)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.lock().get(name).cloned()
    }

    /// Drop the room if nobody is left in it
    pub fn release(&self, name: &str) -> bool {
        let mut rooms = self.rooms.lock();
        match rooms.get(name) {
            Some(room) if room.is_empty() => {
                rooms.remove(name);
                info!("Removed empty room {}", name);
                true
            }
            _ => false,
        }
    }

    pub fn list(&self) -> Vec<RoomInfo> {
        let mut list: Vec<RoomInfo> = self
            .rooms
            .lock()
            .values()
            .map(|room| RoomInfo {
                name: room.name().to_string(),
                peers: room.peer_count(),
                stats: room.stats(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Token cancelled by [`close_all`](Self::close_all); connection tasks
    /// should watch a child of it
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Close every connection in every room and stop their tasks
    pub async fn close_all(&self) {
        let rooms: Vec<Arc<Room>> = self.rooms.lock().drain().map(|(_, room)| room).collect();
        let mut connections = 0;
        for room in rooms {
            for connection_id in room.peer_ids() {
                room.close_connection(&connection_id).await;
                connections += 1;
            }
        }
        self.shutdown.cancel();
        info!("Closed {} connections", connections);
    }
}
