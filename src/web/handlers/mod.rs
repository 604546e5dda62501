use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::server::RoomInfo;
use crate::state::AppState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let status = if state.engine.is_alive() {
        "ok"
    } else {
        "engine_down"
    };
    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Room listing response
#[derive(Serialize)]
pub struct RoomsResponse {
    pub rooms: Vec<RoomInfo>,
}

pub async fn list_rooms(State(state): State<Arc<AppState>>) -> Json<RoomsResponse> {
    Json(RoomsResponse {
        rooms: state.rooms.list(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ConfigStore};
    use crate::engine::{LoopbackEngine, MediaEngine};
    use crate::server::RoomManager;
    use tokio::sync::{broadcast, mpsc};

    fn state() -> (Arc<AppState>, Arc<LoopbackEngine>) {
        let engine = Arc::new(LoopbackEngine::new(Default::default()));
        let dyn_engine: Arc<dyn MediaEngine> = engine.clone();
        let (shutdown_tx, _) = broadcast::channel(1);
        let state = AppState::new(
            ConfigStore::from_config(AppConfig::default()).unwrap(),
            Arc::new(RoomManager::new(dyn_engine.clone())),
            dyn_engine,
            shutdown_tx,
        );
        (state, engine)
    }

    #[tokio::test]
    async fn test_health_reflects_engine() {
        let (state, engine) = state();
        assert_eq!(health_check(State(state.clone())).await.0.status, "ok");
        engine.terminate();
        assert_eq!(health_check(State(state)).await.0.status, "engine_down");
    }

    #[tokio::test]
    async fn test_list_rooms() {
        let (state, _engine) = state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let _b = state.rooms.join("b", tx.clone());
        let _a1 = state.rooms.join("a", tx.clone());
        let _a2 = state.rooms.join("a", tx);

        let rooms = list_rooms(State(state)).await.0.rooms;
        assert_eq!(rooms.len(), 2);
        assert_eq!(rooms[0].name, "a");
        assert_eq!(rooms[0].peers, 2);
        assert_eq!(rooms[1].peers, 1);
    }
}
