use axum::{
    routing::{any, get},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::ws::{ws_handler, ws_room_handler};
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/rooms", get(handlers::list_rooms));

    Router::new()
        // Signaling endpoints
        .route("/ws", any(ws_handler))
        .route("/ws/:room", any(ws_room_handler))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::WebSocketConnector;
    use crate::client::{ClientSession, ClientState};
    use crate::config::{AppConfig, ChannelConfig, ConfigStore};
    use crate::engine::{LoopbackEngine, MediaEngine};
    use crate::media::{Device, MediaTrack};
    use crate::server::RoomManager;
    use crate::signaling::MediaKind;
    use std::time::Duration;
    use tokio_test::assert_ok;
    use tokio::sync::broadcast;

    async fn spawn_server() -> (Arc<AppState>, Arc<LoopbackEngine>, String) {
        let engine = Arc::new(LoopbackEngine::new(Default::default()));
        let dyn_engine: Arc<dyn MediaEngine> = engine.clone();
        let (shutdown_tx, _) = broadcast::channel(1);
        let state = AppState::new(
            ConfigStore::from_config(AppConfig::default()).unwrap(),
            Arc::new(RoomManager::new(dyn_engine.clone())),
            dyn_engine,
            shutdown_tx,
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (state, engine, format!("ws://{}", addr))
    }

    #[tokio::test]
    async fn test_participant_over_websocket() {
        let (state, engine, base) = spawn_server().await;
        let connector = Arc::new(WebSocketConnector::new(format!("{}/ws/lobby", base)));
        let client = ClientSession::connect(ChannelConfig::default(), connector, Device::default())
            .await
            .unwrap();

        assert_ok!(client.load_capabilities().await);
        assert_ok!(client.create_send_transport().await);
        let producer = assert_ok!(client.produce(MediaTrack::video("cam")).await);
        assert_eq!(producer.kind, MediaKind::Video);
        assert_eq!(client.state(), ClientState::Producing);
        assert_eq!(engine.producer_count(), 1);

        let rooms = state.rooms.list();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].name, "lobby");
        assert_eq!(rooms[0].peers, 1);

        // Closing the socket releases the connection and its room
        client.close();
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.transport_count() > 0 || state.rooms.get("lobby").is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection was not released");
    }
}
