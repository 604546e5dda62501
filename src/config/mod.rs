//! Configuration schema and store

pub mod schema;
pub mod store;

pub use schema::{AppConfig, MAX_MEDIA_CODECS, ChannelConfig, ClientConfig, EngineConfig, ListenIp, ServerConfig};
pub use store::ConfigStore;
