//! mediaroom - WebRTC session control plane
//!
//! Signaling, resource bookkeeping and negotiation for a selective
//! forwarding unit. The server half brokers a media engine for every
//! connection in a room; the participant half drives the
//! capabilities → transport → produce/consume sequence over a
//! correlated request channel.

pub mod channel;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod media;
pub mod registry;
pub mod server;
pub mod signaling;
pub mod state;
pub mod utils;
pub mod web;

pub use error::{AppError, Result};
