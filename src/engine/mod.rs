//! Media engine boundary
//!
//! The engine owns the actual media plane (ICE/DTLS/RTP). The control plane
//! only needs the operations below; everything behind them is a black box.

pub mod loopback;
#[cfg(test)]
pub(crate) mod testing;

pub use loopback::LoopbackEngine;

use async_trait::async_trait;

use crate::error::Result;
use crate::registry::TransportDirection;
use crate::signaling::{
    ConsumerOptions, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportOptions,
};

/// Operations the session controller delegates to the media engine
///
/// Implementations report rejected operations as
/// [`AppError::EngineFailure`](crate::error::AppError::EngineFailure) and a
/// dead engine as
/// [`AppError::EngineUnavailable`](crate::error::AppError::EngineUnavailable).
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// RTP capabilities of the router
    fn router_capabilities(&self) -> RtpCapabilities;

    async fn create_transport(&self, direction: TransportDirection) -> Result<TransportOptions>;

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: &DtlsParameters) -> Result<()>;

    /// Create a producer, returning its id
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<String>;

    /// Whether a consumer with these capabilities can receive the producer
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool;

    /// Create a paused consumer
    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerOptions>;

    async fn resume_consumer(&self, consumer_id: &str) -> Result<()>;

    /// Close a consumer. Unknown ids are ignored.
    async fn close_consumer(&self, consumer_id: &str);

    /// Close a transport and everything created on it. Unknown ids are ignored.
    async fn close_transport(&self, transport_id: &str);

    /// Close a producer. Unknown ids are ignored.
    async fn close_producer(&self, producer_id: &str);

    /// Whether the engine is still running
    fn is_alive(&self) -> bool;

    /// Resolves once the engine has died
    async fn closed(&self);
}
