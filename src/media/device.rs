//! Participant media device
//!
//! Holds the codecs this participant can handle and, once loaded, the
//! intersection with the router's capabilities. Transports are built from a
//! loaded device.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

use super::transport::LocalTransport;
use crate::error::{AppError, Result};
use crate::events::EventBus;
use crate::registry::TransportDirection;
use crate::signaling::{
    default_media_codecs, MediaKind, RtpCapabilities, RtpCodecCapability, TransportOptions,
};

pub struct Device {
    supported: Vec<RtpCodecCapability>,
    loaded: RwLock<Option<RtpCapabilities>>,
}

impl Device {
    pub fn new(supported: Vec<RtpCodecCapability>) -> Self {
        Self {
            supported,
            loaded: RwLock::new(None),
        }
    }

    /// Negotiate against the router's capabilities
    ///
    /// Keeps the router's codec entries (with its payload types) for every
    /// codec this device also supports.
    pub fn load(&self, router: &RtpCapabilities) -> Result<()> {
        let codecs: Vec<RtpCodecCapability> = router
            .codecs
            .iter()
            .filter(|rc| self.supported.iter().any(|c| c.matches(&rc.mime_type, rc.clock_rate)))
            .cloned()
            .collect();

        if codecs.is_empty() {
            return Err(AppError::CapabilityLoadFailed(
                "no codec in common with the router".to_string(),
            ));
        }

        debug!("Device loaded with {} codecs", codecs.len());
        *self.loaded.write() = Some(RtpCapabilities {
            codecs,
            header_extensions: router.header_extensions.clone(),
        });
        Ok(())
    }

    pub fn unload(&self) {
        *self.loaded.write() = None;
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.read().is_some()
    }

    /// Negotiated capabilities, if loaded
    pub fn rtp_capabilities(&self) -> Option<RtpCapabilities> {
        self.loaded.read().clone()
    }

    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.has_codec(kind)
    }

    /// Whether a remote producer of this kind can be received
    pub fn can_receive(&self, kind: MediaKind) -> bool {
        self.has_codec(kind)
    }

    fn has_codec(&self, kind: MediaKind) -> bool {
        self.loaded
            .read()
            .as_ref()
            .map(|caps| caps.codec_for(kind).is_some())
            .unwrap_or(false)
    }

    /// Whether this device can receive anything at all
    pub fn can_consume(&self) -> bool {
        self.loaded
            .read()
            .as_ref()
            .map(|caps| !caps.codecs.is_empty())
            .unwrap_or(false)
    }

    pub fn create_send_transport(&self, options: TransportOptions, bus: Arc<EventBus>) -> Result<LocalTransport> {
        self.create_transport(options, TransportDirection::Send, bus)
    }

    pub fn create_recv_transport(&self, options: TransportOptions, bus: Arc<EventBus>) -> Result<LocalTransport> {
        self.create_transport(options, TransportDirection::Receive, bus)
    }

    fn create_transport(
        &self,
        options: TransportOptions,
        direction: TransportDirection,
        bus: Arc<EventBus>,
    ) -> Result<LocalTransport> {
        let caps = self
            .rtp_capabilities()
            .ok_or_else(|| AppError::InvalidState("device not loaded".to_string()))?;
        Ok(LocalTransport::new(options, direction, caps, bus))
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new(default_media_codecs())
    }
}
