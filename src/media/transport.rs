//! Participant-side transport
//!
//! A `LocalTransport` never talks to the network itself. When it needs the
//! server's cooperation (DTLS authorization on first use, a producer id for a
//! new track) it publishes an event carrying a [`Completion`] on the session's
//! [`EventBus`] and waits for whoever handles it to settle the completion.

use parking_lot::RwLock;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::track::{LocalConsumer, LocalProducer, MediaTrack};
use crate::error::{AppError, Result};
use crate::events::{Completion, EventBus, SessionEvent};
use crate::registry::{TransportDirection, TransportState};
use crate::signaling::{
    ConsumerOptions, DtlsFingerprint, DtlsParameters, DtlsRole, RtpCapabilities,
    RtpCodecParameters, RtpParameters, TransportOptions,
};

pub struct LocalTransport {
    id: String,
    direction: TransportDirection,
    remote: TransportOptions,
    capabilities: RtpCapabilities,
    dtls_parameters: DtlsParameters,
    state: RwLock<TransportState>,
    bus: Arc<EventBus>,
    /// Serializes the connect negotiation so it runs once
    connect_lock: tokio::sync::Mutex<()>,
}

impl LocalTransport {
    pub(crate) fn new(
        remote: TransportOptions,
        direction: TransportDirection,
        capabilities: RtpCapabilities,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            id: remote.id.clone(),
            direction,
            remote,
            capabilities,
            dtls_parameters: DtlsParameters {
                role: Some(DtlsRole::Client),
                fingerprints: vec![DtlsFingerprint::generate()],
            },
            state: RwLock::new(TransportState::New),
            bus,
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> TransportDirection {
        self.direction
    }

    pub fn state(&self) -> TransportState {
        *self.state.read()
    }

    /// Server-side parameters this transport was built from
    pub fn remote_options(&self) -> &TransportOptions {
        &self.remote
    }

    pub fn dtls_parameters(&self) -> &DtlsParameters {
        &self.dtls_parameters
    }

    /// Run the connect negotiation unless already connected
    ///
    /// Concurrent callers wait for the first negotiation and share its
    /// outcome. A failed negotiation leaves the transport `New` so the next
    /// call tries again.
    pub async fn ensure_connected(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;

        match self.state() {
            TransportState::Connected => return Ok(()),
            TransportState::Closed => {
                return Err(AppError::InvalidState(format!("transport {} is closed", self.id)))
            }
            _ => {}
        }
        *self.state.write() = TransportState::Connecting;

        let (completion, pending) = Completion::new();
        let handled = self.bus.emit(SessionEvent::ConnectTransport {
            transport_id: self.id.clone(),
            direction: self.direction,
            dtls_parameters: self.dtls_parameters.clone(),
            completion: completion.clone(),
        });
        if handled == 0 {
            completion.reject(AppError::NotReady(format!(
                "nobody handles connect for transport {}",
                self.id
            )));
        }
        drop(completion);

        match pending.wait().await {
            Ok(()) => {
                let mut state = self.state.write();
                if *state == TransportState::Closed {
                    return Err(AppError::InvalidState(format!("transport {} is closed", self.id)));
                }
                *state = TransportState::Connected;
                info!("{} transport {} connected", self.direction, self.id);
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.write();
                if *state == TransportState::Connecting {
                    *state = TransportState::New;
                }
                warn!("Connecting transport {} failed: {}", self.id, e);
                Err(e)
            }
        }
    }

    /// Send a track: connect if needed, then negotiate a server-side producer
    pub async fn produce(&self, track: &MediaTrack) -> Result<LocalProducer> {
        if self.direction != TransportDirection::Send {
            return Err(AppError::InvalidState(format!(
                "transport {} cannot produce",
                self.id
            )));
        }

        let rtp_parameters = self.rtp_parameters_for(track)?;
        self.ensure_connected().await?;

        let (completion, pending) = Completion::new();
        let handled = self.bus.emit(SessionEvent::Produce {
            transport_id: self.id.clone(),
            kind: track.kind,
            rtp_parameters: rtp_parameters.clone(),
            completion: completion.clone(),
        });
        if handled == 0 {
            completion.reject(AppError::NotReady(format!(
                "nobody handles produce for transport {}",
                self.id
            )));
        }
        drop(completion);

        let id = pending.wait().await?;
        if self.state() == TransportState::Closed {
            return Err(AppError::InvalidState(format!("transport {} is closed", self.id)));
        }

        debug!("Producing {} track {} as {}", track.kind, track.id, id);
        Ok(LocalProducer {
            id,
            track_id: track.id.clone(),
            transport_id: self.id.clone(),
            kind: track.kind,
            rtp_parameters,
        })
    }

    /// Build a local consumer from the server's consume answer
    ///
    /// The transport must already be connected. The consumer starts in the
    /// pause state the server reported.
    pub fn consume(&self, options: ConsumerOptions) -> Result<LocalConsumer> {
        if self.direction != TransportDirection::Receive {
            return Err(AppError::InvalidState(format!(
                "transport {} cannot consume",
                self.id
            )));
        }
        if self.state() != TransportState::Connected {
            return Err(AppError::InvalidState(format!(
                "transport {} is {}",
                self.id,
                self.state()
            )));
        }

        let codec = options
            .rtp_parameters
            .primary_codec()
            .ok_or_else(|| AppError::IncompatibleCapabilities("consumer carries no codec".to_string()))?;
        if !self.capabilities.supports(&codec.mime_type, codec.clock_rate) {
            return Err(AppError::IncompatibleCapabilities(format!(
                "codec {} not supported locally",
                codec.mime_type
            )));
        }

        Ok(LocalConsumer {
            id: options.id,
            producer_id: options.producer_id,
            transport_id: self.id.clone(),
            kind: options.kind,
            rtp_parameters: options.rtp_parameters,
            paused: options.paused,
        })
    }

    pub fn close(&self) {
        let mut state = self.state.write();
        if *state != TransportState::Closed {
            *state = TransportState::Closed;
            debug!("Closed local {} transport {}", self.direction, self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == TransportState::Closed
    }

    fn rtp_parameters_for(&self, track: &MediaTrack) -> Result<RtpParameters> {
        let codec = self.capabilities.codec_for(track.kind).ok_or_else(|| {
            AppError::IncompatibleCapabilities(format!("no negotiated {} codec", track.kind))
        })?;
        let payload_type = codec.preferred_payload_type.ok_or_else(|| {
            AppError::IncompatibleCapabilities(format!("{} has no payload type", codec.mime_type))
        })?;
        let ssrc: u32 = rand::thread_rng().gen();

        Ok(RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type,
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: codec.parameters.clone(),
            }],
            encodings: vec![json!({ "ssrc": ssrc })],
        })
    }
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}
