//! In-process media engine
//!
//! Keeps the same object graph a real SFU worker would (router, transports,
//! producers, consumers) and validates every operation against it, without
//! moving any media. Used as the server's default engine and in tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::distributions::{Alphanumeric, DistString};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::MediaEngine;
use crate::config::{EngineConfig, MAX_MEDIA_CODECS};
use crate::error::{AppError, Result};
use crate::registry::TransportDirection;
use crate::signaling::{
    ConsumerOptions, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters,
    MediaKind, RtpCapabilities, RtpCodecParameters, RtpParameters, TransportOptions,
};

/// First dynamic RTP payload type handed out to router codecs
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

struct EngineTransport {
    direction: TransportDirection,
    connected: bool,
}

struct EngineProducer {
    transport_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

struct EngineConsumer {
    transport_id: String,
    producer_id: String,
    paused: bool,
}

#[derive(Default)]
struct EngineState {
    transports: HashMap<String, EngineTransport>,
    producers: HashMap<String, EngineProducer>,
    consumers: HashMap<String, EngineConsumer>,
    next_mid: u32,
}

impl EngineState {
    fn drop_consumers(&mut self, pred: impl Fn(&EngineConsumer) -> bool) {
        self.consumers.retain(|_, c| !pred(c));
    }
}

pub struct LoopbackEngine {
    config: EngineConfig,
    capabilities: RtpCapabilities,
    state: Mutex<EngineState>,
    port_cursor: AtomicU32,
    alive: watch::Sender<bool>,
}

impl LoopbackEngine {
    pub fn new(config: EngineConfig) -> Self {
        if config.media_codecs.len() > MAX_MEDIA_CODECS {
            warn!(
                "Ignoring {} codecs beyond the first {}",
                config.media_codecs.len() - MAX_MEDIA_CODECS,
                MAX_MEDIA_CODECS
            );
        }
        let mut codecs: Vec<_> = config.media_codecs.iter().take(MAX_MEDIA_CODECS).cloned().collect();
        for (payload_type, codec) in (FIRST_DYNAMIC_PAYLOAD_TYPE..).zip(codecs.iter_mut()) {
            if codec.preferred_payload_type.is_none() {
                codec.preferred_payload_type = Some(payload_type);
            }
        }
        let (alive, _) = watch::channel(true);

        info!(
            "Media engine ready: {} codecs, ports {}-{}, initial outgoing bitrate {} bps",
            codecs.len(),
            config.rtc_min_port,
            config.rtc_max_port,
            config.initial_available_outgoing_bitrate
        );

        Self {
            capabilities: RtpCapabilities {
                codecs,
                header_extensions: vec![],
            },
            config,
            state: Mutex::new(EngineState::default()),
            port_cursor: AtomicU32::new(0),
            alive,
        }
    }

    /// Simulate the worker process dying
    pub fn terminate(&self) {
        if self.alive.send_replace(false) {
            error!("Media engine terminated");
        }
    }

    pub fn transport_count(&self) -> usize {
        self.state.lock().transports.len()
    }

    pub fn producer_count(&self) -> usize {
        self.state.lock().producers.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    pub fn is_consumer_paused(&self, consumer_id: &str) -> Option<bool> {
        self.state.lock().consumers.get(consumer_id).map(|c| c.paused)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(AppError::EngineUnavailable)
        }
    }

    fn next_port(&self) -> u16 {
        let span = u32::from(self.config.rtc_max_port - self.config.rtc_min_port) + 1;
        let offset = self.port_cursor.fetch_add(1, Ordering::Relaxed) % span;
        self.config.rtc_min_port + offset as u16
    }

    fn ice_candidates(&self, port: u16) -> Vec<IceCandidate> {
        let mut candidates = Vec::new();
        for listen in &self.config.listen_ips {
            let ip = listen.announced_ip.clone().unwrap_or_else(|| listen.ip.clone());
            candidates.push(IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                ip: ip.clone(),
                protocol: "udp".to_string(),
                port,
                candidate_type: "host".to_string(),
            });
            candidates.push(IceCandidate {
                foundation: "tcpcandidate".to_string(),
                priority: 1_076_276_479,
                ip,
                protocol: "tcp".to_string(),
                port,
                candidate_type: "host".to_string(),
            });
        }
        candidates
    }

    fn producer_supported(&self, producer: &EngineProducer, caps: &RtpCapabilities) -> bool {
        producer
            .rtp_parameters
            .primary_codec()
            .map(|codec| caps.supports(&codec.mime_type, codec.clock_rate))
            .unwrap_or(false)
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    fn router_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_transport(&self, direction: TransportDirection) -> Result<TransportOptions> {
        self.ensure_alive()?;

        let id = uuid::Uuid::new_v4().to_string();
        let port = self.next_port();
        let options = TransportOptions {
            id: id.clone(),
            ice_parameters: IceParameters {
                username_fragment: Alphanumeric.sample_string(&mut rand::thread_rng(), 16),
                password: Alphanumeric.sample_string(&mut rand::thread_rng(), 32),
                ice_lite: Some(true),
            },
            ice_candidates: self.ice_candidates(port),
            dtls_parameters: DtlsParameters {
                role: Some(DtlsRole::Auto),
                fingerprints: vec![DtlsFingerprint::generate()],
            },
        };

        self.state.lock().transports.insert(
            id.clone(),
            EngineTransport {
                direction,
                connected: false,
            },
        );
        debug!(
            "Engine created {} transport {} on port {} ({} bps available)",
            direction, id, port, self.config.initial_available_outgoing_bitrate
        );
        Ok(options)
    }

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: &DtlsParameters) -> Result<()> {
        self.ensure_alive()?;
        if dtls_parameters.fingerprints.is_empty() {
            return Err(AppError::EngineFailure(
                "DTLS parameters carry no fingerprint".to_string(),
            ));
        }

        let mut state = self.state.lock();
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| AppError::EngineFailure(format!("unknown transport {}", transport_id)))?;
        if transport.connected {
            return Err(AppError::EngineFailure(format!(
                "transport {} already connected",
                transport_id
            )));
        }
        transport.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<String> {
        self.ensure_alive()?;

        let codec = rtp_parameters
            .primary_codec()
            .ok_or_else(|| AppError::EngineFailure("RTP parameters carry no codec".to_string()))?;
        if !self.capabilities.supports(&codec.mime_type, codec.clock_rate) {
            return Err(AppError::EngineFailure(format!(
                "codec {} not supported by router",
                codec.mime_type
            )));
        }

        let mut state = self.state.lock();
        match state.transports.get(transport_id) {
            Some(t) if t.direction == TransportDirection::Send => {}
            Some(_) => {
                return Err(AppError::EngineFailure(format!(
                    "transport {} cannot produce",
                    transport_id
                )))
            }
            None => {
                return Err(AppError::EngineFailure(format!(
                    "unknown transport {}",
                    transport_id
                )))
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        state.producers.insert(
            id.clone(),
            EngineProducer {
                transport_id: transport_id.to_string(),
                kind,
                rtp_parameters: rtp_parameters.clone(),
            },
        );
        Ok(id)
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        let state = self.state.lock();
        state
            .producers
            .get(producer_id)
            .map(|p| self.producer_supported(p, rtp_capabilities))
            .unwrap_or(false)
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerOptions> {
        self.ensure_alive()?;

        let mut state = self.state.lock();
        match state.transports.get(transport_id) {
            Some(t) if t.direction == TransportDirection::Receive => {}
            _ => {
                return Err(AppError::EngineFailure(format!(
                    "transport {} cannot consume",
                    transport_id
                )))
            }
        }
        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| AppError::EngineFailure(format!("unknown producer {}", producer_id)))?;
        if !self.producer_supported(producer, rtp_capabilities) {
            return Err(AppError::EngineFailure(format!(
                "cannot consume producer {}",
                producer_id
            )));
        }

        let codecs = producer
            .rtp_parameters
            .codecs
            .iter()
            .filter_map(|codec| {
                let router_codec = self
                    .capabilities
                    .codecs
                    .iter()
                    .find(|c| c.matches(&codec.mime_type, codec.clock_rate))?;
                Some(RtpCodecParameters {
                    mime_type: router_codec.mime_type.clone(),
                    payload_type: router_codec
                        .preferred_payload_type
                        .unwrap_or(FIRST_DYNAMIC_PAYLOAD_TYPE),
                    clock_rate: router_codec.clock_rate,
                    channels: router_codec.channels,
                    parameters: router_codec.parameters.clone(),
                })
            })
            .collect();
        let kind = producer.kind;

        let id = uuid::Uuid::new_v4().to_string();
        let mid = state.next_mid.to_string();
        state.next_mid += 1;
        state.consumers.insert(
            id.clone(),
            EngineConsumer {
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
                paused: true,
            },
        );

        Ok(ConsumerOptions {
            id,
            producer_id: producer_id.to_string(),
            kind,
            rtp_parameters: RtpParameters {
                mid: Some(mid),
                codecs,
                encodings: vec![],
            },
            paused: true,
        })
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<()> {
        self.ensure_alive()?;
        let mut state = self.state.lock();
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| AppError::EngineFailure(format!("unknown consumer {}", consumer_id)))?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &str) {
        if self.state.lock().consumers.remove(consumer_id).is_some() {
            debug!("Engine closed consumer {}", consumer_id);
        }
    }

    async fn close_transport(&self, transport_id: &str) {
        let mut state = self.state.lock();
        if state.transports.remove(transport_id).is_none() {
            return;
        }
        let orphaned: Vec<String> = state
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in &orphaned {
            state.producers.remove(producer_id);
        }
        state.drop_consumers(|c| c.transport_id == transport_id || orphaned.contains(&c.producer_id));
        debug!("Engine closed transport {}", transport_id);
    }

    async fn close_producer(&self, producer_id: &str) {
        let mut state = self.state.lock();
        if state.producers.remove(producer_id).is_some() {
            state.drop_consumers(|c| c.producer_id == producer_id);
            debug!("Engine closed producer {}", producer_id);
        }
    }

    fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.alive.subscribe();
        // Sender lives as long as self, so wait_for only ends on a state change
        let _ = rx.wait_for(|alive| !*alive).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::RtpCodecParameters;

    fn engine() -> LoopbackEngine {
        LoopbackEngine::new(EngineConfig::default())
    }

    fn vp8_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90_000,
                channels: None,
                parameters: Default::default(),
            }],
            encodings: vec![],
        }
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: Some(DtlsRole::Client),
            fingerprints: vec![DtlsFingerprint::generate()],
        }
    }

    #[test]
    fn test_router_capabilities_get_payload_types() {
        let caps = engine().router_capabilities();
        assert_eq!(caps.codecs.len(), 3);
        assert!(caps.codecs.iter().all(|c| c.preferred_payload_type.is_some()));
    }

    #[test]
    fn test_excess_codecs_are_ignored() {
        let mut config = EngineConfig::default();
        let codec = config.media_codecs[0].clone();
        config.media_codecs = vec![codec; 200];
        let caps = LoopbackEngine::new(config).router_capabilities();
        assert_eq!(caps.codecs.len(), MAX_MEDIA_CODECS);
        assert_eq!(caps.codecs.last().unwrap().preferred_payload_type, Some(127));
    }

    #[tokio::test]
    async fn test_transport_ports_stay_in_range() {
        let engine = LoopbackEngine::new(EngineConfig {
            rtc_min_port: 40000,
            rtc_max_port: 40001,
            ..Default::default()
        });
        let mut ports = Vec::new();
        for _ in 0..4 {
            let options = engine.create_transport(TransportDirection::Send).await.unwrap();
            ports.push(options.ice_candidates[0].port);
        }
        assert_eq!(ports, vec![40000, 40001, 40000, 40001]);
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let engine = engine();
        let t = engine.create_transport(TransportDirection::Send).await.unwrap();
        engine.connect_transport(&t.id, &dtls()).await.unwrap();
        let err = engine.connect_transport(&t.id, &dtls()).await.unwrap_err();
        assert!(matches!(err, AppError::EngineFailure(_)));
    }

    #[tokio::test]
    async fn test_produce_consume_and_can_consume() {
        let engine = engine();
        let send = engine.create_transport(TransportDirection::Send).await.unwrap();
        let recv = engine.create_transport(TransportDirection::Receive).await.unwrap();
        let producer_id = engine
            .produce(&send.id, MediaKind::Video, &vp8_parameters())
            .await
            .unwrap();

        let caps = engine.router_capabilities();
        assert!(engine.can_consume(&producer_id, &caps));
        assert!(!engine.can_consume(&producer_id, &RtpCapabilities::default()));
        assert!(!engine.can_consume("missing", &caps));

        let consumer = engine.consume(&recv.id, &producer_id, &caps).await.unwrap();
        assert!(consumer.paused);
        assert_eq!(consumer.kind, MediaKind::Video);
        assert_eq!(consumer.rtp_parameters.codecs[0].payload_type, 101);
        assert_eq!(engine.is_consumer_paused(&consumer.id), Some(true));
        engine.resume_consumer(&consumer.id).await.unwrap();
        assert_eq!(engine.is_consumer_paused(&consumer.id), Some(false));
    }

    #[tokio::test]
    async fn test_closing_transport_drops_children() {
        let engine = engine();
        let send = engine.create_transport(TransportDirection::Send).await.unwrap();
        let recv = engine.create_transport(TransportDirection::Receive).await.unwrap();
        let producer_id = engine
            .produce(&send.id, MediaKind::Video, &vp8_parameters())
            .await
            .unwrap();
        engine
            .consume(&recv.id, &producer_id, &engine.router_capabilities())
            .await
            .unwrap();

        engine.close_transport(&send.id).await;
        assert_eq!(engine.producer_count(), 0);
        assert_eq!(engine.consumer_count(), 0);
        assert_eq!(engine.transport_count(), 1);
    }

    #[tokio::test]
    async fn test_consumer_mids_are_never_reused() {
        let engine = engine();
        let send = engine.create_transport(TransportDirection::Send).await.unwrap();
        let recv = engine.create_transport(TransportDirection::Receive).await.unwrap();
        let caps = engine.router_capabilities();

        let first = engine
            .produce(&send.id, MediaKind::Video, &vp8_parameters())
            .await
            .unwrap();
        let a = engine.consume(&recv.id, &first, &caps).await.unwrap();
        let b = engine.consume(&recv.id, &first, &caps).await.unwrap();
        engine.close_producer(&first).await;
        assert_eq!(engine.consumer_count(), 0);

        let second = engine
            .produce(&send.id, MediaKind::Video, &vp8_parameters())
            .await
            .unwrap();
        let c = engine.consume(&recv.id, &second, &caps).await.unwrap();

        let mids: Vec<_> = [a, b, c]
            .into_iter()
            .map(|consumer| consumer.rtp_parameters.mid.unwrap())
            .collect();
        assert_eq!(mids, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_close_consumer() {
        let engine = engine();
        let send = engine.create_transport(TransportDirection::Send).await.unwrap();
        let recv = engine.create_transport(TransportDirection::Receive).await.unwrap();
        let producer_id = engine
            .produce(&send.id, MediaKind::Video, &vp8_parameters())
            .await
            .unwrap();
        let consumer = engine
            .consume(&recv.id, &producer_id, &engine.router_capabilities())
            .await
            .unwrap();

        engine.close_consumer(&consumer.id).await;
        engine.close_consumer("missing").await;
        assert_eq!(engine.consumer_count(), 0);
        assert_eq!(engine.producer_count(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_codec_rejected() {
        let engine = engine();
        let send = engine.create_transport(TransportDirection::Send).await.unwrap();
        let mut params = vp8_parameters();
        params.codecs[0].mime_type = "video/AV1".to_string();
        let err = engine.produce(&send.id, MediaKind::Video, &params).await.unwrap_err();
        assert!(matches!(err, AppError::EngineFailure(_)));
    }

    #[tokio::test]
    async fn test_terminated_engine_is_unavailable() {
        let engine = engine();
        engine.terminate();
        assert!(!engine.is_alive());
        engine.closed().await;
        let err = engine.create_transport(TransportDirection::Send).await.unwrap_err();
        assert!(matches!(err, AppError::EngineUnavailable));
    }
}
