//! Client session controller
//!
//! Drives the negotiation a participant needs before media can flow:
//!
//! ```text
//! Idle -> CapabilitiesLoaded -> SendTransportReady -> Producing -> SteadyState
//! ```
//!
//! Receiving is driven by `newProducer` notifications and runs independently
//! of the sending side: the receive transport is created lazily by the first
//! notification, and every later one waits for that setup to finish.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channel::{Connector, SignalingChannel};
use crate::config::ChannelConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, EventName, HandlerId, SessionEvent};
use crate::media::{Device, LocalConsumer, LocalProducer, LocalTransport, MediaTrack};
use crate::registry::{
    ConsumerRecord, ProducerRecord, RegistryStats, RemoteProducerRecord, ResourceRegistry,
    TransportDirection, TransportRecord, TransportState,
};
use crate::signaling::{
    CloseProducerRequest, ConnectTransportRequest, ConsumeRequest, ConsumerOptions, MediaKind,
    ProduceRequest, ProduceResponse, RequestKind, ResumeConsumerRequest, RtpCapabilities,
    TransportOptions,
};

/// Owner label of resources created by this participant
const LOCAL_OWNER: &str = "local";
/// Owner label of producers announced by the server
const REMOTE_OWNER: &str = "remote";

/// Sending-side negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientState {
    Idle,
    CapabilitiesLoaded,
    SendTransportReady,
    Producing,
    SteadyState,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClientState::Idle => "idle",
            ClientState::CapabilitiesLoaded => "capabilities_loaded",
            ClientState::SendTransportReady => "send_transport_ready",
            ClientState::Producing => "producing",
            ClientState::SteadyState => "steady_state",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
struct ClientResources {
    registry: ResourceRegistry,
    producers: HashMap<String, LocalProducer>,
    consumers: HashMap<String, LocalConsumer>,
    /// Epoch of each known remote producer; a consume flow only registers
    /// its result if the epoch it started with is still current
    remote_epochs: HashMap<String, u64>,
    next_epoch: u64,
}

impl ClientResources {
    fn clear(&mut self) {
        self.registry = ResourceRegistry::new();
        self.producers.clear();
        self.consumers.clear();
        self.remote_epochs.clear();
    }

    fn mark_connected(&mut self, transport_id: &str) -> Result<()> {
        self.registry
            .set_transport_state(transport_id, TransportState::Connected)
            .map(|_| ())
    }
}

pub struct ClientSession {
    channel: Arc<SignalingChannel>,
    bus: Arc<EventBus>,
    device: Device,
    state: RwLock<ClientState>,
    send_transport: RwLock<Option<Arc<LocalTransport>>>,
    recv_transport: RwLock<Option<Arc<LocalTransport>>>,
    /// Serializes lazy receive-transport creation
    recv_setup: tokio::sync::Mutex<()>,
    resources: Mutex<ClientResources>,
    handlers: Mutex<Vec<HandlerId>>,
}

impl ClientSession {
    /// Open the signaling channel and wire the session to its events
    pub async fn connect(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        device: Device,
    ) -> Result<Arc<Self>> {
        let bus = Arc::new(EventBus::new());
        let channel = SignalingChannel::connect(config, connector, bus.clone()).await?;

        let session = Arc::new(Self {
            channel,
            bus,
            device,
            state: RwLock::new(ClientState::Idle),
            send_transport: RwLock::new(None),
            recv_transport: RwLock::new(None),
            recv_setup: tokio::sync::Mutex::new(()),
            resources: Mutex::new(ClientResources::default()),
            handlers: Mutex::new(Vec::new()),
        });
        session.wire_events();
        Ok(session)
    }

    fn wire_events(self: &Arc<Self>) {
        let mut ids = Vec::new();

        let weak = Arc::downgrade(self);
        ids.push(self.bus.on(EventName::ConnectTransport, move |event| {
            let SessionEvent::ConnectTransport {
                transport_id,
                direction,
                dtls_parameters,
                completion,
            } = event
            else {
                return;
            };
            let Some(session) = weak.upgrade() else {
                completion.reject(AppError::ConnectionLost);
                return;
            };
            let kind = match direction {
                TransportDirection::Send => RequestKind::ConnectProducerTransport,
                TransportDirection::Receive => RequestKind::ConnectConsumerTransport,
            };
            let request = ConnectTransportRequest {
                transport_id: transport_id.clone(),
                dtls_parameters: dtls_parameters.clone(),
            };
            let completion = completion.clone();
            tokio::spawn(async move {
                match session.channel.request::<_, Value>(kind, &request).await {
                    Ok(_) => completion.resolve(()),
                    Err(e) => completion.reject(e),
                };
            });
        }));

        let weak = Arc::downgrade(self);
        ids.push(self.bus.on(EventName::Produce, move |event| {
            let SessionEvent::Produce {
                transport_id,
                kind,
                rtp_parameters,
                completion,
            } = event
            else {
                return;
            };
            let Some(session) = weak.upgrade() else {
                completion.reject(AppError::ConnectionLost);
                return;
            };
            let request = ProduceRequest {
                transport_id: transport_id.clone(),
                kind: *kind,
                rtp_parameters: rtp_parameters.clone(),
                paused: false,
                app_data: None,
            };
            let completion = completion.clone();
            tokio::spawn(async move {
                match session
                    .channel
                    .request::<_, ProduceResponse>(RequestKind::Produce, &request)
                    .await
                {
                    Ok(response) => completion.resolve(response.id),
                    Err(e) => completion.reject(e),
                };
            });
        }));

        let weak = Arc::downgrade(self);
        ids.push(self.bus.on(EventName::NewProducer, move |event| {
            let SessionEvent::NewProducer { producer_id, kind } = event else {
                return;
            };
            let Some(session) = weak.upgrade() else { return };
            let producer_id = producer_id.clone();
            let kind = *kind;
            tokio::spawn(async move {
                if let Err(e) = session.on_new_remote_producer(&producer_id, kind).await {
                    warn!("Failed to consume producer {}: {}", producer_id, e);
                }
            });
        }));

        let weak = Arc::downgrade(self);
        ids.push(self.bus.on(EventName::ProducerClosed, move |event| {
            if let (SessionEvent::ProducerClosed { producer_id }, Some(session)) = (event, weak.upgrade()) {
                session.on_remote_producer_closed(producer_id);
            }
        }));

        let weak = Arc::downgrade(self);
        ids.push(self.bus.on(EventName::ChannelLost, move |_| {
            if let Some(session) = weak.upgrade() {
                session.reset_local_state();
            }
        }));

        *self.handlers.lock() = ids;
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn channel(&self) -> &Arc<SignalingChannel> {
        &self.channel
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn send_transport(&self) -> Option<Arc<LocalTransport>> {
        self.send_transport.read().clone()
    }

    pub fn receive_transport(&self) -> Option<Arc<LocalTransport>> {
        self.recv_transport.read().clone()
    }

    pub fn producers(&self) -> Vec<LocalProducer> {
        self.resources.lock().producers.values().cloned().collect()
    }

    pub fn consumers(&self) -> Vec<LocalConsumer> {
        self.resources.lock().consumers.values().cloned().collect()
    }

    /// Local consumer mirroring a remote producer, if any
    pub fn consumer_for(&self, producer_id: &str) -> Option<LocalConsumer> {
        let resources = self.resources.lock();
        let record = resources.registry.consumer_by_producer(LOCAL_OWNER, producer_id)?;
        resources.consumers.get(&record.id).cloned()
    }

    pub fn knows_remote_producer(&self, producer_id: &str) -> bool {
        self.resources.lock().registry.remote_producer(producer_id).is_ok()
    }

    pub fn stats(&self) -> RegistryStats {
        self.resources.lock().registry.stats()
    }

    fn advance_to(&self, next: ClientState) {
        let mut state = self.state.write();
        if *state < next {
            debug!("Client state {} -> {}", *state, next);
            *state = next;
        }
    }

    // ------------------------------------------------------------------------
    // Sending side
    // ------------------------------------------------------------------------

    /// Fetch the router's capabilities and load the device with them
    pub async fn load_capabilities(&self) -> Result<RtpCapabilities> {
        let router: RtpCapabilities = self
            .channel
            .request(RequestKind::GetRouterCapabilities, &())
            .await
            .map_err(|e| AppError::CapabilityLoadFailed(e.to_string()))?;
        self.device.load(&router)?;
        self.advance_to(ClientState::CapabilitiesLoaded);
        info!("Loaded router capabilities ({} codecs)", router.codecs.len());
        Ok(router)
    }

    pub async fn create_send_transport(&self) -> Result<Arc<LocalTransport>> {
        if !self.device.is_loaded() {
            return Err(AppError::InvalidState(
                "capabilities must be loaded before creating transports".to_string(),
            ));
        }

        let options: TransportOptions = self
            .channel
            .request(RequestKind::CreateProducerTransport, &())
            .await?;
        let transport = Arc::new(self.device.create_send_transport(options, self.bus.clone())?);
        self.resources.lock().registry.register_transport(TransportRecord::new(
            transport.id(),
            LOCAL_OWNER,
            TransportDirection::Send,
        ))?;

        let previous = self.send_transport.write().replace(transport.clone());
        if let Some(previous) = previous {
            previous.close();
        }
        self.advance_to(ClientState::SendTransportReady);
        info!("Send transport {} ready", transport.id());
        Ok(transport)
    }

    /// Start sending a track
    ///
    /// The send transport is connected on first use.
    pub async fn produce(&self, track: MediaTrack) -> Result<LocalProducer> {
        let transport = match (self.state(), self.send_transport()) {
            (state, Some(transport)) if state >= ClientState::SendTransportReady => transport,
            (state, _) => {
                return Err(AppError::NotReady(format!(
                    "cannot produce in state {}",
                    state
                )))
            }
        };
        self.advance_to(ClientState::Producing);

        let producer = match transport.produce(&track).await {
            Ok(producer) => producer,
            Err(e) => {
                let mut state = self.state.write();
                if *state == ClientState::Producing {
                    *state = ClientState::SendTransportReady;
                }
                return Err(e);
            }
        };

        {
            let mut resources = self.resources.lock();
            resources.mark_connected(transport.id())?;
            resources.registry.register_producer(ProducerRecord {
                id: producer.id.clone(),
                connection_id: LOCAL_OWNER.to_string(),
                transport_id: transport.id().to_string(),
                kind: producer.kind,
                paused: false,
            })?;
            resources.producers.insert(producer.id.clone(), producer.clone());
        }

        self.advance_to(ClientState::SteadyState);
        info!("Producing {} track {} as {}", track.kind, track.label, producer.id);
        Ok(producer)
    }

    /// Stop sending a track
    pub async fn close_producer(&self, producer_id: &str) -> Result<()> {
        if !self.resources.lock().producers.contains_key(producer_id) {
            return Err(AppError::NotFound(format!("producer {}", producer_id)));
        }

        self.channel
            .request::<_, Value>(
                RequestKind::CloseProducer,
                &CloseProducerRequest {
                    producer_id: producer_id.to_string(),
                },
            )
            .await?;

        let mut resources = self.resources.lock();
        resources.producers.remove(producer_id);
        // Already gone if the channel was reset meanwhile
        let _ = resources.registry.unregister_producer(producer_id);
        debug!("Closed producer {}", producer_id);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Receiving side
    // ------------------------------------------------------------------------

    /// Create (once) and connect the receive transport
    pub async fn create_receive_transport(&self) -> Result<Arc<LocalTransport>> {
        let _setup = self.recv_setup.lock().await;

        let existing = self.receive_transport().filter(|t| !t.is_closed());
        let transport = match existing {
            Some(transport) => transport,
            None => {
                if !self.device.is_loaded() {
                    return Err(AppError::InvalidState(
                        "capabilities must be loaded before creating transports".to_string(),
                    ));
                }
                let options: TransportOptions = self
                    .channel
                    .request(RequestKind::CreateConsumerTransport, &())
                    .await?;
                let transport = Arc::new(self.device.create_recv_transport(options, self.bus.clone())?);
                self.resources.lock().registry.register_transport(TransportRecord::new(
                    transport.id(),
                    LOCAL_OWNER,
                    TransportDirection::Receive,
                ))?;
                *self.recv_transport.write() = Some(transport.clone());
                info!("Receive transport {} ready", transport.id());
                transport
            }
        };

        transport.ensure_connected().await?;
        self.resources.lock().mark_connected(transport.id())?;
        Ok(transport)
    }

    /// React to a `newProducer` announcement
    ///
    /// Returns the resumed consumer, or `None` when the announcement was
    /// dropped or overtaken by a `producerClosed` for the same producer.
    pub async fn on_new_remote_producer(
        &self,
        producer_id: &str,
        kind: Option<MediaKind>,
    ) -> Result<Option<LocalConsumer>> {
        if !self.device.can_consume() {
            warn!("Ignoring producer {}: capabilities not loaded", producer_id);
            return Ok(None);
        }
        if let Some(kind) = kind {
            if !self.device.can_receive(kind) {
                warn!("Ignoring {} producer {}: no negotiated {} codec", kind, producer_id, kind);
                return Ok(None);
            }
        }

        let epoch = {
            let mut resources = self.resources.lock();
            if resources.remote_epochs.contains_key(producer_id) {
                debug!("Producer {} already known", producer_id);
                return Ok(None);
            }
            resources.registry.register_remote_producer(RemoteProducerRecord {
                id: producer_id.to_string(),
                connection_id: REMOTE_OWNER.to_string(),
                kind,
            })?;
            resources.next_epoch += 1;
            let epoch = resources.next_epoch;
            resources.remote_epochs.insert(producer_id.to_string(), epoch);
            epoch
        };

        let result = self.consume_remote_producer(producer_id, epoch).await;
        if result.is_err() {
            self.forget_remote_producer(producer_id, epoch);
        }
        result
    }

    /// Drop a failed announcement so a later one starts from scratch
    fn forget_remote_producer(&self, producer_id: &str, epoch: u64) {
        let mut resources = self.resources.lock();
        if resources.remote_epochs.get(producer_id) != Some(&epoch) {
            return;
        }
        resources.remote_epochs.remove(producer_id);
        if let Ok(closed) = resources.registry.unregister_producer(producer_id) {
            for consumer in &closed.consumers {
                resources.consumers.remove(&consumer.id);
            }
        }
        debug!("Forgot remote producer {} after a failed consume", producer_id);
    }

    async fn consume_remote_producer(
        &self,
        producer_id: &str,
        epoch: u64,
    ) -> Result<Option<LocalConsumer>> {
        let transport = self.create_receive_transport().await?;
        let rtp_capabilities = self
            .device
            .rtp_capabilities()
            .ok_or_else(|| AppError::NotReady("capabilities were unloaded".to_string()))?;
        let options: ConsumerOptions = self
            .channel
            .request(
                RequestKind::Consume,
                &ConsumeRequest {
                    transport_id: transport.id().to_string(),
                    producer_id: producer_id.to_string(),
                    rtp_capabilities,
                },
            )
            .await?;
        let consumer = transport.consume(options)?;

        {
            let mut resources = self.resources.lock();
            if resources.remote_epochs.get(producer_id) != Some(&epoch) {
                debug!(
                    "Discarding consumer {}: producer {} closed meanwhile",
                    consumer.id, producer_id
                );
                return Ok(None);
            }
            resources.registry.register_consumer(ConsumerRecord {
                id: consumer.id.clone(),
                connection_id: LOCAL_OWNER.to_string(),
                transport_id: transport.id().to_string(),
                producer_id: producer_id.to_string(),
                kind: consumer.kind,
                paused: consumer.paused,
            })?;
            resources.consumers.insert(consumer.id.clone(), consumer.clone());
        }

        self.channel
            .request::<_, Value>(
                RequestKind::ResumeConsumer,
                &ResumeConsumerRequest {
                    consumer_id: consumer.id.clone(),
                },
            )
            .await?;

        let mut resources = self.resources.lock();
        let Some(local) = resources.consumers.get_mut(&consumer.id) else {
            return Ok(None);
        };
        local.paused = false;
        let resumed = local.clone();
        let _ = resources.registry.set_consumer_paused(&consumer.id, false);
        info!("Consuming {} producer {} as {}", resumed.kind, producer_id, resumed.id);
        Ok(Some(resumed))
    }

    /// React to a `producerClosed` announcement
    ///
    /// Returns `false` for producers this session never heard of.
    pub fn on_remote_producer_closed(&self, producer_id: &str) -> bool {
        let mut resources = self.resources.lock();
        resources.remote_epochs.remove(producer_id);
        match resources.registry.unregister_producer(producer_id) {
            Ok(closed) => {
                for consumer in &closed.consumers {
                    resources.consumers.remove(&consumer.id);
                }
                debug!(
                    "Remote producer {} closed ({} consumers)",
                    producer_id,
                    closed.consumers.len()
                );
                true
            }
            Err(_) => {
                debug!("Ignoring close of unknown producer {}", producer_id);
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Drop all negotiated state; the server has already cascaded the old
    /// connection
    fn reset_local_state(&self) {
        self.resources.lock().clear();
        if let Some(transport) = self.send_transport.write().take() {
            transport.close();
        }
        if let Some(transport) = self.recv_transport.write().take() {
            transport.close();
        }
        self.device.unload();
        *self.state.write() = ClientState::Idle;
        info!("Client session reset after connection loss");
    }

    /// Close local resources and the channel
    pub fn close(&self) {
        for id in self.handlers.lock().drain(..) {
            self.bus.off(id);
        }
        self.channel.close();
        self.reset_local_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelState, InProcessConnector};
    use crate::config::EngineConfig;
    use crate::engine::testing::GatedEngine;
    use crate::engine::LoopbackEngine;
    use crate::server::Room;
    use crate::signaling::default_media_codecs;
    use std::time::Duration;

    struct World {
        engine: Arc<LoopbackEngine>,
        room: Arc<Room>,
    }

    fn world() -> World {
        let engine = Arc::new(LoopbackEngine::new(EngineConfig::default()));
        let room = Arc::new(Room::new("test", engine.clone()));
        World { engine, room }
    }

    async fn participant(room: &Arc<Room>) -> (Arc<ClientSession>, Arc<InProcessConnector>) {
        participant_with(room, Device::default()).await
    }

    async fn participant_with(
        room: &Arc<Room>,
        device: Device,
    ) -> (Arc<ClientSession>, Arc<InProcessConnector>) {
        let connector = Arc::new(InProcessConnector::new(room.clone()));
        let session = ClientSession::connect(ChannelConfig::default(), connector.clone(), device)
            .await
            .unwrap();
        (session, connector)
    }

    fn audio_only_device() -> Device {
        Device::new(
            default_media_codecs()
                .into_iter()
                .filter(|c| c.kind == MediaKind::Audio)
                .collect(),
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_transport_before_capabilities_is_rejected() {
        let w = world();
        let (client, _) = participant(&w.room).await;
        assert!(matches!(
            client.create_send_transport().await,
            Err(AppError::InvalidState(_))
        ));
        assert!(matches!(
            client.produce(MediaTrack::audio("mic")).await,
            Err(AppError::NotReady(_))
        ));
    }

    #[tokio::test]
    async fn test_produce_one_video_track() {
        let w = world();
        let (client, _) = participant(&w.room).await;

        client.load_capabilities().await.unwrap();
        assert_eq!(client.state(), ClientState::CapabilitiesLoaded);
        client.create_send_transport().await.unwrap();
        assert_eq!(client.state(), ClientState::SendTransportReady);

        let producer = client.produce(MediaTrack::video("camera")).await.unwrap();
        assert_eq!(client.state(), ClientState::SteadyState);
        assert_eq!(producer.kind, MediaKind::Video);

        w.room.with_registry(|registry| {
            let stats = registry.stats();
            assert_eq!(stats.transports, 1);
            assert_eq!(stats.producers, 1);
            let record = registry.producer(&producer.id).unwrap();
            assert_eq!(record.kind, MediaKind::Video);
            let transport = registry.transport(&record.transport_id).unwrap();
            assert_eq!(transport.direction, TransportDirection::Send);
            assert_eq!(transport.state, TransportState::Connected);
        });
        assert_eq!(client.stats().producers, 1);
    }

    #[tokio::test]
    async fn test_second_participant_consumes_announced_producer() {
        let w = world();
        let (alice, _) = participant(&w.room).await;
        let (bob, _) = participant(&w.room).await;
        bob.load_capabilities().await.unwrap();
        alice.load_capabilities().await.unwrap();
        alice.create_send_transport().await.unwrap();

        let producer = alice.produce(MediaTrack::audio("mic")).await.unwrap();

        wait_until(|| bob.consumer_for(&producer.id).map(|c| !c.paused).unwrap_or(false)).await;
        assert_eq!(bob.consumers().len(), 1);
        assert!(bob.knows_remote_producer(&producer.id));
        assert!(alice.consumers().is_empty());

        w.room.with_registry(|registry| {
            assert_eq!(registry.stats().consumers, 1);
            let consumer = registry.consumer(&bob.consumers()[0].id).unwrap();
            assert_eq!(consumer.producer_id, producer.id);
            assert!(!consumer.paused);
        });
        assert_eq!(w.engine.consumer_count(), 1);

        // Alice stops the track: Bob's consumer goes away on both sides
        alice.close_producer(&producer.id).await.unwrap();
        wait_until(|| bob.consumers().is_empty()).await;
        assert!(!bob.knows_remote_producer(&producer.id));
        assert_eq!(w.room.stats().consumers, 0);
    }

    #[tokio::test]
    async fn test_concurrent_announcements_share_one_receive_transport() {
        let w = world();
        let (alice, _) = participant(&w.room).await;
        let (bob, _) = participant(&w.room).await;
        bob.load_capabilities().await.unwrap();
        alice.load_capabilities().await.unwrap();
        alice.create_send_transport().await.unwrap();

        let (audio, video) = tokio::join!(
            alice.produce(MediaTrack::audio("mic")),
            alice.produce(MediaTrack::video("camera"))
        );
        audio.unwrap();
        video.unwrap();

        wait_until(|| bob.consumers().iter().filter(|c| !c.paused).count() == 2).await;
        let transport = bob.receive_transport().unwrap();
        assert!(bob.consumers().iter().all(|c| c.transport_id == transport.id()));
        w.room.with_registry(|registry| {
            assert_eq!(registry.stats().transports, 2);
        });
    }

    #[tokio::test]
    async fn test_announcement_without_capabilities_is_dropped() {
        let w = world();
        let (client, _) = participant(&w.room).await;
        let result = client.on_new_remote_producer("p1", Some(MediaKind::Audio)).await;
        assert!(matches!(result, Ok(None)));
        assert!(!client.knows_remote_producer("p1"));
    }

    #[tokio::test]
    async fn test_close_before_consume_completes_is_not_resurrected() {
        let w = world();
        let (alice, _) = participant(&w.room).await;
        let (bob, _) = participant(&w.room).await;
        alice.load_capabilities().await.unwrap();
        alice.create_send_transport().await.unwrap();
        bob.load_capabilities().await.unwrap();
        let producer = alice.produce(MediaTrack::audio("mic")).await.unwrap();
        wait_until(|| bob.consumer_for(&producer.id).map(|c| !c.paused).unwrap_or(false)).await;

        // A close for a producer this session never heard of is a no-op
        assert!(!bob.on_remote_producer_closed("never-announced"));

        assert!(bob.on_remote_producer_closed(&producer.id));
        assert!(bob.consumer_for(&producer.id).is_none());

        // Close arrives while a consume flow for the same id is in flight
        let flow = bob.on_new_remote_producer(&producer.id, Some(MediaKind::Audio));
        let closer = async {
            tokio::task::yield_now().await;
            bob.on_remote_producer_closed(&producer.id);
        };
        let (result, ()) = tokio::join!(flow, closer);
        assert!(matches!(result, Ok(None)));
        assert!(bob.consumer_for(&producer.id).is_none());
        assert!(!bob.knows_remote_producer(&producer.id));

        // A fresh announcement starts over cleanly
        let consumer = bob
            .on_new_remote_producer(&producer.id, Some(MediaKind::Audio))
            .await
            .unwrap()
            .unwrap();
        assert!(!consumer.paused);
        assert_eq!(bob.consumers().len(), 1);
    }

    #[tokio::test]
    async fn test_connection_loss_resets_session() {
        let w = world();
        let (client, connector) = participant(&w.room).await;
        client.load_capabilities().await.unwrap();
        client.create_send_transport().await.unwrap();
        client.produce(MediaTrack::audio("mic")).await.unwrap();

        connector.sever_all();
        wait_until(|| client.state() == ClientState::Idle).await;
        assert!(!client.device().is_loaded());
        assert!(client.producers().is_empty());
        assert!(client.send_transport().is_none());

        // The server cascaded the old connection
        wait_until(|| w.engine.transport_count() == 0).await;
        assert_eq!(w.room.stats().producers, 0);
    }

    #[tokio::test]
    async fn test_close_stops_channel() {
        let w = world();
        let (client, _) = participant(&w.room).await;
        client.load_capabilities().await.unwrap();
        client.close();
        assert_eq!(client.channel().state(), ChannelState::Closed);
        assert_eq!(client.state(), ClientState::Idle);
        wait_until(|| w.room.peer_count() == 0).await;
    }

    #[tokio::test]
    async fn test_announcement_of_unreceivable_kind_is_dropped() {
        let w = world();
        let (alice, _) = participant(&w.room).await;
        let (bob, _) = participant_with(&w.room, audio_only_device()).await;
        bob.load_capabilities().await.unwrap();
        alice.load_capabilities().await.unwrap();
        alice.create_send_transport().await.unwrap();

        let producer = alice.produce(MediaTrack::video("camera")).await.unwrap();
        let result = bob.on_new_remote_producer(&producer.id, Some(MediaKind::Video)).await;
        assert!(matches!(result, Ok(None)));
        assert!(!bob.knows_remote_producer(&producer.id));
        assert!(bob.receive_transport().is_none());
        // Only Alice's send transport exists on the server
        assert_eq!(w.engine.transport_count(), 1);

        // Without a kind the server rejects the consume; nothing is kept
        let result = bob.on_new_remote_producer(&producer.id, None).await;
        assert!(matches!(result, Err(AppError::Remote(_))));
        assert!(!bob.knows_remote_producer(&producer.id));
        assert_eq!(bob.stats().remote_producers, 0);
        assert!(bob.consumers().is_empty());

        // Audio still flows to the audio-only participant
        let mic = alice.produce(MediaTrack::audio("mic")).await.unwrap();
        wait_until(|| bob.consumer_for(&mic.id).map(|c| !c.paused).unwrap_or(false)).await;
        assert!(!bob.knows_remote_producer(&producer.id));
    }

    #[tokio::test]
    async fn test_announcement_retried_after_failed_consume() {
        let loopback = Arc::new(LoopbackEngine::new(EngineConfig::default()));
        let engine = Arc::new(GatedEngine::new(loopback.clone()));
        let room = Arc::new(Room::new("test", engine.clone()));
        let (alice, _) = participant(&room).await;
        let (bob, _) = participant(&room).await;
        bob.load_capabilities().await.unwrap();
        alice.load_capabilities().await.unwrap();
        alice.create_send_transport().await.unwrap();

        engine.fail_consumes(1);
        let producer = alice.produce(MediaTrack::video("camera")).await.unwrap();

        // The announcement-driven consume is rejected and rolled back
        wait_until(|| engine.pending_consume_failures() == 0 && !bob.knows_remote_producer(&producer.id)).await;
        assert!(bob.consumer_for(&producer.id).is_none());
        assert_eq!(loopback.consumer_count(), 0);

        let consumer = bob
            .on_new_remote_producer(&producer.id, Some(MediaKind::Video))
            .await
            .unwrap()
            .expect("retry should consume");
        assert!(!consumer.paused);
        assert!(bob.knows_remote_producer(&producer.id));
        assert_eq!(bob.consumers().len(), 1);
        assert_eq!(loopback.consumer_count(), 1);
    }
}
