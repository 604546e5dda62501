//! Per-connection server session
//!
//! Validates each request against the room registry before delegating to the
//! media engine, and registers the engine's result afterwards.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::room::Room;
use crate::error::{AppError, Result};
use crate::registry::{
    ConnectionId, ConsumerRecord, ProducerRecord, ResourceRegistry, TransportDirection,
    TransportRecord, TransportState,
};
use crate::signaling::{
    CloseProducerRequest, ConnectTransportRequest, ConsumeRequest, ConsumerOptions, DtlsParameters,
    Envelope, Inbound, MediaKind, NotificationKind, ProduceRequest, ProduceResponse,
    ProducerNotification, RequestKind, ResumeConsumerRequest, RtpCapabilities, RtpParameters,
    TransportOptions,
};
use crate::utils::LogThrottler;

pub struct ServerSession {
    id: ConnectionId,
    room: Arc<Room>,
    closed: AtomicBool,
    throttler: LogThrottler,
}

impl ServerSession {
    /// Join a room with a fresh connection id
    pub fn join(room: Arc<Room>, outbound: mpsc::UnboundedSender<String>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        room.add_peer(&id, outbound);
        info!("Connection {} joined room {}", id, room.name());
        Self {
            id,
            room,
            closed: AtomicBool::new(false),
            throttler: LogThrottler::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(AppError::InvalidState(format!("connection {} is closed", self.id)))
        } else {
            Ok(())
        }
    }

    fn owned_transport<'a>(
        &self,
        registry: &'a ResourceRegistry,
        transport_id: &str,
        direction: TransportDirection,
    ) -> Result<&'a TransportRecord> {
        let transport = registry.transport(transport_id)?;
        if transport.connection_id != self.id {
            return Err(AppError::NotFound(format!("transport {}", transport_id)));
        }
        if transport.direction != direction {
            return Err(AppError::InvalidState(format!(
                "transport {} is a {} transport",
                transport_id, transport.direction
            )));
        }
        Ok(transport)
    }

    fn connected_transport(
        &self,
        registry: &ResourceRegistry,
        transport_id: &str,
        direction: TransportDirection,
    ) -> Result<()> {
        let transport = self.owned_transport(registry, transport_id, direction)?;
        if transport.state != TransportState::Connected {
            return Err(AppError::InvalidState(format!(
                "transport {} is {}",
                transport_id, transport.state
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    pub fn get_router_capabilities(&self) -> Result<RtpCapabilities> {
        let engine = self.room.engine();
        if !engine.is_alive() {
            return Err(AppError::EngineUnavailable);
        }
        Ok(engine.router_capabilities())
    }

    pub async fn create_transport(&self, direction: TransportDirection) -> Result<TransportOptions> {
        self.ensure_open()?;
        let options = self.room.engine().create_transport(direction).await?;

        let registered = self.ensure_open().and_then(|()| {
            self.room.with_registry(|registry| {
                registry.register_transport(TransportRecord::new(&options.id, &self.id, direction))
            })
        });
        if let Err(e) = registered {
            self.room.engine().close_transport(&options.id).await;
            return Err(e);
        }

        debug!("Connection {} created {} transport {}", self.id, direction, options.id);
        Ok(options)
    }

    pub async fn connect_transport(
        &self,
        transport_id: &str,
        direction: TransportDirection,
        dtls_parameters: &DtlsParameters,
    ) -> Result<()> {
        self.room.with_registry(|registry| {
            let transport = self.owned_transport(registry, transport_id, direction)?;
            if transport.state != TransportState::New {
                return Err(AppError::InvalidState(format!(
                    "transport {} is {}",
                    transport_id, transport.state
                )));
            }
            registry.set_transport_state(transport_id, TransportState::Connecting)?;
            Ok(())
        })?;

        let result = self
            .room
            .engine()
            .connect_transport(transport_id, dtls_parameters)
            .await;

        let next = if result.is_ok() {
            TransportState::Connected
        } else {
            TransportState::New
        };
        // The transport may have been cascaded away meanwhile
        let still_there = self
            .room
            .with_registry(|registry| registry.set_transport_state(transport_id, next).is_ok());

        result?;
        if !still_there {
            return Err(AppError::NotFound(format!("transport {}", transport_id)));
        }
        debug!("Connection {} connected transport {}", self.id, transport_id);
        Ok(())
    }

    pub async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
        paused: bool,
    ) -> Result<String> {
        self.room
            .with_registry(|registry| self.connected_transport(registry, transport_id, TransportDirection::Send))?;

        let engine = self.room.engine();
        let producer_id = engine.produce(transport_id, kind, rtp_parameters).await?;

        let registered = self.ensure_open().and_then(|()| {
            self.room.with_registry(|registry| {
                registry.register_producer(ProducerRecord {
                    id: producer_id.clone(),
                    connection_id: self.id.clone(),
                    transport_id: transport_id.to_string(),
                    kind,
                    paused,
                })
            })
        });
        if let Err(e) = registered {
            engine.close_producer(&producer_id).await;
            return Err(e);
        }

        info!("Connection {} produces {} as {}", self.id, kind, producer_id);
        let notification = ProducerNotification {
            producer_id: producer_id.clone(),
            kind: Some(kind),
        };
        let delivered = self.room.broadcast(
            &self.id,
            &Envelope::notification(NotificationKind::NewProducer, serde_json::to_value(&notification)?),
        );
        debug!("Announced producer {} to {} peers", producer_id, delivered);
        Ok(producer_id)
    }

    pub async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerOptions> {
        self.room.with_registry(|registry| {
            self.connected_transport(registry, transport_id, TransportDirection::Receive)?;
            registry.producer(producer_id)?;
            Ok::<_, AppError>(())
        })?;

        let engine = self.room.engine();
        if !engine.can_consume(producer_id, rtp_capabilities) {
            return Err(AppError::IncompatibleCapabilities(format!(
                "cannot consume producer {}",
                producer_id
            )));
        }
        let options = engine.consume(transport_id, producer_id, rtp_capabilities).await?;

        let registered = self.ensure_open().and_then(|()| {
            self.room.with_registry(|registry| {
                registry.register_consumer(ConsumerRecord {
                    id: options.id.clone(),
                    connection_id: self.id.clone(),
                    transport_id: transport_id.to_string(),
                    producer_id: producer_id.to_string(),
                    kind: options.kind,
                    paused: options.paused,
                })
            })
        });
        if let Err(e) = registered {
            engine.close_consumer(&options.id).await;
            return Err(e);
        }

        debug!("Connection {} consumes {} as {}", self.id, producer_id, options.id);
        Ok(options)
    }

    pub async fn resume_consumer(&self, consumer_id: &str) -> Result<()> {
        self.room.with_registry(|registry| {
            let consumer = registry.consumer(consumer_id)?;
            if consumer.connection_id != self.id {
                return Err(AppError::NotFound(format!("consumer {}", consumer_id)));
            }
            Ok(())
        })?;

        self.room.engine().resume_consumer(consumer_id).await?;
        self.room
            .with_registry(|registry| registry.set_consumer_paused(consumer_id, false))
    }

    pub async fn close_producer(&self, producer_id: &str) -> Result<()> {
        let closed = self.room.with_registry(|registry| {
            let producer = registry.producer(producer_id)?;
            if producer.connection_id != self.id {
                return Err(AppError::NotFound(format!("producer {}", producer_id)));
            }
            registry.unregister_producer(producer_id)
        })?;

        self.room.announce_producer_closed(&self.id, producer_id);
        self.room.engine().close_producer(producer_id).await;
        info!(
            "Connection {} closed producer {} ({} consumers dropped)",
            self.id,
            producer_id,
            closed.consumers.len()
        );
        Ok(())
    }

    /// End the connection; only the first call does anything
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.room.close_connection(&self.id).await;
        info!("Connection {} closed", self.id);
    }

    // ------------------------------------------------------------------------
    // Wire handling
    // ------------------------------------------------------------------------

    /// Handle one inbound frame, returning the response frame if any
    pub async fn handle_text(&self, text: &str) -> Option<String> {
        let (kind, request_id, data) = match Envelope::parse(text) {
            Ok(Inbound::Request {
                kind,
                request_id,
                data,
            }) => (kind, request_id, data),
            Ok(_) => {
                if self.throttler.should_log("unexpected") {
                    warn!("Connection {} sent a frame that is not a request", self.id);
                }
                return None;
            }
            Err(e) => {
                if self.throttler.should_log("malformed") {
                    warn!("Connection {} sent a malformed envelope: {}", self.id, e);
                }
                return None;
            }
        };

        let envelope = match RequestKind::from_str(&kind) {
            Ok(kind) => match self.dispatch(kind, data).await {
                Ok(value) => Envelope::success(request_id, value),
                Err(e) => {
                    debug!("Request {} ({}) failed: {}", request_id, kind, e);
                    Envelope::failure(request_id, e.to_string())
                }
            },
            Err(e) => Envelope::failure(request_id, e),
        };

        match envelope.to_text() {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Failed to encode response: {}", e);
                None
            }
        }
    }

    async fn dispatch(&self, kind: RequestKind, data: Value) -> Result<Value> {
        match kind {
            RequestKind::GetRouterCapabilities => Ok(serde_json::to_value(self.get_router_capabilities()?)?),
            RequestKind::CreateProducerTransport => Ok(serde_json::to_value(
                self.create_transport(TransportDirection::Send).await?,
            )?),
            RequestKind::CreateConsumerTransport => Ok(serde_json::to_value(
                self.create_transport(TransportDirection::Receive).await?,
            )?),
            RequestKind::ConnectProducerTransport => {
                let req: ConnectTransportRequest = decode(data)?;
                self.connect_transport(&req.transport_id, TransportDirection::Send, &req.dtls_parameters)
                    .await?;
                Ok(json!({}))
            }
            RequestKind::ConnectConsumerTransport => {
                let req: ConnectTransportRequest = decode(data)?;
                self.connect_transport(&req.transport_id, TransportDirection::Receive, &req.dtls_parameters)
                    .await?;
                Ok(json!({}))
            }
            RequestKind::Produce => {
                let req: ProduceRequest = decode(data)?;
                let id = self
                    .produce(&req.transport_id, req.kind, &req.rtp_parameters, req.paused)
                    .await?;
                Ok(serde_json::to_value(ProduceResponse { id })?)
            }
            RequestKind::Consume => {
                let req: ConsumeRequest = decode(data)?;
                let options = self
                    .consume(&req.transport_id, &req.producer_id, &req.rtp_capabilities)
                    .await?;
                Ok(serde_json::to_value(options)?)
            }
            RequestKind::ResumeConsumer => {
                let req: ResumeConsumerRequest = decode(data)?;
                self.resume_consumer(&req.consumer_id).await?;
                Ok(json!({}))
            }
            RequestKind::CloseProducer => {
                let req: CloseProducerRequest = decode(data)?;
                self.close_producer(&req.producer_id).await?;
                Ok(json!({}))
            }
        }
    }
}

fn decode<T: DeserializeOwned>(data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| AppError::BadRequest(e.to_string()))
}
