//! Registry records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signaling::MediaKind;

/// Opaque connection handle, freshly issued on every (re)connect
pub type ConnectionId = String;

/// Transport role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Receive,
}

impl std::fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportDirection::Send => write!(f, "send"),
            TransportDirection::Receive => write!(f, "receive"),
        }
    }
}

/// Transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Closed,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportState::New => write!(f, "new"),
            TransportState::Connecting => write!(f, "connecting"),
            TransportState::Connected => write!(f, "connected"),
            TransportState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportRecord {
    pub id: String,
    pub connection_id: ConnectionId,
    pub direction: TransportDirection,
    pub state: TransportState,
    pub created_at: DateTime<Utc>,
}

impl TransportRecord {
    pub fn new(id: impl Into<String>, connection_id: impl Into<String>, direction: TransportDirection) -> Self {
        Self {
            id: id.into(),
            connection_id: connection_id.into(),
            direction,
            state: TransportState::New,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProducerRecord {
    pub id: String,
    pub connection_id: ConnectionId,
    pub transport_id: String,
    pub kind: MediaKind,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerRecord {
    pub id: String,
    pub connection_id: ConnectionId,
    pub transport_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub paused: bool,
}

/// A producer owned by another participant, as seen from a client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteProducerRecord {
    pub id: String,
    pub connection_id: ConnectionId,
    pub kind: Option<MediaKind>,
}

/// Everything removed by a close operation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClosedResources {
    pub transports: Vec<TransportRecord>,
    pub producers: Vec<ProducerRecord>,
    pub consumers: Vec<ConsumerRecord>,
    pub remote_producers: Vec<RemoteProducerRecord>,
}

impl ClosedResources {
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
            && self.producers.is_empty()
            && self.consumers.is_empty()
            && self.remote_producers.is_empty()
    }

    pub fn merge(&mut self, other: ClosedResources) {
        self.transports.extend(other.transports);
        self.producers.extend(other.producers);
        self.consumers.extend(other.consumers);
        self.remote_producers.extend(other.remote_producers);
    }
}

/// Entry counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub remote_producers: usize,
}
