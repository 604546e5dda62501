//! Session event types
//!
//! Every event published on the [`EventBus`](super::EventBus) has a name
//! ([`EventName`]) and a typed payload ([`SessionEvent`]).

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::error::{AppError, Result};
use crate::registry::TransportDirection;
use crate::signaling::{DtlsParameters, MediaKind, RtpParameters};

/// Enumerated event names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    /// Local transport needs its DTLS parameters authorized by the server
    ConnectTransport,
    /// Local send transport needs a server-side producer id
    Produce,
    /// Server announced a producer of another participant
    NewProducer,
    /// Server announced that a producer went away
    ProducerClosed,
    /// Channel link is open (initial connect or successful reconnect)
    ChannelOpen,
    /// Channel link dropped; outstanding requests were failed
    ChannelLost,
    /// Channel is about to try reconnecting
    ChannelReconnecting,
    /// Channel gave up reconnecting (terminal)
    ChannelDisconnected,
}

/// Session event with its payload
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectTransport {
        transport_id: String,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
        completion: Completion<()>,
    },
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        completion: Completion<String>,
    },
    NewProducer {
        producer_id: String,
        kind: Option<MediaKind>,
    },
    ProducerClosed {
        producer_id: String,
    },
    ChannelOpen,
    ChannelLost,
    ChannelReconnecting {
        attempt: u32,
    },
    ChannelDisconnected,
}

impl SessionEvent {
    pub fn name(&self) -> EventName {
        match self {
            SessionEvent::ConnectTransport { .. } => EventName::ConnectTransport,
            SessionEvent::Produce { .. } => EventName::Produce,
            SessionEvent::NewProducer { .. } => EventName::NewProducer,
            SessionEvent::ProducerClosed { .. } => EventName::ProducerClosed,
            SessionEvent::ChannelOpen => EventName::ChannelOpen,
            SessionEvent::ChannelLost => EventName::ChannelLost,
            SessionEvent::ChannelReconnecting { .. } => EventName::ChannelReconnecting,
            SessionEvent::ChannelDisconnected => EventName::ChannelDisconnected,
        }
    }
}

// ============================================================================
// Pending handle
// ============================================================================

/// Resolving side of a pending local operation
///
/// Clones share one underlying slot: the first `resolve` or `reject` wins and
/// every later call is ignored. Dropping the last clone without resolving
/// rejects the [`Pending`] side.
pub struct Completion<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<Result<T>>>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<T> Completion<T> {
    /// Create a completion and the pending handle it settles
    pub fn new() -> (Self, Pending<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            Pending { rx },
        )
    }

    /// Settle with a value. Returns `false` if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settle with an error. Returns `false` if already settled.
    pub fn reject(&self, error: AppError) -> bool {
        self.settle(Err(error))
    }

    pub fn is_settled(&self) -> bool {
        self.slot.lock().is_none()
    }

    fn settle(&self, result: Result<T>) -> bool {
        match self.slot.lock().take() {
            Some(tx) => {
                // Receiver may be gone if the local operation was abandoned
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

/// Awaiting side of a pending local operation
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    pub async fn wait(self) -> Result<T> {
        self.rx.await.unwrap_or_else(|_| {
            Err(AppError::Internal(
                "pending operation dropped without a result".to_string(),
            ))
        })
    }
}
