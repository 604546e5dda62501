//! Correlated signaling channel
//!
//! Multiplexes request/response pairs and server notifications over one
//! [`Link`]. Each request carries a fresh `requestId`; the matching response
//! settles exactly that request, and anything else with a `requestId` is a
//! late or duplicate answer and is ignored.
//!
//! When the link drops, every outstanding request fails with
//! [`AppError::ConnectionLost`] (requests are never replayed) and the channel
//! tries to reconnect through its [`Connector`]. Lifecycle changes are
//! published on the session's [`EventBus`].

pub mod in_process;
pub mod link;

pub use in_process::InProcessConnector;
pub use link::{Connector, Link, WebSocketConnector};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ChannelConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::signaling::{Envelope, Inbound, NotificationKind, ProducerNotification, RequestKind};
use crate::utils::LogThrottler;

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Reconnecting,
    /// Terminal: closed locally or reconnection exhausted
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Open => write!(f, "open"),
            ChannelState::Reconnecting => write!(f, "reconnecting"),
            ChannelState::Closed => write!(f, "closed"),
        }
    }
}

type PendingReply = oneshot::Sender<Result<Value>>;

/// State guarded together so that sending a request and draining pending
/// requests on loss can never interleave
struct Inner {
    state: ChannelState,
    outbound: Option<mpsc::UnboundedSender<String>>,
    pending: HashMap<String, PendingReply>,
}

impl Inner {
    /// Detach the link and hand back every outstanding request
    fn drain(&mut self, state: ChannelState) -> Vec<PendingReply> {
        self.state = state;
        self.outbound = None;
        self.pending.drain().map(|(_, tx)| tx).collect()
    }
}

fn fail_all(pending: Vec<PendingReply>) {
    for tx in pending {
        let _ = tx.send(Err(AppError::ConnectionLost));
    }
}

pub struct SignalingChannel {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    bus: Arc<EventBus>,
    inner: Mutex<Inner>,
    next_request_id: AtomicU64,
    cancel: CancellationToken,
    throttler: LogThrottler,
}

impl SignalingChannel {
    /// Open the first link and start the driver task
    ///
    /// A failed first connect is returned to the caller; automatic
    /// reconnection only covers links lost after they were open.
    pub async fn connect(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        bus: Arc<EventBus>,
    ) -> Result<Arc<Self>> {
        let channel = Arc::new(Self {
            config,
            connector,
            bus,
            inner: Mutex::new(Inner {
                state: ChannelState::Connecting,
                outbound: None,
                pending: HashMap::new(),
            }),
            next_request_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            throttler: LogThrottler::default(),
        });

        let link = match channel.connector.connect().await {
            Ok(link) => link,
            Err(e) => {
                channel.inner.lock().state = ChannelState::Closed;
                return Err(e);
            }
        };
        let incoming = channel.attach(link);
        channel.bus.emit(SessionEvent::ChannelOpen);

        tokio::spawn(Self::drive(
            Arc::downgrade(&channel),
            incoming,
            channel.cancel.clone(),
        ));
        Ok(channel)
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Number of requests waiting for a response
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Send a typed request and decode the typed response
    pub async fn request<T, R>(&self, kind: RequestKind, payload: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let data = serde_json::to_value(payload)?;
        let value = self.request_value(kind, data).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a request and wait for its raw response payload
    pub async fn request_value(&self, kind: RequestKind, data: Value) -> Result<Value> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed).to_string();
        let text = Envelope::request(kind, request_id.as_str(), data).to_text()?;
        let (tx, rx) = oneshot::channel();

        {
            let mut inner = self.inner.lock();
            if inner.state != ChannelState::Open {
                return Err(AppError::NotConnected);
            }
            let outbound = inner.outbound.as_ref().ok_or(AppError::NotConnected)?;
            if outbound.send(text).is_err() {
                return Err(AppError::ConnectionLost);
            }
            inner.pending.insert(request_id.clone(), tx);
        }
        trace!("Sent {} request {}", kind, request_id);

        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AppError::ConnectionLost),
            Err(_) => {
                self.inner.lock().pending.remove(&request_id);
                warn!("Request {} ({}) timed out", request_id, kind);
                Err(AppError::Timeout {
                    request: kind.to_string(),
                    after_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Close the channel for good
    ///
    /// Outstanding requests fail with `ConnectionLost`. No event is emitted.
    pub fn close(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.state == ChannelState::Closed {
                return;
            }
            inner.drain(ChannelState::Closed)
        };
        fail_all(drained);
        self.cancel.cancel();
        info!("Signaling channel closed");
    }

    fn attach(&self, link: Link) -> mpsc::UnboundedReceiver<String> {
        let mut inner = self.inner.lock();
        inner.outbound = Some(link.outgoing);
        inner.state = ChannelState::Open;
        link.incoming
    }

    fn handle_frame(&self, text: &str) {
        match Envelope::parse(text) {
            Ok(Inbound::Response { request_id, result }) => {
                let waiter = self.inner.lock().pending.remove(&request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(result.map_err(AppError::Remote));
                    }
                    None => debug!("Ignoring late or duplicate response {}", request_id),
                }
            }
            Ok(Inbound::Notification { kind, data }) => self.dispatch_notification(&kind, data),
            Ok(Inbound::Request { kind, .. }) => {
                if self.throttler.should_log("server_request") {
                    warn!("Ignoring request {} sent by the server", kind);
                }
            }
            Err(e) => {
                if self.throttler.should_log("malformed") {
                    warn!("Dropping malformed envelope: {}", e);
                }
            }
        }
    }

    fn dispatch_notification(&self, kind: &str, data: Value) {
        let Ok(kind) = NotificationKind::from_str(kind) else {
            if self.throttler.should_log(&format!("unknown_notification_{}", kind)) {
                warn!("Dropping unknown notification {}", kind);
            }
            return;
        };
        let payload: ProducerNotification = match serde_json::from_value(data) {
            Ok(payload) => payload,
            Err(e) => {
                if self.throttler.should_log("bad_notification") {
                    warn!("Dropping {} notification with bad payload: {}", kind, e);
                }
                return;
            }
        };

        let event = match kind {
            NotificationKind::NewProducer => SessionEvent::NewProducer {
                producer_id: payload.producer_id,
                kind: payload.kind,
            },
            NotificationKind::ProducerClosed => SessionEvent::ProducerClosed {
                producer_id: payload.producer_id,
            },
        };
        self.bus.emit(event);
    }

    /// Mark the link lost. Returns `false` if the channel was already closed.
    fn handle_link_lost(&self) -> bool {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.state == ChannelState::Closed {
                return false;
            }
            inner.drain(ChannelState::Reconnecting)
        };
        warn!(
            "Signaling link lost, failing {} outstanding requests",
            drained.len()
        );
        fail_all(drained);
        self.bus.emit(SessionEvent::ChannelLost);
        true
    }

    async fn drive(
        weak: Weak<Self>,
        mut incoming: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = incoming.recv() => frame,
            };
            let Some(channel) = weak.upgrade() else { break };

            match frame {
                Some(text) => channel.handle_frame(&text),
                None => {
                    if !channel.handle_link_lost() {
                        break;
                    }
                    drop(channel);
                    match Self::reconnect(&weak, &cancel).await {
                        Some(next) => incoming = next,
                        None => break,
                    }
                }
            }
        }
        debug!("Signaling channel driver stopped");
    }

    async fn reconnect(
        weak: &Weak<Self>,
        cancel: &CancellationToken,
    ) -> Option<mpsc::UnboundedReceiver<String>> {
        let (interval, max_attempts) = {
            let channel = weak.upgrade()?;
            (
                channel.config.reconnect_interval(),
                channel.config.max_reconnect_attempts,
            )
        };

        for attempt in 1..=max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(interval) => {}
            }

            let channel = weak.upgrade()?;
            if channel.state() == ChannelState::Closed {
                return None;
            }
            info!("Reconnecting signaling channel (attempt {}/{})", attempt, max_attempts);
            channel.bus.emit(SessionEvent::ChannelReconnecting { attempt });

            match channel.connector.connect().await {
                Ok(link) => {
                    // close() may have run while the connect was in flight
                    if cancel.is_cancelled() {
                        return None;
                    }
                    let incoming = channel.attach(link);
                    info!("Signaling channel reopened");
                    channel.bus.emit(SessionEvent::ChannelOpen);
                    return Some(incoming);
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }

        let channel = weak.upgrade()?;
        {
            let mut inner = channel.inner.lock();
            if inner.state == ChannelState::Closed {
                return None;
            }
            inner.state = ChannelState::Closed;
        }
        warn!("Giving up on signaling channel after {} attempts", max_attempts);
        channel.bus.emit(SessionEvent::ChannelDisconnected);
        None
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
