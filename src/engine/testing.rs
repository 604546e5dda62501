//! Engine wrapper for exercising races and transient failures in tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use super::{LoopbackEngine, MediaEngine};
use crate::error::{AppError, Result};
use crate::registry::TransportDirection;
use crate::signaling::{
    ConsumerOptions, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    CreateTransport,
    Produce,
    Consume,
}

/// Handle on an operation held after the engine completed it
pub(crate) struct Hold {
    reached: oneshot::Receiver<()>,
    release: oneshot::Sender<()>,
}

impl Hold {
    /// Wait until the held operation has run in the engine
    pub(crate) async fn reached(&mut self) {
        (&mut self.reached).await.expect("held operation never ran");
    }

    /// Let the held operation return to its caller
    pub(crate) fn release(self) {
        let _ = self.release.send(());
    }
}

struct Armed {
    operation: Operation,
    reached: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

/// Delegates to a [`LoopbackEngine`], optionally pausing one operation after
/// it took effect or failing upcoming consumes
pub(crate) struct GatedEngine {
    inner: Arc<LoopbackEngine>,
    armed: Mutex<Option<Armed>>,
    failing_consumes: AtomicUsize,
}

impl GatedEngine {
    pub(crate) fn new(inner: Arc<LoopbackEngine>) -> Self {
        Self {
            inner,
            armed: Mutex::new(None),
            failing_consumes: AtomicUsize::new(0),
        }
    }

    /// Hold the next call of `operation` until the returned handle is released
    pub(crate) fn hold_after(&self, operation: Operation) -> Hold {
        let (reached_tx, reached_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self.armed.lock() = Some(Armed {
            operation,
            reached: reached_tx,
            release: release_rx,
        });
        Hold {
            reached: reached_rx,
            release: release_tx,
        }
    }

    /// Reject the next `n` consumes
    pub(crate) fn fail_consumes(&self, n: usize) {
        self.failing_consumes.store(n, Ordering::SeqCst);
    }

    /// Consumes still scheduled to be rejected
    pub(crate) fn pending_consume_failures(&self) -> usize {
        self.failing_consumes.load(Ordering::SeqCst)
    }

    async fn gate(&self, operation: Operation) {
        let armed = {
            let mut armed = self.armed.lock();
            match armed.as_ref() {
                Some(a) if a.operation == operation => armed.take(),
                _ => None,
            }
        };
        if let Some(armed) = armed {
            let _ = armed.reached.send(());
            let _ = armed.release.await;
        }
    }
}

#[async_trait]
impl MediaEngine for GatedEngine {
    fn router_capabilities(&self) -> RtpCapabilities {
        self.inner.router_capabilities()
    }

    async fn create_transport(&self, direction: TransportDirection) -> Result<TransportOptions> {
        let options = self.inner.create_transport(direction).await?;
        self.gate(Operation::CreateTransport).await;
        Ok(options)
    }

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: &DtlsParameters) -> Result<()> {
        self.inner.connect_transport(transport_id, dtls_parameters).await
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<String> {
        let id = self.inner.produce(transport_id, kind, rtp_parameters).await?;
        self.gate(Operation::Produce).await;
        Ok(id)
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        self.inner.can_consume(producer_id, rtp_capabilities)
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerOptions> {
        if self
            .failing_consumes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AppError::EngineFailure("consume rejected".to_string()));
        }
        let options = self.inner.consume(transport_id, producer_id, rtp_capabilities).await?;
        self.gate(Operation::Consume).await;
        Ok(options)
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<()> {
        self.inner.resume_consumer(consumer_id).await
    }

    async fn close_consumer(&self, consumer_id: &str) {
        self.inner.close_consumer(consumer_id).await
    }

    async fn close_transport(&self, transport_id: &str) {
        self.inner.close_transport(transport_id).await
    }

    async fn close_producer(&self, producer_id: &str) {
        self.inner.close_producer(producer_id).await
    }

    fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    async fn closed(&self) {
        self.inner.closed().await
    }
}
