//! In-memory resource registry
//!
//! Records the transports, producers and consumers created for each
//! connection, keyed by id, and keeps the ownership graph consistent:
//!
//! ```text
//! Connection ──owns──> Transport (send)    ──owns──> Producer
//!            ──owns──> Transport (receive) ──owns──> Consumer ──refs──> Producer
//! ```
//!
//! The registry is plain bookkeeping. It never talks to the media engine and
//! is not synchronized itself; owners wrap it in a lock.

pub mod types;

pub use types::{
    ClosedResources, ConnectionId, ConsumerRecord, ProducerRecord, RegistryStats,
    RemoteProducerRecord, TransportDirection, TransportRecord, TransportState,
};

use std::collections::{HashMap, HashSet};
use tracing::trace;

use crate::error::{AppError, Result};

#[derive(Debug, Default)]
pub struct ResourceRegistry {
    transports: HashMap<String, TransportRecord>,
    producers: HashMap<String, ProducerRecord>,
    consumers: HashMap<String, ConsumerRecord>,
    remote_producers: HashMap<String, RemoteProducerRecord>,
    /// Transport ids per connection
    by_connection: HashMap<ConnectionId, HashSet<String>>,
    /// Consumer ids per referenced producer
    consumers_by_producer: HashMap<String, HashSet<String>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------------

    pub fn register_transport(&mut self, record: TransportRecord) -> Result<()> {
        if self.transports.contains_key(&record.id) {
            return Err(AppError::InvalidState(format!(
                "transport {} already registered",
                record.id
            )));
        }
        self.by_connection
            .entry(record.connection_id.clone())
            .or_default()
            .insert(record.id.clone());
        trace!("Registered {} transport {}", record.direction, record.id);
        self.transports.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn transport(&self, id: &str) -> Result<&TransportRecord> {
        self.transports
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("transport {}", id)))
    }

    /// Update a transport's state, returning the previous one
    pub fn set_transport_state(&mut self, id: &str, state: TransportState) -> Result<TransportState> {
        let record = self
            .transports
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("transport {}", id)))?;
        Ok(std::mem::replace(&mut record.state, state))
    }

    /// Remove a transport together with its producers and consumers
    pub fn unregister_transport(&mut self, id: &str) -> Result<ClosedResources> {
        let mut record = self
            .transports
            .remove(id)
            .ok_or_else(|| AppError::NotFound(format!("transport {}", id)))?;

        if let Some(ids) = self.by_connection.get_mut(&record.connection_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_connection.remove(&record.connection_id);
            }
        }

        let mut closed = ClosedResources::default();

        let producer_ids: Vec<String> = self
            .producers
            .values()
            .filter(|p| p.transport_id == id)
            .map(|p| p.id.clone())
            .collect();
        for producer_id in producer_ids {
            closed.merge(self.unregister_producer(&producer_id)?);
        }

        let consumer_ids: Vec<String> = self
            .consumers
            .values()
            .filter(|c| c.transport_id == id)
            .map(|c| c.id.clone())
            .collect();
        for consumer_id in consumer_ids {
            closed.consumers.push(self.unregister_consumer(&consumer_id)?);
        }

        record.state = TransportState::Closed;
        closed.transports.push(record);
        Ok(closed)
    }

    // ------------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------------

    /// Register a producer on a connected send transport
    pub fn register_producer(&mut self, record: ProducerRecord) -> Result<()> {
        if self.producers.contains_key(&record.id) || self.remote_producers.contains_key(&record.id) {
            return Err(AppError::InvalidState(format!(
                "producer {} already registered",
                record.id
            )));
        }
        let transport = self.owned_transport(&record.transport_id, &record.connection_id)?;
        if transport.direction != TransportDirection::Send {
            return Err(AppError::InvalidState(format!(
                "transport {} is not a send transport",
                transport.id
            )));
        }
        if transport.state != TransportState::Connected {
            return Err(AppError::InvalidState(format!(
                "transport {} is {}, not connected",
                transport.id, transport.state
            )));
        }

        trace!("Registered {} producer {}", record.kind, record.id);
        self.producers.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn producer(&self, id: &str) -> Result<&ProducerRecord> {
        self.producers
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("producer {}", id)))
    }

    /// Remove a local or remote producer and every consumer referencing it
    pub fn unregister_producer(&mut self, id: &str) -> Result<ClosedResources> {
        let mut closed = ClosedResources::default();

        if let Some(record) = self.producers.remove(id) {
            closed.producers.push(record);
        } else if let Some(record) = self.remote_producers.remove(id) {
            closed.remote_producers.push(record);
        } else {
            return Err(AppError::NotFound(format!("producer {}", id)));
        }

        if let Some(consumer_ids) = self.consumers_by_producer.remove(id) {
            for consumer_id in consumer_ids {
                if let Some(consumer) = self.consumers.remove(&consumer_id) {
                    closed.consumers.push(consumer);
                }
            }
        }
        Ok(closed)
    }

    /// Record a producer announced by the server for another participant
    pub fn register_remote_producer(&mut self, record: RemoteProducerRecord) -> Result<()> {
        if self.producers.contains_key(&record.id) || self.remote_producers.contains_key(&record.id) {
            return Err(AppError::InvalidState(format!(
                "producer {} already registered",
                record.id
            )));
        }
        self.remote_producers.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn remote_producer(&self, id: &str) -> Result<&RemoteProducerRecord> {
        self.remote_producers
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("remote producer {}", id)))
    }

    pub fn producers_of(&self, connection_id: &str) -> Vec<&ProducerRecord> {
        self.producers
            .values()
            .filter(|p| p.connection_id == connection_id)
            .collect()
    }

    // ------------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------------

    /// Register a consumer on a connected receive transport
    ///
    /// The referenced producer must currently be registered (local or remote).
    pub fn register_consumer(&mut self, record: ConsumerRecord) -> Result<()> {
        if self.consumers.contains_key(&record.id) {
            return Err(AppError::InvalidState(format!(
                "consumer {} already registered",
                record.id
            )));
        }
        if !self.producers.contains_key(&record.producer_id)
            && !self.remote_producers.contains_key(&record.producer_id)
        {
            return Err(AppError::NotFound(format!("producer {}", record.producer_id)));
        }
        let transport = self.owned_transport(&record.transport_id, &record.connection_id)?;
        if transport.direction != TransportDirection::Receive {
            return Err(AppError::InvalidState(format!(
                "transport {} is not a receive transport",
                transport.id
            )));
        }
        if transport.state != TransportState::Connected {
            return Err(AppError::InvalidState(format!(
                "transport {} is {}, not connected",
                transport.id, transport.state
            )));
        }

        self.consumers_by_producer
            .entry(record.producer_id.clone())
            .or_default()
            .insert(record.id.clone());
        trace!("Registered consumer {} for producer {}", record.id, record.producer_id);
        self.consumers.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn consumer(&self, id: &str) -> Result<&ConsumerRecord> {
        self.consumers
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("consumer {}", id)))
    }

    pub fn set_consumer_paused(&mut self, id: &str, paused: bool) -> Result<()> {
        let record = self
            .consumers
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("consumer {}", id)))?;
        record.paused = paused;
        Ok(())
    }

    /// Find the consumer a connection holds for a given producer
    pub fn consumer_by_producer(&self, connection_id: &str, producer_id: &str) -> Option<&ConsumerRecord> {
        self.consumers_by_producer
            .get(producer_id)?
            .iter()
            .filter_map(|id| self.consumers.get(id))
            .find(|c| c.connection_id == connection_id)
    }

    pub fn unregister_consumer(&mut self, id: &str) -> Result<ConsumerRecord> {
        let record = self
            .consumers
            .remove(id)
            .ok_or_else(|| AppError::NotFound(format!("consumer {}", id)))?;
        if let Some(ids) = self.consumers_by_producer.get_mut(&record.producer_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.consumers_by_producer.remove(&record.producer_id);
            }
        }
        Ok(record)
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Remove everything a connection owns, transitively
    ///
    /// Consumers of other connections that referenced one of its producers are
    /// removed as well. Calling this again for the same connection returns an
    /// empty result.
    pub fn close_cascade(&mut self, connection_id: &str) -> ClosedResources {
        let mut closed = ClosedResources::default();

        let transport_ids: Vec<String> = self
            .by_connection
            .remove(connection_id)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default();

        for transport_id in transport_ids {
            if let Ok(resources) = self.unregister_transport(&transport_id) {
                closed.merge(resources);
            }
        }

        let remote_ids: Vec<String> = self
            .remote_producers
            .values()
            .filter(|r| r.connection_id == connection_id)
            .map(|r| r.id.clone())
            .collect();
        for remote_id in remote_ids {
            if let Ok(resources) = self.unregister_producer(&remote_id) {
                closed.merge(resources);
            }
        }

        if !closed.is_empty() {
            trace!(
                "Closed connection {}: {} transports, {} producers, {} consumers",
                connection_id,
                closed.transports.len(),
                closed.producers.len(),
                closed.consumers.len()
            );
        }
        closed
    }

    /// Number of entries that still reference a connection
    pub fn connection_resource_count(&self, connection_id: &str) -> usize {
        self.transports
            .values()
            .filter(|t| t.connection_id == connection_id)
            .count()
            + self
                .producers
                .values()
                .filter(|p| p.connection_id == connection_id)
                .count()
            + self
                .consumers
                .values()
                .filter(|c| c.connection_id == connection_id)
                .count()
            + self
                .remote_producers
                .values()
                .filter(|r| r.connection_id == connection_id)
                .count()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            transports: self.transports.len(),
            producers: self.producers.len(),
            consumers: self.consumers.len(),
            remote_producers: self.remote_producers.len(),
        }
    }

    fn owned_transport(&self, transport_id: &str, connection_id: &str) -> Result<&TransportRecord> {
        match self.transports.get(transport_id) {
            Some(t) if t.connection_id == connection_id => Ok(t),
            _ => Err(AppError::NotFound(format!("transport {}", transport_id))),
        }
    }
}
