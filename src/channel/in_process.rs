//! Connector that attaches straight to an in-process room

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::link::{Connector, Link};
use crate::error::{AppError, Result};
use crate::server::{serve, Room, ServerSession};

/// Runs the server side of each link as a task against a [`Room`]
///
/// Besides embedding client and server in one process, it can sever every
/// live link and refuse upcoming connects, which is how reconnection is
/// exercised without a network.
pub struct InProcessConnector {
    room: Arc<Room>,
    links: Mutex<Vec<CancellationToken>>,
    refuse: AtomicUsize,
}

impl InProcessConnector {
    pub fn new(room: Arc<Room>) -> Self {
        Self {
            room,
            links: Mutex::new(Vec::new()),
            refuse: AtomicUsize::new(0),
        }
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    /// Number of links still being served
    pub fn live_links(&self) -> usize {
        self.links.lock().iter().filter(|link| !link.is_cancelled()).count()
    }

    /// Drop every live link from the server side
    pub fn sever_all(&self) {
        let links: Vec<CancellationToken> = self.links.lock().drain(..).collect();
        debug!("Severing {} in-process links", links.len());
        for token in links {
            token.cancel();
        }
    }

    /// Refuse the next `n` connect attempts
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for InProcessConnector {
    async fn connect(&self) -> Result<Link> {
        if self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AppError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "in-process connection refused",
            )));
        }

        let (client, server) = Link::pair();
        let session = ServerSession::join(self.room.clone(), server.outgoing.clone());
        let token = CancellationToken::new();
        {
            let mut links = self.links.lock();
            links.retain(|link| !link.is_cancelled());
            links.push(token.clone());
        }
        let link_token = token.clone();
        tokio::spawn(async move {
            serve(session, server, link_token).await;
            // Mark the link finished so the next connect prunes it
            token.cancel();
        });
        Ok(client)
    }
}
