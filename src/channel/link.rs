//! Transport-agnostic duplex link
//!
//! A [`Link`] is one live connection carrying text frames in both
//! directions. The channel only ever sees links; how they are made is up to
//! a [`Connector`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};

/// One live duplex connection
///
/// Dropping `outgoing` closes the link from this side. `incoming` yields
/// `None` once the other side is gone.
#[derive(Debug)]
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

impl Link {
    /// Two links wired back to back
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Link {
                outgoing: a_tx,
                incoming: b_rx,
            },
            Link {
                outgoing: b_tx,
                incoming: a_rx,
            },
        )
    }
}

/// Opens links on demand (initial connect and every reconnect attempt)
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Link>;
}

/// Connects to a signaling server over WebSocket
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Link> {
        let (ws_stream, _) = connect_async(self.url.as_str()).await.map_err(|e| {
            AppError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("failed to connect to {}: {}", self.url, e),
            ))
        })?;
        info!("Connected to signaling server {}", self.url);

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!("WebSocket send failed: {}", e);
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
            debug!("WebSocket writer stopped");
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("WebSocket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket receive failed: {}", e);
                        break;
                    }
                }
            }
            debug!("WebSocket reader stopped");
        });

        Ok(Link {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_pair_is_crossed() {
        let (mut a, mut b) = Link::pair();
        a.outgoing.send("ping".to_string()).unwrap();
        b.outgoing.send("pong".to_string()).unwrap();
        assert_eq!(b.incoming.recv().await.as_deref(), Some("ping"));
        assert_eq!(a.incoming.recv().await.as_deref(), Some("pong"));

        drop(a);
        assert!(b.incoming.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_websocket_connect_failure_is_reported() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:1/ws");
        assert!(matches!(connector.connect().await, Err(AppError::Io(_))));
    }
}
