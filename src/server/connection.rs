use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::session::ServerSession;
use crate::channel::Link;

/// Serve one joined connection until the link closes or `shutdown` fires
///
/// `session` must have joined with the sending half of `link`. Frames are
/// handled strictly one after another; a response is written before the next
/// frame is read. The session is closed on the way out.
pub async fn serve(session: ServerSession, link: Link, shutdown: CancellationToken) {
    let Link {
        outgoing,
        mut incoming,
    } = link;

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Connection {} stopped by shutdown", session.id());
                break;
            }
            frame = incoming.recv() => frame,
        };
        let Some(text) = frame else { break };

        if let Some(reply) = session.handle_text(&text).await {
            if outgoing.send(reply).is_err() {
                break;
            }
        }
    }

    session.close().await;
}
