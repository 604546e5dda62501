//! Command-line participant
//!
//! Joins a room, publishes a microphone and a camera track and consumes
//! whatever the other peers publish until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;

use mediaroom::channel::WebSocketConnector;
use mediaroom::client::ClientSession;
use mediaroom::config::ConfigStore;
use mediaroom::events::{EventName, SessionEvent};
use mediaroom::media::{Device, MediaTrack};
use mediaroom::utils::{init_logging, LogLevel};

#[derive(Parser, Debug)]
#[command(name = "mediaroom-participant")]
#[command(version, about = "Join a mediaroom server as a publishing participant", long_about = None)]
struct CliArgs {
    /// Path to a TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Signaling endpoint (overrides config file)
    #[arg(short = 'u', long, value_name = "URL")]
    url: Option<String>,

    /// Room to join, appended to the endpoint
    #[arg(short = 'r', long)]
    room: Option<String>,

    /// Do not publish an audio track
    #[arg(long)]
    no_audio: bool,

    /// Do not publish a video track
    #[arg(long)]
    no_video: bool,

    /// Log level
    #[arg(short = 'l', long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v verbose, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

enum ChannelSignal {
    Reopened,
    GaveUp,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    let config = ConfigStore::load(args.config.as_deref()).await?.get();
    let mut url = args.url.unwrap_or_else(|| config.client.server_url.clone());
    if let Some(room) = &args.room {
        url = format!("{}/{}", url.trim_end_matches('/'), room);
    }

    let tracks = || {
        let mut tracks = Vec::new();
        if !args.no_audio {
            tracks.push(MediaTrack::audio("microphone"));
        }
        if !args.no_video {
            tracks.push(MediaTrack::video("camera"));
        }
        tracks
    };

    tracing::info!("Joining {}", url);
    let connector = Arc::new(WebSocketConnector::new(url));
    let session = ClientSession::connect(config.channel, connector, Device::default()).await?;

    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let reopened = signal_tx.clone();
    session.bus().on(EventName::ChannelOpen, move |_| {
        let _ = reopened.send(ChannelSignal::Reopened);
    });
    session.bus().on(EventName::ChannelDisconnected, move |_| {
        let _ = signal_tx.send(ChannelSignal::GaveUp);
    });
    session.bus().on(EventName::NewProducer, |event| {
        if let SessionEvent::NewProducer { producer_id, kind } = event {
            match kind {
                Some(kind) => tracing::info!("Remote {} producer {} announced", kind, producer_id),
                None => tracing::info!("Remote producer {} announced", producer_id),
            }
        }
    });

    negotiate(&session, tracks()).await?;

    let result = loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
                tracing::info!("Leaving room");
                break Ok(());
            }
            signal = signal_rx.recv() => match signal {
                Some(ChannelSignal::Reopened) => {
                    tracing::info!("Channel reopened, negotiating again");
                    if let Err(e) = negotiate(&session, tracks()).await {
                        tracing::error!("Renegotiation failed: {}", e);
                    }
                }
                Some(ChannelSignal::GaveUp) | None => {
                    break Err(anyhow::anyhow!("lost the signaling server"));
                }
            }
        }
    };

    session.close();
    result
}

async fn negotiate(session: &ClientSession, tracks: Vec<MediaTrack>) -> anyhow::Result<()> {
    session.load_capabilities().await?;
    session.create_send_transport().await?;
    for track in tracks {
        let label = track.label.clone();
        let producer = session.produce(track).await?;
        tracing::info!("Publishing {} as producer {}", label, producer.id);
    }
    Ok(())
}
