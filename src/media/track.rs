//! Local tracks and the producer/consumer handles built from them

use serde::Serialize;

use crate::signaling::{MediaKind, RtpParameters};

/// A captured local track
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    pub label: String,
}

impl MediaTrack {
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
        }
    }

    pub fn audio(label: impl Into<String>) -> Self {
        Self::new(MediaKind::Audio, label)
    }

    pub fn video(label: impl Into<String>) -> Self {
        Self::new(MediaKind::Video, label)
    }
}

/// Outgoing track handle, created once the server accepted the produce
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalProducer {
    pub id: String,
    pub track_id: String,
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Incoming track handle mirroring a remote producer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalConsumer {
    pub id: String,
    pub producer_id: String,
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}
