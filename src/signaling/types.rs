//! Media descriptors exchanged during negotiation
//!
//! Shapes follow the mediasoup JSON conventions (camelCase field names) so a
//! browser running mediasoup-client can talk to this server unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Media kind of a track, producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// A codec the router (or a device) is able to handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

impl RtpCodecCapability {
    /// Codec identity used for compatibility checks (mime type + clock rate)
    pub fn matches(&self, mime_type: &str, clock_rate: u32) -> bool {
        self.mime_type.eq_ignore_ascii_case(mime_type) && self.clock_rate == clock_rate
    }
}

/// RTP capabilities: what a router or device can send and receive
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    pub fn supports(&self, mime_type: &str, clock_rate: u32) -> bool {
        self.codecs.iter().any(|c| c.matches(mime_type, clock_rate))
    }

    pub fn codec_for(&self, kind: MediaKind) -> Option<&RtpCodecCapability> {
        self.codecs.iter().find(|c| c.kind == kind)
    }
}

/// Codec negotiated for a concrete RTP stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

/// RTP parameters of a producer or consumer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub encodings: Vec<Value>,
}

impl RtpParameters {
    /// Primary codec of the stream
    pub fn primary_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.first()
    }
}

/// DTLS role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

/// DTLS certificate fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

impl DtlsFingerprint {
    /// SHA-256 fingerprint over fresh random key material
    ///
    /// Formatted like a certificate fingerprint (`AB:CD:...`).
    pub fn generate() -> Self {
        use rand::RngCore;
        use sha2::{Digest, Sha256};

        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let digest = Sha256::digest(seed);
        let value = digest
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");

        Self {
            algorithm: "sha-256".to_string(),
            value,
        }
    }
}

/// DTLS parameters sent when connecting a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<DtlsRole>,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// ICE parameters of a server-side transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_lite: Option<bool>,
}

/// ICE candidate of a server-side transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
}

/// Parameters a client needs to build its local transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Parameters a client needs to build its local consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerOptions {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default = "default_true")]
    pub paused: bool,
}

fn default_true() -> bool {
    true
}

/// Default codec set: Opus for audio, VP8 and H264 for video
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    let mut h264_params = Map::new();
    h264_params.insert("packetization-mode".to_string(), Value::from(1));
    h264_params.insert("profile-level-id".to_string(), Value::from("42e01f"));
    h264_params.insert("level-asymmetry-allowed".to_string(), Value::from(1));

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48_000,
            channels: Some(2),
            parameters: Map::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90_000,
            channels: None,
            parameters: Map::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: None,
            clock_rate: 90_000,
            channels: None,
            parameters: h264_params,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_match_ignores_mime_case() {
        let codecs = default_media_codecs();
        let caps = RtpCapabilities {
            codecs,
            header_extensions: vec![],
        };
        assert!(caps.supports("video/vp8", 90_000));
        assert!(caps.supports("AUDIO/OPUS", 48_000));
        assert!(!caps.supports("audio/opus", 8_000));
        assert!(!caps.supports("video/AV1", 90_000));
    }

    #[test]
    fn test_transport_options_wire_shape() {
        let options = TransportOptions {
            id: "t1".to_string(),
            ice_parameters: IceParameters {
                username_fragment: "ufrag".to_string(),
                password: "pwd".to_string(),
                ice_lite: Some(true),
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1076302079,
                ip: "127.0.0.1".to_string(),
                protocol: "udp".to_string(),
                port: 40000,
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: Some(DtlsRole::Auto),
                fingerprints: vec![],
            },
        };

        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["iceParameters"]["usernameFragment"], "ufrag");
        assert_eq!(json["iceCandidates"][0]["type"], "host");
        assert_eq!(json["dtlsParameters"]["role"], "auto");
    }

    #[test]
    fn test_generated_fingerprint_format() {
        let fp = DtlsFingerprint::generate();
        assert_eq!(fp.algorithm, "sha-256");
        // 32 bytes as hex pairs separated by colons
        assert_eq!(fp.value.len(), 32 * 3 - 1);
        assert_ne!(fp.value, DtlsFingerprint::generate().value);
    }

    #[test]
    fn test_consumer_options_default_paused() {
        let options: ConsumerOptions = serde_json::from_value(serde_json::json!({
            "id": "c1",
            "producerId": "p1",
            "kind": "video",
            "rtpParameters": { "codecs": [] }
        }))
        .unwrap();
        assert!(options.paused);
        assert_eq!(options.kind, MediaKind::Video);
    }
}
