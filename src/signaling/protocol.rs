//! Signaling envelopes and request payloads
//!
//! Three envelope shapes share one JSON text channel:
//!
//! ```text
//! Request:      { "type": "...", "data": {...}, "requestId": "..." }
//! Response:     { "requestId": "...", "data"?: {...}, "error"?: "..." }
//! Notification: { "type": "...", "data": {...} }
//! ```
//!
//! The presence of `requestId` separates RPC traffic from push traffic.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use super::types::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters};

/// Request types understood by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestKind {
    GetRouterCapabilities,
    CreateProducerTransport,
    CreateConsumerTransport,
    ConnectProducerTransport,
    ConnectConsumerTransport,
    Produce,
    Consume,
    ResumeConsumer,
    CloseProducer,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::GetRouterCapabilities => "getRouterCapabilities",
            RequestKind::CreateProducerTransport => "createProducerTransport",
            RequestKind::CreateConsumerTransport => "createConsumerTransport",
            RequestKind::ConnectProducerTransport => "connectProducerTransport",
            RequestKind::ConnectConsumerTransport => "connectConsumerTransport",
            RequestKind::Produce => "produce",
            RequestKind::Consume => "consume",
            RequestKind::ResumeConsumer => "resumeConsumer",
            RequestKind::CloseProducer => "closeProducer",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown request type: {}", s))
    }
}

/// Notification types pushed by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    NewProducer,
    ProducerClosed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::NewProducer => "newProducer",
            NotificationKind::ProducerClosed => "producerClosed",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown notification type: {}", s))
    }
}

/// Raw envelope as it appears on the wire
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Classified inbound envelope
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Request {
        kind: String,
        request_id: String,
        data: Value,
    },
    Response {
        request_id: String,
        result: Result<Value, String>,
    },
    Notification {
        kind: String,
        data: Value,
    },
}

/// Reason an envelope could not be classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedEnvelope {
    NotJson(String),
    MissingType,
}

impl std::fmt::Display for MalformedEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MalformedEnvelope::NotJson(e) => write!(f, "unparseable envelope: {}", e),
            MalformedEnvelope::MissingType => write!(f, "envelope has neither type nor requestId"),
        }
    }
}

impl Envelope {
    pub fn request(kind: RequestKind, request_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind: Some(kind.as_str().to_string()),
            data: Some(data),
            request_id: Some(request_id.into()),
            error: None,
        }
    }

    pub fn success(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind: None,
            data: Some(data),
            request_id: Some(request_id.into()),
            error: None,
        }
    }

    pub fn failure(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            kind: None,
            data: None,
            request_id: Some(request_id.into()),
            error: Some(error.into()),
        }
    }

    pub fn notification(kind: NotificationKind, data: Value) -> Self {
        Self {
            kind: Some(kind.as_str().to_string()),
            data: Some(data),
            request_id: None,
            error: None,
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse and classify a text frame
    ///
    /// An envelope carrying both `type` and `requestId` is a request; one
    /// carrying only `requestId` is a response; one carrying only `type` is a
    /// notification.
    pub fn parse(text: &str) -> Result<Inbound, MalformedEnvelope> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| MalformedEnvelope::NotJson(e.to_string()))?;

        match (envelope.kind, envelope.request_id) {
            (Some(kind), Some(request_id)) => Ok(Inbound::Request {
                kind,
                request_id,
                data: envelope.data.unwrap_or(Value::Null),
            }),
            (None, Some(request_id)) => {
                let result = match envelope.error {
                    Some(error) => Err(error),
                    None => Ok(envelope.data.unwrap_or(Value::Null)),
                };
                Ok(Inbound::Response { request_id, result })
            }
            (Some(kind), None) => Ok(Inbound::Notification {
                kind,
                data: envelope.data.unwrap_or(Value::Null),
            }),
            (None, None) => Err(MalformedEnvelope::MissingType),
        }
    }
}

// ============================================================================
// Request / response payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub transport_id: String,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProduceResponse {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub transport_id: String,
    pub producer_id: String,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConsumerRequest {
    pub consumer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseProducerRequest {
    pub producer_id: String,
}

/// Payload of `newProducer` and `producerClosed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerNotification {
    pub producer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
}
