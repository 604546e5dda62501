//! Signaling wire protocol
//!
//! Envelope framing, request/notification names and the media descriptors
//! carried inside them. Both the server and the participant side speak this
//! protocol; nothing here performs I/O.

pub mod protocol;
pub mod types;

pub use protocol::{
    CloseProducerRequest, ConnectTransportRequest, ConsumeRequest, Envelope, Inbound,
    MalformedEnvelope, NotificationKind, ProduceRequest, ProduceResponse, ProducerNotification,
    RequestKind, ResumeConsumerRequest,
};
pub use types::{
    default_media_codecs, ConsumerOptions, DtlsFingerprint, DtlsParameters, DtlsRole,
    IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpParameters, TransportOptions,
};
