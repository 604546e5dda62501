//! Participant-side media stack model
//!
//! [`Device`] negotiates codecs against the router and builds
//! [`LocalTransport`]s; transports turn [`MediaTrack`]s into producers and
//! consume answers into consumers. Everything that needs the server goes
//! through the session's event bus.

pub mod device;
pub mod track;
pub mod transport;

pub use device::Device;
pub use track::{LocalConsumer, LocalProducer, MediaTrack};
pub use transport::LocalTransport;
