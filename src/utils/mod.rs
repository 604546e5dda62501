//! Utility modules shared by the client and server halves

pub mod logging;
pub mod throttle;

pub use logging::{init_logging, LogLevel};
pub use throttle::LogThrottler;
