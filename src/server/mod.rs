//! Server session controller
//!
//! Every accepted connection gets a [`ServerSession`] joined to a [`Room`].
//! [`serve`] runs the per-connection loop on top of any [`Link`](crate::channel::Link),
//! so the WebSocket route and the in-process connector share one code path.

pub mod connection;
pub mod room;
pub mod session;

pub use connection::serve;
pub use room::{Room, RoomInfo, RoomManager, DEFAULT_ROOM};
pub use session::ServerSession;
