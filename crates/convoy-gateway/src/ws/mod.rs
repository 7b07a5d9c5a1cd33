pub mod connection;
pub mod dispatch;
pub mod generation;
pub mod handshake;
pub mod heartbeat;
pub mod registry;
pub mod replay;
pub mod session;
pub mod stream;
pub mod tool_events;
