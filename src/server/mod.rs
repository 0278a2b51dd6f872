//! RTMP server: listener, per-connection driver and application hooks

pub mod config;
pub mod connection;
pub mod handler;
pub mod listener;

pub use config::ServerConfig;
pub use connection::Connection;
pub use handler::{AcceptAll, DisconnectReason, RtmpHandler};
pub use listener::{supervise, RtmpServer};
