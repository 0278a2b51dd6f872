//! RTMP ingest and stream distribution hub
//!
//! Publishers push audio/video over RTMP; the hub caches the current group
//! of pictures per stream and fans every packet out to any number of
//! subscribers through bounded per-subscriber queues. RTMP players are one
//! kind of subscriber; packagers, relays and admin tools subscribe to the
//! same [`StreamRegistry`] directly.
//!
//! ```no_run
//! use rtmp_hub::{AcceptAll, RtmpServer, ServerConfig};
//!
//! # async fn serve() -> rtmp_hub::Result<()> {
//! let server = RtmpServer::new(ServerConfig::default(), AcceptAll);
//! server.run_until(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! }).await
//! # }
//! ```

pub mod amf;
pub mod error;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use error::{Error, Result};
pub use media::{Packet, PacketKind};
pub use registry::{
    Capabilities, CloseReason, RegistryConfig, StreamKey, StreamRegistry, Subscription,
};
pub use server::{AcceptAll, RtmpHandler, RtmpServer, ServerConfig};
