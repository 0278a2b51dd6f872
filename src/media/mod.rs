//! Media handling for the hub
//!
//! - FLV tag header classification (keyframes, sequence headers)
//! - the protocol-agnostic `Packet`
//! - GOP caching for late-joiner support

pub mod flv;
pub mod gop;
pub mod packet;

pub use gop::GopCache;
pub use packet::{Packet, PacketKind};
