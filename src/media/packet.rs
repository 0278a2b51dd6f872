//! Protocol-agnostic media packet
//!
//! A `Packet` is what the hub stores and fans out. Payloads are `Bytes`, so
//! cloning a packet for each subscriber shares the underlying buffer.

use bytes::Bytes;

use super::flv;

/// Kind of media carried by a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Audio,
    Video,
    /// AMF0-encoded `onMetaData` data message body
    Metadata,
}

/// One audio or video access unit, or stream metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    /// Absolute timestamp in milliseconds (32-bit, wraps)
    pub timestamp: u32,
    pub payload: Bytes,
    is_keyframe: bool,
    is_sequence_header: bool,
}

impl Packet {
    pub fn audio(timestamp: u32, payload: Bytes) -> Self {
        let is_sequence_header = flv::is_audio_sequence_header(&payload);
        Self {
            kind: PacketKind::Audio,
            timestamp,
            payload,
            is_keyframe: false,
            is_sequence_header,
        }
    }

    pub fn video(timestamp: u32, payload: Bytes) -> Self {
        let is_sequence_header = flv::is_video_sequence_header(&payload);
        // A sequence header carries the keyframe bit but is not a frame
        let is_keyframe = !is_sequence_header && flv::is_video_keyframe(&payload);
        Self {
            kind: PacketKind::Video,
            timestamp,
            payload,
            is_keyframe,
            is_sequence_header,
        }
    }

    pub fn metadata(timestamp: u32, payload: Bytes) -> Self {
        Self {
            kind: PacketKind::Metadata,
            timestamp,
            payload,
            is_keyframe: false,
            is_sequence_header: false,
        }
    }

    /// Video keyframe (never true for audio, metadata or sequence headers)
    pub fn is_keyframe(&self) -> bool {
        self.is_keyframe
    }

    /// Codec configuration record that must precede decodable frames
    pub fn is_sequence_header(&self) -> bool {
        self.is_sequence_header
    }

    pub fn is_video(&self) -> bool {
        self.kind == PacketKind::Video
    }

    pub fn is_audio(&self) -> bool {
        self.kind == PacketKind::Audio
    }

    pub fn is_metadata(&self) -> bool {
        self.kind == PacketKind::Metadata
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
