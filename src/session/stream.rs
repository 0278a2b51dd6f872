//! Per-message-stream state
//!
//! Each RTMP message stream (created by `createStream`) is either idle,
//! publishing into the hub, or playing out of it.

use std::time::Instant;

use crate::media::{Packet, PacketKind};

/// Stream mode (publishing or playing)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Created but not publishing or playing yet
    Idle,
    Publishing,
    Playing,
}

/// State of one message stream
#[derive(Debug)]
pub struct MessageStream {
    /// Message stream ID
    pub id: u32,

    pub mode: StreamMode,

    /// Stream name from publish/play
    pub stream_key: Option<String>,

    /// Publish type ("live", "record", "append")
    pub publish_type: Option<String>,

    pub started_at: Option<Instant>,

    /// Player asked us to stop writing (pause)
    pub paused: bool,

    /// receiveAudio flag
    pub receive_audio: bool,

    /// receiveVideo flag
    pub receive_video: bool,

    /// Withhold video frames until the next keyframe
    pub awaiting_keyframe: bool,

    pub video_frames: u64,
    pub audio_frames: u64,
    pub keyframes: u64,
    pub bytes: u64,
}

impl MessageStream {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            mode: StreamMode::Idle,
            stream_key: None,
            publish_type: None,
            started_at: None,
            paused: false,
            receive_audio: true,
            receive_video: true,
            awaiting_keyframe: false,
            video_frames: 0,
            audio_frames: 0,
            keyframes: 0,
            bytes: 0,
        }
    }

    pub fn start_publish(&mut self, stream_key: String, publish_type: String) {
        self.mode = StreamMode::Publishing;
        self.stream_key = Some(stream_key);
        self.publish_type = Some(publish_type);
        self.started_at = Some(Instant::now());
    }

    pub fn start_play(&mut self, stream_key: String) {
        self.mode = StreamMode::Playing;
        self.stream_key = Some(stream_key);
        self.started_at = Some(Instant::now());
        self.paused = false;
        self.awaiting_keyframe = false;
    }

    /// Back to idle (unpublish, closeStream)
    pub fn stop(&mut self) {
        self.mode = StreamMode::Idle;
        self.stream_key = None;
        self.publish_type = None;
        self.started_at = None;
        self.paused = false;
    }

    pub fn is_publishing(&self) -> bool {
        self.mode == StreamMode::Publishing
    }

    pub fn is_playing(&self) -> bool {
        self.mode == StreamMode::Playing
    }

    pub fn set_paused(&mut self, paused: bool) {
        if self.paused && !paused {
            // Resuming mid-GOP would hand the decoder frames it can't use
            self.awaiting_keyframe = true;
        }
        self.paused = paused;
    }

    pub fn set_receive_video(&mut self, enabled: bool) {
        if enabled && !self.receive_video {
            self.awaiting_keyframe = true;
        }
        self.receive_video = enabled;
    }

    pub fn set_receive_audio(&mut self, enabled: bool) {
        self.receive_audio = enabled;
    }

    /// Count an incoming media packet on a publishing stream
    pub fn record(&mut self, packet: &Packet) {
        self.bytes += packet.size() as u64;
        match packet.kind {
            PacketKind::Video => {
                self.video_frames += 1;
                if packet.is_keyframe() {
                    self.keyframes += 1;
                }
            }
            PacketKind::Audio => self.audio_frames += 1,
            PacketKind::Metadata => {}
        }
    }

    /// Whether a packet should be written to a playing client
    ///
    /// Packets are still consumed from the subscription while this returns
    /// `false`, so a paused player never overruns its queue.
    pub fn should_send(&mut self, packet: &Packet) -> bool {
        if self.paused {
            return false;
        }
        match packet.kind {
            PacketKind::Metadata => true,
            PacketKind::Audio => self.receive_audio,
            PacketKind::Video => {
                if !self.receive_video {
                    return false;
                }
                if packet.is_sequence_header() {
                    return true;
                }
                if self.awaiting_keyframe {
                    if !packet.is_keyframe() {
                        return false;
                    }
                    self.awaiting_keyframe = false;
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn keyframe(ts: u32) -> Packet {
        Packet::video(ts, Bytes::from_static(&[0x17, 0x01, 0x00]))
    }

    fn delta(ts: u32) -> Packet {
        Packet::video(ts, Bytes::from_static(&[0x27, 0x01, 0x00]))
    }

    fn audio(ts: u32) -> Packet {
        Packet::audio(ts, Bytes::from_static(&[0xAF, 0x01, 0x00]))
    }

    #[test]
    fn test_publish_lifecycle() {
        let mut stream = MessageStream::new(1);
        assert_eq!(stream.mode, StreamMode::Idle);

        stream.start_publish("cam".into(), "live".into());
        assert!(stream.is_publishing());
        assert_eq!(stream.stream_key.as_deref(), Some("cam"));

        stream.record(&keyframe(0));
        stream.record(&delta(33));
        stream.record(&audio(20));
        assert_eq!(stream.video_frames, 2);
        assert_eq!(stream.keyframes, 1);
        assert_eq!(stream.audio_frames, 1);
        assert_eq!(stream.bytes, 9);

        stream.stop();
        assert_eq!(stream.mode, StreamMode::Idle);
        assert!(stream.stream_key.is_none());
    }

    #[test]
    fn test_pause_withholds_until_keyframe() {
        let mut stream = MessageStream::new(1);
        stream.start_play("cam".into());
        assert!(stream.should_send(&delta(0)));

        stream.set_paused(true);
        assert!(!stream.should_send(&delta(1)));
        assert!(!stream.should_send(&audio(1)));

        stream.set_paused(false);
        assert!(!stream.should_send(&delta(2)));
        assert!(stream.should_send(&audio(2)));
        assert!(stream.should_send(&keyframe(3)));
        assert!(stream.should_send(&delta(4)));
    }

    #[test]
    fn test_receive_flags() {
        let mut stream = MessageStream::new(1);
        stream.start_play("cam".into());

        stream.set_receive_audio(false);
        assert!(!stream.should_send(&audio(0)));
        assert!(stream.should_send(&delta(0)));

        stream.set_receive_video(false);
        assert!(!stream.should_send(&keyframe(1)));

        stream.set_receive_video(true);
        assert!(!stream.should_send(&delta(2)));
        assert!(stream.should_send(&keyframe(3)));
    }

    #[test]
    fn test_sequence_header_passes_while_awaiting_keyframe() {
        let mut stream = MessageStream::new(1);
        stream.start_play("cam".into());
        stream.set_paused(true);
        stream.set_paused(false);

        let header = Packet::video(0, Bytes::from_static(&[0x17, 0x00, 0x00]));
        assert!(stream.should_send(&header));
        assert!(stream.awaiting_keyframe);
        assert!(stream.should_send(&Packet::metadata(0, Bytes::new())));
    }
}
