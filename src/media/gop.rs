//! GOP (Group of Pictures) cache for late-joiner support
//!
//! A new subscriber needs the codec sequence headers, then the most recent
//! keyframe and everything since, to start decoding without waiting for the
//! next keyframe. The cache holds exactly that:
//!
//! ```text
//! [metadata] [video seq header] [audio seq header] [keyframe, frame, frame, ...]
//! ```
//!
//! The frame window is bounded by packet count. On overflow the oldest
//! packet is dropped and the cache is flagged degraded until the next
//! keyframe starts a fresh window.

use std::collections::VecDeque;

use super::packet::{Packet, PacketKind};

/// Per-stream replay buffer
#[derive(Debug)]
pub struct GopCache {
    max_packets: usize,
    metadata: Option<Packet>,
    video_header: Option<Packet>,
    audio_header: Option<Packet>,
    /// Frames from the last keyframe onward
    packets: VecDeque<Packet>,
    has_keyframe: bool,
    degraded: bool,
}

impl GopCache {
    pub fn new(max_packets: usize) -> Self {
        Self {
            max_packets: max_packets.max(1),
            metadata: None,
            video_header: None,
            audio_header: None,
            packets: VecDeque::new(),
            has_keyframe: false,
            degraded: false,
        }
    }

    /// Route a packet to the right slot
    ///
    /// Returns `true` when this packet caused the window to start dropping
    /// frames (the transition into the degraded state).
    pub fn push(&mut self, packet: Packet) -> bool {
        if packet.is_metadata() {
            self.metadata = Some(packet);
            return false;
        }
        if packet.is_sequence_header() {
            self.on_sequence_header(packet);
            return false;
        }
        self.on_packet(packet)
    }

    /// Store or replace the standing header for the packet's kind
    pub fn on_sequence_header(&mut self, packet: Packet) {
        match packet.kind {
            PacketKind::Video => self.video_header = Some(packet),
            PacketKind::Audio => self.audio_header = Some(packet),
            PacketKind::Metadata => self.metadata = Some(packet),
        }
    }

    /// Append a frame, opening a new window on a video keyframe
    ///
    /// Frames arriving before the first keyframe are not cached: a late
    /// joiner could not decode them anyway.
    pub fn on_packet(&mut self, packet: Packet) -> bool {
        if packet.is_keyframe() {
            self.packets.clear();
            self.has_keyframe = true;
            self.degraded = false;
        } else if !self.has_keyframe {
            return false;
        }

        let mut became_degraded = false;
        if self.packets.len() >= self.max_packets {
            self.packets.pop_front();
            if !self.degraded {
                self.degraded = true;
                became_degraded = true;
            }
        }
        self.packets.push_back(packet);
        became_degraded
    }

    /// Exact sequence a newly joined subscriber receives before live packets
    pub fn snapshot(&self) -> Vec<Packet> {
        let mut out = Vec::with_capacity(self.packets.len() + 3);
        out.extend(self.metadata.iter().cloned());
        out.extend(self.video_header.iter().cloned());
        out.extend(self.audio_header.iter().cloned());
        out.extend(self.packets.iter().cloned());
        out
    }

    /// Standing metadata and sequence headers only
    pub fn headers(&self) -> Vec<Packet> {
        let mut out = Vec::with_capacity(3);
        out.extend(self.metadata.iter().cloned());
        out.extend(self.video_header.iter().cloned());
        out.extend(self.audio_header.iter().cloned());
        out
    }

    /// Number of frames in the current window (headers excluded)
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Whether frames of the current GOP have been dropped
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Drop frames but keep headers and metadata
    pub fn clear_frames(&mut self) {
        self.packets.clear();
        self.has_keyframe = false;
        self.degraded = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn video_header() -> Packet {
        Packet::video(0, Bytes::from_static(&[0x17, 0x00, 0x00, 0x00, 0x00]))
    }

    fn audio_header() -> Packet {
        Packet::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]))
    }

    fn keyframe(ts: u32) -> Packet {
        Packet::video(ts, Bytes::from_static(&[0x17, 0x01, 0x00, 0x00, 0x00]))
    }

    fn delta(ts: u32) -> Packet {
        Packet::video(ts, Bytes::from_static(&[0x27, 0x01, 0x00, 0x00, 0x00]))
    }

    fn audio(ts: u32) -> Packet {
        Packet::audio(ts, Bytes::from_static(&[0xAF, 0x01, 0x21]))
    }

    #[test]
    fn test_new_keyframe_discards_previous_gop() {
        let mut cache = GopCache::new(1024);
        cache.push(video_header());
        cache.push(keyframe(0));
        cache.push(delta(33));
        cache.push(delta(66));
        cache.push(keyframe(100));

        assert_eq!(cache.snapshot(), vec![video_header(), keyframe(100)]);
    }

    #[test]
    fn test_snapshot_order() {
        let mut cache = GopCache::new(1024);
        let meta = Packet::metadata(0, Bytes::from_static(b"meta"));
        cache.push(audio_header());
        cache.push(video_header());
        cache.push(meta.clone());
        cache.push(keyframe(0));
        cache.push(audio(10));
        cache.push(delta(33));

        assert_eq!(
            cache.snapshot(),
            vec![meta, video_header(), audio_header(), keyframe(0), audio(10), delta(33)]
        );
    }

    #[test]
    fn test_frames_before_first_keyframe_not_cached() {
        let mut cache = GopCache::new(16);
        cache.push(video_header());
        cache.push(delta(0));
        cache.push(audio(5));
        assert!(cache.is_empty());

        cache.push(keyframe(40));
        cache.push(audio(45));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_header_replacement() {
        let mut cache = GopCache::new(16);
        cache.push(video_header());
        let new_header = Packet::video(500, Bytes::from_static(&[0x17, 0x00, 0x00, 0x00, 0x01]));
        cache.push(new_header.clone());
        assert_eq!(cache.headers(), vec![new_header]);
    }

    #[test]
    fn test_overflow_drops_oldest_and_degrades() {
        let mut cache = GopCache::new(3);
        cache.push(keyframe(0));
        cache.push(delta(1));
        cache.push(delta(2));
        assert!(!cache.is_degraded());

        assert!(cache.push(delta(3)));
        assert!(cache.is_degraded());
        // Only the first overflow reports the transition
        assert!(!cache.push(delta(4)));

        let ts: Vec<u32> = cache.snapshot().iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, vec![2, 3, 4]);

        // Next keyframe restores fidelity
        cache.push(keyframe(5));
        assert!(!cache.is_degraded());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear_frames_keeps_headers() {
        let mut cache = GopCache::new(16);
        cache.push(video_header());
        cache.push(audio_header());
        cache.push(keyframe(0));
        cache.clear_frames();

        assert_eq!(cache.snapshot(), vec![video_header(), audio_header()]);
        // A delta after clearing waits for a keyframe again
        cache.push(delta(10));
        assert!(cache.is_empty());
    }
}
