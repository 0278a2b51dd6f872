//! FLV audio/video tag header classification
//!
//! RTMP audio and video payloads are FLV tag bodies. The first byte (and for
//! AVC/HEVC/AAC the second) tells us everything the hub needs: whether a
//! video frame is a keyframe and whether a payload is a codec sequence header.
//!
//! ```text
//! Video: | FrameType(4) | CodecID(4) | AVCPacketType(8) | ...
//! Audio: | SoundFormat(4) | Rate(2) | Size(1) | Type(1) | AACPacketType(8) | ...
//! ```
//!
//! Enhanced RTMP video sets the top bit of the first byte; the remaining
//! bits are then `FrameType(3) | PacketType(4)` followed by a FourCC.

/// Video frame type (upper 4 bits of the first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    Keyframe = 1,
    InterFrame = 2,
    DisposableInterFrame = 3,
    GeneratedKeyframe = 4,
    VideoInfoFrame = 5,
}

impl VideoFrameType {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(VideoFrameType::Keyframe),
            2 => Some(VideoFrameType::InterFrame),
            3 => Some(VideoFrameType::DisposableInterFrame),
            4 => Some(VideoFrameType::GeneratedKeyframe),
            5 => Some(VideoFrameType::VideoInfoFrame),
            _ => None,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        if b & 0x80 != 0 {
            Self::from_bits((b >> 4) & 0x07)
        } else {
            Self::from_bits((b >> 4) & 0x0F)
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(
            self,
            VideoFrameType::Keyframe | VideoFrameType::GeneratedKeyframe
        )
    }
}

/// Legacy video codec ID (lower 4 bits of the first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    SorensonH263 = 2,
    ScreenVideo = 3,
    Vp6 = 4,
    Vp6Alpha = 5,
    ScreenVideoV2 = 6,
    Avc = 7,
    /// Non-standard but widely deployed
    Hevc = 12,
}

impl VideoCodec {
    pub fn from_byte(b: u8) -> Option<Self> {
        if b & 0x80 != 0 {
            return None;
        }
        match b & 0x0F {
            2 => Some(VideoCodec::SorensonH263),
            3 => Some(VideoCodec::ScreenVideo),
            4 => Some(VideoCodec::Vp6),
            5 => Some(VideoCodec::Vp6Alpha),
            6 => Some(VideoCodec::ScreenVideoV2),
            7 => Some(VideoCodec::Avc),
            12 => Some(VideoCodec::Hevc),
            _ => None,
        }
    }

    /// Codecs whose second byte is a packet type (0 = sequence header)
    fn has_packet_type(&self) -> bool {
        matches!(self, VideoCodec::Avc | VideoCodec::Hevc)
    }
}

/// Audio sound format (upper 4 bits of the first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    LinearPcmPlatform = 0,
    Adpcm = 1,
    Mp3 = 2,
    LinearPcmLe = 3,
    Nellymoser16kMono = 4,
    Nellymoser8kMono = 5,
    Nellymoser = 6,
    G711ALaw = 7,
    G711MuLaw = 8,
    Aac = 10,
    Speex = 11,
    Mp38k = 14,
    DeviceSpecific = 15,
}

impl AudioFormat {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            0 => Some(AudioFormat::LinearPcmPlatform),
            1 => Some(AudioFormat::Adpcm),
            2 => Some(AudioFormat::Mp3),
            3 => Some(AudioFormat::LinearPcmLe),
            4 => Some(AudioFormat::Nellymoser16kMono),
            5 => Some(AudioFormat::Nellymoser8kMono),
            6 => Some(AudioFormat::Nellymoser),
            7 => Some(AudioFormat::G711ALaw),
            8 => Some(AudioFormat::G711MuLaw),
            10 => Some(AudioFormat::Aac),
            11 => Some(AudioFormat::Speex),
            14 => Some(AudioFormat::Mp38k),
            15 => Some(AudioFormat::DeviceSpecific),
            _ => None,
        }
    }
}

// Enhanced RTMP packet type for a codec configuration record
const EX_PACKET_TYPE_SEQUENCE_START: u8 = 0;

pub fn is_video_keyframe(data: &[u8]) -> bool {
    data.first()
        .and_then(|b| VideoFrameType::from_byte(*b))
        .map(|ft| ft.is_keyframe())
        .unwrap_or(false)
}

/// AVC/HEVC decoder configuration record, legacy or enhanced framing
pub fn is_video_sequence_header(data: &[u8]) -> bool {
    let Some(&first) = data.first() else {
        return false;
    };
    if first & 0x80 != 0 {
        return first & 0x0F == EX_PACKET_TYPE_SEQUENCE_START;
    }
    match (VideoCodec::from_byte(first), data.get(1)) {
        (Some(codec), Some(&packet_type)) => codec.has_packet_type() && packet_type == 0,
        _ => false,
    }
}

/// AAC AudioSpecificConfig
pub fn is_audio_sequence_header(data: &[u8]) -> bool {
    match (data.first().and_then(|b| AudioFormat::from_byte(*b)), data.get(1)) {
        (Some(AudioFormat::Aac), Some(&packet_type)) => packet_type == 0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_frame_type() {
        assert_eq!(VideoFrameType::from_byte(0x17), Some(VideoFrameType::Keyframe));
        assert_eq!(VideoFrameType::from_byte(0x27), Some(VideoFrameType::InterFrame));
        assert_eq!(VideoFrameType::from_byte(0x00), None);
        assert!(VideoFrameType::GeneratedKeyframe.is_keyframe());
        assert!(!VideoFrameType::DisposableInterFrame.is_keyframe());
    }

    #[test]
    fn test_avc_sequence_header() {
        assert!(is_video_sequence_header(&[0x17, 0x00, 0x00, 0x00, 0x00]));
        assert!(is_video_keyframe(&[0x17, 0x00, 0x00, 0x00, 0x00]));
        assert!(!is_video_sequence_header(&[0x17, 0x01, 0x00, 0x00, 0x00]));
        // Single byte is not enough to tell
        assert!(!is_video_sequence_header(&[0x17]));
    }

    #[test]
    fn test_hevc_and_enhanced_headers() {
        assert!(is_video_sequence_header(&[0x1C, 0x00]));
        assert_eq!(VideoCodec::from_byte(0x1C), Some(VideoCodec::Hevc));

        // Enhanced: keyframe + SequenceStart + 'hvc1'
        let ex_seq = [0x90, b'h', b'v', b'c', b'1'];
        assert!(is_video_sequence_header(&ex_seq));
        assert!(is_video_keyframe(&ex_seq));

        // Enhanced: inter frame + CodedFrames
        let ex_frame = [0xA1, b'h', b'v', b'c', b'1'];
        assert!(!is_video_sequence_header(&ex_frame));
        assert!(!is_video_keyframe(&ex_frame));
    }

    #[test]
    fn test_non_avc_never_sequence_header() {
        // VP6 keyframe with a zero second byte
        assert!(!is_video_sequence_header(&[0x14, 0x00]));
        assert!(is_video_keyframe(&[0x14, 0x00]));
    }

    #[test]
    fn test_aac_sequence_header() {
        assert!(is_audio_sequence_header(&[0xAF, 0x00, 0x12, 0x10]));
        assert!(!is_audio_sequence_header(&[0xAF, 0x01, 0x21, 0x00]));
        assert!(!is_audio_sequence_header(&[0x2F, 0x00]));
        assert!(!is_audio_sequence_header(&[]));
    }

    #[test]
    fn test_audio_format() {
        assert_eq!(AudioFormat::from_byte(0xAF), Some(AudioFormat::Aac));
        assert_eq!(AudioFormat::from_byte(0x2F), Some(AudioFormat::Mp3));
        assert_eq!(AudioFormat::from_byte(0x90), None);
    }
}
