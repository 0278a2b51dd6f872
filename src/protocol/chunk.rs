//! RTMP chunk stream codec
//!
//! Messages travel as chunks of at most `chunk_size` payload bytes. Chunks of
//! different chunk streams (csid) interleave freely, so the decoder keeps
//! header and reassembly state per csid.
//!
//! ```text
//! +--------------+----------------+--------------------+------------+
//! | Basic Header | Message Header | Extended Timestamp | Chunk Data |
//! | 1-3 bytes    | 0/3/7/11 bytes | 0 or 4 bytes       | <= size    |
//! +--------------+----------------+--------------------+------------+
//! ```
//!
//! Header format (fmt) 0 carries everything, 1 drops the stream id, 2 keeps
//! only a timestamp delta, 3 carries nothing and inherits the previous header.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::constants::{
    DEFAULT_CHUNK_SIZE, EXTENDED_TIMESTAMP, MAX_CHUNK_SIZE, MAX_MESSAGE_SIZE,
};

/// A complete message as carried by the chunk stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpChunk {
    /// Chunk stream ID
    pub csid: u32,
    /// Absolute timestamp (32-bit, wraps)
    pub timestamp: u32,
    /// Message type ID
    pub message_type: u8,
    /// Message stream ID
    pub stream_id: u32,
    /// Reassembled message payload
    pub payload: Bytes,
}

/// Last header seen on a chunk stream plus the message being reassembled
#[derive(Debug, Default)]
struct ChunkStreamState {
    timestamp: u32,
    timestamp_delta: u32,
    length: u32,
    message_type: u8,
    stream_id: u32,
    extended: bool,
    partial: BytesMut,
}

/// Header fields resolved for one chunk before anything is committed
struct ResolvedHeader {
    header_len: usize,
    timestamp: u32,
    timestamp_delta: u32,
    length: u32,
    message_type: u8,
    stream_id: u32,
    extended: bool,
    starts_message: bool,
}

enum DecodeStep {
    NeedMore,
    Partial,
    Complete(RtmpChunk),
}

/// Incoming chunk stream decoder
#[derive(Debug)]
pub struct ChunkDecoder {
    chunk_size: u32,
    max_message_size: u32,
    streams: HashMap<u32, ChunkStreamState>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
            streams: HashMap::new(),
        }
    }

    /// Override the message length sanity bound
    pub fn with_max_message_size(mut self, max: u32) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Apply a Set Chunk Size received from the peer
    ///
    /// Takes effect from the next chunk decoded.
    pub fn set_chunk_size(&mut self, size: u32) -> Result<(), ProtocolError> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(ProtocolError::InvalidChunkSize(size));
        }
        self.chunk_size = size;
        Ok(())
    }

    /// Drop the partially received message on `csid` (Abort Message)
    pub fn abort(&mut self, csid: u32) {
        if let Some(state) = self.streams.get_mut(&csid) {
            state.partial.clear();
        }
    }

    /// Decode the next complete message from `buf`
    ///
    /// Consumes whole chunks only. Returns `Ok(None)` when `buf` holds no
    /// further complete chunk; bytes of an incomplete chunk stay in `buf`.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RtmpChunk>, ProtocolError> {
        loop {
            match self.decode_chunk(buf)? {
                DecodeStep::NeedMore => return Ok(None),
                DecodeStep::Partial => continue,
                DecodeStep::Complete(chunk) => return Ok(Some(chunk)),
            }
        }
    }

    fn decode_chunk(&mut self, buf: &mut BytesMut) -> Result<DecodeStep, ProtocolError> {
        let (fmt, csid, basic_len) = match parse_basic_header(buf) {
            Some(h) => h,
            None => return Ok(DecodeStep::NeedMore),
        };

        let header = match self.resolve_header(buf, fmt, csid, basic_len)? {
            Some(h) => h,
            None => return Ok(DecodeStep::NeedMore),
        };

        if header.length > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge(
                header.length,
                self.max_message_size,
            ));
        }

        let already = if header.starts_message {
            0
        } else {
            self.streams.get(&csid).map(|s| s.partial.len()).unwrap_or(0)
        };
        let remaining = header.length as usize - already.min(header.length as usize);
        let payload_len = remaining.min(self.chunk_size as usize);

        if buf.len() < header.header_len + payload_len {
            return Ok(DecodeStep::NeedMore);
        }

        // Whole chunk is buffered: commit
        buf.advance(header.header_len);
        let data = buf.split_to(payload_len);

        let state = self.streams.entry(csid).or_default();
        if header.starts_message && !state.partial.is_empty() {
            tracing::warn!(
                csid = csid,
                dropped = state.partial.len(),
                "New message header before previous message completed"
            );
            state.partial.clear();
        }

        state.timestamp = header.timestamp;
        state.timestamp_delta = header.timestamp_delta;
        state.length = header.length;
        state.message_type = header.message_type;
        state.stream_id = header.stream_id;
        state.extended = header.extended;
        state.partial.extend_from_slice(&data);

        if state.partial.len() < state.length as usize {
            return Ok(DecodeStep::Partial);
        }

        Ok(DecodeStep::Complete(RtmpChunk {
            csid,
            timestamp: state.timestamp,
            message_type: state.message_type,
            stream_id: state.stream_id,
            payload: state.partial.split().freeze(),
        }))
    }

    /// Work out the effective header for a chunk without consuming anything
    fn resolve_header(
        &self,
        buf: &[u8],
        fmt: u8,
        csid: u32,
        basic_len: usize,
    ) -> Result<Option<ResolvedHeader>, ProtocolError> {
        let message_header_len = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };

        let prev = self.streams.get(&csid);
        if fmt != 0 && prev.is_none() {
            return Err(ProtocolError::MissingChunkHeader(csid));
        }

        let mut pos = basic_len + message_header_len;
        if buf.len() < pos {
            return Ok(None);
        }
        let h = &buf[basic_len..pos];

        let in_progress = prev.map(|p| !p.partial.is_empty()).unwrap_or(false);

        let ts_field = if fmt < 3 { read_u24(&h[0..3]) } else { 0 };
        let extended = if fmt < 3 {
            ts_field == EXTENDED_TIMESTAMP
        } else {
            prev.map(|p| p.extended).unwrap_or(false)
        };

        let mut ext_value = 0;
        if extended {
            if buf.len() < pos + 4 {
                return Ok(None);
            }
            ext_value = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
            pos += 4;
        }
        let ts_value = if extended { ext_value } else { ts_field };

        let resolved = match (fmt, prev) {
            (0, _) => ResolvedHeader {
                header_len: pos,
                timestamp: ts_value,
                timestamp_delta: 0,
                length: read_u24(&h[3..6]),
                message_type: h[6],
                stream_id: u32::from_le_bytes([h[7], h[8], h[9], h[10]]),
                extended,
                starts_message: true,
            },
            (1, Some(p)) => ResolvedHeader {
                header_len: pos,
                timestamp: p.timestamp.wrapping_add(ts_value),
                timestamp_delta: ts_value,
                length: read_u24(&h[3..6]),
                message_type: h[6],
                stream_id: p.stream_id,
                extended,
                starts_message: true,
            },
            (2, Some(p)) => ResolvedHeader {
                header_len: pos,
                timestamp: p.timestamp.wrapping_add(ts_value),
                timestamp_delta: ts_value,
                length: p.length,
                message_type: p.message_type,
                stream_id: p.stream_id,
                extended,
                starts_message: true,
            },
            (_, Some(p)) => {
                // Continuation keeps the timestamp; a fresh message reapplies the delta
                let timestamp = if in_progress {
                    p.timestamp
                } else {
                    p.timestamp.wrapping_add(p.timestamp_delta)
                };
                ResolvedHeader {
                    header_len: pos,
                    timestamp,
                    timestamp_delta: p.timestamp_delta,
                    length: p.length,
                    message_type: p.message_type,
                    stream_id: p.stream_id,
                    extended,
                    starts_message: !in_progress,
                }
            }
            (_, None) => return Err(ProtocolError::MissingChunkHeader(csid)),
        };

        Ok(Some(resolved))
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Outgoing chunk stream encoder
///
/// First chunk of each message gets a full (fmt 0) header, continuations
/// get fmt 3.
#[derive(Debug)]
pub struct ChunkEncoder {
    chunk_size: u32,
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Change the outbound chunk size
    ///
    /// Call only after the Set Chunk Size message announcing it has been
    /// encoded; messages already encoded keep their chunking.
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
    }

    /// Append the chunks for `chunk` to `buf`
    pub fn encode(&self, chunk: &RtmpChunk, buf: &mut BytesMut) {
        let extended = chunk.timestamp >= EXTENDED_TIMESTAMP;
        let ts_field = if extended {
            EXTENDED_TIMESTAMP
        } else {
            chunk.timestamp
        };

        let payload = &chunk.payload[..];
        let chunk_size = self.chunk_size as usize;
        let chunk_count = payload.len().div_ceil(chunk_size).max(1);
        buf.reserve(payload.len() + 18 + (chunk_count - 1) * 7);

        write_basic_header(buf, 0, chunk.csid);
        put_u24(buf, ts_field);
        put_u24(buf, payload.len() as u32);
        buf.put_u8(chunk.message_type);
        buf.put_u32_le(chunk.stream_id);
        if extended {
            buf.put_u32(chunk.timestamp);
        }

        let mut pieces = payload.chunks(chunk_size);
        if let Some(first) = pieces.next() {
            buf.put_slice(first);
        }
        for piece in pieces {
            write_basic_header(buf, 3, chunk.csid);
            if extended {
                buf.put_u32(chunk.timestamp);
            }
            buf.put_slice(piece);
        }
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse fmt + csid, returning the basic header length
fn parse_basic_header(buf: &[u8]) -> Option<(u8, u32, usize)> {
    let first = *buf.first()?;
    let fmt = first >> 6;
    match first & 0x3F {
        0 => {
            let b1 = *buf.get(1)?;
            Some((fmt, 64 + u32::from(b1), 2))
        }
        1 => {
            let b1 = *buf.get(1)?;
            let b2 = *buf.get(2)?;
            Some((fmt, 64 + u32::from(b1) + u32::from(b2) * 256, 3))
        }
        csid => Some((fmt, u32::from(csid), 1)),
    }
}

fn write_basic_header(buf: &mut BytesMut, fmt: u8, csid: u32) {
    debug_assert!((2..=65599).contains(&csid), "chunk stream id {csid} not encodable");
    let fmt_bits = fmt << 6;
    if (2..64).contains(&csid) {
        buf.put_u8(fmt_bits | csid as u8);
    } else if (64..320).contains(&csid) {
        buf.put_u8(fmt_bits);
        buf.put_u8((csid - 64) as u8);
    } else {
        let id = csid.saturating_sub(64).min(0xFFFF);
        buf.put_u8(fmt_bits | 1);
        buf.put_u8((id & 0xFF) as u8);
        buf.put_u8((id >> 8) as u8);
    }
}

fn read_u24(b: &[u8]) -> u32 {
    (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2])
}

fn put_u24(buf: &mut BytesMut, v: u32) {
    buf.put_u8((v >> 16) as u8);
    buf.put_u8((v >> 8) as u8);
    buf.put_u8(v as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{MSG_AUDIO, MSG_SET_CHUNK_SIZE, MSG_VIDEO};

    fn message(csid: u32, timestamp: u32, len: usize) -> RtmpChunk {
        let payload: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
        RtmpChunk {
            csid,
            timestamp,
            message_type: MSG_VIDEO,
            stream_id: 1,
            payload: Bytes::from(payload),
        }
    }

    fn decode_all(decoder: &mut ChunkDecoder, buf: &mut BytesMut) -> Vec<RtmpChunk> {
        let mut out = Vec::new();
        while let Some(chunk) = decoder.decode(buf).unwrap() {
            out.push(chunk);
        }
        out
    }

    #[test]
    fn test_roundtrip_across_chunk_sizes() {
        for size in [128u32, 1024, 4096, 65536] {
            let mut encoder = ChunkEncoder::new();
            encoder.set_chunk_size(size);
            let mut decoder = ChunkDecoder::new();
            decoder.set_chunk_size(size).unwrap();

            let msg = message(6, 123_456, size as usize * 3 + 17);
            let mut buf = BytesMut::new();
            encoder.encode(&msg, &mut buf);

            let decoded = decode_all(&mut decoder, &mut buf);
            assert_eq!(decoded, vec![msg], "chunk size {}", size);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();
        let msg = message(4, 40, 1000);

        let mut wire = BytesMut::new();
        encoder.encode(&msg, &mut wire);

        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            buf.put_u8(*byte);
            if let Some(chunk) = decoder.decode(&mut buf).unwrap() {
                decoded.push(chunk);
            }
        }
        assert_eq!(decoded, vec![msg]);
    }

    #[test]
    fn test_interleaved_chunk_streams() {
        let encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();

        let video = message(6, 100, 300);
        let mut audio = message(4, 101, 50);
        audio.message_type = MSG_AUDIO;

        let mut video_wire = BytesMut::new();
        encoder.encode(&video, &mut video_wire);
        let mut audio_wire = BytesMut::new();
        encoder.encode(&audio, &mut audio_wire);

        // First video chunk (12 header + 128), then the whole audio message,
        // then the rest of the video
        let mut buf = BytesMut::new();
        buf.put_slice(&video_wire[..12 + 128]);
        buf.put_slice(&audio_wire);
        buf.put_slice(&video_wire[12 + 128..]);

        let decoded = decode_all(&mut decoder, &mut buf);
        assert_eq!(decoded, vec![audio, video]);
    }

    #[test]
    fn test_chunk_size_change_is_not_retroactive() {
        let mut encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();

        let before = message(6, 0, 500);
        let set_size = RtmpChunk {
            csid: 2,
            timestamp: 0,
            message_type: MSG_SET_CHUNK_SIZE,
            stream_id: 0,
            payload: Bytes::copy_from_slice(&4096u32.to_be_bytes()),
        };
        let after = message(6, 33, 3000);

        let mut buf = BytesMut::new();
        encoder.encode(&before, &mut buf);
        encoder.encode(&set_size, &mut buf);
        encoder.set_chunk_size(4096);
        encoder.encode(&after, &mut buf);

        // Everything is buffered at once; the first message must still be
        // split on the old 128-byte boundary
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(before));
        let control = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(control.message_type, MSG_SET_CHUNK_SIZE);
        decoder.set_chunk_size(4096).unwrap();
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(after));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_type3_without_prior_header() {
        let mut decoder = ChunkDecoder::new();
        let mut buf = BytesMut::from(&[0xC5u8, 0x00, 0x00][..]);
        assert_eq!(
            decoder.decode(&mut buf),
            Err(ProtocolError::MissingChunkHeader(5))
        );
    }

    #[test]
    fn test_message_too_large() {
        let mut decoder = ChunkDecoder::new().with_max_message_size(1024);
        let mut buf = BytesMut::new();
        buf.put_u8(0x06);
        put_u24(&mut buf, 0);
        put_u24(&mut buf, 4096);
        buf.put_u8(MSG_VIDEO);
        buf.put_u32_le(1);

        assert_eq!(
            decoder.decode(&mut buf),
            Err(ProtocolError::MessageTooLarge(4096, 1024))
        );
    }

    #[test]
    fn test_invalid_chunk_size() {
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.set_chunk_size(0).is_err());
        assert!(decoder.set_chunk_size(0x8000_0000).is_err());
        assert_eq!(decoder.chunk_size(), DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_extended_timestamp_roundtrip() {
        let encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();
        let msg = message(6, 0x0100_0000, 400);

        let mut buf = BytesMut::new();
        encoder.encode(&msg, &mut buf);
        assert_eq!(decode_all(&mut decoder, &mut buf), vec![msg]);
    }

    #[test]
    fn test_compressed_headers_and_timestamp_wrap() {
        let mut decoder = ChunkDecoder::new();
        let mut buf = BytesMut::new();

        // fmt 0: ts near the top of the 32-bit range (extended)
        buf.put_u8(0x04);
        put_u24(&mut buf, EXTENDED_TIMESTAMP);
        put_u24(&mut buf, 2);
        buf.put_u8(MSG_AUDIO);
        buf.put_u32_le(1);
        buf.put_u32(u32::MAX - 10);
        buf.put_slice(&[0xAF, 0x01]);

        // fmt 2: delta of 20 wraps past zero
        buf.put_u8(0x84);
        put_u24(&mut buf, 20);
        buf.put_slice(&[0xAF, 0x02]);

        // fmt 3: new message reuses the delta
        buf.put_u8(0xC4);
        buf.put_slice(&[0xAF, 0x03]);

        let decoded = decode_all(&mut decoder, &mut buf);
        let timestamps: Vec<u32> = decoded.iter().map(|c| c.timestamp).collect();
        assert_eq!(timestamps, vec![u32::MAX - 10, 9, 29]);
        assert!(decoded.iter().all(|c| c.stream_id == 1 && c.message_type == MSG_AUDIO));
    }

    #[test]
    fn test_abort_discards_partial() {
        let encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();
        let first = message(6, 0, 300);
        let second = message(6, 40, 10);

        let mut wire = BytesMut::new();
        encoder.encode(&first, &mut wire);
        let mut buf = BytesMut::from(&wire[..12 + 128]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        decoder.abort(6);
        encoder.encode(&second, &mut buf);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(second));
    }

    #[test]
    fn test_basic_header_forms() {
        let encoder = ChunkEncoder::new();
        for csid in [2u32, 63, 64, 319, 320, 65599] {
            let mut decoder = ChunkDecoder::new();
            let msg = message(csid, 5, 10);
            let mut buf = BytesMut::new();
            encoder.encode(&msg, &mut buf);
            assert_eq!(decoder.decode(&mut buf).unwrap(), Some(msg), "csid {}", csid);
        }
    }

    #[test]
    fn test_empty_message() {
        let encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();
        let msg = message(3, 0, 0);
        let mut buf = BytesMut::new();
        encoder.encode(&msg, &mut buf);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not encodable")]
    fn test_reserved_csid_rejected() {
        let mut buf = BytesMut::new();
        write_basic_header(&mut buf, 0, 1);
    }
}
