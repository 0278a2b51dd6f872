//! RTMP message types
//!
//! A chunk stream hands us `(type id, payload)` pairs; this module turns them
//! into typed messages and back.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::amf::{amf0, Amf0Decoder, Amf0Encoder, AmfObject, AmfValue};
use crate::error::{Error, ProtocolError};
use crate::protocol::chunk::RtmpChunk;
use crate::protocol::constants::*;

/// A decoded RTMP message
#[derive(Debug, Clone, PartialEq)]
pub enum RtmpMessage {
    SetChunkSize(u32),
    Abort { csid: u32 },
    Acknowledgement { sequence: u32 },
    UserControl(UserControlEvent),
    WindowAckSize(u32),
    SetPeerBandwidth { size: u32, limit_type: u8 },
    Audio { timestamp: u32, data: Bytes },
    Video { timestamp: u32, data: Bytes },
    Command(Command),
    Data(DataMessage),
    /// Message type we don't interpret (shared objects, aggregates)
    Unknown { type_id: u8, data: Bytes },
}

/// User control event (message type 4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
    Unknown { event_type: u16, data: Bytes },
}

/// AMF command: name, transaction id, command object, arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    pub command_object: AmfValue,
    pub arguments: Vec<AmfValue>,
    /// Message stream the command travelled on
    pub stream_id: u32,
}

/// AMF data message (`@setDataFrame`, `onMetaData`, `|RtmpSampleAccess`)
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    pub name: String,
    pub values: Vec<AmfValue>,
    pub stream_id: u32,
}

impl RtmpMessage {
    /// Interpret a reassembled chunk
    pub fn from_chunk(chunk: &RtmpChunk) -> Result<Self, Error> {
        let mut p = chunk.payload.clone();

        let msg = match chunk.message_type {
            MSG_SET_CHUNK_SIZE => {
                need(&p, 4, "set chunk size")?;
                // Top bit is reserved and must be ignored
                RtmpMessage::SetChunkSize(p.get_u32() & 0x7FFF_FFFF)
            }
            MSG_ABORT => {
                need(&p, 4, "abort")?;
                RtmpMessage::Abort { csid: p.get_u32() }
            }
            MSG_ACKNOWLEDGEMENT => {
                need(&p, 4, "acknowledgement")?;
                RtmpMessage::Acknowledgement {
                    sequence: p.get_u32(),
                }
            }
            MSG_USER_CONTROL => RtmpMessage::UserControl(UserControlEvent::decode(&mut p)?),
            MSG_WINDOW_ACK_SIZE => {
                need(&p, 4, "window acknowledgement size")?;
                RtmpMessage::WindowAckSize(p.get_u32())
            }
            MSG_SET_PEER_BANDWIDTH => {
                need(&p, 5, "set peer bandwidth")?;
                let size = p.get_u32();
                let limit_type = p.get_u8();
                RtmpMessage::SetPeerBandwidth { size, limit_type }
            }
            MSG_AUDIO => RtmpMessage::Audio {
                timestamp: chunk.timestamp,
                data: p,
            },
            MSG_VIDEO => RtmpMessage::Video {
                timestamp: chunk.timestamp,
                data: p,
            },
            MSG_COMMAND_AMF0 => RtmpMessage::Command(Command::decode(p, chunk.stream_id)?),
            MSG_COMMAND_AMF3 => {
                skip_format_byte(&mut p);
                RtmpMessage::Command(Command::decode(p, chunk.stream_id)?)
            }
            MSG_DATA_AMF0 => RtmpMessage::Data(DataMessage::decode(p, chunk.stream_id)?),
            MSG_DATA_AMF3 => {
                skip_format_byte(&mut p);
                RtmpMessage::Data(DataMessage::decode(p, chunk.stream_id)?)
            }
            type_id => RtmpMessage::Unknown { type_id, data: p },
        };

        Ok(msg)
    }

    /// Serialize to `(message type id, payload)`
    pub fn encode(&self) -> (u8, Bytes) {
        match self {
            RtmpMessage::SetChunkSize(size) => (MSG_SET_CHUNK_SIZE, u32_payload(*size)),
            RtmpMessage::Abort { csid } => (MSG_ABORT, u32_payload(*csid)),
            RtmpMessage::Acknowledgement { sequence } => {
                (MSG_ACKNOWLEDGEMENT, u32_payload(*sequence))
            }
            RtmpMessage::UserControl(event) => (MSG_USER_CONTROL, event.encode()),
            RtmpMessage::WindowAckSize(size) => (MSG_WINDOW_ACK_SIZE, u32_payload(*size)),
            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u32(*size);
                buf.put_u8(*limit_type);
                (MSG_SET_PEER_BANDWIDTH, buf.freeze())
            }
            RtmpMessage::Audio { data, .. } => (MSG_AUDIO, data.clone()),
            RtmpMessage::Video { data, .. } => (MSG_VIDEO, data.clone()),
            RtmpMessage::Command(cmd) => (MSG_COMMAND_AMF0, cmd.encode()),
            RtmpMessage::Data(data) => (MSG_DATA_AMF0, data.encode()),
            RtmpMessage::Unknown { type_id, data } => (*type_id, data.clone()),
        }
    }

    /// Chunk stream this message is normally sent on
    pub fn default_csid(&self) -> u32 {
        match self {
            RtmpMessage::SetChunkSize(_)
            | RtmpMessage::Abort { .. }
            | RtmpMessage::Acknowledgement { .. }
            | RtmpMessage::UserControl(_)
            | RtmpMessage::WindowAckSize(_)
            | RtmpMessage::SetPeerBandwidth { .. } => CSID_PROTOCOL_CONTROL,
            RtmpMessage::Audio { .. } => CSID_AUDIO,
            RtmpMessage::Video { .. } => CSID_VIDEO,
            RtmpMessage::Data(_) => CSID_DATA,
            RtmpMessage::Command(_) | RtmpMessage::Unknown { .. } => CSID_COMMAND,
        }
    }
}

impl UserControlEvent {
    fn decode(p: &mut Bytes) -> Result<Self, ProtocolError> {
        need(p, 2, "user control")?;
        let event_type = p.get_u16();

        let event = match event_type {
            UC_SET_BUFFER_LENGTH => {
                need(p, 8, "set buffer length")?;
                UserControlEvent::SetBufferLength {
                    stream_id: p.get_u32(),
                    buffer_ms: p.get_u32(),
                }
            }
            UC_STREAM_BEGIN | UC_STREAM_EOF | UC_STREAM_DRY | UC_STREAM_IS_RECORDED
            | UC_PING_REQUEST | UC_PING_RESPONSE => {
                need(p, 4, "user control")?;
                let value = p.get_u32();
                match event_type {
                    UC_STREAM_BEGIN => UserControlEvent::StreamBegin(value),
                    UC_STREAM_EOF => UserControlEvent::StreamEof(value),
                    UC_STREAM_DRY => UserControlEvent::StreamDry(value),
                    UC_STREAM_IS_RECORDED => UserControlEvent::StreamIsRecorded(value),
                    UC_PING_REQUEST => UserControlEvent::PingRequest(value),
                    _ => UserControlEvent::PingResponse(value),
                }
            }
            _ => UserControlEvent::Unknown {
                event_type,
                data: p.split_off(0),
            },
        };
        Ok(event)
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(10);
        match self {
            UserControlEvent::StreamBegin(id) => put_event(&mut buf, UC_STREAM_BEGIN, *id),
            UserControlEvent::StreamEof(id) => put_event(&mut buf, UC_STREAM_EOF, *id),
            UserControlEvent::StreamDry(id) => put_event(&mut buf, UC_STREAM_DRY, *id),
            UserControlEvent::StreamIsRecorded(id) => {
                put_event(&mut buf, UC_STREAM_IS_RECORDED, *id)
            }
            UserControlEvent::PingRequest(ts) => put_event(&mut buf, UC_PING_REQUEST, *ts),
            UserControlEvent::PingResponse(ts) => put_event(&mut buf, UC_PING_RESPONSE, *ts),
            UserControlEvent::SetBufferLength {
                stream_id,
                buffer_ms,
            } => {
                put_event(&mut buf, UC_SET_BUFFER_LENGTH, *stream_id);
                buf.put_u32(*buffer_ms);
            }
            UserControlEvent::Unknown { event_type, data } => {
                buf.put_u16(*event_type);
                buf.put_slice(data);
            }
        }
        buf.freeze()
    }
}

impl Command {
    fn decode(payload: Bytes, stream_id: u32) -> Result<Self, Error> {
        let mut buf = payload;
        let mut decoder = Amf0Decoder::new();

        let name = match decoder.decode(&mut buf)? {
            AmfValue::String(s) => s,
            other => {
                return Err(ProtocolError::UnexpectedMessage(format!(
                    "command name is not a string: {:?}",
                    other
                ))
                .into())
            }
        };
        let transaction_id = if buf.has_remaining() {
            decoder.decode(&mut buf)?.as_number().unwrap_or(0.0)
        } else {
            0.0
        };
        let command_object = if buf.has_remaining() {
            decoder.decode(&mut buf)?
        } else {
            AmfValue::Null
        };
        let arguments = decoder.decode_all(&mut buf)?;

        Ok(Command {
            name,
            transaction_id,
            command_object,
            arguments,
            stream_id,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut encoder = Amf0Encoder::new();
        encoder.encode(&AmfValue::String(self.name.clone()));
        encoder.encode(&AmfValue::Number(self.transaction_id));
        encoder.encode(&self.command_object);
        encoder.encode_all(&self.arguments);
        encoder.finish()
    }

    /// `_result` reply to a transaction
    pub fn result(transaction_id: f64, properties: AmfValue, info: AmfValue) -> Self {
        Command {
            name: CMD_RESULT.to_string(),
            transaction_id,
            command_object: properties,
            arguments: vec![info],
            stream_id: 0,
        }
    }

    /// `_error` reply to a transaction
    pub fn error(transaction_id: f64, properties: AmfValue, info: AmfValue) -> Self {
        Command {
            name: CMD_ERROR.to_string(),
            transaction_id,
            command_object: properties,
            arguments: vec![info],
            stream_id: 0,
        }
    }

    /// `onStatus` notification on a message stream
    pub fn on_status(stream_id: u32, level: &str, code: &str, description: &str) -> Self {
        Command {
            name: CMD_ON_STATUS.to_string(),
            transaction_id: 0.0,
            command_object: AmfValue::Null,
            arguments: vec![status_object(level, code, description)],
            stream_id,
        }
    }

    /// First argument as a string (stream names for publish/play)
    pub fn string_arg(&self, index: usize) -> Option<&str> {
        self.arguments.get(index)?.as_str()
    }
}

/// `{ level, code, description }` info object used by status replies
pub fn status_object(level: &str, code: &str, description: &str) -> AmfValue {
    AmfValue::Object(
        AmfObject::new()
            .with("level", level)
            .with("code", code)
            .with("description", description),
    )
}

impl DataMessage {
    fn decode(payload: Bytes, stream_id: u32) -> Result<Self, Error> {
        let mut values = amf0::decode_all(&payload)?;
        if values.is_empty() {
            return Err(ProtocolError::Truncated("data").into());
        }
        let name = match values.remove(0) {
            AmfValue::String(s) => s,
            other => {
                return Err(ProtocolError::UnexpectedMessage(format!(
                    "data message name is not a string: {:?}",
                    other
                ))
                .into())
            }
        };
        Ok(DataMessage {
            name,
            values,
            stream_id,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut encoder = Amf0Encoder::new();
        encoder.encode(&AmfValue::String(self.name.clone()));
        encoder.encode_all(&self.values);
        encoder.finish()
    }

    /// Normalise publisher metadata to a bare `onMetaData(obj)` message
    ///
    /// Accepts both `@setDataFrame("onMetaData", obj)` and `onMetaData(obj)`.
    pub fn into_metadata(self) -> Option<DataMessage> {
        let mut values = self.values;
        match self.name.as_str() {
            CMD_SET_DATA_FRAME => {
                if values.first().and_then(AmfValue::as_str) != Some(CMD_ON_METADATA) {
                    return None;
                }
                values.remove(0);
            }
            CMD_ON_METADATA => {}
            _ => return None,
        }

        let object = values.into_iter().find(|v| v.as_object().is_some())?;
        Some(DataMessage {
            name: CMD_ON_METADATA.to_string(),
            values: vec![object],
            stream_id: self.stream_id,
        })
    }
}

/// Parameters carried in the `connect` command object
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectParams {
    pub app: String,
    pub tc_url: Option<String>,
    pub flash_ver: Option<String>,
    pub swf_url: Option<String>,
    pub page_url: Option<String>,
    pub object_encoding: f64,
}

impl ConnectParams {
    pub fn from_amf(obj: &AmfValue) -> Self {
        let get = |k: &str| obj.get_string(k).map(str::to_string);
        ConnectParams {
            app: normalize_app(obj.get_string("app").unwrap_or_default()),
            tc_url: get("tcUrl"),
            flash_ver: get("flashVer"),
            swf_url: get("swfUrl"),
            page_url: get("pageUrl"),
            object_encoding: obj.get_number("objectEncoding").unwrap_or(0.0),
        }
    }
}

/// Arguments of `publish(name, type)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishParams {
    pub stream_key: String,
    /// "live", "record" or "append"
    pub publish_type: String,
}

impl PublishParams {
    pub fn from_command(cmd: &Command) -> Option<Self> {
        let stream_key = strip_query(cmd.string_arg(0)?);
        if stream_key.is_empty() {
            return None;
        }
        Some(PublishParams {
            stream_key,
            publish_type: cmd.string_arg(1).unwrap_or("live").to_string(),
        })
    }
}

/// Arguments of `play(name, start, duration, reset)`
#[derive(Debug, Clone, PartialEq)]
pub struct PlayParams {
    pub stream_key: String,
    pub start: f64,
    pub duration: f64,
    pub reset: bool,
}

impl PlayParams {
    pub fn from_command(cmd: &Command) -> Option<Self> {
        let stream_key = strip_query(cmd.string_arg(0)?);
        if stream_key.is_empty() {
            return None;
        }
        let number = |i: usize, default: f64| {
            cmd.arguments
                .get(i)
                .and_then(AmfValue::as_number)
                .unwrap_or(default)
        };
        Some(PlayParams {
            stream_key,
            start: number(1, -2.0),
            duration: number(2, -1.0),
            reset: cmd
                .arguments
                .get(3)
                .and_then(AmfValue::as_bool)
                .unwrap_or(true),
        })
    }
}

/// Strip surrounding slashes and any query string from an app name
fn normalize_app(app: &str) -> String {
    strip_query(app).trim_matches('/').to_string()
}

/// Stream names may carry `?token=...` which is not part of the identity
fn strip_query(name: &str) -> String {
    name.split('?').next().unwrap_or_default().to_string()
}

fn need(p: &Bytes, n: usize, what: &'static str) -> Result<(), ProtocolError> {
    if p.remaining() < n {
        Err(ProtocolError::Truncated(what))
    } else {
        Ok(())
    }
}

fn skip_format_byte(p: &mut Bytes) {
    if p.first() == Some(&0) {
        p.advance(1);
    }
}

fn u32_payload(v: u32) -> Bytes {
    Bytes::copy_from_slice(&v.to_be_bytes())
}

fn put_event(buf: &mut BytesMut, event_type: u16, value: u32) {
    buf.put_u16(event_type);
    buf.put_u32(value);
}
