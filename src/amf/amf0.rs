//! AMF0 encoder and decoder
//!
//! Type markers:
//! ```text
//! 0x00 Number        0x08 ECMA Array
//! 0x01 Boolean       0x09 Object End (after an empty key)
//! 0x02 String        0x0A Strict Array
//! 0x03 Object        0x0B Date
//! 0x05 Null          0x0C Long String
//! 0x06 Undefined     0x0D Unsupported
//! 0x07 Reference     0x0F XML Document
//!                    0x10 Typed Object
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::value::{AmfObject, AmfValue};
use crate::error::AmfError;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_REFERENCE: u8 = 0x07;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;
const MARKER_UNSUPPORTED: u8 = 0x0D;
const MARKER_XML_DOCUMENT: u8 = 0x0F;
const MARKER_TYPED_OBJECT: u8 = 0x10;

/// Maximum nesting depth for objects and arrays
const MAX_NESTING_DEPTH: usize = 64;

/// AMF0 decoder
///
/// Lenient by default: a missing object-end marker at the end of the buffer
/// closes the object, and unknown markers decode as `Undefined`. Some
/// encoders in the wild get both wrong.
pub struct Amf0Decoder {
    references: Vec<AmfValue>,
    lenient: bool,
    depth: usize,
}

impl Amf0Decoder {
    pub fn new() -> Self {
        Self::with_lenient(true)
    }

    pub fn with_lenient(lenient: bool) -> Self {
        Self {
            references: Vec::new(),
            lenient,
            depth: 0,
        }
    }

    /// Clear the reference table (between messages)
    pub fn reset(&mut self) {
        self.references.clear();
        self.depth = 0;
    }

    /// Decode a single value
    pub fn decode(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.is_empty() {
            return Err(AmfError::UnexpectedEof);
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.depth -= 1;
            return Err(AmfError::NestingTooDeep);
        }

        let marker = buf.get_u8();
        let result = self.decode_value(marker, buf);
        self.depth -= 1;
        result
    }

    /// Decode values until the buffer is exhausted
    pub fn decode_all(&mut self, buf: &mut Bytes) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::new();
        while buf.has_remaining() {
            values.push(self.decode(buf)?);
        }
        Ok(values)
    }

    fn decode_value(&mut self, marker: u8, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        match marker {
            MARKER_NUMBER => {
                ensure(buf, 8)?;
                Ok(AmfValue::Number(buf.get_f64()))
            }
            MARKER_BOOLEAN => {
                ensure(buf, 1)?;
                Ok(AmfValue::Boolean(buf.get_u8() != 0))
            }
            MARKER_STRING => Ok(AmfValue::String(read_utf8(buf)?)),
            MARKER_LONG_STRING => Ok(AmfValue::String(read_utf8_long(buf)?)),
            MARKER_OBJECT => {
                let index = self.reserve_reference();
                let props = self.decode_properties(buf)?;
                Ok(self.store_reference(index, AmfValue::Object(props)))
            }
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_UNDEFINED | MARKER_UNSUPPORTED => Ok(AmfValue::Undefined),
            MARKER_REFERENCE => {
                ensure(buf, 2)?;
                let index = buf.get_u16();
                self.references
                    .get(index as usize)
                    .cloned()
                    .ok_or(AmfError::InvalidReference(index))
            }
            MARKER_ECMA_ARRAY => {
                ensure(buf, 4)?;
                // Count is advisory; the end marker terminates
                let _count = buf.get_u32();
                let index = self.reserve_reference();
                let props = self.decode_properties(buf)?;
                Ok(self.store_reference(index, AmfValue::EcmaArray(props)))
            }
            MARKER_STRICT_ARRAY => {
                ensure(buf, 4)?;
                let count = buf.get_u32() as usize;
                let index = self.reserve_reference();
                let mut elements = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    elements.push(self.decode(buf)?);
                }
                Ok(self.store_reference(index, AmfValue::StrictArray(elements)))
            }
            MARKER_DATE => {
                ensure(buf, 10)?;
                let millis = buf.get_f64();
                let timezone = buf.get_i16();
                Ok(AmfValue::Date { millis, timezone })
            }
            MARKER_XML_DOCUMENT => Ok(AmfValue::Xml(read_utf8_long(buf)?)),
            MARKER_TYPED_OBJECT => {
                let class_name = read_utf8(buf)?;
                let index = self.reserve_reference();
                let properties = self.decode_properties(buf)?;
                Ok(self.store_reference(
                    index,
                    AmfValue::TypedObject {
                        class_name,
                        properties,
                    },
                ))
            }
            _ if self.lenient => Ok(AmfValue::Undefined),
            _ => Err(AmfError::UnknownMarker(marker)),
        }
    }

    /// Key/value pairs up to the empty-key + 0x09 terminator
    fn decode_properties(&mut self, buf: &mut Bytes) -> Result<AmfObject, AmfError> {
        let mut props = AmfObject::new();
        loop {
            if self.lenient && buf.is_empty() {
                break;
            }
            let key = read_utf8(buf)?;

            if key.is_empty() {
                if buf.is_empty() {
                    if self.lenient {
                        break;
                    }
                    return Err(AmfError::UnexpectedEof);
                }
                let end = buf.get_u8();
                if end == MARKER_OBJECT_END || self.lenient {
                    break;
                }
                return Err(AmfError::UnknownMarker(end));
            }

            let value = self.decode(buf)?;
            props.push_raw(key, value);
        }
        Ok(props)
    }

    fn reserve_reference(&mut self) -> usize {
        self.references.push(AmfValue::Null);
        self.references.len() - 1
    }

    fn store_reference(&mut self, index: usize, value: AmfValue) -> AmfValue {
        self.references[index] = value.clone();
        value
    }
}

impl Default for Amf0Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure(buf: &Bytes, n: usize) -> Result<(), AmfError> {
    if buf.remaining() < n {
        Err(AmfError::UnexpectedEof)
    } else {
        Ok(())
    }
}

fn read_utf8(buf: &mut Bytes) -> Result<String, AmfError> {
    ensure(buf, 2)?;
    let len = buf.get_u16() as usize;
    read_utf8_body(buf, len)
}

fn read_utf8_long(buf: &mut Bytes) -> Result<String, AmfError> {
    ensure(buf, 4)?;
    let len = buf.get_u32() as usize;
    read_utf8_body(buf, len)
}

fn read_utf8_body(buf: &mut Bytes, len: usize) -> Result<String, AmfError> {
    ensure(buf, len)?;
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// AMF0 encoder
pub struct Amf0Encoder {
    buf: BytesMut,
}

impl Amf0Encoder {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Take the encoded bytes, leaving the encoder empty
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn encode(&mut self, value: &AmfValue) {
        match value {
            AmfValue::Number(n) => {
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*n);
            }
            AmfValue::Boolean(b) => {
                self.buf.put_u8(MARKER_BOOLEAN);
                self.buf.put_u8(u8::from(*b));
            }
            AmfValue::String(s) => {
                if s.len() > 0xFFFF {
                    self.buf.put_u8(MARKER_LONG_STRING);
                    self.buf.put_u32(s.len() as u32);
                } else {
                    self.buf.put_u8(MARKER_STRING);
                    self.buf.put_u16(s.len() as u16);
                }
                self.buf.put_slice(s.as_bytes());
            }
            AmfValue::Object(props) => {
                self.buf.put_u8(MARKER_OBJECT);
                self.encode_properties(props);
            }
            AmfValue::Null => self.buf.put_u8(MARKER_NULL),
            AmfValue::Undefined => self.buf.put_u8(MARKER_UNDEFINED),
            AmfValue::EcmaArray(props) => {
                self.buf.put_u8(MARKER_ECMA_ARRAY);
                self.buf.put_u32(props.len() as u32);
                self.encode_properties(props);
            }
            AmfValue::StrictArray(elements) => {
                self.buf.put_u8(MARKER_STRICT_ARRAY);
                self.buf.put_u32(elements.len() as u32);
                for elem in elements {
                    self.encode(elem);
                }
            }
            AmfValue::Date { millis, timezone } => {
                self.buf.put_u8(MARKER_DATE);
                self.buf.put_f64(*millis);
                self.buf.put_i16(*timezone);
            }
            AmfValue::Xml(s) => {
                self.buf.put_u8(MARKER_XML_DOCUMENT);
                self.buf.put_u32(s.len() as u32);
                self.buf.put_slice(s.as_bytes());
            }
            AmfValue::TypedObject {
                class_name,
                properties,
            } => {
                self.buf.put_u8(MARKER_TYPED_OBJECT);
                self.write_utf8(class_name);
                self.encode_properties(properties);
            }
        }
    }

    pub fn encode_all(&mut self, values: &[AmfValue]) {
        for value in values {
            self.encode(value);
        }
    }

    fn encode_properties(&mut self, props: &AmfObject) {
        for (key, val) in props.iter() {
            self.write_utf8(key);
            self.encode(val);
        }
        self.buf.put_u16(0);
        self.buf.put_u8(MARKER_OBJECT_END);
    }

    /// Key string without a marker; keys are capped at 65535 bytes
    fn write_utf8(&mut self, s: &str) {
        let mut len = s.len().min(0xFFFF);
        while !s.is_char_boundary(len) {
            len -= 1;
        }
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&s.as_bytes()[..len]);
    }
}

impl Default for Amf0Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a single value
pub fn encode(value: &AmfValue) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode(value);
    encoder.finish()
}

/// Encode a sequence of values back to back
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode_all(values);
    encoder.finish()
}

/// Decode a single value
pub fn decode(data: &[u8]) -> Result<AmfValue, AmfError> {
    let mut buf = Bytes::copy_from_slice(data);
    Amf0Decoder::new().decode(&mut buf)
}

/// Decode every value in `data`
pub fn decode_all(data: &[u8]) -> Result<Vec<AmfValue>, AmfError> {
    let mut buf = Bytes::copy_from_slice(data);
    Amf0Decoder::new().decode_all(&mut buf)
}
