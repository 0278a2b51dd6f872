//! Action Message Format (AMF0)
//!
//! Command and data messages carry AMF0 values. AMF3-flavoured messages
//! (types 15 and 17) are a format byte followed by AMF0, so AMF0 is all we
//! need to decode.

pub mod amf0;
pub mod value;

pub use amf0::{Amf0Decoder, Amf0Encoder};
pub use value::{AmfObject, AmfValue};
