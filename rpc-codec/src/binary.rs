//! Homematic BIN-RPC wire format.
//!
//! A frame is the magic `Bin`, one message type byte, a big-endian `u32`
//! length of everything that follows, and the body. Request bodies hold the
//! method name (length-prefixed, untagged), a parameter count and the tagged
//! parameters; response bodies hold a single tagged value.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{fault_from_value, CannedResponse, RpcCodec, MAX_VALUE_NESTING};
use crate::error::{CodecError, CodecResult};
use crate::text::Charset;
use crate::value::{RpcMessage, RpcValue};

const FORMAT_NAME: &str = "BIN-RPC";

/// Frame magic.
pub const MAGIC: &[u8; 3] = b"Bin";
/// Magic, message type and length.
pub const HEADER_LEN: usize = 8;

pub const MSG_REQUEST: u8 = 0x00;
pub const MSG_RESPONSE: u8 = 0x01;
pub const MSG_FAULT: u8 = 0xff;

const TYPE_INTEGER: u32 = 0x01;
const TYPE_BOOLEAN: u32 = 0x02;
const TYPE_STRING: u32 = 0x03;
const TYPE_DOUBLE: u32 = 0x04;
const TYPE_BASE64: u32 = 0x11;
const TYPE_ARRAY: u32 = 0x100;
const TYPE_STRUCT: u32 = 0x101;

/// Doubles travel as `mantissa / 2^30 * 2^exponent`.
const MANTISSA_SCALE: f64 = 1_073_741_824.0;

#[rustfmt::skip]
pub const BIN_EMPTY_STRING: &[u8] = &[
    b'B', b'i', b'n', 0x01, 0, 0, 0, 0x08,
    0, 0, 0, 0x03, 0, 0, 0, 0,
];

#[rustfmt::skip]
pub const BIN_EMPTY_ARRAY: &[u8] = &[
    b'B', b'i', b'n', 0x01, 0, 0, 0, 0x08,
    0, 0, 0x01, 0, 0, 0, 0, 0,
];

#[rustfmt::skip]
pub const BIN_EMPTY_EVENT_LIST: &[u8] = &[
    b'B', b'i', b'n', 0x01, 0, 0, 0, 0x15,
    0, 0, 0x01, 0, 0, 0, 0, 0x01,
    0, 0, 0, 0x03, 0, 0, 0, 0x05,
    b'e', b'v', b'e', b'n', b't',
];

/// Validate a frame header and return the number of body bytes that follow it.
///
/// Connection handlers read [`HEADER_LEN`] bytes, call this, then read exactly
/// the returned number of bytes before decoding.
pub fn frame_length(header: &[u8]) -> CodecResult<usize> {
    if header.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            needed: HEADER_LEN,
            available: header.len(),
        });
    }
    if &header[..3] != MAGIC {
        return Err(CodecError::BadMagic([header[0], header[1], header[2]]));
    }
    let mut length = &header[4..HEADER_LEN];
    Ok(length.get_u32() as usize)
}

/// BIN-RPC codec with a configurable string encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinRpcCodec {
    charset: Charset,
}

impl BinRpcCodec {
    /// A codec using ISO-8859-1 strings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_charset(charset: Charset) -> Self {
        Self { charset }
    }

    /// A codec using the encoding named by `label`.
    pub fn with_encoding(label: &str) -> CodecResult<Self> {
        Charset::for_label(label).map(Self::with_charset)
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// Check the header of a complete frame and return its type and body.
    fn open_frame<'a>(&self, frame: &'a [u8], accepted: &[u8]) -> CodecResult<(u8, &'a [u8])> {
        let declared = frame_length(frame)?;
        let message_type = frame[3];
        if !accepted.contains(&message_type) {
            return Err(CodecError::UnexpectedMessageType {
                expected: accepted[0],
                found: message_type,
            });
        }
        let body = &frame[HEADER_LEN..];
        if body.len() < declared {
            return Err(CodecError::Truncated {
                needed: declared,
                available: body.len(),
            });
        }
        if body.len() > declared {
            return Err(CodecError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }
        Ok((message_type, body))
    }

    fn read_string(&self, buf: &mut &[u8]) -> CodecResult<String> {
        let raw = read_len_prefixed(buf)?;
        Ok(self.charset.decode(raw)?.into_owned())
    }

    fn read_value(&self, buf: &mut &[u8], depth: usize) -> CodecResult<RpcValue> {
        if depth > MAX_VALUE_NESTING {
            return Err(CodecError::NestingTooDeep {
                limit: MAX_VALUE_NESTING,
            });
        }
        match read_u32(buf)? {
            TYPE_INTEGER => Ok(RpcValue::Integer(read_i32(buf)?)),
            TYPE_BOOLEAN => {
                need(buf, 1)?;
                Ok(RpcValue::Bool(buf.get_u8() != 0))
            }
            TYPE_STRING => Ok(RpcValue::String(self.read_string(buf)?)),
            TYPE_DOUBLE => {
                let mantissa = read_i32(buf)?;
                let exponent = read_i32(buf)?;
                decode_double(mantissa, exponent).map(RpcValue::Double)
            }
            TYPE_BASE64 => {
                let text = read_len_prefixed(buf)?;
                BASE64
                    .decode(text)
                    .map(RpcValue::Bytes)
                    .map_err(|e| CodecError::InvalidValue {
                        kind: "base64",
                        text: e.to_string(),
                    })
            }
            TYPE_ARRAY => {
                let count = read_u32(buf)? as usize;
                let mut items = Vec::with_capacity(count.min(buf.remaining()));
                for _ in 0..count {
                    items.push(self.read_value(buf, depth + 1)?);
                }
                Ok(RpcValue::List(items))
            }
            TYPE_STRUCT => {
                let count = read_u32(buf)? as usize;
                let mut members = std::collections::BTreeMap::new();
                for _ in 0..count {
                    let name = self.read_string(buf)?;
                    let value = self.read_value(buf, depth + 1)?;
                    if members.contains_key(&name) {
                        return Err(CodecError::DuplicateKey(name));
                    }
                    members.insert(name, value);
                }
                Ok(RpcValue::Struct(members))
            }
            other => Err(CodecError::UnknownType(other)),
        }
    }

    fn write_string(&self, out: &mut BytesMut, text: &str) -> CodecResult<()> {
        let raw = self.charset.encode(text)?;
        write_len_prefixed(out, &raw)
    }

    fn write_value(&self, out: &mut BytesMut, value: &RpcValue) -> CodecResult<()> {
        match value {
            RpcValue::Null => {
                return Err(CodecError::Unsupported {
                    kind: "null",
                    format: FORMAT_NAME,
                })
            }
            RpcValue::Bool(b) => {
                out.put_u32(TYPE_BOOLEAN);
                out.put_u8(u8::from(*b));
            }
            RpcValue::Integer(i) => {
                out.put_u32(TYPE_INTEGER);
                out.put_i32(*i);
            }
            RpcValue::Double(d) => {
                let (mantissa, exponent) = encode_double(*d)?;
                out.put_u32(TYPE_DOUBLE);
                out.put_i32(mantissa);
                out.put_i32(exponent);
            }
            RpcValue::String(s) => {
                out.put_u32(TYPE_STRING);
                self.write_string(out, s)?;
            }
            RpcValue::Bytes(b) => {
                out.put_u32(TYPE_BASE64);
                write_len_prefixed(out, BASE64.encode(b).as_bytes())?;
            }
            RpcValue::List(items) => {
                out.put_u32(TYPE_ARRAY);
                out.put_u32(wire_len(items.len())?);
                for item in items {
                    self.write_value(out, item)?;
                }
            }
            RpcValue::Struct(members) => {
                out.put_u32(TYPE_STRUCT);
                out.put_u32(wire_len(members.len())?);
                for (name, member) in members {
                    self.write_string(out, name)?;
                    self.write_value(out, member)?;
                }
            }
        }
        Ok(())
    }
}

impl RpcCodec for BinRpcCodec {
    fn format_name(&self) -> &'static str {
        FORMAT_NAME
    }

    fn decode_request(&self, frame: &[u8]) -> CodecResult<RpcMessage> {
        let (_, mut body) = self.open_frame(frame, &[MSG_REQUEST])?;
        let method_name = self.read_string(&mut body)?;
        let count = read_u32(&mut body)? as usize;
        let mut params = Vec::with_capacity(count.min(body.remaining()));
        for _ in 0..count {
            params.push(self.read_value(&mut body, 0)?);
        }
        if body.has_remaining() {
            return Err(CodecError::TrailingBytes(body.remaining()));
        }
        Ok(RpcMessage::new(method_name, params))
    }

    fn encode_request(&self, message: &RpcMessage) -> CodecResult<Bytes> {
        let mut body = BytesMut::new();
        self.write_string(&mut body, message.method_name())?;
        body.put_u32(wire_len(message.params().len())?);
        for param in message.params() {
            self.write_value(&mut body, param)?;
        }
        finish_frame(MSG_REQUEST, &body)
    }

    fn decode_response(&self, frame: &[u8]) -> CodecResult<RpcValue> {
        let (message_type, mut body) = self.open_frame(frame, &[MSG_RESPONSE, MSG_FAULT])?;
        let value = self.read_value(&mut body, 0)?;
        if body.has_remaining() {
            return Err(CodecError::TrailingBytes(body.remaining()));
        }
        if message_type == MSG_FAULT {
            return Err(fault_from_value(value));
        }
        Ok(value)
    }

    fn encode_response(&self, value: &RpcValue) -> CodecResult<Bytes> {
        let mut body = BytesMut::new();
        self.write_value(&mut body, value)?;
        finish_frame(MSG_RESPONSE, &body)
    }

    fn canned(&self, kind: CannedResponse) -> Bytes {
        Bytes::from_static(match kind {
            CannedResponse::EmptyString => BIN_EMPTY_STRING,
            CannedResponse::EmptyArray => BIN_EMPTY_ARRAY,
            CannedResponse::EmptyEventList => BIN_EMPTY_EVENT_LIST,
        })
    }
}

fn finish_frame(message_type: u8, body: &[u8]) -> CodecResult<Bytes> {
    let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
    out.put_slice(MAGIC);
    out.put_u8(message_type);
    out.put_u32(wire_len(body.len())?);
    out.put_slice(body);
    Ok(out.freeze())
}

fn need(buf: &[u8], needed: usize) -> CodecResult<()> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn read_u32(buf: &mut &[u8]) -> CodecResult<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn read_i32(buf: &mut &[u8]) -> CodecResult<i32> {
    need(buf, 4)?;
    Ok(buf.get_i32())
}

fn read_len_prefixed<'a>(buf: &mut &'a [u8]) -> CodecResult<&'a [u8]> {
    let len = read_u32(buf)? as usize;
    need(buf, len)?;
    let (raw, rest) = buf.split_at(len);
    *buf = rest;
    Ok(raw)
}

fn write_len_prefixed(out: &mut BytesMut, raw: &[u8]) -> CodecResult<()> {
    out.put_u32(wire_len(raw.len())?);
    out.put_slice(raw);
    Ok(())
}

fn wire_len(len: usize) -> CodecResult<u32> {
    u32::try_from(len).map_err(|_| CodecError::InvalidValue {
        kind: "length",
        text: len.to_string(),
    })
}

fn encode_double(value: f64) -> CodecResult<(i32, i32)> {
    if !value.is_finite() {
        return Err(CodecError::Unsupported {
            kind: "non-finite double",
            format: FORMAT_NAME,
        });
    }
    if value == 0.0 {
        return Ok((0, 0));
    }
    let exponent = value.abs().log2().floor() as i32 + 1;
    let mantissa = (value / 2f64.powi(exponent) * MANTISSA_SCALE) as i32;
    // Near f64::MAX the exponent leaves the range the decoder can rebuild.
    let rebuilt = f64::from(mantissa) / MANTISSA_SCALE * 2f64.powi(exponent);
    if mantissa == 0 || !rebuilt.is_finite() {
        return Err(CodecError::InvalidValue {
            kind: "double",
            text: value.to_string(),
        });
    }
    Ok((mantissa, exponent))
}

/// Decoded doubles are rounded to six decimal places, as the gateway does.
fn decode_double(mantissa: i32, exponent: i32) -> CodecResult<f64> {
    let value = f64::from(mantissa) / MANTISSA_SCALE * 2f64.powi(exponent);
    if !value.is_finite() {
        return Err(CodecError::InvalidValue {
            kind: "double",
            text: format!("{mantissa}e{exponent}"),
        });
    }
    let scaled = value * 1e6;
    if scaled.is_finite() {
        Ok(scaled.round() / 1e6)
    } else {
        Ok(value)
    }
}
