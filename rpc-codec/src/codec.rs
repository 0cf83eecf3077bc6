//! The codec seam shared by both wire formats.

use bytes::Bytes;

use crate::error::CodecResult;
use crate::value::{RpcMessage, RpcValue};

/// Fixed replies sent regardless of the request's content.
///
/// Each codec serves these from pre-built constants so the bytes on the wire
/// are exactly what the gateway firmware expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CannedResponse {
    /// A single empty string
    EmptyString,
    /// A single empty array
    EmptyArray,
    /// An array holding the string `"event"`
    EmptyEventList,
}

impl CannedResponse {
    /// The value this canned response carries.
    pub fn value(self) -> RpcValue {
        match self {
            CannedResponse::EmptyString => RpcValue::String(String::new()),
            CannedResponse::EmptyArray => RpcValue::List(Vec::new()),
            CannedResponse::EmptyEventList => RpcValue::List(vec![RpcValue::from("event")]),
        }
    }
}

/// Encodes and decodes complete RPC frames of one wire format.
///
/// Implementations are pure: framing a byte stream off a socket is the
/// caller's job.
pub trait RpcCodec: Send + Sync {
    /// Short name of the wire format, for logs and errors.
    fn format_name(&self) -> &'static str;

    /// Decode one method call.
    fn decode_request(&self, frame: &[u8]) -> CodecResult<RpcMessage>;

    /// Encode one method call.
    fn encode_request(&self, message: &RpcMessage) -> CodecResult<Bytes>;

    /// Decode the single value of a method response.
    fn decode_response(&self, frame: &[u8]) -> CodecResult<RpcValue>;

    /// Encode `value` as a method response.
    fn encode_response(&self, value: &RpcValue) -> CodecResult<Bytes>;

    /// The pre-built bytes of a canned response.
    fn canned(&self, kind: CannedResponse) -> Bytes;
}

/// Maximum nesting of arrays and structs accepted by the decoders.
pub const MAX_VALUE_NESTING: usize = 64;

/// Turn the value of a fault response into a [`CodecError::Fault`].
pub(crate) fn fault_from_value(value: RpcValue) -> crate::error::CodecError {
    let members = value.as_struct();
    let code = members
        .and_then(|m| m.get("faultCode"))
        .and_then(RpcValue::as_i32)
        .unwrap_or_default();
    let message = members
        .and_then(|m| m.get("faultString"))
        .and_then(RpcValue::as_str)
        .unwrap_or_default()
        .to_string();
    crate::error::CodecError::Fault { code, message }
}
