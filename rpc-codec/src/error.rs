//! Error types for message encoding and decoding

use thiserror::Error;

/// Errors that can occur while encoding or decoding an RPC message
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// The input ended before a complete message was read
    #[error("Message truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// The binary frame does not start with the `Bin` magic
    #[error("Invalid frame magic: {0:02x?}")]
    BadMagic([u8; 3]),

    /// The frame carries a message type other than the one being decoded
    #[error("Unexpected message type 0x{found:02x}, expected 0x{expected:02x}")]
    UnexpectedMessageType { expected: u8, found: u8 },

    /// A binary value carries a type tag this codec does not know
    #[error("Unknown value type 0x{0:x}")]
    UnknownType(u32),

    /// A struct contains the same member name twice
    #[error("Duplicate struct member: {0}")]
    DuplicateKey(String),

    /// Bytes were left over after the last value of a frame
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// The header length does not match the frame
    #[error("Declared length {declared} does not match frame length {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Text could not be decoded with, or represented in, the configured encoding
    #[error("Invalid text for encoding {encoding}")]
    InvalidText { encoding: &'static str },

    /// The configured encoding label is not known
    #[error("Unknown character encoding: {0}")]
    UnknownEncoding(String),

    /// The value cannot be represented in this wire format
    #[error("{kind} values are not supported by {format}")]
    Unsupported {
        kind: &'static str,
        format: &'static str,
    },

    /// The XML document is not well formed
    #[error("Malformed XML: {0}")]
    MalformedXml(String),

    /// A required XML element is missing
    #[error("Missing required element: {0}")]
    MissingElement(&'static str),

    /// An XML element appeared where it is not allowed
    #[error("Unexpected element <{found}> in <{context}>")]
    UnexpectedElement {
        found: String,
        context: &'static str,
    },

    /// A scalar value could not be parsed
    #[error("Invalid {kind} value: {text}")]
    InvalidValue { kind: &'static str, text: String },

    /// Arrays or structs are nested deeper than the decoder allows
    #[error("Values nested deeper than {limit} levels")]
    NestingTooDeep { limit: usize },

    /// The peer answered with an RPC fault
    #[error("RPC fault {code}: {message}")]
    Fault { code: i32, message: String },
}

/// Result type alias for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

impl From<quick_xml::Error> for CodecError {
    fn from(err: quick_xml::Error) -> Self {
        CodecError::MalformedXml(err.to_string())
    }
}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        CodecError::MalformedXml(err.to_string())
    }
}
