//! String transcoding between Rust strings and the gateway's character set.
//!
//! The gateway speaks ISO-8859-1 by default. The Latin-1 labels map bytes to
//! code points one to one; every other label resolves the WHATWG way.

use std::borrow::Cow;

use encoding_rs::Encoding;

use crate::error::{CodecError, CodecResult};

/// Label used when no encoding is configured.
pub const DEFAULT_ENCODING: &str = "ISO-8859-1";

const LATIN1_LABELS: [&str; 6] = [
    "iso-8859-1",
    "iso8859-1",
    "iso_8859-1",
    "iso-ir-100",
    "latin1",
    "l1",
];

/// A resolved character encoding used for every string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charset {
    kind: CharsetKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharsetKind {
    Latin1,
    Whatwg(&'static Encoding),
}

impl Charset {
    /// Resolve an encoding label such as `ISO-8859-1` or `UTF-8`.
    pub fn for_label(label: &str) -> CodecResult<Self> {
        let trimmed = label.trim();
        if LATIN1_LABELS
            .iter()
            .any(|known| known.eq_ignore_ascii_case(trimmed))
        {
            return Ok(Self::default());
        }
        Encoding::for_label(trimmed.as_bytes())
            .map(|encoding| Self {
                kind: CharsetKind::Whatwg(encoding),
            })
            .ok_or_else(|| CodecError::UnknownEncoding(label.to_string()))
    }

    /// Canonical name of the resolved encoding.
    pub fn name(&self) -> &'static str {
        match self.kind {
            CharsetKind::Latin1 => DEFAULT_ENCODING,
            CharsetKind::Whatwg(encoding) => encoding.name(),
        }
    }

    /// Encode `text`, failing on characters the encoding cannot represent.
    pub fn encode<'a>(&self, text: &'a str) -> CodecResult<Cow<'a, [u8]>> {
        match self.kind {
            CharsetKind::Latin1 => {
                if text.chars().any(|c| u32::from(c) > 0xFF) {
                    return Err(self.invalid_text());
                }
                Ok(encoding_rs::mem::encode_latin1_lossy(text))
            }
            CharsetKind::Whatwg(encoding) => {
                let (bytes, _, unmappable) = encoding.encode(text);
                if unmappable {
                    return Err(self.invalid_text());
                }
                Ok(bytes)
            }
        }
    }

    /// Decode `bytes`, failing on malformed sequences.
    pub fn decode<'a>(&self, bytes: &'a [u8]) -> CodecResult<Cow<'a, str>> {
        match self.kind {
            CharsetKind::Latin1 => Ok(encoding_rs::mem::decode_latin1(bytes)),
            CharsetKind::Whatwg(encoding) => {
                let (text, malformed) = encoding.decode_without_bom_handling(bytes);
                if malformed {
                    return Err(self.invalid_text());
                }
                Ok(text)
            }
        }
    }

    fn invalid_text(&self) -> CodecError {
        CodecError::InvalidText {
            encoding: self.name(),
        }
    }
}

impl Default for Charset {
    fn default() -> Self {
        Self {
            kind: CharsetKind::Latin1,
        }
    }
}
