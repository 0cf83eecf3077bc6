//! XML-RPC wire format.
//!
//! Documents are read with a pull parser rather than serde because parameter
//! types are only known once the value element has been seen.

use std::collections::BTreeMap;
use std::io::Write;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::codec::{fault_from_value, CannedResponse, RpcCodec, MAX_VALUE_NESTING};
use crate::error::{CodecError, CodecResult};
use crate::text::{Charset, DEFAULT_ENCODING};
use crate::value::{RpcMessage, RpcValue};

const FORMAT_NAME: &str = "XML-RPC";

pub const XML_EMPTY_STRING: &str = concat!(
    r#"<?xml version="1.0" encoding="ISO-8859-1"?>"#,
    "<methodResponse><params><param>",
    "<value></value>",
    "</param></params></methodResponse>"
);

pub const XML_EMPTY_ARRAY: &str = concat!(
    r#"<?xml version="1.0" encoding="ISO-8859-1"?>"#,
    "<methodResponse><params><param>",
    "<value><array><data></data></array></value>",
    "</param></params></methodResponse>"
);

pub const XML_EMPTY_EVENT_LIST: &str = concat!(
    r#"<?xml version="1.0" encoding="ISO-8859-1"?>"#,
    "<methodResponse><params><param>",
    "<value><array><data><value>event</value></data></array></value>",
    "</param></params></methodResponse>"
);

/// XML-RPC codec with a configurable document encoding.
#[derive(Debug, Clone)]
pub struct XmlRpcCodec {
    charset: Charset,
    declared_encoding: String,
}

impl XmlRpcCodec {
    /// A codec producing and expecting ISO-8859-1 documents.
    pub fn new() -> Self {
        Self {
            charset: Charset::default(),
            declared_encoding: DEFAULT_ENCODING.to_string(),
        }
    }

    /// A codec using the encoding named by `label`, also written into the
    /// XML declaration of every document it produces.
    pub fn with_encoding(label: &str) -> CodecResult<Self> {
        Ok(Self {
            charset: Charset::for_label(label)?,
            declared_encoding: label.trim().to_string(),
        })
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    fn document<F>(&self, body: F) -> CodecResult<Bytes>
    where
        F: FnOnce(&mut Writer<Vec<u8>>) -> CodecResult<()>,
    {
        let mut writer = Writer::new(Vec::new());
        writer.write_event(Event::Decl(BytesDecl::new(
            "1.0",
            Some(self.declared_encoding.as_str()),
            None,
        )))?;
        body(&mut writer)?;

        let utf8 = String::from_utf8(writer.into_inner())
            .map_err(|_| CodecError::InvalidText { encoding: "UTF-8" })?;
        Ok(Bytes::from(self.charset.encode(&utf8)?.into_owned()))
    }
}

impl Default for XmlRpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcCodec for XmlRpcCodec {
    fn format_name(&self) -> &'static str {
        FORMAT_NAME
    }

    fn decode_request(&self, frame: &[u8]) -> CodecResult<RpcMessage> {
        let text = self.charset.decode(frame)?;
        let mut parser = Parser::new(&text);
        parser.expect_start("methodCall", "document")?;

        let method_name = match parser.next_structural("methodCall")? {
            Event::Start(e) if e.name().as_ref() == b"methodName" => {
                parser.read_text("methodName")?.trim().to_string()
            }
            _ => return Err(CodecError::MissingElement("methodName")),
        };
        if method_name.is_empty() {
            return Err(CodecError::MissingElement("methodName"));
        }

        let params = match parser.next_structural("methodCall")? {
            Event::Start(e) if e.name().as_ref() == b"params" => {
                let params = parser.parse_params()?;
                parser.expect_end("methodCall")?;
                params
            }
            Event::Empty(e) if e.name().as_ref() == b"params" => {
                parser.expect_end("methodCall")?;
                Vec::new()
            }
            Event::End(_) => Vec::new(),
            other => return Err(unexpected(&other, "methodCall")),
        };
        parser.expect_eof()?;
        Ok(RpcMessage::new(method_name, params))
    }

    fn encode_request(&self, message: &RpcMessage) -> CodecResult<Bytes> {
        self.document(|w| {
            w.write_event(Event::Start(BytesStart::new("methodCall")))?;
            write_scalar(w, "methodName", message.method_name())?;
            w.write_event(Event::Start(BytesStart::new("params")))?;
            for param in message.params() {
                w.write_event(Event::Start(BytesStart::new("param")))?;
                write_value(w, param)?;
                w.write_event(Event::End(BytesEnd::new("param")))?;
            }
            w.write_event(Event::End(BytesEnd::new("params")))?;
            w.write_event(Event::End(BytesEnd::new("methodCall")))?;
            Ok(())
        })
    }

    fn decode_response(&self, frame: &[u8]) -> CodecResult<RpcValue> {
        let text = self.charset.decode(frame)?;
        let mut parser = Parser::new(&text);
        parser.expect_start("methodResponse", "document")?;

        let result = match parser.next_structural("methodResponse")? {
            Event::Start(e) if e.name().as_ref() == b"params" => {
                let value = parser
                    .parse_params()?
                    .into_iter()
                    .next()
                    .ok_or(CodecError::MissingElement("param"))?;
                Ok(value)
            }
            Event::Start(e) if e.name().as_ref() == b"fault" => {
                let value = parser.expect_value("fault")?;
                parser.expect_end("fault")?;
                Err(fault_from_value(value))
            }
            Event::End(_) | Event::Eof => return Err(CodecError::MissingElement("params")),
            other => return Err(unexpected(&other, "methodResponse")),
        };
        parser.expect_end("methodResponse")?;
        parser.expect_eof()?;
        result
    }

    fn encode_response(&self, value: &RpcValue) -> CodecResult<Bytes> {
        self.document(|w| {
            w.write_event(Event::Start(BytesStart::new("methodResponse")))?;
            w.write_event(Event::Start(BytesStart::new("params")))?;
            w.write_event(Event::Start(BytesStart::new("param")))?;
            write_value(w, value)?;
            w.write_event(Event::End(BytesEnd::new("param")))?;
            w.write_event(Event::End(BytesEnd::new("params")))?;
            w.write_event(Event::End(BytesEnd::new("methodResponse")))?;
            Ok(())
        })
    }

    fn canned(&self, kind: CannedResponse) -> Bytes {
        Bytes::from_static(
            match kind {
                CannedResponse::EmptyString => XML_EMPTY_STRING,
                CannedResponse::EmptyArray => XML_EMPTY_ARRAY,
                CannedResponse::EmptyEventList => XML_EMPTY_EVENT_LIST,
            }
            .as_bytes(),
        )
    }
}

fn write_scalar<W: Write>(w: &mut Writer<W>, tag: &str, text: &str) -> CodecResult<()> {
    w.write_event(Event::Start(BytesStart::new(tag)))?;
    if !text.is_empty() {
        w.write_event(Event::Text(BytesText::new(text)))?;
    }
    w.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

fn write_value<W: Write>(w: &mut Writer<W>, value: &RpcValue) -> CodecResult<()> {
    w.write_event(Event::Start(BytesStart::new("value")))?;
    match value {
        RpcValue::Null => w.write_event(Event::Empty(BytesStart::new("nil")))?,
        RpcValue::Bool(b) => write_scalar(w, "boolean", if *b { "1" } else { "0" })?,
        RpcValue::Integer(i) => write_scalar(w, "i4", &i.to_string())?,
        RpcValue::Double(d) => {
            if !d.is_finite() {
                return Err(CodecError::Unsupported {
                    kind: "non-finite double",
                    format: FORMAT_NAME,
                });
            }
            write_scalar(w, "double", &d.to_string())?
        }
        // Untyped so an empty string matches the canned document.
        RpcValue::String(s) => {
            if !s.is_empty() {
                w.write_event(Event::Text(BytesText::new(s)))?;
            }
        }
        RpcValue::Bytes(b) => write_scalar(w, "base64", &BASE64.encode(b))?,
        RpcValue::List(items) => {
            w.write_event(Event::Start(BytesStart::new("array")))?;
            w.write_event(Event::Start(BytesStart::new("data")))?;
            for item in items {
                write_value(w, item)?;
            }
            w.write_event(Event::End(BytesEnd::new("data")))?;
            w.write_event(Event::End(BytesEnd::new("array")))?;
        }
        RpcValue::Struct(members) => {
            w.write_event(Event::Start(BytesStart::new("struct")))?;
            for (name, member) in members {
                w.write_event(Event::Start(BytesStart::new("member")))?;
                write_scalar(w, "name", name)?;
                write_value(w, member)?;
                w.write_event(Event::End(BytesEnd::new("member")))?;
            }
            w.write_event(Event::End(BytesEnd::new("struct")))?;
        }
    }
    w.write_event(Event::End(BytesEnd::new("value")))?;
    Ok(())
}

/// Recursive-descent reader over quick-xml events.
///
/// End tag names are checked by quick-xml itself, so an `End` event always
/// closes the element most recently opened.
struct Parser<'a> {
    reader: Reader<&'a [u8]>,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            reader: Reader::from_str(text),
            depth: 0,
        }
    }

    /// Next event that carries structure, skipping prolog, comments and
    /// whitespace between elements.
    fn next_structural(&mut self, context: &'static str) -> CodecResult<Event<'a>> {
        loop {
            match self.reader.read_event()? {
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::Text(t) if is_blank(&t) => {}
                event @ (Event::Text(_) | Event::CData(_)) => {
                    return Err(unexpected(&event, context))
                }
                event => return Ok(event),
            }
        }
    }

    fn expect_start(&mut self, name: &'static str, context: &'static str) -> CodecResult<()> {
        match self.next_structural(context)? {
            Event::Start(e) if e.name().as_ref() == name.as_bytes() => Ok(()),
            Event::Eof => Err(CodecError::MissingElement(name)),
            other => Err(unexpected(&other, context)),
        }
    }

    fn expect_end(&mut self, context: &'static str) -> CodecResult<()> {
        match self.next_structural(context)? {
            Event::End(_) => Ok(()),
            Event::Eof => Err(CodecError::MalformedXml(format!("<{context}> is not closed"))),
            other => Err(unexpected(&other, context)),
        }
    }

    fn expect_eof(&mut self) -> CodecResult<()> {
        match self.next_structural("document")? {
            Event::Eof => Ok(()),
            other => Err(unexpected(&other, "document")),
        }
    }

    /// Text content of the element just opened, up to its end tag.
    fn read_text(&mut self, context: &'static str) -> CodecResult<String> {
        let mut text = String::new();
        loop {
            match self.reader.read_event()? {
                Event::Text(t) => text.push_str(&t.unescape()?),
                Event::CData(c) => text.push_str(cdata_str(&c)?),
                Event::Comment(_) | Event::PI(_) => {}
                Event::End(_) => return Ok(text),
                Event::Eof => {
                    return Err(CodecError::MalformedXml(format!("<{context}> is not closed")))
                }
                other => return Err(unexpected(&other, context)),
            }
        }
    }

    /// Expect a `<value>` element and parse it.
    fn expect_value(&mut self, context: &'static str) -> CodecResult<RpcValue> {
        match self.next_structural(context)? {
            Event::Start(e) if e.name().as_ref() == b"value" => self.parse_value(),
            Event::Empty(e) if e.name().as_ref() == b"value" => Ok(RpcValue::String(String::new())),
            Event::End(_) | Event::Eof => Err(CodecError::MissingElement("value")),
            other => Err(unexpected(&other, context)),
        }
    }

    /// Contents of `<params>`, up to and including its end tag.
    fn parse_params(&mut self) -> CodecResult<Vec<RpcValue>> {
        let mut params = Vec::new();
        loop {
            match self.next_structural("params")? {
                Event::Start(e) if e.name().as_ref() == b"param" => {
                    params.push(self.expect_value("param")?);
                    self.expect_end("param")?;
                }
                Event::End(_) => return Ok(params),
                other => return Err(unexpected(&other, "params")),
            }
        }
    }

    /// Contents of `<value>`, up to and including its end tag.
    fn parse_value(&mut self) -> CodecResult<RpcValue> {
        let mut text = String::new();
        loop {
            let event = self.reader.read_event()?;
            match event {
                Event::Text(t) => text.push_str(&t.unescape()?),
                Event::CData(c) => text.push_str(cdata_str(&c)?),
                Event::Comment(_) | Event::PI(_) => {}
                Event::End(_) => return Ok(RpcValue::String(text)),
                Event::Start(ref e) | Event::Empty(ref e) if !text.trim().is_empty() => {
                    return Err(CodecError::UnexpectedElement {
                        found: tag_name(e),
                        context: "value",
                    })
                }
                Event::Start(e) => {
                    let value = self.parse_typed(&tag_name(&e))?;
                    self.expect_end("value")?;
                    return Ok(value);
                }
                Event::Empty(e) => {
                    let value = empty_typed(&tag_name(&e))?;
                    self.expect_end("value")?;
                    return Ok(value);
                }
                Event::Eof => return Err(CodecError::MalformedXml("<value> is not closed".into())),
                other => return Err(unexpected(&other, "value")),
            }
        }
    }

    /// A typed value whose start tag has just been read.
    fn parse_typed(&mut self, tag: &str) -> CodecResult<RpcValue> {
        match tag {
            "i4" | "int" => {
                let text = self.read_text("int")?;
                text.trim()
                    .parse()
                    .map(RpcValue::Integer)
                    .map_err(|_| invalid("integer", text))
            }
            "boolean" => {
                let text = self.read_text("boolean")?;
                match text.trim() {
                    "1" | "true" => Ok(RpcValue::Bool(true)),
                    "0" | "false" => Ok(RpcValue::Bool(false)),
                    _ => Err(invalid("boolean", text)),
                }
            }
            "double" => {
                let text = self.read_text("double")?;
                text.trim()
                    .parse()
                    .map(RpcValue::Double)
                    .map_err(|_| invalid("double", text))
            }
            "string" => self.read_text("string").map(RpcValue::String),
            "dateTime.iso8601" => self.read_text("dateTime.iso8601").map(RpcValue::String),
            "base64" => {
                let text = self.read_text("base64")?;
                let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
                BASE64
                    .decode(compact)
                    .map(RpcValue::Bytes)
                    .map_err(|_| invalid("base64", text))
            }
            "nil" => {
                self.expect_end("nil")?;
                Ok(RpcValue::Null)
            }
            "array" => self.nested(Self::parse_array),
            "struct" => self.nested(Self::parse_struct),
            other => Err(CodecError::UnexpectedElement {
                found: other.to_string(),
                context: "value",
            }),
        }
    }

    fn nested(&mut self, parse: fn(&mut Self) -> CodecResult<RpcValue>) -> CodecResult<RpcValue> {
        if self.depth >= MAX_VALUE_NESTING {
            return Err(CodecError::NestingTooDeep {
                limit: MAX_VALUE_NESTING,
            });
        }
        self.depth += 1;
        let value = parse(self);
        self.depth -= 1;
        value
    }

    fn parse_array(&mut self) -> CodecResult<RpcValue> {
        match self.next_structural("array")? {
            Event::Start(e) if e.name().as_ref() == b"data" => {}
            Event::Empty(e) if e.name().as_ref() == b"data" => {
                self.expect_end("array")?;
                return Ok(RpcValue::List(Vec::new()));
            }
            other => return Err(unexpected(&other, "array")),
        }

        let mut items = Vec::new();
        loop {
            match self.next_structural("data")? {
                Event::Start(e) if e.name().as_ref() == b"value" => items.push(self.parse_value()?),
                Event::Empty(e) if e.name().as_ref() == b"value" => {
                    items.push(RpcValue::String(String::new()))
                }
                Event::End(_) => break,
                other => return Err(unexpected(&other, "data")),
            }
        }
        self.expect_end("array")?;
        Ok(RpcValue::List(items))
    }

    fn parse_struct(&mut self) -> CodecResult<RpcValue> {
        let mut members = BTreeMap::new();
        loop {
            match self.next_structural("struct")? {
                Event::Start(e) if e.name().as_ref() == b"member" => {
                    self.expect_start("name", "member")?;
                    let name = self.read_text("name")?;
                    let value = self.expect_value("member")?;
                    self.expect_end("member")?;
                    if members.contains_key(&name) {
                        return Err(CodecError::DuplicateKey(name));
                    }
                    members.insert(name, value);
                }
                Event::End(_) => return Ok(RpcValue::Struct(members)),
                other => return Err(unexpected(&other, "struct")),
            }
        }
    }
}

fn empty_typed(tag: &str) -> CodecResult<RpcValue> {
    match tag {
        "string" | "dateTime.iso8601" => Ok(RpcValue::String(String::new())),
        "base64" => Ok(RpcValue::Bytes(Vec::new())),
        "nil" => Ok(RpcValue::Null),
        "array" => Ok(RpcValue::List(Vec::new())),
        "struct" => Ok(RpcValue::Struct(BTreeMap::new())),
        other => Err(invalid("empty element", format!("<{other}/>"))),
    }
}

fn is_blank(text: &BytesText<'_>) -> bool {
    text.iter().all(u8::is_ascii_whitespace)
}

fn cdata_str<'b>(cdata: &'b BytesCData<'_>) -> CodecResult<&'b str> {
    std::str::from_utf8(cdata).map_err(|_| CodecError::InvalidText { encoding: "UTF-8" })
}

fn tag_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

fn invalid(kind: &'static str, text: String) -> CodecError {
    CodecError::InvalidValue { kind, text }
}

fn unexpected(event: &Event<'_>, context: &'static str) -> CodecError {
    let found = match event {
        Event::Start(e) | Event::Empty(e) => tag_name(e),
        Event::End(e) => format!("/{}", String::from_utf8_lossy(e.name().as_ref())),
        Event::Text(_) | Event::CData(_) => "text".to_string(),
        Event::Eof => "end of document".to_string(),
        _ => "markup".to_string(),
    };
    CodecError::UnexpectedElement { found, context }
}
