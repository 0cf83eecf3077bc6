//! Dynamically typed RPC values and messages.

use std::collections::BTreeMap;
use std::fmt;

/// A single RPC parameter or result.
///
/// Every consumer matches on the variant it expects; there are no implicit
/// conversions between kinds. Struct members are kept in a sorted map so the
/// same value always encodes to the same bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcValue {
    Null,
    Bool(bool),
    Integer(i32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<RpcValue>),
    Struct(BTreeMap<String, RpcValue>),
}

impl RpcValue {
    /// Static name of this value's kind, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            RpcValue::Null => "null",
            RpcValue::Bool(_) => "boolean",
            RpcValue::Integer(_) => "integer",
            RpcValue::Double(_) => "double",
            RpcValue::String(_) => "string",
            RpcValue::Bytes(_) => "base64",
            RpcValue::List(_) => "array",
            RpcValue::Struct(_) => "struct",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            RpcValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RpcValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RpcValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[RpcValue]> {
        match self {
            RpcValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&BTreeMap<String, RpcValue>> {
        match self {
            RpcValue::Struct(members) => Some(members),
            _ => None,
        }
    }

    /// Take the items out of a list value, or hand the value back unchanged.
    pub fn into_list(self) -> Result<Vec<RpcValue>, RpcValue> {
        match self {
            RpcValue::List(items) => Ok(items),
            other => Err(other),
        }
    }

    /// Build a struct value from `(name, value)` pairs.
    pub fn structure<K, I>(members: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, RpcValue)>,
    {
        RpcValue::Struct(members.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<bool> for RpcValue {
    fn from(value: bool) -> Self {
        RpcValue::Bool(value)
    }
}

impl From<i32> for RpcValue {
    fn from(value: i32) -> Self {
        RpcValue::Integer(value)
    }
}

impl From<f64> for RpcValue {
    fn from(value: f64) -> Self {
        RpcValue::Double(value)
    }
}

impl From<&str> for RpcValue {
    fn from(value: &str) -> Self {
        RpcValue::String(value.to_string())
    }
}

impl From<String> for RpcValue {
    fn from(value: String) -> Self {
        RpcValue::String(value)
    }
}

impl From<Vec<u8>> for RpcValue {
    fn from(value: Vec<u8>) -> Self {
        RpcValue::Bytes(value)
    }
}

impl From<Vec<RpcValue>> for RpcValue {
    fn from(items: Vec<RpcValue>) -> Self {
        RpcValue::List(items)
    }
}

impl fmt::Display for RpcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcValue::Null => write!(f, "null"),
            RpcValue::Bool(b) => write!(f, "{b}"),
            RpcValue::Integer(i) => write!(f, "{i}"),
            RpcValue::Double(d) => write!(f, "{d}"),
            RpcValue::String(s) => write!(f, "{s:?}"),
            RpcValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            RpcValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            RpcValue::Struct(members) => {
                write!(f, "{{")?;
                for (i, (name, value)) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// One decoded RPC call: a method name and its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcMessage {
    method_name: String,
    params: Vec<RpcValue>,
}

impl RpcMessage {
    pub fn new(method_name: impl Into<String>, params: Vec<RpcValue>) -> Self {
        Self {
            method_name: method_name.into(),
            params,
        }
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn params(&self) -> &[RpcValue] {
        &self.params
    }

    /// Split the message into its method name and parameters.
    pub fn into_parts(self) -> (String, Vec<RpcValue>) {
        (self.method_name, self.params)
    }
}
