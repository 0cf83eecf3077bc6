//! Message codecs for Homematic gateway callbacks.
//!
//! The gateway pushes events as single RPC calls in one of two wire formats:
//!
//! - [`BinRpcCodec`]: the compact binary BIN-RPC encoding
//! - [`XmlRpcCodec`]: standard XML-RPC documents
//!
//! Both implement [`RpcCodec`], which decodes and encodes whole frames of
//! dynamically typed [`RpcValue`]s and serves the fixed [`CannedResponse`]
//! replies byte for byte. Reading frames off a socket is left to the caller;
//! [`binary::frame_length`] tells a BIN-RPC reader how many bytes to expect.
//!
//! # Example
//!
//! ```
//! use rpc_codec::{BinRpcCodec, RpcCodec, RpcMessage, RpcValue};
//!
//! let codec = BinRpcCodec::new();
//! let call = RpcMessage::new(
//!     "event",
//!     vec!["BidCos-RF".into(), "LEQ0123456:1".into(), "STATE".into(), true.into()],
//! );
//!
//! let frame = codec.encode_request(&call).unwrap();
//! assert_eq!(codec.decode_request(&frame).unwrap(), call);
//! assert_eq!(call.params()[3], RpcValue::Bool(true));
//! ```

pub mod binary;
pub mod codec;
pub mod error;
pub mod text;
pub mod value;
pub mod xml;

pub use binary::BinRpcCodec;
pub use codec::{CannedResponse, RpcCodec, MAX_VALUE_NESTING};
pub use error::{CodecError, CodecResult};
pub use text::{Charset, DEFAULT_ENCODING};
pub use value::{RpcMessage, RpcValue};
pub use xml::XmlRpcCodec;
