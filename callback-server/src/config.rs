//! Configuration for the callback server
//!
//! [`ServerConfig`] controls where the server listens, which wire format it
//! speaks, and how many connections it serves at once. It deserializes from
//! any serde format with every field optional.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rpc_codec::{BinRpcCodec, Charset, RpcCodec, XmlRpcCodec, DEFAULT_ENCODING};
use serde::Deserialize;

use crate::error::ServerError;

/// The wire format a server instance speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Raw BIN-RPC frames over TCP
    #[default]
    Binary,
    /// XML-RPC documents over HTTP POST
    Xml,
}

impl TransferMode {
    /// Build the codec for this mode with the given character encoding.
    pub fn codec(self, encoding: &str) -> Result<Arc<dyn RpcCodec>, ServerError> {
        let codec: Arc<dyn RpcCodec> = match self {
            TransferMode::Binary => Arc::new(BinRpcCodec::with_encoding(encoding)?),
            TransferMode::Xml => Arc::new(XmlRpcCodec::with_encoding(encoding)?),
        };
        Ok(codec)
    }
}

/// Configuration for the [`CallbackServer`](crate::CallbackServer)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind
    /// Default: 0.0.0.0
    pub bind_address: IpAddr,

    /// Port to bind, 0 picks an ephemeral port
    /// Default: 0
    pub port: u16,

    /// Wire format
    /// Default: binary
    pub transfer_mode: TransferMode,

    /// Character encoding for strings on the wire
    /// Default: ISO-8859-1
    pub encoding: String,

    /// Maximum number of connections handled concurrently
    /// Default: 8
    pub max_connections: usize,

    /// Largest accepted message in bytes
    /// Default: 4 MiB
    pub max_message_size: usize,

    /// How long shutdown waits for in-flight connections, in milliseconds
    /// Default: 1000
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            transfer_mode: TransferMode::Binary,
            encoding: DEFAULT_ENCODING.to_string(),
            max_connections: 8,
            max_message_size: 4 * 1024 * 1024,
            shutdown_grace_ms: 1000,
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// BIN-RPC server on `port`
    pub fn binary(port: u16) -> Self {
        Self {
            port,
            transfer_mode: TransferMode::Binary,
            ..Default::default()
        }
    }

    /// XML-RPC server on `port`
    pub fn xml(port: u16) -> Self {
        Self {
            port,
            transfer_mode: TransferMode::Xml,
            ..Default::default()
        }
    }

    /// The socket address to bind
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Grace period granted to in-flight connections on shutdown
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_connections == 0 {
            return Err(ServerError::Configuration(
                "Max connections must be greater than 0".to_string(),
            ));
        }

        if self.max_message_size == 0 {
            return Err(ServerError::Configuration(
                "Max message size must be greater than 0".to_string(),
            ));
        }

        if Charset::for_label(&self.encoding).is_err() {
            return Err(ServerError::Configuration(format!(
                "Unknown character encoding: {}",
                self.encoding
            )));
        }

        Ok(())
    }

    pub fn with_bind_address(mut self, address: impl Into<IpAddr>) -> Self {
        self.bind_address = address.into();
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }
}
