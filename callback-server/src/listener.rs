//! The application-facing side of the server.
//!
//! Decoded gateway callbacks end up as calls on an [`EventListener`]. The
//! listener is shared by every connection handler, so its methods may run
//! concurrently from several tasks.

use std::fmt;

use async_trait::async_trait;
use rpc_codec::RpcValue;

/// Error type listeners return. The server only logs it.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Identifies one datapoint on the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatapointInfo {
    /// Device address without channel suffix, e.g. `LEQ0123456`
    pub address: String,
    /// Channel number, `None` for device-level datapoints
    pub channel: Option<u32>,
    /// Parameter name, e.g. `STATE`
    pub parameter: String,
}

impl DatapointInfo {
    pub fn new(
        address: impl Into<String>,
        channel: Option<u32>,
        parameter: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            channel,
            parameter: parameter.into(),
        }
    }
}

impl fmt::Display for DatapointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel {
            Some(channel) => write!(f, "{}:{}#{}", self.address, channel, self.parameter),
            None => write!(f, "{}#{}", self.address, self.parameter),
        }
    }
}

/// Receives parsed gateway callbacks.
///
/// Implementations must be safe to call from several connection handlers at
/// once. A returned error is logged and the gateway still gets its normal
/// reply.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// A datapoint changed its value.
    async fn event_received(
        &self,
        datapoint: DatapointInfo,
        value: RpcValue,
    ) -> Result<(), ListenerError>;

    /// Devices were paired with the gateway. Addresses carry no channel suffix
    /// and appear once each.
    async fn new_devices(&self, addresses: Vec<String>) -> Result<(), ListenerError>;

    /// Devices were removed from the gateway.
    async fn delete_devices(&self, addresses: Vec<String>) -> Result<(), ListenerError>;
}

/// One listener callback as a value, for channel-based consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Datapoint {
        datapoint: DatapointInfo,
        value: RpcValue,
    },
    NewDevices(Vec<String>),
    DeleteDevices(Vec<String>),
}
