//! Channel-backed [`EventListener`].
//!
//! `EventForwarder` turns listener callbacks into [`GatewayEvent`]s on an
//! unbounded channel, so consumers can process them from their own task.

use async_trait::async_trait;
use rpc_codec::RpcValue;
use tokio::sync::mpsc;

use crate::listener::{DatapointInfo, EventListener, GatewayEvent, ListenerError};

/// Returned by the forwarder once the receiving side is gone.
#[derive(Debug, thiserror::Error)]
#[error("Gateway event receiver has been dropped")]
pub struct ReceiverDropped;

/// Forwards every callback to an mpsc channel.
#[derive(Debug, Clone)]
pub struct EventForwarder {
    event_sender: mpsc::UnboundedSender<GatewayEvent>,
}

impl EventForwarder {
    /// Create a forwarder sending on `event_sender`.
    ///
    /// # Example
    ///
    /// ```
    /// use tokio::sync::mpsc;
    /// use callback_server::{EventForwarder, GatewayEvent};
    ///
    /// let (tx, mut rx) = mpsc::unbounded_channel::<GatewayEvent>();
    /// let forwarder = EventForwarder::new(tx);
    /// ```
    pub fn new(event_sender: mpsc::UnboundedSender<GatewayEvent>) -> Self {
        Self { event_sender }
    }

    /// Create a forwarder together with the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn forward(&self, event: GatewayEvent) -> Result<(), ListenerError> {
        self.event_sender
            .send(event)
            .map_err(|_| Box::new(ReceiverDropped) as ListenerError)
    }
}

#[async_trait]
impl EventListener for EventForwarder {
    async fn event_received(
        &self,
        datapoint: DatapointInfo,
        value: RpcValue,
    ) -> Result<(), ListenerError> {
        self.forward(GatewayEvent::Datapoint { datapoint, value })
    }

    async fn new_devices(&self, addresses: Vec<String>) -> Result<(), ListenerError> {
        self.forward(GatewayEvent::NewDevices(addresses))
    }

    async fn delete_devices(&self, addresses: Vec<String>) -> Result<(), ListenerError> {
        self.forward(GatewayEvent::DeleteDevices(addresses))
    }
}
