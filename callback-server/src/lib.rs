//! Inbound RPC callback server for Homematic gateways.
//!
//! A Homematic gateway reports device events by calling back into the
//! integration: it opens a TCP connection, issues exactly one RPC call and
//! waits for a fixed acknowledgement. This crate is the receiving end.
//!
//! # Overview
//!
//! - [`CallbackServer`]: binds a port and serves each accepted connection on
//!   a bounded worker pool, speaking BIN-RPC or XML-RPC over HTTP.
//! - [`Dispatcher`]: maps `event`, `newDevices`, `deleteDevices`,
//!   `system.listMethods` and `system.multicall` onto an [`EventListener`].
//! - [`EventListener`]: the trait the application implements.
//! - [`EventForwarder`]: a ready-made listener that forwards [`GatewayEvent`]s
//!   to an mpsc channel.
//!
//! Wire formats live in the [`rpc_codec`] crate.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use callback_server::{CallbackServer, EventForwarder, GatewayEvent, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (forwarder, mut rx) = EventForwarder::channel();
//!     let server = CallbackServer::start(ServerConfig::xml(9292), Arc::new(forwarder)).await?;
//!
//!     tokio::spawn(async move {
//!         while let Some(event) = rx.recv().await {
//!             if let GatewayEvent::Datapoint { datapoint, value } = event {
//!                 println!("{datapoint} = {value}");
//!             }
//!         }
//!     });
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
mod connection;
pub mod dispatcher;
pub mod error;
pub mod forwarder;
pub mod listener;
pub mod logging;
mod pool;
mod server;

pub use config::{ServerConfig, TransferMode};
pub use dispatcher::{Dispatcher, Reply, MAX_MULTICALL_DEPTH, SUPPORTED_METHODS};
pub use error::{ConnectionError, DispatchError, ServerError};
pub use forwarder::EventForwarder;
pub use listener::{DatapointInfo, EventListener, GatewayEvent, ListenerError};
pub use server::CallbackServer;
