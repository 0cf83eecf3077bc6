//! Run a callback server and log every gateway event.
//!
//! ```text
//! HM_RPC_LOG_MODE=development cargo run -p homematic-rpc-callback-server --example log_events -- xml 9292
//! ```
//!
//! Then register `http://<this host>:9292` (or `xmlrpc_bin://...:2001` for
//! `binary`) as the callback URL on the gateway with `init`.

use std::sync::Arc;

use callback_server::logging::{init_logging_from_env_or, LoggingMode};
use callback_server::{CallbackServer, EventForwarder, GatewayEvent, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env_or(LoggingMode::Development)?;

    let mut args = std::env::args().skip(1);
    let mode = args.next().unwrap_or_else(|| "binary".to_string());
    let port = args.next().map(|p| p.parse()).transpose()?.unwrap_or(2001);

    let config = match mode.as_str() {
        "xml" => ServerConfig::xml(port),
        "binary" => ServerConfig::binary(port),
        other => return Err(format!("unknown transfer mode {other:?}, use binary or xml").into()),
    };

    let (forwarder, mut rx) = EventForwarder::channel();
    let server = CallbackServer::start(config, Arc::new(forwarder)).await?;
    tracing::info!(port = server.port(), mode = ?server.transfer_mode(), "Waiting for gateway callbacks");

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(GatewayEvent::Datapoint { datapoint, value }) => {
                    tracing::info!(%datapoint, %value, "Datapoint changed");
                }
                Some(GatewayEvent::NewDevices(addresses)) => {
                    tracing::info!(?addresses, "New devices");
                }
                Some(GatewayEvent::DeleteDevices(addresses)) => {
                    tracing::info!(?addresses, "Deleted devices");
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    server.shutdown().await?;
    Ok(())
}
