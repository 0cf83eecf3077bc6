//! TCP listener for gateway callbacks.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::config::{ServerConfig, TransferMode};
use crate::connection::ConnectionContext;
use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::listener::EventListener;
use crate::pool::{log_join, WorkerPool};

const LISTEN_BACKLOG: u32 = 128;

/// Pause after a failed accept so a persistent error does not spin the loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Callback server receiving RPC calls from a Homematic gateway.
///
/// The server binds one port, accepts connections on a background task and
/// serves each connection on a bounded worker pool. Every connection carries
/// exactly one call which is dispatched to the [`EventListener`].
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use callback_server::{CallbackServer, EventForwarder, ServerConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let (forwarder, mut rx) = EventForwarder::channel();
///
///     let server = CallbackServer::start(ServerConfig::binary(2001), Arc::new(forwarder))
///         .await
///         .expect("Failed to start callback server");
///
///     println!("Listening on port {}", server.port());
///
///     while let Some(event) = rx.recv().await {
///         println!("Gateway event: {event:?}");
///     }
/// }
/// ```
pub struct CallbackServer {
    /// The address the server is bound to
    local_addr: SocketAddr,
    /// The wire format served
    transfer_mode: TransferMode,
    /// Shutdown signal, shared with every connection handler
    shutdown_tx: watch::Sender<bool>,
    /// Accept loop task handle
    server_handle: Option<JoinHandle<()>>,
}

impl CallbackServer {
    /// Bind the configured port and start accepting connections.
    ///
    /// Returns once the socket is listening. The listener is shared by all
    /// connection handlers and must be safe to call concurrently.
    pub async fn start(
        config: ServerConfig,
        listener: Arc<dyn EventListener>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let codec = config.transfer_mode.codec(&config.encoding)?;

        let tcp_listener = bind(config.socket_addr())?;
        let local_addr = tcp_listener.local_addr()?;

        let context = Arc::new(ConnectionContext::new(
            codec,
            Dispatcher::new(listener),
            config.transfer_mode,
            config.max_message_size,
        ));
        let pool = WorkerPool::new(config.max_connections);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server_handle = tokio::spawn(accept_loop(
            tcp_listener,
            context,
            pool,
            shutdown_rx,
            config.shutdown_grace(),
        ));

        info!(
            %local_addr,
            mode = ?config.transfer_mode,
            encoding = %config.encoding,
            max_connections = config.max_connections,
            "Callback server listening"
        );

        Ok(Self {
            local_addr,
            transfer_mode: config.transfer_mode,
            shutdown_tx,
            server_handle: Some(server_handle),
        })
    }

    /// Get the address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the port the server is bound to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Get the wire format this server speaks.
    pub fn transfer_mode(&self) -> TransferMode {
        self.transfer_mode
    }

    /// Shutdown the callback server.
    ///
    /// Closes the listening socket, cancels connections still waiting for
    /// their request and gives the others the configured grace period before
    /// aborting them. Returns once the accept loop has stopped.
    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e: JoinError| ServerError::Shutdown(e.to_string()))?;
        }

        info!(local_addr = %self.local_addr, "Callback server stopped");
        Ok(())
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let listen = || -> std::io::Result<TcpListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(LISTEN_BACKLOG)
    };
    listen().map_err(|source| ServerError::Bind { addr, source })
}

/// Source of inbound connections for the accept loop.
#[async_trait]
trait Acceptor: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

enum LoopEvent<S> {
    Shutdown,
    Accepted(io::Result<(S, SocketAddr)>),
    Finished(Result<(), JoinError>),
}

async fn accept_loop<A: Acceptor>(
    listener: A,
    context: Arc<ConnectionContext>,
    mut pool: WorkerPool,
    mut shutdown_rx: watch::Receiver<bool>,
    grace: Duration,
) {
    let cancel = shutdown_rx.clone();

    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown_rx.wait_for(|stop| *stop) => LoopEvent::Shutdown,
            accepted = listener.accept() => LoopEvent::Accepted(accepted),
            Some(joined) = pool.join_next(), if !pool.is_empty() => LoopEvent::Finished(joined),
        };

        match event {
            LoopEvent::Shutdown => break,
            LoopEvent::Accepted(Ok((stream, peer))) => {
                trace!(%peer, active = pool.len(), "Accepted callback connection");
                let context = Arc::clone(&context);
                let cancel = cancel.clone();
                pool.submit(async move { context.handle(stream, peer, cancel).await });
            }
            LoopEvent::Accepted(Err(e)) => {
                warn!(error = %e, "Failed to accept callback connection");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
            LoopEvent::Finished(joined) => log_join(joined),
        }
    }

    drop(listener);
    debug!(active = pool.len(), "Accept loop stopped, draining connection handlers");
    pool.shutdown(grace).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::EventForwarder;
    use crate::listener::GatewayEvent;
    use rpc_codec::binary::BIN_EMPTY_STRING;
    use rpc_codec::{BinRpcCodec, RpcCodec, RpcMessage, RpcValue};
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::Mutex;

    /// Hands out scripted accept results, then waits forever.
    struct ScriptedAcceptor {
        script: Mutex<VecDeque<io::Result<DuplexStream>>>,
    }

    #[async_trait]
    impl Acceptor for ScriptedAcceptor {
        type Stream = DuplexStream;

        async fn accept(&self) -> io::Result<(DuplexStream, SocketAddr)> {
            let next = self.script.lock().await.pop_front();
            match next {
                Some(result) => {
                    result.map(|stream| (stream, SocketAddr::from((Ipv4Addr::LOCALHOST, 40000))))
                }
                None => std::future::pending().await,
            }
        }
    }

    fn local(config: ServerConfig) -> ServerConfig {
        config.with_bind_address(Ipv4Addr::LOCALHOST)
    }

    #[tokio::test]
    async fn test_start_on_ephemeral_port() {
        let (forwarder, _rx) = EventForwarder::channel();
        let server = CallbackServer::start(local(ServerConfig::xml(0)), Arc::new(forwarder))
            .await
            .unwrap();

        assert_ne!(server.port(), 0);
        assert_eq!(server.local_addr().ip(), Ipv4Addr::LOCALHOST);
        assert_eq!(server.transfer_mode(), TransferMode::Xml);
        assert!(server.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let (forwarder, _rx) = EventForwarder::channel();
        let result = CallbackServer::start(
            local(ServerConfig::binary(0)).with_max_connections(0),
            Arc::new(forwarder),
        )
        .await;

        assert!(matches!(result, Err(ServerError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_accept_error_is_retried() {
        let (forwarder, mut rx) = EventForwarder::channel();
        let codec: Arc<dyn RpcCodec> = Arc::new(BinRpcCodec::new());
        let context = Arc::new(ConnectionContext::new(
            codec,
            Dispatcher::new(Arc::new(forwarder)),
            TransferMode::Binary,
            ServerConfig::default().max_message_size,
        ));

        let (mut client, server_end) = tokio::io::duplex(1024);
        let acceptor = ScriptedAcceptor {
            script: Mutex::new(VecDeque::from([
                Err(io::Error::new(io::ErrorKind::ConnectionAborted, "aborted")),
                Err(io::Error::new(io::ErrorKind::Other, "too many open files")),
                Ok(server_end),
            ])),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(accept_loop(
            acceptor,
            context,
            WorkerPool::new(4),
            shutdown_rx,
            Duration::from_secs(1),
        ));

        let call = RpcMessage::new(
            "event",
            vec!["BidCos-RF".into(), "LEQ0123456:1".into(), "STATE".into(), true.into()],
        );
        client
            .write_all(&BinRpcCodec::new().encode_request(&call).unwrap())
            .await
            .unwrap();
        let mut reply = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
            .await
            .expect("reply after accept errors")
            .unwrap();

        assert_eq!(reply, BIN_EMPTY_STRING);
        assert!(matches!(
            rx.recv().await,
            Some(GatewayEvent::Datapoint { value: RpcValue::Bool(true), .. })
        ));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_port_in_use_is_a_bind_error() {
        let (forwarder, _rx) = EventForwarder::channel();
        let forwarder = Arc::new(forwarder);
        let first = CallbackServer::start(local(ServerConfig::binary(0)), forwarder.clone())
            .await
            .unwrap();

        let second =
            CallbackServer::start(local(ServerConfig::binary(first.port())), forwarder).await;

        assert!(matches!(second, Err(ServerError::Bind { .. })));
        first.shutdown().await.unwrap();
    }
}
