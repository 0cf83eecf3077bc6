//! Per-socket request handling.
//!
//! Every accepted socket carries exactly one call. The handler reads it,
//! dispatches it, writes the single reply and closes the socket. BIN-RPC is
//! framed straight off the stream; XML-RPC arrives as the body of one HTTP
//! POST served by hyper.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use hyper::body::HttpBody as _;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use rpc_codec::binary::{self, HEADER_LEN};
use rpc_codec::RpcCodec;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::config::TransferMode;
use crate::dispatcher::{Dispatcher, Reply};
use crate::error::ConnectionError;

/// How a connection ended when nothing went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The call was answered
    Replied,
    /// The peer closed the socket before sending anything
    PeerClosed,
    /// Shutdown started while the request was still being read
    Cancelled,
}

/// Everything a handler needs, shared by all connections of one server.
pub(crate) struct ConnectionContext {
    codec: Arc<dyn RpcCodec>,
    dispatcher: Dispatcher,
    transfer_mode: TransferMode,
    max_message_size: usize,
}

impl ConnectionContext {
    pub(crate) fn new(
        codec: Arc<dyn RpcCodec>,
        dispatcher: Dispatcher,
        transfer_mode: TransferMode,
        max_message_size: usize,
    ) -> Self {
        Self {
            codec,
            dispatcher,
            transfer_mode,
            max_message_size,
        }
    }

    /// Serve one accepted socket and log how it ended.
    pub(crate) async fn handle<S>(
        self: Arc<Self>,
        stream: S,
        peer: SocketAddr,
        cancel: watch::Receiver<bool>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match self.serve(stream, cancel).await {
            Ok(Outcome::Replied) => debug!(%peer, "Callback answered"),
            Ok(Outcome::PeerClosed) => trace!(%peer, "Peer closed connection without a request"),
            Ok(Outcome::Cancelled) => debug!(%peer, "Callback connection cancelled by shutdown"),
            Err(e) => warn!(%peer, error = %e, "Dropping callback connection"),
        }
    }

    pub(crate) async fn serve<S>(
        self: &Arc<Self>,
        stream: S,
        cancel: watch::Receiver<bool>,
    ) -> Result<Outcome, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match self.transfer_mode {
            TransferMode::Binary => self.serve_binary(stream, cancel).await,
            TransferMode::Xml => self.serve_http(stream, cancel).await,
        }
    }

    async fn serve_binary<S>(
        &self,
        mut stream: S,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Outcome, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let frame = tokio::select! {
            frame = self.read_frame(&mut stream) => frame?,
            _ = cancelled(&mut cancel) => return Ok(Outcome::Cancelled),
        };
        let Some(frame) = frame else {
            return Ok(Outcome::PeerClosed);
        };

        let reply = self.process(&frame).await?;
        stream.write_all(&reply).await?;
        stream.shutdown().await?;
        Ok(Outcome::Replied)
    }

    /// Read one BIN-RPC frame. `None` means the peer closed before the first byte.
    async fn read_frame<S>(&self, stream: &mut S) -> Result<Option<Vec<u8>>, ConnectionError>
    where
        S: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        if stream.read(&mut header[..1]).await? == 0 {
            return Ok(None);
        }
        read_full(stream, &mut header[1..], HEADER_LEN).await?;

        let body_len = binary::frame_length(&header).map_err(ConnectionError::Decode)?;
        if body_len > self.max_message_size {
            return Err(ConnectionError::FrameTooLarge {
                declared: body_len,
                limit: self.max_message_size,
            });
        }

        let mut frame = vec![0u8; HEADER_LEN + body_len];
        frame[..HEADER_LEN].copy_from_slice(&header);
        read_full(stream, &mut frame[HEADER_LEN..], HEADER_LEN + body_len).await?;
        Ok(Some(frame))
    }

    async fn serve_http<S>(
        self: &Arc<Self>,
        stream: S,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Outcome, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let answered = Arc::new(AtomicBool::new(false));
        let service = {
            let context = Arc::clone(self);
            let answered = Arc::clone(&answered);
            service_fn(move |request| {
                let context = Arc::clone(&context);
                let answered = Arc::clone(&answered);
                async move {
                    let response = context.answer_http(request).await?;
                    answered.store(true, Ordering::Release);
                    Ok::<_, ConnectionError>(response)
                }
            })
        };

        let mut http = Http::new();
        http.http1_only(true).http1_keep_alive(false);
        let connection = http.serve_connection(stream, service);
        tokio::pin!(connection);

        let result = tokio::select! {
            result = connection.as_mut() => result,
            _ = cancelled(&mut cancel) => {
                connection.as_mut().graceful_shutdown();
                connection.await
            }
        };
        result.map_err(http_failure)?;

        Ok(if answered.load(Ordering::Acquire) {
            Outcome::Replied
        } else if *cancel.borrow() {
            Outcome::Cancelled
        } else {
            Outcome::PeerClosed
        })
    }

    async fn answer_http(&self, request: Request<Body>) -> Result<Response<Body>, ConnectionError> {
        if request.method() != Method::POST {
            return Err(ConnectionError::UnsupportedHttpMethod(
                request.method().to_string(),
            ));
        }

        let declared = request
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<usize>().ok());
        if let Some(declared) = declared.filter(|len| *len > self.max_message_size) {
            return Err(ConnectionError::FrameTooLarge {
                declared,
                limit: self.max_message_size,
            });
        }

        let body = self.read_body(request.into_body()).await?;
        if body.is_empty() {
            return Err(ConnectionError::EmptyBody);
        }

        let reply = self.process(&body).await?;
        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/xml")
            .body(Body::from(reply))
            .map_err(|e| ConnectionError::Http(e.to_string()))
    }

    async fn read_body(&self, mut body: Body) -> Result<BytesMut, ConnectionError> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk.map_err(|e| ConnectionError::Http(e.to_string()))?;
            if collected.len() + chunk.len() > self.max_message_size {
                return Err(ConnectionError::FrameTooLarge {
                    declared: collected.len() + chunk.len(),
                    limit: self.max_message_size,
                });
            }
            collected.extend_from_slice(&chunk);
        }
        Ok(collected)
    }

    /// Decode, dispatch and encode one call.
    async fn process(&self, request: &[u8]) -> Result<Bytes, ConnectionError> {
        let message = self
            .codec
            .decode_request(request)
            .map_err(ConnectionError::Decode)?;
        debug!(
            method = message.method_name(),
            format = self.codec.format_name(),
            "Received callback"
        );

        match self.dispatcher.dispatch(message).await {
            Reply::Canned(kind) => Ok(self.codec.canned(kind)),
            Reply::Value(value) => self
                .codec
                .encode_response(&value)
                .map_err(ConnectionError::Encode),
        }
    }
}

/// Fill `buf` completely; end of stream is a truncated frame of `expected` bytes.
async fn read_full<S>(stream: &mut S, buf: &mut [u8], expected: usize) -> Result<(), ConnectionError>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ConnectionError::Truncated { expected })
        }
        Err(e) => Err(e.into()),
    }
}

/// Resolves once shutdown has been requested or the server is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|stop| *stop).await;
}

/// Recover the handler's own error from a failed hyper connection.
fn http_failure(error: hyper::Error) -> ConnectionError {
    let text = error.to_string();
    match error.into_cause().map(|cause| cause.downcast::<ConnectionError>()) {
        Some(Ok(inner)) => *inner,
        _ => ConnectionError::Http(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::EventForwarder;
    use crate::listener::{DatapointInfo, GatewayEvent};
    use rpc_codec::binary::BIN_EMPTY_STRING;
    use rpc_codec::xml::XML_EMPTY_STRING;
    use rpc_codec::{BinRpcCodec, RpcMessage, RpcValue, XmlRpcCodec};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_test::io::Builder;

    fn context(mode: TransferMode) -> (Arc<ConnectionContext>, UnboundedReceiver<GatewayEvent>) {
        let (forwarder, rx) = EventForwarder::channel();
        let context = ConnectionContext::new(
            mode.codec("ISO-8859-1").unwrap(),
            Dispatcher::new(Arc::new(forwarder)),
            mode,
            1024,
        );
        (Arc::new(context), rx)
    }

    fn event_call() -> RpcMessage {
        RpcMessage::new(
            "event",
            vec!["BidCos-RF".into(), "LEQ0123456:1".into(), "STATE".into(), true.into()],
        )
    }

    fn expected_event() -> GatewayEvent {
        GatewayEvent::Datapoint {
            datapoint: DatapointInfo::new("LEQ0123456", Some(1), "STATE"),
            value: RpcValue::Bool(true),
        }
    }

    #[tokio::test]
    async fn test_binary_event_gets_canned_reply() {
        let (context, mut rx) = context(TransferMode::Binary);
        let (_stop, cancel) = watch::channel(false);
        let frame = BinRpcCodec::new().encode_request(&event_call()).unwrap();
        let stream = Builder::new().read(&frame).write(BIN_EMPTY_STRING).build();

        let outcome = context.serve(stream, cancel).await.unwrap();

        assert_eq!(outcome, Outcome::Replied);
        assert_eq!(rx.try_recv().unwrap(), expected_event());
    }

    #[tokio::test]
    async fn test_truncated_binary_frame_gets_no_reply() {
        let (context, mut rx) = context(TransferMode::Binary);
        let (_stop, cancel) = watch::channel(false);
        let frame = BinRpcCodec::new().encode_request(&event_call()).unwrap();
        let stream = Builder::new().read(&frame[..frame.len() - 3]).build();

        let result = context.serve(stream, cancel).await;

        assert!(matches!(result, Err(ConnectionError::Truncated { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_truncated_binary_header_gets_no_reply() {
        let (context, _rx) = context(TransferMode::Binary);
        let (_stop, cancel) = watch::channel(false);
        let stream = Builder::new().read(b"Bin\x00").build();

        let result = context.serve(stream, cancel).await;

        assert!(matches!(
            result,
            Err(ConnectionError::Truncated { expected: HEADER_LEN })
        ));
    }

    #[tokio::test]
    async fn test_silent_peer_close() {
        let (context, _rx) = context(TransferMode::Binary);
        let (_stop, cancel) = watch::channel(false);
        let stream = Builder::new().build();

        let outcome = context.serve(stream, cancel).await.unwrap();

        assert_eq!(outcome, Outcome::PeerClosed);
    }

    #[tokio::test]
    async fn test_oversized_binary_frame_is_rejected() {
        let (context, _rx) = context(TransferMode::Binary);
        let (_stop, cancel) = watch::channel(false);
        let stream = Builder::new().read(b"Bin\x00\x00\x01\x00\x00").build();

        let result = context.serve(stream, cancel).await;

        assert!(matches!(
            result,
            Err(ConnectionError::FrameTooLarge { declared: 65536, limit: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_bad_magic_is_a_decode_error() {
        let (context, _rx) = context(TransferMode::Binary);
        let (_stop, cancel) = watch::channel(false);
        let stream = Builder::new().read(b"GET / HT").build();

        let result = context.serve(stream, cancel).await;

        assert!(matches!(result, Err(ConnectionError::Decode(_))));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_read() {
        let (context, _rx) = context(TransferMode::Binary);
        let (stop, cancel) = watch::channel(false);
        let (_client, server) = tokio::io::duplex(1024);

        let handler = tokio::spawn({
            let context = Arc::clone(&context);
            async move { context.serve(server, cancel).await }
        });
        stop.send(true).unwrap();

        assert_eq!(handler.await.unwrap().unwrap(), Outcome::Cancelled);
    }

    async fn http_exchange(request: Vec<u8>) -> (Result<Outcome, ConnectionError>, Vec<u8>) {
        let (context, _rx) = context(TransferMode::Xml);
        let (_stop, cancel) = watch::channel(false);
        let (mut client, server) = tokio::io::duplex(64 * 1024);

        let handler = tokio::spawn({
            let context = Arc::clone(&context);
            async move { context.serve(server, cancel).await }
        });

        client.write_all(&request).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        (handler.await.unwrap(), response)
    }

    fn post(body: &[u8]) -> Vec<u8> {
        let mut request = format!(
            "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(body);
        request
    }

    #[tokio::test]
    async fn test_xml_event_over_http() {
        let body = XmlRpcCodec::new().encode_request(&event_call()).unwrap();

        let (outcome, response) = http_exchange(post(&body)).await;

        assert_eq!(outcome.unwrap(), Outcome::Replied);
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("content-type: text/xml"));
        assert!(response.ends_with(XML_EMPTY_STRING));
    }

    #[tokio::test]
    async fn test_xml_empty_body_closes_without_reply() {
        let (outcome, response) = http_exchange(post(b"")).await;

        assert!(matches!(outcome, Err(ConnectionError::EmptyBody)));
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn test_xml_get_is_rejected() {
        let (outcome, response) =
            http_exchange(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec()).await;

        assert!(matches!(
            outcome,
            Err(ConnectionError::UnsupportedHttpMethod(method)) if method == "GET"
        ));
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn test_xml_malformed_document_is_a_decode_error() {
        let (outcome, response) = http_exchange(post(b"<methodCall><methodName>event")).await;

        assert!(matches!(outcome, Err(ConnectionError::Decode(_))));
        assert!(response.is_empty());
    }
}
