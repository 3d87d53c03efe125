//! AMQP over WebSocket.
//!
//! Frames travel as binary WebSocket messages under the `amqp`
//! subprotocol. [`WsStream`] turns the message stream back into a byte
//! stream so the rest of the engine sees an ordinary transport; message
//! boundaries carry no meaning.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures_util::{SinkExt, StreamExt};
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::debug;

use crate::error::{AmqpError, Result};

use super::tls::{client_config, connect_tls};
use super::{Address, Transport, TransportConnector};

/// WebSocket subprotocol for AMQP.
pub const AMQP_SUBPROTOCOL: &str = "amqp";

/// Byte-stream view of a WebSocket carrying binary messages.
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Bytes,
}

impl<S> WsStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Bytes::new(),
        }
    }
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::other(e.to_string())
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let n = self.read_buf.len().min(buf.remaining());
                buf.put_slice(&self.read_buf[..n]);
                self.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            match ready!(self.inner.poll_next_unpin(cx)) {
                Some(Ok(Message::Binary(data))) => self.read_buf = data,
                // pings are answered by tungstenite itself
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Text(_))) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "text message on AMQP WebSocket",
                    )))
                }
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Err(e)) => return Poll::Ready(Err(ws_error(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        ready!(self.inner.poll_ready_unpin(cx)).map_err(ws_error)?;
        self.inner
            .start_send_unpin(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(ws_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_flush_unpin(cx).map_err(ws_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_close_unpin(cx).map_err(ws_error)
    }
}

/// `ws` and `wss`.
pub struct WebSocketConnector {
    tls: Option<Arc<ClientConfig>>,
}

impl WebSocketConnector {
    pub fn plain() -> Self {
        Self { tls: None }
    }

    pub fn secure(accept_invalid_certs: bool) -> Result<Self> {
        Ok(Self {
            tls: Some(client_config(accept_invalid_certs)?),
        })
    }

    async fn upgrade<S>(&self, stream: S, address: &Address) -> Result<WsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let scheme = if self.tls.is_some() { "wss" } else { "ws" };
        let url = format!(
            "{}://{}/{}",
            scheme,
            address.authority(),
            address.path.as_deref().unwrap_or("")
        );
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AmqpError::InvalidAddress(format!("{}: {}", url, e)))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            http_value(AMQP_SUBPROTOCOL)?,
        );
        let (ws, _response) = client_async(request, stream)
            .await
            .map_err(|e| AmqpError::Transport(format!("WebSocket handshake failed: {}", e)))?;
        debug!(%url, "WebSocket established");
        Ok(WsStream::new(ws))
    }
}

fn http_value(
    value: &str,
) -> Result<tokio_tungstenite::tungstenite::http::HeaderValue> {
    value
        .parse()
        .map_err(|_| AmqpError::Transport(format!("invalid header value {}", value)))
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(&self, address: &Address) -> Result<Transport> {
        let tcp = TcpStream::connect(address.authority())
            .await
            .map_err(|e| AmqpError::Transport(format!("connect {}: {}", address, e)))?;
        tcp.set_nodelay(true)?;
        match &self.tls {
            Some(config) => {
                let tls = connect_tls(tcp, &address.host, config.clone()).await?;
                Ok(Box::new(self.upgrade(tls, address).await?))
            }
            None => Ok(Box::new(self.upgrade(tcp, address).await?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    fn amqp_subprotocol(
        _request: &Request,
        mut response: Response,
    ) -> std::result::Result<Response, ErrorResponse> {
        response.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(AMQP_SUBPROTOCOL),
        );
        Ok(response)
    }

    #[tokio::test]
    async fn test_binary_messages_as_byte_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_hdr_async(socket, amqp_subprotocol).await.unwrap();
            ws.send(Message::Binary(Bytes::from_static(b"AMQP"))).await.unwrap();
            ws.send(Message::Binary(Bytes::from_static(&[0, 1, 0, 0])))
                .await
                .unwrap();
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => data,
                other => panic!("unexpected {:?}", other),
            }
        });

        let address = Address::parse(&format!("ws://127.0.0.1:{}", port)).unwrap();
        let mut transport = WebSocketConnector::plain().connect(&address).await.unwrap();
        let mut header = [0u8; 8];
        transport.read_exact(&mut header).await.unwrap();
        assert_eq!(&header, b"AMQP\x00\x01\x00\x00");

        transport.write_all(b"hello").await.unwrap();
        transport.flush().await.unwrap();
        assert_eq!(&server.await.unwrap()[..], b"hello");
    }
}
