//! Transport module - the byte streams a connection runs over.
//!
//! The engine only needs an async bidirectional byte stream. Connectors turn
//! an [`Address`] into such a stream; the [`TransportRegistry`] picks the
//! connector by URL scheme:
//!
//! - `amqp`: TCP
//! - `amqps`: TCP + TLS (rustls)
//! - `ws` / `wss`: WebSocket binary messages, optionally over TLS
//!
//! Other schemes can be registered at runtime.

mod address;
mod tcp;
mod tls;
mod websocket;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{AmqpError, Result};

pub use address::{default_port, Address};
pub use tcp::TcpConnector;
pub use tls::{client_config, connect_tls, TlsConnector};
pub use websocket::{WebSocketConnector, WsStream, AMQP_SUBPROTOCOL};

/// Any stream usable as a transport.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// A boxed, type-erased transport stream.
pub type Transport = Box<dyn IoStream>;

/// Opens a transport stream for an address.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, address: &Address) -> Result<Transport>;
}

/// Scheme → connector table.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    connectors: HashMap<String, Arc<dyn TransportConnector>>,
}

impl TransportRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `amqp`, `amqps`, `ws` and `wss` connectors.
    pub fn with_defaults(accept_invalid_certs: bool) -> Result<Self> {
        let mut registry = Self::new();
        registry.register("amqp", TcpConnector);
        registry.register("amqps", TlsConnector::new(accept_invalid_certs)?);
        registry.register("ws", WebSocketConnector::plain());
        registry.register("wss", WebSocketConnector::secure(accept_invalid_certs)?);
        Ok(registry)
    }

    /// Add or replace the connector for `scheme`.
    pub fn register(&mut self, scheme: &str, connector: impl TransportConnector + 'static) {
        self.connectors
            .insert(scheme.to_ascii_lowercase(), Arc::new(connector));
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn TransportConnector>> {
        self.connectors.get(scheme).cloned()
    }

    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.connectors.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    pub async fn connect(&self, address: &Address) -> Result<Transport> {
        let connector = self.get(&address.scheme).ok_or_else(|| {
            AmqpError::InvalidAddress(format!("no transport for scheme {}", address.scheme))
        })?;
        connector.connect(address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::Mutex;

    /// Hands out one prepared in-memory stream.
    struct MemoryConnector(Mutex<Option<DuplexStream>>);

    #[async_trait]
    impl TransportConnector for MemoryConnector {
        async fn connect(&self, _address: &Address) -> Result<Transport> {
            match self.0.lock().await.take() {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(AmqpError::Transport("already used".into())),
            }
        }
    }

    #[test]
    fn test_default_schemes() {
        let registry = TransportRegistry::with_defaults(false).unwrap();
        assert_eq!(registry.schemes(), vec!["amqp", "amqps", "ws", "wss"]);
    }

    #[tokio::test]
    async fn test_unknown_scheme() {
        let registry = TransportRegistry::new();
        let address = Address::parse("amqp://localhost").unwrap();
        let err = registry.connect(&address).await.err().unwrap();
        assert!(matches!(err, AmqpError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_custom_scheme() {
        let (client, mut peer) = duplex(64);
        let mut registry = TransportRegistry::new();
        registry.register("mem", MemoryConnector(Mutex::new(Some(client))));

        let address = Address::parse("mem://anywhere:1").unwrap();
        let mut transport = registry.connect(&address).await.unwrap();
        transport.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert!(registry.connect(&address).await.is_err());
    }
}
