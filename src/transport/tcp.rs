//! Plain TCP.

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{AmqpError, Result};

use super::{Address, Transport, TransportConnector};

/// `amqp`: a plain TCP stream with Nagle disabled.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(&self, address: &Address) -> Result<Transport> {
        let stream = TcpStream::connect(address.authority())
            .await
            .map_err(|e| AmqpError::Transport(format!("connect {}: {}", address, e)))?;
        stream.set_nodelay(true)?;
        debug!(%address, "TCP connected");
        Ok(Box::new(stream))
    }
}
