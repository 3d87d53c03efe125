//! Protocol header exchange and the optional SASL layer.
//!
//! ```text
//! client                         peer
//!   AMQP 3 1 0 0  ──────────────▶
//!                 ◀────────────── AMQP 3 1 0 0
//!                 ◀────────────── sasl-mechanisms
//!   sasl-init     ──────────────▶
//!                 ◀────────────── sasl-outcome
//!   AMQP 0 1 0 0  ──────────────▶
//!                 ◀────────────── AMQP 0 1 0 0
//! ```
//!
//! Bytes read past the final header stay in the `FrameBuffer`, which the
//! caller hands on to the connection pump.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{AmqpError, Result};
use crate::protocol::{build_sasl_frame, FrameBuffer, Incoming, ProtocolHeader, ProtocolId};

use super::sasl::{SaslMechanism, SaslNegotiator};

const READ_CHUNK: usize = 8 * 1024;

/// Read until the buffer yields one complete item.
pub(crate) async fn read_item<S>(stream: &mut S, buffer: &mut FrameBuffer) -> Result<Incoming>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = BytesMut::with_capacity(READ_CHUNK);
    loop {
        if let Some(item) = buffer.next_item()? {
            return Ok(item);
        }
        chunk.clear();
        let n = stream.read_buf(&mut chunk).await?;
        if n == 0 {
            return Err(AmqpError::ConnectionClosed(None));
        }
        buffer.extend(&chunk);
    }
}

async fn exchange_header<S>(
    stream: &mut S,
    buffer: &mut FrameBuffer,
    header: ProtocolHeader,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&header.encode()).await?;
    stream.flush().await?;
    buffer.expect_protocol_header();

    match read_item(stream, buffer).await? {
        Incoming::Header(reply) if reply == header => Ok(()),
        Incoming::Header(reply) => Err(match header.id {
            ProtocolId::Sasl => AmqpError::SaslNegotiationFailed(format!(
                "peer answered with protocol header {:?}",
                reply.id
            )),
            _ => AmqpError::Protocol(format!(
                "peer answered with protocol header {:?} {}.{}.{}",
                reply.id, reply.major, reply.minor, reply.revision
            )),
        }),
        Incoming::Frame(_) => Err(AmqpError::Protocol(
            "frame received before protocol header".into(),
        )),
    }
}

async fn negotiate_sasl<S>(
    stream: &mut S,
    buffer: &mut FrameBuffer,
    mechanism: Arc<dyn SaslMechanism>,
    hostname: Option<String>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    exchange_header(stream, buffer, ProtocolHeader::sasl()).await?;

    let mut negotiator = SaslNegotiator::new(mechanism, hostname);
    while !negotiator.is_done() {
        let frame = match read_item(stream, buffer).await? {
            Incoming::Frame(frame) if frame.is_sasl() => frame,
            Incoming::Frame(_) => {
                return Err(AmqpError::SaslNegotiationFailed(
                    "AMQP frame during SASL exchange".into(),
                ))
            }
            Incoming::Header(_) => {
                return Err(AmqpError::SaslNegotiationFailed(
                    "unexpected protocol header during SASL exchange".into(),
                ))
            }
        };
        let sasl = frame.decode_sasl()?;
        debug!(frame = sasl.name(), "sasl frame received");
        if let Some(reply) = negotiator.handle(sasl)? {
            stream.write_all(&build_sasl_frame(&reply)?).await?;
            stream.flush().await?;
        }
    }
    Ok(())
}

/// Run the pre-AMQP handshake: SASL when a mechanism is given, then the
/// AMQP protocol header.
pub async fn handshake<S>(
    stream: &mut S,
    buffer: &mut FrameBuffer,
    sasl: Option<Arc<dyn SaslMechanism>>,
    hostname: Option<String>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(mechanism) = sasl {
        negotiate_sasl(stream, buffer, mechanism, hostname).await?;
    }
    exchange_header(stream, buffer, ProtocolHeader::amqp()).await?;
    debug!("protocol header exchanged");
    Ok(())
}
