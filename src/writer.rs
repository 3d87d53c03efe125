//! Dedicated writer task for frame sending.
//!
//! The connection pump never writes to the transport directly. Every frame
//! goes through a single writer task fed by an mpsc channel, so frames from
//! different sessions and links can never interleave on the wire, and
//! multiple queued frames are batched into one vectored write.
//!
//! # Architecture
//!
//! ```text
//! Connection pump ─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Transport
//! ```
//!
//! Backpressure: a shared pending counter tracks frames queued but not yet
//! written; senders wait (up to a timeout) while it is at the limit.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::codec::EncodeOptions;
use crate::error::{AmqpError, Result};
use crate::protocol::{encode_amqp_body, frame_type, FrameHeader, Performative, FRAME_HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the transport.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Pre-encoded 8-byte frame header.
    pub header: [u8; FRAME_HEADER_SIZE],
    /// Frame body (empty for heartbeats).
    pub body: Bytes,
}

impl OutboundFrame {
    /// Frame of the given type around an already encoded body.
    #[inline]
    pub fn new(frame_type: u8, channel: u16, body: Bytes) -> Self {
        Self {
            header: FrameHeader::new(frame_type, channel, body.len()).encode(),
            body,
        }
    }

    /// Encode an AMQP performative (and transfer payload) into a frame.
    pub fn amqp(
        channel: u16,
        performative: &Performative,
        payload: &[u8],
        opts: &EncodeOptions,
    ) -> Result<Self> {
        let body = encode_amqp_body(performative, payload, opts)?;
        Ok(Self::new(frame_type::AMQP, channel, body))
    }

    /// Empty AMQP frame on channel 0.
    #[inline]
    pub fn heartbeat() -> Self {
        Self::new(frame_type::AMQP, 0, Bytes::new())
    }

    /// Total size of this frame (header + body).
    #[inline]
    pub fn size(&self) -> usize {
        FRAME_HEADER_SIZE + self.body.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    #[serde(rename = "backpressure_timeout_ms", with = "crate::connection::duration_ms")]
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Send a frame to the writer task.
    ///
    /// Waits while backpressure is active, failing with `Timeout` after
    /// the configured duration.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            AmqpError::ConnectionClosed(None)
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if start.elapsed() > self.timeout {
                return Err(AmqpError::Timeout);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task exits once every handle is dropped, after flushing and shutting
/// down the write half.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        trace!(frames = batch_size, "writing batch");
        write_batch(&mut writer, &batch).await?;

        pending.fetch_sub(batch_size, Ordering::Release);
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(batch.len() * 2);
    for frame in batch {
        slices.push(IoSlice::new(&frame.header));
        if !frame.body.is_empty() {
            slices.push(IoSlice::new(&frame.body));
        }
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();

    let written = writer.write_vectored(&slices).await?;
    if written == total_size {
        writer.flush().await?;
        return Ok(());
    }

    if written == 0 {
        return Err(write_zero());
    }

    // Partial write: continue with the remaining bytes.
    let mut total_written = written;
    while total_written < total_size {
        let remaining_slices = build_remaining_slices(batch, total_written);
        if remaining_slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&remaining_slices).await?;
        if written == 0 {
            return Err(write_zero());
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

fn write_zero() -> AmqpError {
    AmqpError::Io(std::io::Error::new(
        std::io::ErrorKind::WriteZero,
        "write_vectored returned 0",
    ))
}

/// Build IoSlice array for remaining data after partial write.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut skipped = 0;

    for frame in batch {
        let header_start = skipped;
        let header_end = skipped + FRAME_HEADER_SIZE;
        if skip_bytes < header_end {
            let start_in_header = skip_bytes.saturating_sub(header_start);
            slices.push(IoSlice::new(&frame.header[start_in_header..]));
        }
        skipped = header_end;

        if !frame.body.is_empty() {
            let body_start = skipped;
            let body_end = skipped + frame.body.len();
            if skip_bytes < body_end {
                let start_in_body = skip_bytes.saturating_sub(body_start);
                slices.push(IoSlice::new(&frame.body[start_in_body..]));
            }
            skipped = body_end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{End, FrameBuffer, Incoming};
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn data_frame(channel: u16, body: &'static [u8]) -> OutboundFrame {
        OutboundFrame::new(frame_type::AMQP, channel, Bytes::from_static(body))
    }

    #[test]
    fn test_outbound_frame_header() {
        let frame = data_frame(3, b"hello");
        assert_eq!(frame.header, [0, 0, 0, 13, 2, 0, 0, 3]);
        assert_eq!(frame.size(), FRAME_HEADER_SIZE + 5);
    }

    #[test]
    fn test_heartbeat_is_bare_header() {
        let frame = OutboundFrame::heartbeat();
        assert!(frame.body.is_empty());
        assert_eq!(frame.header, [0, 0, 0, 8, 2, 0, 0, 0]);
    }

    #[test]
    fn test_amqp_frame_decodes() {
        let frame = OutboundFrame::amqp(
            1,
            &Performative::End(End::default()),
            &[],
            &EncodeOptions::default(),
        )
        .unwrap();
        let mut bytes = frame.header.to_vec();
        bytes.extend_from_slice(&frame.body);

        let mut buffer = FrameBuffer::new();
        let items = buffer.push(&bytes).unwrap();
        let Incoming::Frame(decoded) = &items[0] else {
            panic!("expected frame")
        };
        assert_eq!(decoded.channel(), 1);
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_writer_batching() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        for i in 0..10u16 {
            handle.send(data_frame(i, b"abcd")).await.unwrap();
        }

        let expected = 10 * (FRAME_HEADER_SIZE + 4);
        let mut buf = vec![0u8; expected];
        server.read_exact(&mut buf).await.unwrap();

        let mut frames = FrameBuffer::new();
        assert_eq!(frames.push(&buf).unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_send_times_out_at_capacity() {
        let (tx, mut rx) = mpsc::channel::<OutboundFrame>(10);
        let pending = Arc::new(AtomicUsize::new(100));
        let handle = WriterHandle::new(tx, pending.clone(), 100, Duration::from_millis(20));

        let result = handle.send(OutboundFrame::heartbeat()).await;
        assert!(matches!(result, Err(AmqpError::Timeout)));
        assert_eq!(pending.load(Ordering::Acquire), 100);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_after_writer_gone() {
        let (tx, rx) = mpsc::channel::<OutboundFrame>(10);
        drop(rx);
        let pending = Arc::new(AtomicUsize::new(0));
        let handle = WriterHandle::new(tx, pending.clone(), 10, Duration::from_secs(1));
        let err = handle.send(OutboundFrame::heartbeat()).await.unwrap_err();
        assert!(matches!(err, AmqpError::ConnectionClosed(None)));
        assert_eq!(pending.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_build_remaining_slices_partial_header() {
        let batch = vec![data_frame(0, b"hello")];
        let slices = build_remaining_slices(&batch, 5);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), FRAME_HEADER_SIZE - 5);
        assert_eq!(slices[1].len(), 5);

        let slices = build_remaining_slices(&batch, FRAME_HEADER_SIZE + 2);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 3);
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|i| data_frame(i, b"abc")).collect();
        write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(buf.into_inner().len(), 5 * (FRAME_HEADER_SIZE + 3));
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());
        drop(handle);

        assert!(task.await.unwrap().is_ok());
        let mut buf = Vec::new();
        assert_eq!(server.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
