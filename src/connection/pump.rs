//! Connection pump.
//!
//! One task per connection owns the [`ConnectionEngine`]. It reads the
//! transport, feeds frames to the engine, executes application commands
//! arriving over an mpsc channel, keeps the peer's idle deadline with
//! heartbeats and enforces ours. After every step it hands the engine's
//! frames to the writer task and routes its events to waiting handles.
//!
//! ```text
//! handles ─► mpsc<Command> ─┐
//!                           ├─► Pump ─► ConnectionEngine ─► WriterHandle ─► Transport
//! Transport ─► FrameBuffer ─┘    │
//!                                └─► oneshot replies / delivery queues
//! ```
//!
//! The pump never runs application code. When it ends, every pending reply
//! and delivery queue receives the terminal error.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::engine::{ConnectionEngine, EngineEvent, LinkOptions, ReceivedDelivery, SessionOptions};
use crate::error::{AmqpError, Result};
use crate::protocol::{ErrorCondition, FrameBuffer, Incoming, Outcome, Role, Source, Target};
use crate::transport::Transport;
use crate::writer::{OutboundFrame, WriterHandle};

const READ_CHUNK: usize = 64 * 1024;

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Per-receiver delivery queue. Bounded in practice by link credit.
pub(crate) type DeliveryTx = mpsc::UnboundedSender<Result<ReceivedDelivery>>;
pub(crate) type DeliveryRx = mpsc::UnboundedReceiver<Result<ReceivedDelivery>>;

type LinkKey = (u16, u32);

#[derive(Debug, Clone, Copy)]
pub(crate) enum CreditOp {
    Add(u32),
    Drain,
}

/// A request from an application handle to the pump.
pub(crate) enum Command {
    BeginSession {
        opts: SessionOptions,
        reply: Reply<u16>,
    },
    EndSession {
        channel: u16,
        error: Option<ErrorCondition>,
        reply: Reply<()>,
    },
    Attach {
        channel: u16,
        name: String,
        role: Role,
        source: Option<Source>,
        target: Option<Target>,
        opts: LinkOptions,
        deliveries: Option<DeliveryTx>,
        reply: Reply<u32>,
    },
    Detach {
        channel: u16,
        handle: u32,
        closed: bool,
        error: Option<ErrorCondition>,
        reply: Reply<()>,
    },
    Send {
        channel: u16,
        handle: u32,
        token: u64,
        payload: Bytes,
        settled: bool,
        non_blocking: bool,
        reply: Reply<Outcome>,
    },
    CancelSend {
        channel: u16,
        token: u64,
    },
    Dispose {
        channel: u16,
        handle: u32,
        delivery_id: u32,
        outcome: Outcome,
        reply: Reply<()>,
    },
    Credit {
        channel: u16,
        handle: u32,
        op: CreditOp,
        reply: Reply<()>,
    },
    Close {
        error: Option<ErrorCondition>,
        reply: Reply<()>,
    },
}

impl Command {
    /// Answer the command with an error without executing it.
    fn fail(self, error: AmqpError) {
        match self {
            Command::BeginSession { reply, .. } => drop(reply.send(Err(error))),
            Command::Attach { reply, .. } => drop(reply.send(Err(error))),
            Command::Send { reply, .. } => drop(reply.send(Err(error))),
            Command::EndSession { reply, .. }
            | Command::Detach { reply, .. }
            | Command::Dispose { reply, .. }
            | Command::Credit { reply, .. }
            | Command::Close { reply, .. } => drop(reply.send(Err(error))),
            Command::CancelSend { .. } => {}
        }
    }
}

/// How the connection ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Terminal {
    /// Condition carried by the peer's `close`, or the local failure.
    pub error: Option<ErrorCondition>,
    /// True if the close exchange completed.
    pub clean: bool,
}

impl Terminal {
    pub fn to_error(&self) -> AmqpError {
        AmqpError::ConnectionClosed(self.error.clone())
    }
}

/// Outstanding replies and delivery queues, keyed by what will resolve them.
#[derive(Default)]
struct Waiters {
    opened: Option<Reply<()>>,
    begins: HashMap<u16, Reply<u16>>,
    ends: HashMap<u16, Reply<()>>,
    attaches: HashMap<LinkKey, Reply<u32>>,
    detaches: HashMap<LinkKey, Reply<()>>,
    drains: HashMap<LinkKey, Vec<Reply<()>>>,
    sends: HashMap<u64, Reply<Outcome>>,
    closes: Vec<Reply<()>>,
    receivers: HashMap<LinkKey, DeliveryTx>,
}

impl Waiters {
    fn route(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Opened => {
                if let Some(reply) = self.opened.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            EngineEvent::Closed(_) => {}
            EngineEvent::SessionBegun { channel } => {
                if let Some(reply) = self.begins.remove(&channel) {
                    let _ = reply.send(Ok(channel));
                }
            }
            EngineEvent::SessionEnded {
                channel,
                error,
                tokens,
            } => {
                if let Some(reply) = self.begins.remove(&channel) {
                    let _ = reply.send(Err(AmqpError::SessionEnded(error.clone())));
                }
                if let Some(reply) = self.ends.remove(&channel) {
                    let _ = reply.send(Ok(()));
                }
                self.fail_tokens(tokens, || AmqpError::SessionEnded(error.clone()));
                self.fail_links(|key| key.0 == channel, || AmqpError::SessionEnded(error.clone()));
            }
            EngineEvent::LinkAttached { channel, handle } => {
                if let Some(reply) = self.attaches.remove(&(channel, handle)) {
                    let _ = reply.send(Ok(handle));
                }
            }
            EngineEvent::LinkDetached {
                channel,
                handle,
                error,
                tokens,
            } => {
                if let Some(reply) = self.detaches.remove(&(channel, handle)) {
                    let _ = reply.send(Ok(()));
                }
                self.fail_tokens(tokens, || AmqpError::LinkDetached(error.clone()));
                self.fail_links(
                    |key| *key == (channel, handle),
                    || AmqpError::LinkDetached(error.clone()),
                );
            }
            EngineEvent::Delivery {
                channel,
                handle,
                delivery,
            } => {
                let key = (channel, handle);
                let delivered = match self.receivers.get(&key) {
                    Some(tx) => tx.send(Ok(delivery)).is_ok(),
                    None => false,
                };
                if !delivered {
                    debug!(channel, handle, "delivery for a dropped receiver");
                    self.receivers.remove(&key);
                }
            }
            EngineEvent::Settled { token, outcome } => {
                if let Some(reply) = self.sends.remove(&token) {
                    let _ = reply.send(Ok(outcome));
                }
            }
            EngineEvent::Drained { channel, handle } => {
                for reply in self.drains.remove(&(channel, handle)).unwrap_or_default() {
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }

    fn fail_tokens(&mut self, tokens: Vec<u64>, error: impl Fn() -> AmqpError) {
        for token in tokens {
            if let Some(reply) = self.sends.remove(&token) {
                let _ = reply.send(Err(error()));
            }
        }
    }

    /// Resolve every link-keyed waiter matching `matches`. Pending detaches
    /// complete; everything else fails.
    fn fail_links(&mut self, matches: impl Fn(&LinkKey) -> bool, error: impl Fn() -> AmqpError) {
        let keys: Vec<LinkKey> = self.attaches.keys().copied().filter(&matches).collect();
        for key in keys {
            if let Some(reply) = self.attaches.remove(&key) {
                let _ = reply.send(Err(error()));
            }
        }
        let keys: Vec<LinkKey> = self.detaches.keys().copied().filter(&matches).collect();
        for key in keys {
            if let Some(reply) = self.detaches.remove(&key) {
                let _ = reply.send(Ok(()));
            }
        }
        let keys: Vec<LinkKey> = self.drains.keys().copied().filter(&matches).collect();
        for key in keys {
            for reply in self.drains.remove(&key).unwrap_or_default() {
                let _ = reply.send(Err(error()));
            }
        }
        let keys: Vec<LinkKey> = self.receivers.keys().copied().filter(&matches).collect();
        for key in keys {
            if let Some(tx) = self.receivers.remove(&key) {
                let _ = tx.send(Err(error()));
            }
        }
    }

    /// Resolve everything with the connection's terminal result.
    fn fail_all(&mut self, terminal: &Terminal) {
        if let Some(reply) = self.opened.take() {
            let _ = reply.send(Err(terminal.to_error()));
        }
        for (_, reply) in self.begins.drain() {
            let _ = reply.send(Err(terminal.to_error()));
        }
        for (_, reply) in self.ends.drain() {
            let _ = reply.send(Ok(()));
        }
        for (_, reply) in self.sends.drain() {
            let _ = reply.send(Err(terminal.to_error()));
        }
        self.fail_links(|_| true, || terminal.to_error());
        for reply in self.closes.drain(..) {
            let result = if terminal.clean {
                Ok(())
            } else {
                Err(terminal.to_error())
            };
            let _ = reply.send(result);
        }
    }
}

enum Wake {
    Read(std::io::Result<usize>),
    Command(Option<Command>),
    Heartbeat,
    IdleExpired,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

pub(crate) struct Pump {
    engine: ConnectionEngine,
    reader: ReadHalf<Transport>,
    buffer: FrameBuffer,
    chunk: BytesMut,
    writer: WriterHandle,
    writer_task: JoinHandle<Result<()>>,
    commands: mpsc::Receiver<Command>,
    commands_open: bool,
    waiters: Waiters,
    receive_deadline: Option<Duration>,
    last_read: Instant,
    last_write: Instant,
    remote_close: Option<ErrorCondition>,
    terminal: watch::Sender<Option<Terminal>>,
}

impl Pump {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        engine: ConnectionEngine,
        reader: ReadHalf<Transport>,
        buffer: FrameBuffer,
        writer: WriterHandle,
        writer_task: JoinHandle<Result<()>>,
        commands: mpsc::Receiver<Command>,
        opened: Reply<()>,
        receive_deadline: Option<Duration>,
        terminal: watch::Sender<Option<Terminal>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            engine,
            reader,
            buffer,
            chunk: BytesMut::with_capacity(READ_CHUNK),
            writer,
            writer_task,
            commands,
            commands_open: true,
            waiters: Waiters {
                opened: Some(opened),
                ..Default::default()
            },
            receive_deadline,
            last_read: now,
            last_write: now,
            remote_close: None,
            terminal,
        }
    }

    /// Drive the connection to its end, then resolve everything pending.
    pub(crate) async fn run(mut self) {
        let terminal = match self.run_loop().await {
            Ok(()) => Terminal {
                error: self.remote_close.take(),
                clean: true,
            },
            Err(error) => {
                error!(%error, "connection failed");
                if !self.engine.is_ended() {
                    self.engine.fail(&error);
                    if let Err(e) = self.flush().await {
                        debug!(error = %e, "could not send close");
                    }
                }
                Terminal {
                    error: Some(error.to_condition()),
                    clean: false,
                }
            }
        };

        let Pump {
            writer,
            writer_task,
            mut commands,
            mut waiters,
            terminal: terminal_tx,
            ..
        } = self;

        drop(writer);
        match writer_task.await {
            Ok(Err(e)) => debug!(error = %e, "writer task ended with error"),
            Err(e) => warn!(error = %e, "writer task panicked"),
            Ok(Ok(())) => {}
        }

        debug!(error = ?terminal.error, clean = terminal.clean, "connection ended");
        waiters.fail_all(&terminal);
        commands.close();
        while let Ok(command) = commands.try_recv() {
            command.fail(terminal.to_error());
        }
        terminal_tx.send_replace(Some(terminal));
    }

    async fn run_loop(&mut self) -> Result<()> {
        self.engine.header_exchanged();
        self.engine.open();
        // frames the peer sent right behind its protocol header
        self.process_buffered()?;

        loop {
            self.flush().await?;
            if self.engine.is_ended() {
                return Ok(());
            }

            let heartbeat_at = self
                .engine
                .remote_idle_timeout()
                .and_then(|t| self.last_write.checked_add(t / 2));
            let idle_at = self
                .receive_deadline
                .and_then(|t| self.last_read.checked_add(t));
            self.chunk.reserve(READ_CHUNK);

            let wake = tokio::select! {
                read = self.reader.read_buf(&mut self.chunk) => Wake::Read(read),
                command = self.commands.recv(), if self.commands_open => Wake::Command(command),
                _ = sleep_until(heartbeat_at) => Wake::Heartbeat,
                _ = sleep_until(idle_at) => Wake::IdleExpired,
            };

            match wake {
                Wake::Read(read) => {
                    if read? == 0 {
                        return Err(AmqpError::Transport("peer closed the transport".into()));
                    }
                    self.last_read = Instant::now();
                    self.buffer.extend(&self.chunk);
                    self.chunk.clear();
                    self.process_buffered()?;
                }
                Wake::Command(Some(command)) => self.execute(command),
                Wake::Command(None) => {
                    debug!("all handles dropped, closing connection");
                    self.commands_open = false;
                    self.engine.close(None);
                }
                Wake::Heartbeat => {
                    trace!("heartbeat");
                    self.writer.send(OutboundFrame::heartbeat()).await?;
                    self.last_write = Instant::now();
                }
                Wake::IdleExpired => return Err(AmqpError::IdleTimeout),
            }
        }
    }

    fn process_buffered(&mut self) -> Result<()> {
        while let Some(item) = self.buffer.next_item()? {
            let frame = match item {
                Incoming::Frame(frame) => frame.decode_amqp()?,
                Incoming::Header(header) => {
                    return Err(AmqpError::Protocol(format!(
                        "unexpected protocol header {:?} after open",
                        header.id
                    )))
                }
            };
            if let Some(performative) = &frame.performative {
                trace!(channel = frame.channel, frame = performative.name(), "frame received");
            }
            self.engine.handle_frame(frame)?;
            // inbound frames are bounded by the negotiated size once open arrives
            self.buffer.set_max_frame_size(self.engine.max_frame_size());
            if self.engine.is_ended() {
                break;
            }
        }
        Ok(())
    }

    /// Write everything the engine produced and route its events.
    async fn flush(&mut self) -> Result<()> {
        let out = self.engine.output();
        let frames: Vec<_> = out.frames.drain(..).collect();
        let events: Vec<_> = out.events.drain(..).collect();
        let encode = out.encode;

        for frame in frames {
            trace!(channel = frame.channel, frame = frame.performative.name(), "frame sent");
            let outbound = OutboundFrame::amqp(frame.channel, &frame.performative, &frame.payload, &encode)?;
            self.writer.send(outbound).await?;
            self.last_write = Instant::now();
        }
        for event in events {
            if let EngineEvent::Closed(error) = &event {
                self.remote_close = error.clone();
            }
            self.waiters.route(event);
        }
        Ok(())
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::BeginSession { opts, reply } => match self.engine.begin_session(opts) {
                Ok(channel) => {
                    self.waiters.begins.insert(channel, reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::EndSession {
                channel,
                error,
                reply,
            } => match self.engine.end_session(channel, error) {
                Ok(()) => {
                    self.waiters.ends.insert(channel, reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Attach {
                channel,
                name,
                role,
                source,
                target,
                opts,
                deliveries,
                reply,
            } => match self.engine.attach(channel, name, role, source, target, &opts) {
                Ok(handle) => {
                    self.waiters.attaches.insert((channel, handle), reply);
                    if let Some(tx) = deliveries {
                        self.waiters.receivers.insert((channel, handle), tx);
                    }
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Detach {
                channel,
                handle,
                closed,
                error,
                reply,
            } => match self.engine.detach(channel, handle, closed, error) {
                Ok(()) => {
                    self.waiters.detaches.insert((channel, handle), reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Send {
                channel,
                handle,
                token,
                payload,
                settled,
                non_blocking,
                reply,
            } => match self
                .engine
                .send(channel, handle, token, payload, settled, non_blocking)
            {
                Ok(()) => {
                    self.waiters.sends.insert(token, reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::CancelSend { channel, token } => {
                if self.engine.cancel_send(channel, token) {
                    debug!(channel, token, "queued send withdrawn");
                    self.waiters.sends.remove(&token);
                }
            }
            Command::Dispose {
                channel,
                handle,
                delivery_id,
                outcome,
                reply,
            } => {
                let _ = reply.send(self.engine.dispose(channel, handle, delivery_id, outcome));
            }
            Command::Credit {
                channel,
                handle,
                op: CreditOp::Add(credit),
                reply,
            } => {
                let _ = reply.send(self.engine.add_credit(channel, handle, credit));
            }
            Command::Credit {
                channel,
                handle,
                op: CreditOp::Drain,
                reply,
            } => match self.engine.drain(channel, handle) {
                Ok(()) => self
                    .waiters
                    .drains
                    .entry((channel, handle))
                    .or_default()
                    .push(reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Close { error, reply } => {
                self.engine.close(error);
                self.waiters.closes.push(reply);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::conditions;

    fn key_count(waiters: &Waiters) -> usize {
        waiters.attaches.len() + waiters.detaches.len() + waiters.drains.len() + waiters.receivers.len()
    }

    #[tokio::test]
    async fn test_link_detach_fails_link_waiters() {
        let mut waiters = Waiters::default();
        let (attach_tx, attach_rx) = oneshot::channel();
        let (send_tx, send_rx) = oneshot::channel();
        let (delivery_tx, mut delivery_rx) = mpsc::unbounded_channel();
        waiters.attaches.insert((1, 0), attach_tx);
        waiters.sends.insert(7, send_tx);
        waiters.receivers.insert((1, 0), delivery_tx);

        let error = ErrorCondition::new(conditions::NOT_FOUND);
        waiters.route(EngineEvent::LinkDetached {
            channel: 1,
            handle: 0,
            error: Some(error.clone()),
            tokens: vec![7],
        });

        assert!(matches!(
            attach_rx.await.unwrap(),
            Err(AmqpError::LinkDetached(Some(ref e))) if *e == error
        ));
        assert!(matches!(send_rx.await.unwrap(), Err(AmqpError::LinkDetached(_))));
        assert!(matches!(
            delivery_rx.recv().await.unwrap(),
            Err(AmqpError::LinkDetached(_))
        ));
        assert!(delivery_rx.recv().await.is_none());
        assert_eq!(key_count(&waiters), 0);
    }

    #[tokio::test]
    async fn test_session_end_leaves_other_sessions() {
        let mut waiters = Waiters::default();
        let (ours, mut ours_rx) = mpsc::unbounded_channel();
        let (other, _other_rx) = mpsc::unbounded_channel();
        waiters.receivers.insert((0, 0), ours);
        waiters.receivers.insert((1, 0), other);

        waiters.route(EngineEvent::SessionEnded {
            channel: 0,
            error: None,
            tokens: vec![],
        });

        assert!(matches!(
            ours_rx.recv().await.unwrap(),
            Err(AmqpError::SessionEnded(None))
        ));
        assert!(waiters.receivers.contains_key(&(1, 0)));
    }

    #[tokio::test]
    async fn test_settled_resolves_send() {
        let mut waiters = Waiters::default();
        let (tx, rx) = oneshot::channel();
        waiters.sends.insert(3, tx);
        waiters.route(EngineEvent::Settled {
            token: 3,
            outcome: Outcome::Released,
        });
        assert_eq!(rx.await.unwrap().unwrap(), Outcome::Released);
    }

    #[tokio::test]
    async fn test_fail_all_with_terminal() {
        let mut waiters = Waiters::default();
        let (send_tx, send_rx) = oneshot::channel();
        let (close_tx, close_rx) = oneshot::channel();
        let (delivery_tx, mut delivery_rx) = mpsc::unbounded_channel();
        waiters.sends.insert(1, send_tx);
        waiters.closes.push(close_tx);
        waiters.receivers.insert((0, 2), delivery_tx);

        let terminal = Terminal {
            error: Some(ErrorCondition::new(conditions::FRAMING_ERROR)),
            clean: false,
        };
        waiters.fail_all(&terminal);

        assert!(matches!(
            send_rx.await.unwrap(),
            Err(AmqpError::ConnectionClosed(Some(_)))
        ));
        assert!(close_rx.await.unwrap().is_err());
        assert!(matches!(
            delivery_rx.recv().await.unwrap(),
            Err(AmqpError::ConnectionClosed(Some(_)))
        ));
    }

    #[tokio::test]
    async fn test_clean_terminal_completes_close() {
        let mut waiters = Waiters::default();
        let (close_tx, close_rx) = oneshot::channel();
        waiters.closes.push(close_tx);
        waiters.fail_all(&Terminal {
            error: None,
            clean: true,
        });
        assert!(close_rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_command_fail_replies() {
        let (tx, rx) = oneshot::channel();
        Command::BeginSession {
            opts: SessionOptions::default(),
            reply: tx,
        }
        .fail(AmqpError::ConnectionClosed(None));
        assert!(matches!(
            rx.await.unwrap(),
            Err(AmqpError::ConnectionClosed(None))
        ));
    }
}
