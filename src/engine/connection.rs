//! Connection state machine.
//!
//! ```text
//! Start → HeaderExchanged → OpenSent ─→ Opened → CloseSent → End
//!                         → OpenReceived ↗       ↘ (close received, echoed) → End
//! ```
//!
//! Owns every session by local channel and routes incoming frames to them
//! through the remote → local channel map.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::codec::EncodeOptions;
use crate::error::{AmqpError, Result};
use crate::protocol::{
    AmqpFrame, Begin, Close, ErrorCondition, Open, Outcome, Performative, Role, Source, Target,
    MIN_MAX_FRAME_SIZE,
};

use super::link::LinkOptions;
use super::session::{SessionEngine, SessionOptions};
use super::{EngineEvent, Output};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Start,
    HeaderExchanged,
    OpenSent,
    OpenReceived,
    Opened,
    CloseSent,
    End,
}

#[derive(Debug)]
pub(crate) struct ConnectionEngine {
    state: ConnectionState,
    local: Open,
    remote: Option<Open>,
    sessions: HashMap<u16, SessionEngine>,
    /// remote channel → local channel
    remote_channels: HashMap<u16, u16>,
    channel_max: u16,
    max_sessions: usize,
    out: Output,
}

impl ConnectionEngine {
    pub fn new(local: Open, encode: EncodeOptions, max_sessions: Option<usize>) -> Self {
        Self {
            state: ConnectionState::Start,
            channel_max: local.channel_max,
            max_sessions: max_sessions.unwrap_or(usize::MAX),
            out: Output::new(encode, local.max_frame_size),
            local,
            remote: None,
            sessions: HashMap::new(),
            remote_channels: HashMap::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn is_opened(&self) -> bool {
        self.state == ConnectionState::Opened
    }

    #[inline]
    pub fn is_ended(&self) -> bool {
        self.state == ConnectionState::End
    }

    pub fn output(&mut self) -> &mut Output {
        &mut self.out
    }

    /// Negotiated max-frame-size, applied to frames in both directions.
    pub fn max_frame_size(&self) -> u32 {
        self.out.max_frame_size
    }

    /// Idle timeout the peer advertised; we must send something at least
    /// this often.
    pub fn remote_idle_timeout(&self) -> Option<Duration> {
        self.remote
            .as_ref()
            .and_then(|open| open.idle_time_out)
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64))
    }

    pub fn header_exchanged(&mut self) {
        if self.state == ConnectionState::Start {
            self.state = ConnectionState::HeaderExchanged;
        }
    }

    /// Send our `open`.
    pub fn open(&mut self) {
        self.out.frame(0, self.local.clone());
        self.state = match self.state {
            ConnectionState::OpenReceived => {
                self.out.event(EngineEvent::Opened);
                ConnectionState::Opened
            }
            _ => ConnectionState::OpenSent,
        };
        debug!(container_id = %self.local.container_id, "open sent");
    }

    /// Send `close`. The connection ends when the peer's `close` arrives.
    pub fn close(&mut self, error: Option<ErrorCondition>) {
        match self.state {
            ConnectionState::CloseSent | ConnectionState::End => return,
            _ => {}
        }
        self.out.frame(0, Close { error });
        self.state = ConnectionState::CloseSent;
    }

    /// Close with the condition matching a fatal error.
    pub fn fail(&mut self, error: &AmqpError) {
        warn!(%error, "closing connection on error");
        self.close(Some(error.to_condition()));
    }

    /// Process one decoded frame. An error is connection-fatal; the caller
    /// should `fail` with it.
    pub fn handle_frame(&mut self, frame: AmqpFrame) -> Result<()> {
        let AmqpFrame {
            channel,
            performative,
            payload,
        } = frame;
        let performative = match performative {
            Some(performative) => performative,
            None => return Ok(()),
        };
        trace!(channel, performative = performative.name(), "frame received");

        match performative {
            Performative::Open(open) => self.on_open(open),
            Performative::Close(close) => {
                self.on_close(close);
                Ok(())
            }
            other if self.remote.is_none() => Err(AmqpError::Protocol(format!(
                "{} received before open",
                other.name()
            ))),
            // after our close only the peer's close matters
            _ if self.state == ConnectionState::CloseSent => Ok(()),
            Performative::Begin(begin) => self.on_begin(channel, begin),
            other => self.dispatch(channel, other, payload),
        }
    }

    fn on_open(&mut self, open: Open) -> Result<()> {
        if self.remote.is_some() {
            return Err(AmqpError::Protocol("duplicate open".into()));
        }
        if open.max_frame_size < MIN_MAX_FRAME_SIZE {
            return Err(AmqpError::Protocol(format!(
                "peer max-frame-size {} below minimum {}",
                open.max_frame_size, MIN_MAX_FRAME_SIZE
            )));
        }
        self.out.max_frame_size = self.local.max_frame_size.min(open.max_frame_size);
        self.channel_max = self.local.channel_max.min(open.channel_max);
        debug!(
            remote_container = %open.container_id,
            max_frame_size = self.out.max_frame_size,
            channel_max = self.channel_max,
            idle_time_out = ?open.idle_time_out,
            "open received"
        );
        self.remote = Some(open);

        self.state = match self.state {
            ConnectionState::OpenSent => {
                self.out.event(EngineEvent::Opened);
                ConnectionState::Opened
            }
            _ => ConnectionState::OpenReceived,
        };
        Ok(())
    }

    fn on_close(&mut self, close: Close) {
        debug!(error = ?close.error, "close received");
        if self.state != ConnectionState::CloseSent {
            self.out.frame(0, Close::default());
        }
        self.state = ConnectionState::End;
        self.sessions.clear();
        self.remote_channels.clear();
        self.out.event(EngineEvent::Closed(close.error));
    }

    fn allocate_channel(&self) -> Result<u16> {
        if self.sessions.len() >= self.max_sessions {
            return Err(AmqpError::ResourceLimitExceeded(format!(
                "session limit {} reached",
                self.max_sessions
            )));
        }
        (0..=self.channel_max)
            .find(|channel| !self.sessions.contains_key(channel))
            .ok_or_else(|| {
                AmqpError::ResourceLimitExceeded(format!(
                    "no free channel (channel-max {})",
                    self.channel_max
                ))
            })
    }

    fn on_begin(&mut self, channel: u16, begin: Begin) -> Result<()> {
        if self.remote_channels.contains_key(&channel) {
            return Err(AmqpError::Protocol(format!(
                "begin on channel {} already in use",
                channel
            )));
        }
        match begin.remote_channel {
            Some(local) => {
                let session = self
                    .sessions
                    .get_mut(&local)
                    .ok_or(AmqpError::ChannelNotFound(local))?;
                self.remote_channels.insert(channel, local);
                session.on_begin(&begin, channel, &mut self.out);
            }
            None => {
                let local = self.allocate_channel()?;
                debug!(remote_channel = channel, "refusing peer-initiated session");
                let session = SessionEngine::reject(local, channel, &mut self.out);
                self.remote_channels.insert(channel, local);
                self.sessions.insert(local, session);
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, channel: u16, performative: Performative, payload: Bytes) -> Result<()> {
        let local = *self
            .remote_channels
            .get(&channel)
            .ok_or(AmqpError::ChannelNotFound(channel))?;
        let session = self
            .sessions
            .get_mut(&local)
            .ok_or(AmqpError::ChannelNotFound(channel))?;
        let out = &mut self.out;

        match performative {
            Performative::End(end) => {
                if session.on_end(&end, out) {
                    self.sessions.remove(&local);
                    self.remote_channels.remove(&channel);
                }
                Ok(())
            }
            Performative::Attach(attach) => session.on_attach(&attach, out),
            Performative::Flow(flow) => session.on_flow(&flow, out),
            Performative::Transfer(transfer) => session.on_transfer(&transfer, &payload, out),
            Performative::Disposition(disposition) => session.on_disposition(&disposition, out),
            Performative::Detach(detach) => session.on_detach(&detach, out),
            other => Err(AmqpError::Protocol(format!(
                "unexpected {} on channel {}",
                other.name(),
                channel
            ))),
        }
    }

    fn with_session<T>(
        &mut self,
        channel: u16,
        f: impl FnOnce(&mut SessionEngine, &mut Output) -> Result<T>,
    ) -> Result<T> {
        if !self.is_opened() {
            return Err(AmqpError::ConnectionClosed(None));
        }
        let session = self
            .sessions
            .get_mut(&channel)
            .ok_or(AmqpError::SessionEnded(None))?;
        f(session, &mut self.out)
    }

    /// Begin a local session. Returns its channel.
    pub fn begin_session(&mut self, opts: SessionOptions) -> Result<u16> {
        if !self.is_opened() {
            return Err(AmqpError::ConnectionClosed(None));
        }
        let channel = self.allocate_channel()?;
        let session = SessionEngine::new(channel, opts);
        self.out.frame(channel, session.begin_frame());
        self.sessions.insert(channel, session);
        Ok(channel)
    }

    pub fn end_session(&mut self, channel: u16, error: Option<ErrorCondition>) -> Result<()> {
        self.with_session(channel, |session, out| {
            session.end(error, out);
            Ok(())
        })
    }

    pub fn attach(
        &mut self,
        channel: u16,
        name: String,
        role: Role,
        source: Option<Source>,
        target: Option<Target>,
        opts: &LinkOptions,
    ) -> Result<u32> {
        self.with_session(channel, |session, out| {
            session.attach(name, role, source, target, opts, out)
        })
    }

    pub fn detach(
        &mut self,
        channel: u16,
        handle: u32,
        closed: bool,
        error: Option<ErrorCondition>,
    ) -> Result<()> {
        self.with_session(channel, |session, out| {
            session.detach(handle, closed, error, out)
        })
    }

    pub fn send(
        &mut self,
        channel: u16,
        handle: u32,
        token: u64,
        payload: Bytes,
        settled: bool,
        non_blocking: bool,
    ) -> Result<()> {
        self.with_session(channel, |session, out| {
            session.send(handle, token, payload, settled, non_blocking, out)
        })
    }

    pub fn cancel_send(&mut self, channel: u16, token: u64) -> bool {
        self.sessions
            .get_mut(&channel)
            .map(|session| session.cancel_send(token))
            .unwrap_or(false)
    }

    pub fn dispose(
        &mut self,
        channel: u16,
        handle: u32,
        delivery_id: u32,
        outcome: Outcome,
    ) -> Result<()> {
        self.with_session(channel, |session, out| {
            session.dispose(handle, delivery_id, outcome, out)
        })
    }

    pub fn add_credit(&mut self, channel: u16, handle: u32, credit: u32) -> Result<()> {
        self.with_session(channel, |session, out| {
            session.add_credit(handle, credit, out)
        })
    }

    pub fn drain(&mut self, channel: u16, handle: u32) -> Result<()> {
        self.with_session(channel, |session, out| session.drain(handle, out))
    }
}
