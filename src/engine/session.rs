//! Session state machine.
//!
//! A session multiplexes links over one channel pair and owns the
//! transfer-level flow control: the incoming window we grant and the
//! outgoing window the peer grants us. Delivery ids form their own sequence,
//! separate from transfer ids, since a multi-frame delivery uses one
//! delivery id but several transfer ids.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::error::{AmqpError, Result};
use crate::protocol::{
    conditions, Attach, Begin, DeliveryState, Detach, Disposition, End, ErrorCondition, Flow,
    Outcome, Performative, ReceiverSettleMode, Role, SenderSettleMode, SequenceNo, Source,
    Target, Transfer, FRAME_HEADER_SIZE,
};

use super::delivery::PendingTransfer;
use super::link::{LinkEngine, LinkOptions, LinkState};
use super::{EngineEvent, Output};

/// Default incoming and outgoing window, in transfer frames.
pub const DEFAULT_WINDOW: u32 = 2048;

/// Default highest link handle this end accepts.
pub const DEFAULT_HANDLE_MAX: u32 = 1023;

/// Per-session begin options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            incoming_window: DEFAULT_WINDOW,
            outgoing_window: DEFAULT_WINDOW,
            handle_max: DEFAULT_HANDLE_MAX,
        }
    }
}

impl SessionOptions {
    pub fn incoming_window(mut self, window: u32) -> Self {
        self.incoming_window = window;
        self
    }

    pub fn outgoing_window(mut self, window: u32) -> Self {
        self.outgoing_window = window;
        self
    }

    pub fn handle_max(mut self, handle_max: u32) -> Self {
        self.handle_max = handle_max;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    BeginSent,
    Mapped,
    EndSent,
    Unmapped,
}

#[derive(Debug)]
pub(crate) struct SessionEngine {
    pub channel: u16,
    pub remote_channel: Option<u16>,
    pub state: SessionState,
    opts: SessionOptions,
    handle_max: u32,

    next_outgoing_id: SequenceNo,
    remote_incoming_window: u32,
    remote_outgoing_window: u32,
    next_delivery_id: SequenceNo,

    next_incoming_id: SequenceNo,
    incoming_window: u32,
    last_incoming_delivery_id: Option<SequenceNo>,

    links: BTreeMap<u32, LinkEngine>,
    /// remote handle → local handle
    remote_handles: HashMap<u32, u32>,
    /// delivery id → (local handle, send token) for our unsettled sends
    outgoing_unsettled: HashMap<u32, (u32, u64)>,
    /// delivery id → local handle for received, unsettled deliveries
    incoming_unsettled: HashMap<u32, u32>,

    local_error: Option<ErrorCondition>,
    /// Peer-initiated session we answered with begin + end.
    rejected: bool,
}

impl SessionEngine {
    pub fn new(channel: u16, opts: SessionOptions) -> Self {
        Self {
            channel,
            remote_channel: None,
            state: SessionState::BeginSent,
            handle_max: opts.handle_max,
            next_outgoing_id: SequenceNo(0),
            remote_incoming_window: 0,
            remote_outgoing_window: 0,
            next_delivery_id: SequenceNo(0),
            next_incoming_id: SequenceNo(0),
            incoming_window: opts.incoming_window,
            last_incoming_delivery_id: None,
            links: BTreeMap::new(),
            remote_handles: HashMap::new(),
            outgoing_unsettled: HashMap::new(),
            incoming_unsettled: HashMap::new(),
            local_error: None,
            rejected: false,
            opts,
        }
    }

    /// Answer a peer-initiated begin with begin + end(not-allowed).
    pub fn reject(channel: u16, remote_channel: u16, out: &mut Output) -> Self {
        let mut session = Self::new(channel, SessionOptions::default());
        session.remote_channel = Some(remote_channel);
        session.rejected = true;
        let mut begin = session.begin_frame();
        begin.remote_channel = Some(remote_channel);
        out.frame(channel, begin);
        session.end(
            Some(
                ErrorCondition::new(conditions::NOT_ALLOWED)
                    .with_description("peer-initiated sessions are not accepted"),
            ),
            out,
        );
        session
    }

    pub fn begin_frame(&self) -> Begin {
        Begin {
            remote_channel: self.remote_channel,
            next_outgoing_id: self.next_outgoing_id.get(),
            incoming_window: self.incoming_window,
            outgoing_window: self.opts.outgoing_window,
            handle_max: self.opts.handle_max,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
        }
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.state == SessionState::Mapped
    }

    /// Peer answered our begin.
    pub fn on_begin(&mut self, begin: &Begin, remote_channel: u16, out: &mut Output) {
        self.remote_channel = Some(remote_channel);
        self.next_incoming_id = SequenceNo(begin.next_outgoing_id);
        self.remote_incoming_window = begin.incoming_window;
        self.remote_outgoing_window = begin.outgoing_window;
        self.handle_max = self.handle_max.min(begin.handle_max);
        if self.state == SessionState::BeginSent {
            self.state = SessionState::Mapped;
            debug!(channel = self.channel, remote_channel, "session mapped");
            out.event(EngineEvent::SessionBegun {
                channel: self.channel,
            });
        }
    }

    /// Send `end`. The session unmaps when the peer's `end` arrives.
    pub fn end(&mut self, error: Option<ErrorCondition>, out: &mut Output) {
        if matches!(self.state, SessionState::EndSent | SessionState::Unmapped) {
            return;
        }
        self.local_error = error.clone();
        self.state = SessionState::EndSent;
        out.frame(self.channel, End { error });
    }

    /// Session-level protocol violation: end the session with `condition`.
    fn fail(&mut self, condition: ErrorCondition, out: &mut Output) {
        warn!(channel = self.channel, %condition, "ending session on error");
        self.end(Some(condition), out);
    }

    /// Peer sent `end`. Returns true once the session is unmapped.
    pub fn on_end(&mut self, end: &End, out: &mut Output) -> bool {
        if self.state != SessionState::EndSent {
            out.frame(self.channel, End::default());
        }
        self.state = SessionState::Unmapped;
        if !self.rejected {
            let error = end.error.clone().or_else(|| self.local_error.take());
            out.event(EngineEvent::SessionEnded {
                channel: self.channel,
                error,
                tokens: self.take_all_tokens(),
            });
        }
        true
    }

    /// Tokens of every send that can no longer complete.
    pub fn take_all_tokens(&mut self) -> Vec<u64> {
        let mut tokens: Vec<u64> = self
            .outgoing_unsettled
            .drain()
            .map(|(_, (_, token))| token)
            .collect();
        for link in self.links.values_mut() {
            tokens.extend(link.take_queued_tokens());
        }
        self.links.clear();
        self.remote_handles.clear();
        self.incoming_unsettled.clear();
        tokens
    }

    fn allocate_handle(&self) -> Result<u32> {
        let mut candidate = 0u32;
        for handle in self.links.keys() {
            if *handle != candidate {
                break;
            }
            candidate = match candidate.checked_add(1) {
                Some(next) => next,
                None => break,
            };
        }
        if candidate > self.handle_max || self.links.contains_key(&candidate) {
            return Err(AmqpError::ResourceLimitExceeded(format!(
                "no free link handle (handle-max {})",
                self.handle_max
            )));
        }
        Ok(candidate)
    }

    /// Start attaching a local link. Returns the allocated handle.
    pub fn attach(
        &mut self,
        name: String,
        role: Role,
        source: Option<Source>,
        target: Option<Target>,
        opts: &LinkOptions,
        out: &mut Output,
    ) -> Result<u32> {
        if !self.is_mapped() {
            return Err(AmqpError::SessionEnded(self.local_error.clone()));
        }
        let handle = self.allocate_handle()?;
        let link = LinkEngine::new(name, role, handle, source, target, opts);
        out.frame(self.channel, link.attach_frame());
        self.links.insert(handle, link);
        Ok(handle)
    }

    pub fn on_attach(&mut self, attach: &Attach, out: &mut Output) -> Result<()> {
        if self.remote_handles.contains_key(&attach.handle) {
            self.fail(
                ErrorCondition::new(conditions::HANDLE_IN_USE)
                    .with_description(format!("handle {} already attached", attach.handle)),
                out,
            );
            return Ok(());
        }

        let local = self
            .links
            .iter()
            .find(|(_, link)| {
                link.state == LinkState::AttachSent
                    && link.remote_handle.is_none()
                    && link.name == attach.name
                    && link.role == attach.role.opposite()
            })
            .map(|(handle, _)| *handle);

        let handle = match local {
            Some(handle) => handle,
            None => return self.reject_attach(attach, out),
        };
        self.remote_handles.insert(attach.handle, handle);

        let channel = self.channel;
        let link = match self.links.get_mut(&handle) {
            Some(link) => link,
            None => return Ok(()),
        };
        if !link.on_remote_attach(attach) {
            debug!(channel, handle, name = %link.name, "attach refused by peer");
            return Ok(());
        }
        debug!(channel, handle, name = %link.name, "link attached");
        out.event(EngineEvent::LinkAttached { channel, handle });

        if !link.is_sender() && link.initial_credit > 0 {
            link.link_credit = link.initial_credit;
            self.send_link_flow(handle, false, out);
        }
        Ok(())
    }

    fn reject_attach(&mut self, attach: &Attach, out: &mut Output) -> Result<()> {
        let handle = match self.allocate_handle() {
            Ok(handle) => handle,
            Err(_) => {
                self.fail(
                    ErrorCondition::new(conditions::RESOURCE_LIMIT_EXCEEDED)
                        .with_description("no free link handle"),
                    out,
                );
                return Ok(());
            }
        };
        debug!(channel = self.channel, name = %attach.name, "refusing peer-initiated link");
        let link = LinkEngine::rejected(attach, handle);
        out.frame(self.channel, link.attach_frame());
        out.frame(
            self.channel,
            link.detach_frame(
                true,
                Some(
                    ErrorCondition::new(conditions::NOT_ALLOWED)
                        .with_description("peer-initiated links are not accepted"),
                ),
            ),
        );
        self.remote_handles.insert(attach.handle, handle);
        self.links.insert(handle, link);
        Ok(())
    }

    /// Start detaching a local link.
    pub fn detach(
        &mut self,
        handle: u32,
        closed: bool,
        error: Option<ErrorCondition>,
        out: &mut Output,
    ) -> Result<()> {
        let link = self
            .links
            .get_mut(&handle)
            .ok_or(AmqpError::HandleNotFound(handle))?;
        if matches!(link.state, LinkState::DetachSent | LinkState::Detached) {
            return Ok(());
        }
        link.state = LinkState::DetachSent;
        out.frame(self.channel, link.detach_frame(closed, error));
        Ok(())
    }

    pub fn on_detach(&mut self, detach: &Detach, out: &mut Output) -> Result<()> {
        let handle = match self.remote_handles.remove(&detach.handle) {
            Some(handle) => handle,
            None => {
                self.fail(
                    ErrorCondition::new(conditions::UNATTACHED_HANDLE)
                        .with_description(format!("detach for unknown handle {}", detach.handle)),
                    out,
                );
                return Ok(());
            }
        };
        let mut link = match self.links.remove(&handle) {
            Some(link) => link,
            None => return Ok(()),
        };

        if link.state != LinkState::DetachSent {
            out.frame(self.channel, link.detach_frame(detach.closed, None));
        }
        link.state = LinkState::Detached;
        if link.rejected_by_us {
            return Ok(());
        }

        let mut tokens = link.take_queued_tokens();
        self.outgoing_unsettled.retain(|_, (h, token)| {
            if *h == handle {
                tokens.push(*token);
                false
            } else {
                true
            }
        });
        self.incoming_unsettled.retain(|_, h| *h != handle);

        debug!(channel = self.channel, handle, error = ?detach.error, "link detached");
        out.event(EngineEvent::LinkDetached {
            channel: self.channel,
            handle,
            error: detach.error.clone(),
            tokens,
        });
        Ok(())
    }

    fn session_flow(&self) -> Flow {
        Flow {
            next_incoming_id: Some(self.next_incoming_id.get()),
            incoming_window: self.incoming_window,
            next_outgoing_id: self.next_outgoing_id.get(),
            outgoing_window: self.opts.outgoing_window,
            ..Default::default()
        }
    }

    fn send_session_flow(&self, out: &mut Output) {
        out.frame(self.channel, self.session_flow());
    }

    fn send_link_flow(&self, handle: u32, echo: bool, out: &mut Output) {
        if let Some(link) = self.links.get(&handle) {
            let mut flow = self.session_flow();
            link.fill_flow(&mut flow);
            flow.echo = echo;
            out.frame(self.channel, flow);
        }
    }

    pub fn on_flow(&mut self, flow: &Flow, out: &mut Output) -> Result<()> {
        let next_incoming = SequenceNo(flow.next_incoming_id.unwrap_or(0));
        let limit = next_incoming.add(flow.incoming_window);
        self.remote_incoming_window = if limit.is_after(self.next_outgoing_id) {
            limit.distance_from(self.next_outgoing_id)
        } else {
            0
        };
        self.remote_outgoing_window = flow.outgoing_window;

        let remote_handle = match flow.handle {
            Some(handle) => handle,
            None => {
                if flow.echo {
                    self.send_session_flow(out);
                }
                return self.schedule(out);
            }
        };
        let handle = match self.remote_handles.get(&remote_handle) {
            Some(handle) => *handle,
            None => {
                self.fail(
                    ErrorCondition::new(conditions::UNATTACHED_HANDLE)
                        .with_description(format!("flow for unknown handle {}", remote_handle)),
                    out,
                );
                return Ok(());
            }
        };

        let channel = self.channel;
        let mut reply = flow.echo;
        if let Some(link) = self.links.get_mut(&handle) {
            if link.is_sender() {
                link.on_sender_flow(flow);
                trace!(channel, handle, credit = link.link_credit, "credit updated");
            } else if link.on_receiver_flow(flow) {
                out.event(EngineEvent::Drained { channel, handle });
            }
        }
        self.schedule(out)?;

        if let Some(link) = self.links.get_mut(&handle) {
            if link.is_sender() && link.complete_drain() {
                reply = true;
            }
        }
        if reply {
            self.send_link_flow(handle, false, out);
        }
        Ok(())
    }

    /// Queue a message on a sender link and push out whatever the credit
    /// and windows allow.
    pub fn send(
        &mut self,
        handle: u32,
        token: u64,
        payload: Bytes,
        settled: bool,
        non_blocking: bool,
        out: &mut Output,
    ) -> Result<()> {
        let link = self
            .links
            .get_mut(&handle)
            .ok_or(AmqpError::LinkDetached(None))?;
        if !link.is_sender() {
            return Err(AmqpError::InvalidState("link is not a sender".into()));
        }
        if !link.is_attached() {
            return Err(AmqpError::LinkDetached(None));
        }
        if let Some(max) = link.remote_max_message_size {
            if max > 0 && payload.len() as u64 > max {
                return Err(AmqpError::ResourceLimitExceeded(format!(
                    "message of {} bytes exceeds peer max-message-size {}",
                    payload.len(),
                    max
                )));
            }
        }
        if non_blocking && link.link_credit as usize <= link.queue.len() {
            return Err(AmqpError::InsufficientCredit);
        }
        let settled = match link.snd_settle_mode {
            SenderSettleMode::Settled => true,
            SenderSettleMode::Unsettled => false,
            SenderSettleMode::Mixed => settled,
        };
        link.queue
            .push_back(PendingTransfer::new(token, payload, settled));
        self.schedule(out)
    }

    /// Withdraw a queued send whose first frame has not gone out.
    pub fn cancel_send(&mut self, token: u64) -> bool {
        self.links.values_mut().any(|link| link.cancel(token))
    }

    /// Emit transfer frames for every sender link in handle order, as far as
    /// credit and the peer's incoming window allow.
    pub fn schedule(&mut self, out: &mut Output) -> Result<()> {
        if !self.is_mapped() {
            return Ok(());
        }
        for (handle, link) in self.links.iter_mut() {
            if !link.is_sender() || !link.is_attached() {
                continue;
            }
            while self.remote_incoming_window > 0 {
                let pending = match link.queue.front_mut() {
                    Some(pending) => pending,
                    None => break,
                };
                let first = !pending.started();
                if first {
                    if link.link_credit == 0 {
                        break;
                    }
                    link.link_credit -= 1;
                    link.delivery_count = link.delivery_count.next();
                    pending.delivery_id = Some(self.next_delivery_id.take_next());
                }

                let (transfer, chunk) = next_fragment(pending, *handle, first, out)?;
                let done = !transfer.more;
                out.frame_with_payload(self.channel, transfer, chunk);
                self.next_outgoing_id = self.next_outgoing_id.next();
                self.remote_incoming_window -= 1;

                if done {
                    if let Some(sent) = link.queue.pop_front() {
                        let id = sent.delivery_id.map(SequenceNo::get).unwrap_or_default();
                        if sent.settled {
                            out.event(EngineEvent::Settled {
                                token: sent.token,
                                outcome: Outcome::Accepted,
                            });
                        } else {
                            self.outgoing_unsettled.insert(id, (*handle, sent.token));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn on_transfer(&mut self, transfer: &Transfer, payload: &[u8], out: &mut Output) -> Result<()> {
        if !self.is_mapped() {
            return Ok(());
        }
        if self.incoming_window == 0 {
            self.fail(
                ErrorCondition::new(conditions::WINDOW_VIOLATION)
                    .with_description("transfer beyond incoming window"),
                out,
            );
            return Ok(());
        }
        self.next_incoming_id = self.next_incoming_id.next();
        self.incoming_window -= 1;

        let handle = match self.remote_handles.get(&transfer.handle) {
            Some(handle) => *handle,
            None => {
                self.fail(AmqpError::HandleNotFound(transfer.handle).to_condition(), out);
                return Ok(());
            }
        };
        let channel = self.channel;
        let link = match self.links.get_mut(&handle) {
            Some(link) if link.is_attached() => link,
            _ => return Ok(()),
        };
        if link.is_sender() {
            let condition = ErrorCondition::new(conditions::NOT_ALLOWED)
                .with_description("transfer received on a sending link");
            return self.detach(handle, true, Some(condition), out);
        }

        let mut delivery_id = None;
        if link.incoming.is_none() {
            if let Some(id) = transfer.delivery_id.map(SequenceNo) {
                if let Some(last) = self.last_incoming_delivery_id {
                    if !id.is_after(last) {
                        return Err(AmqpError::InvalidSequenceNumberComparison(format!(
                            "delivery-id {} does not follow {}",
                            id, last
                        )));
                    }
                }
                self.last_incoming_delivery_id = Some(id);
                delivery_id = Some(id);
            }
        }

        match link.on_transfer(transfer, payload, delivery_id) {
            Ok(Some(delivery)) => {
                trace!(channel, handle, delivery_id = delivery.delivery_id, "delivery complete");
                if !delivery.settled {
                    self.incoming_unsettled.insert(delivery.delivery_id, handle);
                }
                let replenish = link.replenish_credit();
                out.event(EngineEvent::Delivery {
                    channel,
                    handle,
                    delivery,
                });
                if replenish {
                    self.send_link_flow(handle, false, out);
                }
            }
            Ok(None) => {}
            Err(condition) => {
                warn!(channel, handle, %condition, "detaching link on error");
                self.detach(handle, true, Some(condition), out)?;
            }
        }

        if self.incoming_window <= self.opts.incoming_window / 2 {
            self.incoming_window = self.opts.incoming_window;
            self.send_session_flow(out);
        }
        Ok(())
    }

    pub fn on_disposition(&mut self, disposition: &Disposition, out: &mut Output) -> Result<()> {
        let first = SequenceNo(disposition.first);
        let last = SequenceNo(disposition.last_id());

        match disposition.role {
            // peer is the receiver: outcome for our sends
            Role::Receiver => {
                let mut ids: Vec<u32> = self
                    .outgoing_unsettled
                    .keys()
                    .copied()
                    .filter(|id| SequenceNo(*id).in_range(first, last))
                    .collect();
                ids.sort_by_key(|id| SequenceNo(*id).distance_from(first));
                for id in ids {
                    let terminal = disposition
                        .state
                        .as_ref()
                        .map(DeliveryState::is_terminal)
                        .unwrap_or(false);
                    if !disposition.settled && !terminal {
                        continue;
                    }
                    let (handle, token) = match self.outgoing_unsettled.remove(&id) {
                        Some(entry) => entry,
                        None => continue,
                    };
                    if !disposition.settled {
                        // receiver settles second: settle on our side to finish
                        out.frame(
                            self.channel,
                            Disposition {
                                role: Role::Sender,
                                first: id,
                                last: None,
                                settled: true,
                                state: disposition.state.clone(),
                                batchable: false,
                            },
                        );
                    }
                    let outcome = disposition
                        .state
                        .as_ref()
                        .and_then(DeliveryState::outcome)
                        .cloned()
                        .unwrap_or(Outcome::Accepted);
                    trace!(channel = self.channel, handle, id, outcome = outcome.name(), "delivery settled");
                    out.event(EngineEvent::Settled { token, outcome });
                }
            }
            // peer is the sender: settling deliveries we received
            Role::Sender => {
                if !disposition.settled {
                    return Ok(());
                }
                let ids: Vec<u32> = self
                    .incoming_unsettled
                    .keys()
                    .copied()
                    .filter(|id| SequenceNo(*id).in_range(first, last))
                    .collect();
                for id in ids {
                    if let Some(handle) = self.incoming_unsettled.remove(&id) {
                        self.forget_incoming(handle, id, out);
                    }
                }
            }
        }
        Ok(())
    }

    fn forget_incoming(&mut self, handle: u32, delivery_id: u32, out: &mut Output) {
        let replenish = match self.links.get_mut(&handle) {
            Some(link) => {
                link.unsettled_in.remove(&delivery_id);
                link.replenish_credit()
            }
            None => false,
        };
        if replenish {
            self.send_link_flow(handle, false, out);
        }
    }

    /// Apply a local outcome to a received delivery.
    pub fn dispose(
        &mut self,
        handle: u32,
        delivery_id: u32,
        outcome: Outcome,
        out: &mut Output,
    ) -> Result<()> {
        let link = self
            .links
            .get(&handle)
            .ok_or(AmqpError::LinkDetached(None))?;
        if !link.is_attached() {
            return Err(AmqpError::LinkDetached(None));
        }
        if !self.incoming_unsettled.contains_key(&delivery_id) {
            // pre-settled or already settled
            return Ok(());
        }
        let settled = link.rcv_settle_mode == ReceiverSettleMode::First;
        out.frame(
            self.channel,
            Disposition {
                role: Role::Receiver,
                first: delivery_id,
                last: None,
                settled,
                state: Some(DeliveryState::Outcome(outcome)),
                batchable: false,
            },
        );
        if settled {
            self.incoming_unsettled.remove(&delivery_id);
            self.forget_incoming(handle, delivery_id, out);
        }
        Ok(())
    }

    fn receiver_mut(&mut self, handle: u32) -> Result<&mut LinkEngine> {
        let link = self
            .links
            .get_mut(&handle)
            .ok_or(AmqpError::LinkDetached(None))?;
        if link.is_sender() {
            return Err(AmqpError::InvalidState("link is not a receiver".into()));
        }
        if !link.is_attached() {
            return Err(AmqpError::LinkDetached(None));
        }
        Ok(link)
    }

    pub fn add_credit(&mut self, handle: u32, credit: u32, out: &mut Output) -> Result<()> {
        let link = self.receiver_mut(handle)?;
        link.link_credit = link.link_credit.saturating_add(credit);
        self.send_link_flow(handle, false, out);
        Ok(())
    }

    /// Ask the sender to use up or return all outstanding credit.
    pub fn drain(&mut self, handle: u32, out: &mut Output) -> Result<()> {
        let channel = self.channel;
        let link = self.receiver_mut(handle)?;
        if link.link_credit == 0 {
            out.event(EngineEvent::Drained { channel, handle });
            return Ok(());
        }
        link.drain = true;
        link.drain_requested = true;
        self.send_link_flow(handle, false, out);
        Ok(())
    }

    /// Handle allocated for a link name, if attached or attaching.
    #[cfg(test)]
    fn link(&self, handle: u32) -> Option<&LinkEngine> {
        self.links.get(&handle)
    }
}

/// Cut the next transfer frame out of a pending delivery so that the whole
/// frame fits the negotiated max-frame-size.
fn next_fragment(
    pending: &mut PendingTransfer,
    handle: u32,
    first: bool,
    out: &Output,
) -> Result<(Transfer, Bytes)> {
    let mut transfer = Transfer {
        handle,
        more: true,
        ..Default::default()
    };
    if first {
        transfer.delivery_id = pending.delivery_id.map(SequenceNo::get);
        transfer.delivery_tag = Some(pending.tag.clone());
        transfer.message_format = Some(pending.message_format);
        transfer.settled = Some(pending.settled);
    }

    let overhead =
        FRAME_HEADER_SIZE + Performative::Transfer(transfer.clone()).encoded_len(&out.encode)?;
    let room = (out.max_frame_size as usize).saturating_sub(overhead);
    if room == 0 && pending.remaining() > 0 {
        return Err(AmqpError::ResourceLimitExceeded(format!(
            "max-frame-size {} leaves no room for transfer payload",
            out.max_frame_size
        )));
    }
    let chunk_len = room.min(pending.remaining());
    let chunk = pending
        .payload
        .slice(pending.offset..pending.offset + chunk_len);
    pending.offset += chunk_len;
    transfer.more = pending.remaining() > 0;
    Ok((transfer, chunk))
}
