//! Link state machine.
//!
//! ```text
//! Detached → AttachSent → Attached → DetachSent → Detached
//!                            └──────→ DetachReceived → Detached
//! ```
//!
//! A link is either a sender or a receiver. Sender links queue outgoing
//! deliveries until the peer grants credit; receiver links reassemble
//! multi-frame transfers and grant credit, manually or automatically as
//! deliveries are settled.

use std::collections::{HashSet, VecDeque};

use bytes::Bytes;
use serde::Deserialize;

use crate::protocol::{
    conditions, Attach, Detach, ErrorCondition, Flow, ReceiverSettleMode, Role, SenderSettleMode,
    SequenceNo, Source, Target, Transfer,
};

use super::delivery::{IncomingTransfer, PendingTransfer, ReceivedDelivery};

/// Default credit granted by a receiver on attach.
pub const DEFAULT_INITIAL_CREDIT: u32 = 100;

/// How a receiver replenishes link credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditMode {
    /// Credit is only granted by explicit `add_credit` calls.
    Manual,
    /// Credit is topped back up to the initial level as deliveries settle.
    #[default]
    Auto,
}

/// Per-link attach options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkOptions {
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    pub credit_mode: CreditMode,
    /// Credit granted right after attach (receivers only).
    pub initial_credit: u32,
    /// Largest message this end accepts (receivers) or advertises.
    pub max_message_size: Option<u64>,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            snd_settle_mode: SenderSettleMode::Mixed,
            rcv_settle_mode: ReceiverSettleMode::First,
            credit_mode: CreditMode::Auto,
            initial_credit: DEFAULT_INITIAL_CREDIT,
            max_message_size: None,
        }
    }
}

impl LinkOptions {
    pub fn snd_settle_mode(mut self, mode: SenderSettleMode) -> Self {
        self.snd_settle_mode = mode;
        self
    }

    pub fn rcv_settle_mode(mut self, mode: ReceiverSettleMode) -> Self {
        self.rcv_settle_mode = mode;
        self
    }

    pub fn credit_mode(mut self, mode: CreditMode) -> Self {
        self.credit_mode = mode;
        self
    }

    pub fn initial_credit(mut self, credit: u32) -> Self {
        self.initial_credit = credit;
        self
    }

    pub fn max_message_size(mut self, size: u64) -> Self {
        self.max_message_size = Some(size);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkState {
    AttachSent,
    Attached,
    DetachSent,
    Detached,
}

#[derive(Debug)]
pub(crate) struct LinkEngine {
    pub name: String,
    pub role: Role,
    pub handle: u32,
    pub remote_handle: Option<u32>,
    pub state: LinkState,
    pub source: Option<Source>,
    pub target: Option<Target>,
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    pub delivery_count: SequenceNo,
    pub link_credit: u32,
    pub drain: bool,
    pub credit_mode: CreditMode,
    pub initial_credit: u32,
    pub local_max_message_size: Option<u64>,
    pub remote_max_message_size: Option<u64>,
    /// Sender: deliveries waiting to go out, in order.
    pub queue: VecDeque<PendingTransfer>,
    /// Receiver: delivery currently being reassembled.
    pub incoming: Option<IncomingTransfer>,
    /// Receiver: delivery ids received and not yet settled locally.
    pub unsettled_in: HashSet<u32>,
    /// Peer-initiated link we answered with attach + detach.
    pub rejected_by_us: bool,
    /// Receiver: waiting for the sender to answer a drain.
    pub drain_requested: bool,
}

impl LinkEngine {
    pub fn new(
        name: String,
        role: Role,
        handle: u32,
        source: Option<Source>,
        target: Option<Target>,
        opts: &LinkOptions,
    ) -> Self {
        Self {
            name,
            role,
            handle,
            remote_handle: None,
            state: LinkState::AttachSent,
            source,
            target,
            snd_settle_mode: opts.snd_settle_mode,
            rcv_settle_mode: opts.rcv_settle_mode,
            delivery_count: SequenceNo(0),
            link_credit: 0,
            drain: false,
            credit_mode: opts.credit_mode,
            initial_credit: opts.initial_credit,
            local_max_message_size: opts.max_message_size,
            remote_max_message_size: None,
            queue: VecDeque::new(),
            incoming: None,
            unsettled_in: HashSet::new(),
            rejected_by_us: false,
            drain_requested: false,
        }
    }

    /// Placeholder for a peer-initiated attach we refuse.
    pub fn rejected(attach: &Attach, handle: u32) -> Self {
        let mut link = Self::new(
            attach.name.clone(),
            attach.role.opposite(),
            handle,
            None,
            None,
            &LinkOptions::default(),
        );
        link.remote_handle = Some(attach.handle);
        link.state = LinkState::DetachSent;
        link.rejected_by_us = true;
        link
    }

    #[inline]
    pub fn is_sender(&self) -> bool {
        self.role == Role::Sender
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.state == LinkState::Attached
    }

    pub fn attach_frame(&self) -> Attach {
        let mut attach = Attach::new(self.name.clone(), self.handle, self.role);
        attach.snd_settle_mode = self.snd_settle_mode;
        attach.rcv_settle_mode = self.rcv_settle_mode;
        attach.source = self.source.clone();
        attach.target = self.target.clone();
        attach.max_message_size = self.local_max_message_size;
        if self.is_sender() {
            attach.initial_delivery_count = Some(self.delivery_count.get());
        }
        attach
    }

    pub fn detach_frame(&self, closed: bool, error: Option<ErrorCondition>) -> Detach {
        Detach {
            handle: self.handle,
            closed,
            error,
        }
    }

    /// Apply the peer's attach. Returns false if the peer refused the link
    /// (null terminus on its side), in which case a detach is expected next.
    pub fn on_remote_attach(&mut self, attach: &Attach) -> bool {
        self.remote_handle = Some(attach.handle);
        self.remote_max_message_size = attach.max_message_size;
        if !self.is_sender() {
            if let Some(count) = attach.initial_delivery_count {
                self.delivery_count = SequenceNo(count);
            }
            // the sender decides the settle mode it actually uses
            self.snd_settle_mode = attach.snd_settle_mode;
        } else {
            self.rcv_settle_mode = attach.rcv_settle_mode;
        }

        let refused = match self.role {
            Role::Sender => attach.target.is_none(),
            Role::Receiver => attach.source.is_none(),
        };
        if refused {
            return false;
        }
        self.state = LinkState::Attached;
        true
    }

    /// Link-level part of an outgoing `flow`.
    pub fn fill_flow(&self, flow: &mut Flow) {
        flow.handle = Some(self.handle);
        flow.delivery_count = Some(self.delivery_count.get());
        flow.link_credit = Some(self.link_credit);
        flow.available = Some(self.queue.len() as u32);
        flow.drain = self.drain;
    }

    /// Sender side of an incoming link `flow`: recompute credit from the
    /// receiver's view of the delivery count.
    pub fn on_sender_flow(&mut self, flow: &Flow) {
        if let Some(credit) = flow.link_credit {
            let receiver_count = flow
                .delivery_count
                .map(SequenceNo)
                .unwrap_or(self.delivery_count);
            let limit = receiver_count.add(credit);
            self.link_credit = if limit.is_after(self.delivery_count) {
                limit.distance_from(self.delivery_count)
            } else {
                0
            };
        }
        self.drain = flow.drain;
    }

    /// Sender: when draining with nothing left to send, consume the
    /// remaining credit. Returns true if a flow must be sent.
    pub fn complete_drain(&mut self) -> bool {
        if self.drain && self.queue.is_empty() && self.link_credit > 0 {
            self.delivery_count = self.delivery_count.add(self.link_credit);
            self.link_credit = 0;
            return true;
        }
        false
    }

    /// Receiver side of an incoming link `flow`. Returns true if a pending
    /// drain has completed.
    pub fn on_receiver_flow(&mut self, flow: &Flow) -> bool {
        if let Some(count) = flow.delivery_count {
            let limit = self.delivery_count.add(self.link_credit);
            let sender_count = SequenceNo(count);
            self.delivery_count = sender_count;
            self.link_credit = if limit.is_after(sender_count) {
                limit.distance_from(sender_count)
            } else {
                0
            };
        }
        if self.drain_requested && self.link_credit == 0 {
            self.drain_requested = false;
            self.drain = false;
            return true;
        }
        false
    }

    /// Receiver: accept one transfer frame. `delivery_id` is the validated
    /// id when this frame starts a new delivery.
    ///
    /// Errors are link-level conditions; the caller detaches the link.
    pub fn on_transfer(
        &mut self,
        transfer: &Transfer,
        payload: &[u8],
        delivery_id: Option<SequenceNo>,
    ) -> std::result::Result<Option<ReceivedDelivery>, ErrorCondition> {
        if self.incoming.is_none() {
            if self.link_credit == 0 {
                return Err(ErrorCondition::new(conditions::TRANSFER_LIMIT_EXCEEDED)
                    .with_description("transfer received without link credit"));
            }
            let id = delivery_id.ok_or_else(|| {
                ErrorCondition::new(conditions::INVALID_FIELD)
                    .with_description("first transfer of a delivery has no delivery-id")
            })?;
            self.link_credit -= 1;
            self.delivery_count = self.delivery_count.next();
            self.incoming = Some(IncomingTransfer::new(
                id,
                transfer.delivery_tag.clone().unwrap_or_else(Bytes::new),
                transfer.settled.unwrap_or(false),
                transfer.message_format.unwrap_or(0),
            ));
        }

        if transfer.aborted {
            self.incoming = None;
            return Ok(None);
        }

        let incoming = match self.incoming.as_mut() {
            Some(incoming) => incoming,
            None => return Ok(None),
        };
        if transfer.settled == Some(true) {
            incoming.settled = true;
        }
        incoming.append(payload);

        if let Some(max) = self.local_max_message_size {
            if incoming.len() as u64 > max {
                self.incoming = None;
                return Err(ErrorCondition::new(conditions::MESSAGE_SIZE_EXCEEDED)
                    .with_description(format!("message exceeds {} bytes", max)));
            }
        }

        if transfer.more {
            return Ok(None);
        }

        let delivery = match self.incoming.take() {
            Some(incoming) => incoming.finish(),
            None => return Ok(None),
        };
        if !delivery.settled {
            self.unsettled_in.insert(delivery.delivery_id);
        }
        Ok(Some(delivery))
    }

    /// Receiver in auto mode: top credit back up once it has fallen to half
    /// of the initial grant. Returns true if a flow must be sent.
    pub fn replenish_credit(&mut self) -> bool {
        if self.credit_mode != CreditMode::Auto || self.drain {
            return false;
        }
        let desired = self
            .initial_credit
            .saturating_sub(self.unsettled_in.len() as u32);
        if desired > self.link_credit && self.link_credit <= self.initial_credit / 2 {
            self.link_credit = desired;
            return true;
        }
        false
    }

    /// Tokens of queued sends, which can no longer complete once the link
    /// goes away.
    pub fn take_queued_tokens(&mut self) -> Vec<u64> {
        self.queue.drain(..).map(|p| p.token).collect()
    }

    /// Remove an unstarted queued send. Returns true if it was found.
    pub fn cancel(&mut self, token: u64) -> bool {
        match self
            .queue
            .iter()
            .position(|p| p.token == token && !p.started())
        {
            Some(index) => {
                self.queue.remove(index);
                true
            }
            None => false,
        }
    }
}
