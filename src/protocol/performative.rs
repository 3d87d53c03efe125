//! Typed AMQP performatives.
//!
//! Each performative is a described list with a fixed schema. Optional
//! fields are `Option`s (or carry their schema default); fields past the
//! end of an encoded list decode to their default.

use bytes::{Bytes, BytesMut};

use crate::codec::{
    fields_value, symbols_value, unwrap_described, Descriptor, EncodeOptions, Encoder, FieldList,
    FieldReader, Fields, FromValue, Symbol, Value,
};
use crate::error::{AmqpError, Result};

use super::definitions::{ErrorCondition, ReceiverSettleMode, Role, SenderSettleMode};
use super::delivery_state::DeliveryState;
use super::terminus::{Source, Target};

/// Descriptor codes of the transport performatives.
pub mod code {
    pub const OPEN: u64 = 0x10;
    pub const BEGIN: u64 = 0x11;
    pub const ATTACH: u64 = 0x12;
    pub const FLOW: u64 = 0x13;
    pub const TRANSFER: u64 = 0x14;
    pub const DISPOSITION: u64 = 0x15;
    pub const DETACH: u64 = 0x16;
    pub const END: u64 = 0x17;
    pub const CLOSE: u64 = 0x18;
}

fn error_value(error: &Option<ErrorCondition>) -> Option<Value> {
    error.as_ref().map(ErrorCondition::to_value)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    pub container_id: String,
    pub hostname: Option<String>,
    pub max_frame_size: u32,
    pub channel_max: u16,
    /// Idle timeout in milliseconds.
    pub idle_time_out: Option<u32>,
    pub outgoing_locales: Vec<Symbol>,
    pub incoming_locales: Vec<Symbol>,
    pub offered_capabilities: Vec<Symbol>,
    pub desired_capabilities: Vec<Symbol>,
    pub properties: Option<Fields>,
}

impl Open {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            hostname: None,
            max_frame_size: u32::MAX,
            channel_max: u16::MAX,
            idle_time_out: None,
            outgoing_locales: Vec::new(),
            incoming_locales: Vec::new(),
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
        }
    }

    fn fields(&self) -> FieldList {
        let mut f = FieldList::new();
        f.push(self.container_id.clone())
            .push(self.hostname.clone())
            .push(self.max_frame_size)
            .push(self.channel_max)
            .push(self.idle_time_out)
            .push(symbols_value(&self.outgoing_locales))
            .push(symbols_value(&self.incoming_locales))
            .push(symbols_value(&self.offered_capabilities))
            .push(symbols_value(&self.desired_capabilities))
            .push(fields_value(&self.properties));
        f
    }

    fn read(mut r: FieldReader) -> Result<Self> {
        Ok(Self {
            container_id: r.required("container-id")?,
            hostname: r.optional()?,
            max_frame_size: r.or_default(u32::MAX)?,
            channel_max: r.or_default(u16::MAX)?,
            idle_time_out: r.optional()?,
            outgoing_locales: r.or_default(Vec::new())?,
            incoming_locales: r.or_default(Vec::new())?,
            offered_capabilities: r.or_default(Vec::new())?,
            desired_capabilities: r.or_default(Vec::new())?,
            properties: r.optional()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Begin {
    pub remote_channel: Option<u16>,
    pub next_outgoing_id: u32,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: u32,
    pub offered_capabilities: Vec<Symbol>,
    pub desired_capabilities: Vec<Symbol>,
    pub properties: Option<Fields>,
}

impl Begin {
    fn fields(&self, opts: &EncodeOptions) -> FieldList {
        let mut f = FieldList::new();
        f.push(self.remote_channel)
            .push_exact(self.next_outgoing_id, opts.fixed_width_fields)
            .push(self.incoming_window)
            .push(self.outgoing_window)
            .push_exact(self.handle_max, opts.fixed_width_fields)
            .push(symbols_value(&self.offered_capabilities))
            .push(symbols_value(&self.desired_capabilities))
            .push(fields_value(&self.properties));
        f
    }

    fn read(mut r: FieldReader) -> Result<Self> {
        Ok(Self {
            remote_channel: r.optional()?,
            next_outgoing_id: r.required("next-outgoing-id")?,
            incoming_window: r.required("incoming-window")?,
            outgoing_window: r.required("outgoing-window")?,
            handle_max: r.or_default(u32::MAX)?,
            offered_capabilities: r.or_default(Vec::new())?,
            desired_capabilities: r.or_default(Vec::new())?,
            properties: r.optional()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attach {
    pub name: String,
    pub handle: u32,
    pub role: Role,
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    pub source: Option<Source>,
    pub target: Option<Target>,
    pub unsettled: Option<Value>,
    pub incomplete_unsettled: bool,
    pub initial_delivery_count: Option<u32>,
    pub max_message_size: Option<u64>,
    pub offered_capabilities: Vec<Symbol>,
    pub desired_capabilities: Vec<Symbol>,
    pub properties: Option<Fields>,
}

impl Attach {
    pub fn new(name: impl Into<String>, handle: u32, role: Role) -> Self {
        Self {
            name: name.into(),
            handle,
            role,
            snd_settle_mode: SenderSettleMode::default(),
            rcv_settle_mode: ReceiverSettleMode::default(),
            source: None,
            target: None,
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: None,
            max_message_size: None,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
        }
    }

    fn fields(&self, opts: &EncodeOptions) -> FieldList {
        let mut f = FieldList::new();
        f.push(self.name.clone())
            .push_exact(self.handle, opts.fixed_width_fields)
            .push(self.role)
            .push(self.snd_settle_mode)
            .push(self.rcv_settle_mode)
            .push(self.source.as_ref().map(Source::to_value))
            .push(self.target.as_ref().map(Target::to_value))
            .push(self.unsettled.clone())
            .push(self.incomplete_unsettled)
            .push_exact(self.initial_delivery_count, opts.fixed_width_fields)
            .push(self.max_message_size)
            .push(symbols_value(&self.offered_capabilities))
            .push(symbols_value(&self.desired_capabilities))
            .push(fields_value(&self.properties));
        f
    }

    fn read(mut r: FieldReader) -> Result<Self> {
        Ok(Self {
            name: r.required("name")?,
            handle: r.required("handle")?,
            role: r.required("role")?,
            snd_settle_mode: r.or_default(SenderSettleMode::Mixed)?,
            rcv_settle_mode: r.or_default(ReceiverSettleMode::First)?,
            source: r.optional()?,
            target: r.optional()?,
            unsettled: r.optional()?,
            incomplete_unsettled: r.or_default(false)?,
            initial_delivery_count: r.optional()?,
            max_message_size: r.optional()?,
            offered_capabilities: r.or_default(Vec::new())?,
            desired_capabilities: r.or_default(Vec::new())?,
            properties: r.optional()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Flow {
    pub next_incoming_id: Option<u32>,
    pub incoming_window: u32,
    pub next_outgoing_id: u32,
    pub outgoing_window: u32,
    pub handle: Option<u32>,
    pub delivery_count: Option<u32>,
    pub link_credit: Option<u32>,
    pub available: Option<u32>,
    pub drain: bool,
    pub echo: bool,
    pub properties: Option<Fields>,
}

impl Flow {
    fn fields(&self, opts: &EncodeOptions) -> FieldList {
        let exact = opts.fixed_width_fields;
        let mut f = FieldList::new();
        f.push_exact(self.next_incoming_id, exact)
            .push(self.incoming_window)
            .push_exact(self.next_outgoing_id, exact)
            .push(self.outgoing_window)
            .push_exact(self.handle, exact)
            .push_exact(self.delivery_count, exact)
            .push(self.link_credit)
            .push(self.available)
            .push(self.drain)
            .push(self.echo)
            .push(fields_value(&self.properties));
        f
    }

    fn read(mut r: FieldReader) -> Result<Self> {
        Ok(Self {
            next_incoming_id: r.optional()?,
            incoming_window: r.required("incoming-window")?,
            next_outgoing_id: r.required("next-outgoing-id")?,
            outgoing_window: r.required("outgoing-window")?,
            handle: r.optional()?,
            delivery_count: r.optional()?,
            link_credit: r.optional()?,
            available: r.optional()?,
            drain: r.or_default(false)?,
            echo: r.or_default(false)?,
            properties: r.optional()?,
        })
    }

    /// True if this flow carries link state.
    pub fn is_link_flow(&self) -> bool {
        self.handle.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transfer {
    pub handle: u32,
    pub delivery_id: Option<u32>,
    pub delivery_tag: Option<Bytes>,
    pub message_format: Option<u32>,
    pub settled: Option<bool>,
    pub more: bool,
    pub rcv_settle_mode: Option<ReceiverSettleMode>,
    pub state: Option<DeliveryState>,
    pub resume: bool,
    pub aborted: bool,
    pub batchable: bool,
}

impl Transfer {
    fn fields(&self, opts: &EncodeOptions) -> FieldList {
        let exact = opts.fixed_width_fields;
        let mut f = FieldList::new();
        f.push_exact(self.handle, exact)
            .push_exact(self.delivery_id, exact)
            .push(self.delivery_tag.clone())
            .push(self.message_format)
            .push(self.settled)
            .push(self.more)
            .push(self.rcv_settle_mode)
            .push(self.state.as_ref().map(DeliveryState::to_value))
            .push(self.resume)
            .push(self.aborted)
            .push(self.batchable);
        f
    }

    fn read(mut r: FieldReader) -> Result<Self> {
        Ok(Self {
            handle: r.required("handle")?,
            delivery_id: r.optional()?,
            delivery_tag: r.optional()?,
            message_format: r.optional()?,
            settled: r.optional()?,
            more: r.or_default(false)?,
            rcv_settle_mode: r.optional()?,
            state: r.optional()?,
            resume: r.or_default(false)?,
            aborted: r.or_default(false)?,
            batchable: r.or_default(false)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Disposition {
    pub role: Role,
    pub first: u32,
    pub last: Option<u32>,
    pub settled: bool,
    pub state: Option<DeliveryState>,
    pub batchable: bool,
}

impl Disposition {
    /// Inclusive upper bound of the range (defaults to `first`).
    pub fn last_id(&self) -> u32 {
        self.last.unwrap_or(self.first)
    }

    fn fields(&self, opts: &EncodeOptions) -> FieldList {
        let exact = opts.fixed_width_fields;
        let mut f = FieldList::new();
        f.push(self.role)
            .push_exact(self.first, exact)
            .push_exact(self.last, exact)
            .push(self.settled)
            .push(self.state.as_ref().map(DeliveryState::to_value))
            .push(self.batchable);
        f
    }

    fn read(mut r: FieldReader) -> Result<Self> {
        Ok(Self {
            role: r.required("role")?,
            first: r.required("first")?,
            last: r.optional()?,
            settled: r.or_default(false)?,
            state: r.optional()?,
            batchable: r.or_default(false)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detach {
    pub handle: u32,
    pub closed: bool,
    pub error: Option<ErrorCondition>,
}

impl Detach {
    fn fields(&self, opts: &EncodeOptions) -> FieldList {
        let mut f = FieldList::new();
        f.push_exact(self.handle, opts.fixed_width_fields)
            .push(self.closed)
            .push(error_value(&self.error));
        f
    }

    fn read(mut r: FieldReader) -> Result<Self> {
        Ok(Self {
            handle: r.required("handle")?,
            closed: r.or_default(false)?,
            error: r.optional()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct End {
    pub error: Option<ErrorCondition>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Close {
    pub error: Option<ErrorCondition>,
}

fn error_fields(error: &Option<ErrorCondition>) -> FieldList {
    let mut f = FieldList::new();
    f.push(error_value(error));
    f
}

/// Any AMQP transport performative.
#[derive(Debug, Clone, PartialEq)]
pub enum Performative {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition(Disposition),
    Detach(Detach),
    End(End),
    Close(Close),
}

impl Performative {
    pub fn name(&self) -> &'static str {
        match self {
            Performative::Open(_) => "open",
            Performative::Begin(_) => "begin",
            Performative::Attach(_) => "attach",
            Performative::Flow(_) => "flow",
            Performative::Transfer(_) => "transfer",
            Performative::Disposition(_) => "disposition",
            Performative::Detach(_) => "detach",
            Performative::End(_) => "end",
            Performative::Close(_) => "close",
        }
    }

    pub fn code(&self) -> u64 {
        match self {
            Performative::Open(_) => code::OPEN,
            Performative::Begin(_) => code::BEGIN,
            Performative::Attach(_) => code::ATTACH,
            Performative::Flow(_) => code::FLOW,
            Performative::Transfer(_) => code::TRANSFER,
            Performative::Disposition(_) => code::DISPOSITION,
            Performative::Detach(_) => code::DETACH,
            Performative::End(_) => code::END,
            Performative::Close(_) => code::CLOSE,
        }
    }

    /// Append the described-list encoding to `buf`.
    pub fn encode(&self, buf: &mut BytesMut, opts: &EncodeOptions) -> Result<()> {
        let fields = match self {
            Performative::Open(p) => p.fields(),
            Performative::Begin(p) => p.fields(opts),
            Performative::Attach(p) => p.fields(opts),
            Performative::Flow(p) => p.fields(opts),
            Performative::Transfer(p) => p.fields(opts),
            Performative::Disposition(p) => p.fields(opts),
            Performative::Detach(p) => p.fields(opts),
            Performative::End(p) => error_fields(&p.error),
            Performative::Close(p) => error_fields(&p.error),
        };
        Encoder::new(buf, opts.int_width).write_composite(self.code(), &fields)
    }

    /// Encoded size in bytes under the given options.
    pub fn encoded_len(&self, opts: &EncodeOptions) -> Result<usize> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf, opts)?;
        Ok(buf.len())
    }
}

fn descriptor_code(descriptor: &Descriptor) -> Option<u64> {
    match descriptor {
        Descriptor::Code(c) => Some(*c),
        Descriptor::Symbol(s) => Some(match s.as_str() {
            "amqp:open:list" => code::OPEN,
            "amqp:begin:list" => code::BEGIN,
            "amqp:attach:list" => code::ATTACH,
            "amqp:flow:list" => code::FLOW,
            "amqp:transfer:list" => code::TRANSFER,
            "amqp:disposition:list" => code::DISPOSITION,
            "amqp:detach:list" => code::DETACH,
            "amqp:end:list" => code::END,
            "amqp:close:list" => code::CLOSE,
            _ => return None,
        }),
    }
}

impl FromValue for Performative {
    fn from_value(value: Value) -> Result<Self> {
        let (descriptor, body) = unwrap_described(value)?;
        let unknown = || {
            AmqpError::MalformedEncoding(format!("unknown performative {:?}", descriptor))
        };
        let code = descriptor_code(&descriptor).ok_or_else(unknown)?;
        let performative = match code {
            code::OPEN => Performative::Open(Open::read(FieldReader::from_list(body, "open", 10)?)?),
            code::BEGIN => {
                Performative::Begin(Begin::read(FieldReader::from_list(body, "begin", 8)?)?)
            }
            code::ATTACH => {
                Performative::Attach(Attach::read(FieldReader::from_list(body, "attach", 14)?)?)
            }
            code::FLOW => Performative::Flow(Flow::read(FieldReader::from_list(body, "flow", 11)?)?),
            code::TRANSFER => Performative::Transfer(Transfer::read(FieldReader::from_list(
                body, "transfer", 11,
            )?)?),
            code::DISPOSITION => Performative::Disposition(Disposition::read(
                FieldReader::from_list(body, "disposition", 6)?,
            )?),
            code::DETACH => {
                Performative::Detach(Detach::read(FieldReader::from_list(body, "detach", 3)?)?)
            }
            code::END => {
                let mut r = FieldReader::from_list(body, "end", 1)?;
                Performative::End(End {
                    error: r.optional()?,
                })
            }
            code::CLOSE => {
                let mut r = FieldReader::from_list(body, "close", 1)?;
                Performative::Close(Close {
                    error: r.optional()?,
                })
            }
            _ => return Err(unknown()),
        };
        Ok(performative)
    }
}

macro_rules! impl_from_performative {
    ($($variant:ident),*) => {
        $(impl From<$variant> for Performative {
            fn from(p: $variant) -> Self {
                Performative::$variant(p)
            }
        })*
    };
}

impl_from_performative!(Open, Begin, Attach, Flow, Transfer, Disposition, Detach, End, Close);
