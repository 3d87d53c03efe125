//! Delivery states and outcomes.

use crate::codec::{fields_value, unwrap_described, FieldList, FieldReader, Fields, FromValue, Value};
use crate::error::{AmqpError, Result};

use super::definitions::ErrorCondition;

pub const RECEIVED_CODE: u64 = 0x23;
pub const ACCEPTED_CODE: u64 = 0x24;
pub const REJECTED_CODE: u64 = 0x25;
pub const RELEASED_CODE: u64 = 0x26;
pub const MODIFIED_CODE: u64 = 0x27;

/// Terminal delivery outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Accepted,
    Rejected(Option<ErrorCondition>),
    Released,
    Modified(Modified),
}

/// Parameters of the `modified` outcome.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Modified {
    pub delivery_failed: bool,
    pub undeliverable_here: bool,
    pub message_annotations: Option<Fields>,
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Accepted => "accepted",
            Outcome::Rejected(_) => "rejected",
            Outcome::Released => "released",
            Outcome::Modified(_) => "modified",
        }
    }
}

/// Any delivery state carried by `transfer` or `disposition`.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryState {
    /// Non-terminal progress marker for resumable transfers.
    Received {
        section_number: u32,
        section_offset: u64,
    },
    Outcome(Outcome),
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Outcome(_))
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            DeliveryState::Outcome(o) => Some(o),
            DeliveryState::Received { .. } => None,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut f = FieldList::new();
        let code = match self {
            DeliveryState::Received {
                section_number,
                section_offset,
            } => {
                f.push(*section_number).push(*section_offset);
                RECEIVED_CODE
            }
            DeliveryState::Outcome(Outcome::Accepted) => ACCEPTED_CODE,
            DeliveryState::Outcome(Outcome::Rejected(error)) => {
                f.push(error.as_ref().map(ErrorCondition::to_value));
                REJECTED_CODE
            }
            DeliveryState::Outcome(Outcome::Released) => RELEASED_CODE,
            DeliveryState::Outcome(Outcome::Modified(m)) => {
                f.push(m.delivery_failed)
                    .push(m.undeliverable_here)
                    .push(fields_value(&m.message_annotations));
                MODIFIED_CODE
            }
        };
        f.into_described(code)
    }
}

impl From<Outcome> for DeliveryState {
    fn from(outcome: Outcome) -> Self {
        DeliveryState::Outcome(outcome)
    }
}

impl FromValue for DeliveryState {
    fn from_value(value: Value) -> Result<Self> {
        let (descriptor, body) = unwrap_described(value)?;
        let state = if descriptor.matches(RECEIVED_CODE, "amqp:received:list") {
            let mut r = FieldReader::from_list(body, "received", 2)?;
            DeliveryState::Received {
                section_number: r.required("section-number")?,
                section_offset: r.required("section-offset")?,
            }
        } else if descriptor.matches(ACCEPTED_CODE, "amqp:accepted:list") {
            FieldReader::from_list(body, "accepted", 0)?;
            Outcome::Accepted.into()
        } else if descriptor.matches(REJECTED_CODE, "amqp:rejected:list") {
            let mut r = FieldReader::from_list(body, "rejected", 1)?;
            Outcome::Rejected(r.optional()?).into()
        } else if descriptor.matches(RELEASED_CODE, "amqp:released:list") {
            FieldReader::from_list(body, "released", 0)?;
            Outcome::Released.into()
        } else if descriptor.matches(MODIFIED_CODE, "amqp:modified:list") {
            let mut r = FieldReader::from_list(body, "modified", 3)?;
            Outcome::Modified(Modified {
                delivery_failed: r.or_default(false)?,
                undeliverable_here: r.or_default(false)?,
                message_annotations: r.optional()?,
            })
            .into()
        } else {
            return Err(AmqpError::MalformedEncoding(format!(
                "unknown delivery state {:?}",
                descriptor
            )));
        };
        Ok(state)
    }
}

impl From<DeliveryState> for Value {
    fn from(state: DeliveryState) -> Self {
        state.to_value()
    }
}
