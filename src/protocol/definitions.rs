//! Shared protocol definitions: roles, settle modes and error conditions.

use std::fmt;

use crate::codec::{fields_value, FieldList, FieldReader, Fields, FromValue, Symbol, Value};
use crate::error::{AmqpError, Result};

/// Descriptor code of the `error` composite.
pub const ERROR_CODE: u64 = 0x1d;

/// Standard error condition symbols.
pub mod conditions {
    pub const INTERNAL_ERROR: &str = "amqp:internal-error";
    pub const NOT_FOUND: &str = "amqp:not-found";
    pub const UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
    pub const DECODE_ERROR: &str = "amqp:decode-error";
    pub const RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
    pub const NOT_ALLOWED: &str = "amqp:not-allowed";
    pub const INVALID_FIELD: &str = "amqp:invalid-field";
    pub const NOT_IMPLEMENTED: &str = "amqp:not-implemented";
    pub const RESOURCE_LOCKED: &str = "amqp:resource-locked";
    pub const PRECONDITION_FAILED: &str = "amqp:precondition-failed";
    pub const RESOURCE_DELETED: &str = "amqp:resource-deleted";
    pub const ILLEGAL_STATE: &str = "amqp:illegal-state";
    pub const FRAME_SIZE_TOO_SMALL: &str = "amqp:frame-size-too-small";

    pub const CONNECTION_FORCED: &str = "amqp:connection:forced";
    pub const FRAMING_ERROR: &str = "amqp:connection:framing-error";
    pub const REDIRECT: &str = "amqp:connection:redirect";

    pub const WINDOW_VIOLATION: &str = "amqp:session:window-violation";
    pub const ERRANT_LINK: &str = "amqp:session:errant-link";
    pub const HANDLE_IN_USE: &str = "amqp:session:handle-in-use";
    pub const UNATTACHED_HANDLE: &str = "amqp:session:unattached-handle";

    pub const DETACH_FORCED: &str = "amqp:link:detach-forced";
    pub const TRANSFER_LIMIT_EXCEEDED: &str = "amqp:link:transfer-limit-exceeded";
    pub const MESSAGE_SIZE_EXCEEDED: &str = "amqp:link:message-size-exceeded";
    pub const LINK_REDIRECT: &str = "amqp:link:redirect";
    pub const STOLEN: &str = "amqp:link:stolen";
}

/// Error condition carried by `close`, `end`, `detach` and `rejected`.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorCondition {
    pub condition: Symbol,
    pub description: Option<String>,
    pub info: Option<Fields>,
}

impl ErrorCondition {
    pub fn new(condition: impl Into<Symbol>) -> Self {
        Self {
            condition: condition.into(),
            description: None,
            info: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn to_value(&self) -> Value {
        let mut fields = FieldList::new();
        fields
            .push(self.condition.clone())
            .push(self.description.clone())
            .push(fields_value(&self.info));
        fields.into_described(ERROR_CODE)
    }

    pub(crate) fn to_fields(&self) -> FieldList {
        let mut fields = FieldList::new();
        fields
            .push(self.condition.clone())
            .push(self.description.clone())
            .push(fields_value(&self.info));
        fields
    }
}

impl FromValue for ErrorCondition {
    fn from_value(value: Value) -> Result<Self> {
        let mut r = FieldReader::new(value, ERROR_CODE, "error", 3)?;
        Ok(Self {
            condition: r.required("condition")?,
            description: r.optional()?,
            info: r.optional()?,
        })
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.condition)?;
        if let Some(d) = &self.description {
            write!(f, " ({})", d)?;
        }
        Ok(())
    }
}

impl From<ErrorCondition> for Value {
    fn from(e: ErrorCondition) -> Self {
        e.to_value()
    }
}

/// Link role. Encoded as a boolean: `false` = sender, `true` = receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn as_bool(self) -> bool {
        matches!(self, Role::Receiver)
    }

    pub fn opposite(self) -> Self {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl FromValue for Role {
    fn from_value(value: Value) -> Result<Self> {
        Ok(if bool::from_value(value)? {
            Role::Receiver
        } else {
            Role::Sender
        })
    }
}

impl From<Role> for Value {
    fn from(r: Role) -> Self {
        Value::Bool(r.as_bool())
    }
}

/// Sender settlement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderSettleMode {
    /// Deliveries may be sent unsettled.
    Unsettled = 0,
    /// Deliveries are sent settled (fire and forget).
    Settled = 1,
    /// Sender chooses per delivery.
    #[default]
    Mixed = 2,
}

impl FromValue for SenderSettleMode {
    fn from_value(value: Value) -> Result<Self> {
        match u8::from_value(value)? {
            0 => Ok(SenderSettleMode::Unsettled),
            1 => Ok(SenderSettleMode::Settled),
            2 => Ok(SenderSettleMode::Mixed),
            other => Err(AmqpError::MalformedEncoding(format!(
                "invalid snd-settle-mode {}",
                other
            ))),
        }
    }
}

impl From<SenderSettleMode> for Value {
    fn from(m: SenderSettleMode) -> Self {
        Value::Ubyte(m as u8)
    }
}

/// Receiver settlement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiverSettleMode {
    /// Receiver settles as soon as it decides an outcome.
    #[default]
    First = 0,
    /// Receiver settles only after the sender settles.
    Second = 1,
}

impl FromValue for ReceiverSettleMode {
    fn from_value(value: Value) -> Result<Self> {
        match u8::from_value(value)? {
            0 => Ok(ReceiverSettleMode::First),
            1 => Ok(ReceiverSettleMode::Second),
            other => Err(AmqpError::MalformedEncoding(format!(
                "invalid rcv-settle-mode {}",
                other
            ))),
        }
    }
}

impl From<ReceiverSettleMode> for Value {
    fn from(m: ReceiverSettleMode) -> Self {
        Value::Ubyte(m as u8)
    }
}
