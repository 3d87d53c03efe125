//! SASL frame bodies.

use bytes::{Bytes, BytesMut};

use crate::codec::{
    unwrap_described, Descriptor, Encoder, FieldList, FieldReader, FromValue,
    IntWidth, Symbol, Value,
};
use crate::error::{AmqpError, Result};

pub const MECHANISMS_CODE: u64 = 0x40;
pub const INIT_CODE: u64 = 0x41;
pub const CHALLENGE_CODE: u64 = 0x42;
pub const RESPONSE_CODE: u64 = 0x43;
pub const OUTCOME_CODE: u64 = 0x44;

/// Result code of `sasl-outcome`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslCode {
    Ok = 0,
    Auth = 1,
    Sys = 2,
    SysPerm = 3,
    SysTemp = 4,
}

impl SaslCode {
    fn from_u8(code: u8) -> Result<Self> {
        Ok(match code {
            0 => SaslCode::Ok,
            1 => SaslCode::Auth,
            2 => SaslCode::Sys,
            3 => SaslCode::SysPerm,
            4 => SaslCode::SysTemp,
            other => {
                return Err(AmqpError::MalformedEncoding(format!(
                    "invalid sasl code {}",
                    other
                )))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaslMechanisms {
    pub mechanisms: Vec<Symbol>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaslInit {
    pub mechanism: Symbol,
    pub initial_response: Option<Bytes>,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaslOutcome {
    pub code: SaslCode,
    pub additional_data: Option<Bytes>,
}

/// Any SASL frame body.
#[derive(Debug, Clone, PartialEq)]
pub enum SaslFrame {
    Mechanisms(SaslMechanisms),
    Init(SaslInit),
    Challenge(Bytes),
    Response(Bytes),
    Outcome(SaslOutcome),
}

impl SaslFrame {
    pub fn name(&self) -> &'static str {
        match self {
            SaslFrame::Mechanisms(_) => "sasl-mechanisms",
            SaslFrame::Init(_) => "sasl-init",
            SaslFrame::Challenge(_) => "sasl-challenge",
            SaslFrame::Response(_) => "sasl-response",
            SaslFrame::Outcome(_) => "sasl-outcome",
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let mut f = FieldList::new();
        let code = match self {
            SaslFrame::Mechanisms(m) => {
                // mandatory multiple field: always an array
                f.push(Value::Array(
                    m.mechanisms.iter().cloned().map(Value::Symbol).collect(),
                ));
                MECHANISMS_CODE
            }
            SaslFrame::Init(i) => {
                f.push(i.mechanism.clone())
                    .push(i.initial_response.clone())
                    .push(i.hostname.clone());
                INIT_CODE
            }
            SaslFrame::Challenge(c) => {
                f.push(c.clone());
                CHALLENGE_CODE
            }
            SaslFrame::Response(r) => {
                f.push(r.clone());
                RESPONSE_CODE
            }
            SaslFrame::Outcome(o) => {
                f.push(o.code as u8).push(o.additional_data.clone());
                OUTCOME_CODE
            }
        };
        Encoder::new(buf, IntWidth::Smallest).write_composite(code, &f)
    }
}

fn sasl_code(descriptor: &Descriptor) -> Option<u64> {
    match descriptor {
        Descriptor::Code(c) => Some(*c),
        Descriptor::Symbol(s) => Some(match s.as_str() {
            "amqp:sasl-mechanisms:list" => MECHANISMS_CODE,
            "amqp:sasl-init:list" => INIT_CODE,
            "amqp:sasl-challenge:list" => CHALLENGE_CODE,
            "amqp:sasl-response:list" => RESPONSE_CODE,
            "amqp:sasl-outcome:list" => OUTCOME_CODE,
            _ => return None,
        }),
    }
}

impl FromValue for SaslFrame {
    fn from_value(value: Value) -> Result<Self> {
        let (descriptor, body) = unwrap_described(value)?;
        let unknown =
            || AmqpError::MalformedEncoding(format!("unknown sasl frame {:?}", descriptor));
        let frame = match sasl_code(&descriptor).ok_or_else(unknown)? {
            MECHANISMS_CODE => {
                let mut r = FieldReader::from_list(body, "sasl-mechanisms", 1)?;
                SaslFrame::Mechanisms(SaslMechanisms {
                    mechanisms: r.required("sasl-server-mechanisms")?,
                })
            }
            INIT_CODE => {
                let mut r = FieldReader::from_list(body, "sasl-init", 3)?;
                SaslFrame::Init(SaslInit {
                    mechanism: r.required("mechanism")?,
                    initial_response: r.optional()?,
                    hostname: r.optional()?,
                })
            }
            CHALLENGE_CODE => {
                let mut r = FieldReader::from_list(body, "sasl-challenge", 1)?;
                SaslFrame::Challenge(r.required("challenge")?)
            }
            RESPONSE_CODE => {
                let mut r = FieldReader::from_list(body, "sasl-response", 1)?;
                SaslFrame::Response(r.required("response")?)
            }
            OUTCOME_CODE => {
                let mut r = FieldReader::from_list(body, "sasl-outcome", 2)?;
                SaslFrame::Outcome(SaslOutcome {
                    code: SaslCode::from_u8(r.required("code")?)?,
                    additional_data: r.optional()?,
                })
            }
            _ => return Err(unknown()),
        };
        Ok(frame)
    }
}
