//! Bare and annotated message format.
//!
//! A message is a sequence of described sections:
//!
//! ```text
//! header? delivery-annotations? message-annotations? properties?
//! application-properties? body footer?
//! ```
//!
//! The body is one or more `data` sections, one or more `amqp-sequence`
//! sections, or a single `amqp-value`.

use bytes::{Bytes, BytesMut};

use crate::codec::{
    unwrap_described, Decoder, Descriptor, Encoder, FieldList, FieldReader, FromValue,
    IntWidth, Symbol, Value,
};
use crate::error::{AmqpError, Result};

pub mod section {
    pub const HEADER: u64 = 0x70;
    pub const DELIVERY_ANNOTATIONS: u64 = 0x71;
    pub const MESSAGE_ANNOTATIONS: u64 = 0x72;
    pub const PROPERTIES: u64 = 0x73;
    pub const APPLICATION_PROPERTIES: u64 = 0x74;
    pub const DATA: u64 = 0x75;
    pub const AMQP_SEQUENCE: u64 = 0x76;
    pub const AMQP_VALUE: u64 = 0x77;
    pub const FOOTER: u64 = 0x78;
}

/// Annotation maps keep their raw keys (symbols or ulongs).
pub type Annotations = Vec<(Value, Value)>;

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub durable: bool,
    pub priority: u8,
    /// Time to live in milliseconds.
    pub ttl: Option<u32>,
    pub first_acquirer: bool,
    pub delivery_count: u32,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            durable: false,
            priority: 4,
            ttl: None,
            first_acquirer: false,
            delivery_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Properties {
    pub message_id: Option<Value>,
    pub user_id: Option<Bytes>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<Value>,
    pub content_type: Option<Symbol>,
    pub content_encoding: Option<Symbol>,
    pub absolute_expiry_time: Option<i64>,
    pub creation_time: Option<i64>,
    pub group_id: Option<String>,
    pub group_sequence: Option<u32>,
    pub reply_to_group_id: Option<String>,
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    #[default]
    Empty,
    Data(Vec<Bytes>),
    Sequence(Vec<Vec<Value>>),
    Value(Value),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub header: Option<Header>,
    pub delivery_annotations: Option<Annotations>,
    pub message_annotations: Option<Annotations>,
    pub properties: Option<Properties>,
    pub application_properties: Option<Vec<(String, Value)>>,
    pub body: Body,
    pub footer: Option<Annotations>,
}

impl Message {
    pub fn new(body: Body) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    /// Message with a single `data` section.
    pub fn data(bytes: impl Into<Bytes>) -> Self {
        Self::new(Body::Data(vec![bytes.into()]))
    }

    /// Message with an `amqp-value` body.
    pub fn value(value: impl Into<Value>) -> Self {
        Self::new(Body::Value(value.into()))
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = Some(properties);
        self
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.header = Some(header);
        self
    }

    pub fn with_application_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.application_properties
            .get_or_insert_with(Vec::new)
            .push((key.into(), value.into()));
        self
    }

    /// Look up an application property. The first matching key wins.
    pub fn application_property(&self, key: &str) -> Option<&Value> {
        self.application_properties
            .as_ref()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Concatenated `data` sections, if the body is binary.
    pub fn body_bytes(&self) -> Option<Bytes> {
        match &self.body {
            Body::Data(chunks) if chunks.len() == 1 => Some(chunks[0].clone()),
            Body::Data(chunks) => {
                let mut buf = BytesMut::new();
                for c in chunks {
                    buf.extend_from_slice(c);
                }
                Some(buf.freeze())
            }
            _ => None,
        }
    }

    /// The body as text, for `amqp-value` string bodies.
    pub fn body_str(&self) -> Option<&str> {
        match &self.body {
            Body::Value(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let mut enc = Encoder::new(buf, IntWidth::Smallest);

        if let Some(h) = &self.header {
            let mut f = FieldList::new();
            f.push(h.durable)
                .push(h.priority)
                .push(h.ttl)
                .push(h.first_acquirer)
                .push(h.delivery_count);
            enc.write_composite(section::HEADER, &f)?;
        }
        if let Some(a) = &self.delivery_annotations {
            enc.write_value(&Value::described(section::DELIVERY_ANNOTATIONS, Value::Map(a.clone())))?;
        }
        if let Some(a) = &self.message_annotations {
            enc.write_value(&Value::described(section::MESSAGE_ANNOTATIONS, Value::Map(a.clone())))?;
        }
        if let Some(p) = &self.properties {
            let mut f = FieldList::new();
            f.push(p.message_id.clone())
                .push(p.user_id.clone())
                .push(p.to.clone())
                .push(p.subject.clone())
                .push(p.reply_to.clone())
                .push(p.correlation_id.clone())
                .push(p.content_type.clone())
                .push(p.content_encoding.clone())
                .push(p.absolute_expiry_time.map(Value::Timestamp))
                .push(p.creation_time.map(Value::Timestamp))
                .push(p.group_id.clone())
                .push(p.group_sequence)
                .push(p.reply_to_group_id.clone());
            enc.write_composite(section::PROPERTIES, &f)?;
        }
        if let Some(props) = &self.application_properties {
            let map = props
                .iter()
                .map(|(k, v)| (Value::String(k.clone()), v.clone()))
                .collect();
            enc.write_value(&Value::described(section::APPLICATION_PROPERTIES, Value::Map(map)))?;
        }
        match &self.body {
            Body::Empty => {}
            Body::Data(chunks) => {
                for c in chunks {
                    enc.write_value(&Value::described(section::DATA, Value::Binary(c.clone())))?;
                }
            }
            Body::Sequence(lists) => {
                for l in lists {
                    enc.write_value(&Value::described(section::AMQP_SEQUENCE, Value::List(l.clone())))?;
                }
            }
            Body::Value(v) => {
                enc.write_value(&Value::described(section::AMQP_VALUE, v.clone()))?;
            }
        }
        if let Some(a) = &self.footer {
            enc.write_value(&Value::described(section::FOOTER, Value::Map(a.clone())))?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a message from the concatenated payload of a delivery.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut decoder = Decoder::new(buf);
        let mut message = Message::default();
        let mut last_rank = 0u8;

        while decoder.remaining() > 0 {
            let (descriptor, value) = unwrap_described(decoder.read_value()?)?;
            let code = section_code(&descriptor).ok_or_else(|| {
                AmqpError::MalformedEncoding(format!("unknown message section {:?}", descriptor))
            })?;
            let rank = section_rank(code);
            if rank < last_rank || (rank == last_rank && !is_repeatable(code)) {
                return Err(AmqpError::MalformedEncoding(format!(
                    "message section 0x{:02x} out of order",
                    code
                )));
            }
            last_rank = rank;

            match code {
                section::HEADER => {
                    let mut r = FieldReader::from_list(value, "header", 5)?;
                    message.header = Some(Header {
                        durable: r.or_default(false)?,
                        priority: r.or_default(4)?,
                        ttl: r.optional()?,
                        first_acquirer: r.or_default(false)?,
                        delivery_count: r.or_default(0)?,
                    });
                }
                section::DELIVERY_ANNOTATIONS => {
                    message.delivery_annotations = Some(annotations(value)?)
                }
                section::MESSAGE_ANNOTATIONS => message.message_annotations = Some(annotations(value)?),
                section::PROPERTIES => {
                    let mut r = FieldReader::from_list(value, "properties", 13)?;
                    message.properties = Some(Properties {
                        message_id: r.optional()?,
                        user_id: r.optional()?,
                        to: r.optional()?,
                        subject: r.optional()?,
                        reply_to: r.optional()?,
                        correlation_id: r.optional()?,
                        content_type: r.optional()?,
                        content_encoding: r.optional()?,
                        absolute_expiry_time: r.optional()?,
                        creation_time: r.optional()?,
                        group_id: r.optional()?,
                        group_sequence: r.optional()?,
                        reply_to_group_id: r.optional()?,
                    });
                }
                section::APPLICATION_PROPERTIES => {
                    let entries = match value {
                        Value::Map(entries) => entries,
                        Value::Null => Vec::new(),
                        other => {
                            return Err(AmqpError::MalformedEncoding(format!(
                                "application-properties must be a map, got {}",
                                other.type_name()
                            )))
                        }
                    };
                    let props = entries
                        .into_iter()
                        .map(|(k, v)| Ok((String::from_value(k)?, v)))
                        .collect::<Result<Vec<_>>>()?;
                    message.application_properties = Some(props);
                }
                section::DATA => {
                    let chunk = Bytes::from_value(value)?;
                    match &mut message.body {
                        Body::Empty => message.body = Body::Data(vec![chunk]),
                        Body::Data(chunks) => chunks.push(chunk),
                        _ => return Err(mixed_body()),
                    }
                }
                section::AMQP_SEQUENCE => {
                    let list = Vec::<Value>::from_value(value)?;
                    match &mut message.body {
                        Body::Empty => message.body = Body::Sequence(vec![list]),
                        Body::Sequence(lists) => lists.push(list),
                        _ => return Err(mixed_body()),
                    }
                }
                section::AMQP_VALUE => match message.body {
                    Body::Empty => message.body = Body::Value(value),
                    _ => return Err(mixed_body()),
                },
                section::FOOTER => message.footer = Some(annotations(value)?),
                other => {
                    return Err(AmqpError::MalformedEncoding(format!(
                        "unknown message section 0x{:02x}",
                        other
                    )))
                }
            }
        }
        Ok(message)
    }
}

fn mixed_body() -> AmqpError {
    AmqpError::MalformedEncoding("message body mixes section kinds".to_string())
}

fn annotations(value: Value) -> Result<Annotations> {
    match value {
        Value::Map(entries) => Ok(entries),
        Value::Null => Ok(Vec::new()),
        other => Err(AmqpError::MalformedEncoding(format!(
            "annotations must be a map, got {}",
            other.type_name()
        ))),
    }
}

fn section_code(descriptor: &Descriptor) -> Option<u64> {
    let code = match descriptor {
        Descriptor::Code(c) => *c,
        Descriptor::Symbol(s) => match s.as_str() {
            "amqp:header:list" => section::HEADER,
            "amqp:delivery-annotations:map" => section::DELIVERY_ANNOTATIONS,
            "amqp:message-annotations:map" => section::MESSAGE_ANNOTATIONS,
            "amqp:properties:list" => section::PROPERTIES,
            "amqp:application-properties:map" => section::APPLICATION_PROPERTIES,
            "amqp:data:binary" => section::DATA,
            "amqp:amqp-sequence:list" => section::AMQP_SEQUENCE,
            "amqp:amqp-value:*" => section::AMQP_VALUE,
            "amqp:footer:map" => section::FOOTER,
            _ => return None,
        },
    };
    (section::HEADER..=section::FOOTER).contains(&code).then_some(code)
}

/// Position of a section in the message layout; body sections share a rank.
fn section_rank(code: u64) -> u8 {
    match code {
        section::DATA | section::AMQP_SEQUENCE | section::AMQP_VALUE => 6,
        section::FOOTER => 7,
        other => (other - section::HEADER + 1) as u8,
    }
}

fn is_repeatable(code: u64) -> bool {
    matches!(code, section::DATA | section::AMQP_SEQUENCE)
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::value(text)
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::value(text)
    }
}

impl From<Bytes> for Message {
    fn from(bytes: Bytes) -> Self {
        Message::data(bytes)
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Message::data(bytes)
    }
}
