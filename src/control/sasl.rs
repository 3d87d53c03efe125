//! SASL negotiation.
//!
//! ```text
//! Idle → MechanismsReceived → InitSent → (ChallengeReceived → ResponseSent)*
//!      → OutcomeReceived → Done | Failed
//! ```
//!
//! The negotiator is a pure state machine: it is fed decoded SASL frames and
//! returns the frame to send back, if any. The handshake drives it over the
//! stream.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use tracing::debug;

use crate::codec::Symbol;
use crate::error::{AmqpError, Result};
use crate::protocol::{SaslCode, SaslFrame, SaslInit};

/// A SASL mechanism: its name and the client side of its exchange.
pub trait SaslMechanism: Send + Sync + fmt::Debug {
    /// Mechanism name as offered in `sasl-mechanisms`, e.g. `PLAIN`.
    fn name(&self) -> &str;

    /// Initial response carried by `sasl-init`.
    fn initial_response(&self) -> Option<Bytes>;

    /// Answer a `sasl-challenge`.
    fn respond(&self, _challenge: &[u8]) -> Result<Bytes> {
        Err(AmqpError::SaslNegotiationFailed(format!(
            "mechanism {} does not expect a challenge",
            self.name()
        )))
    }
}

/// `ANONYMOUS`: no credentials.
#[derive(Debug, Clone, Default)]
pub struct Anonymous;

impl SaslMechanism for Anonymous {
    fn name(&self) -> &str {
        "ANONYMOUS"
    }

    fn initial_response(&self) -> Option<Bytes> {
        None
    }
}

/// `PLAIN`: username and password in the clear.
#[derive(Clone)]
pub struct Plain {
    pub username: String,
    pub password: String,
}

impl Plain {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Plain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plain")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl SaslMechanism for Plain {
    fn name(&self) -> &str {
        "PLAIN"
    }

    /// `authzid NUL authcid NUL passwd` with an empty authzid.
    fn initial_response(&self) -> Option<Bytes> {
        let mut buf = BytesMut::with_capacity(2 + self.username.len() + self.password.len());
        buf.extend_from_slice(b"\0");
        buf.extend_from_slice(self.username.as_bytes());
        buf.extend_from_slice(b"\0");
        buf.extend_from_slice(self.password.as_bytes());
        Some(buf.freeze())
    }
}

/// `EXTERNAL`: identity established by the transport (client certificate).
#[derive(Debug, Clone, Default)]
pub struct External;

impl SaslMechanism for External {
    fn name(&self) -> &str {
        "EXTERNAL"
    }

    fn initial_response(&self) -> Option<Bytes> {
        Some(Bytes::new())
    }
}

/// Configured SASL behavior for a connection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "mechanism", rename_all = "lowercase")]
pub enum SaslProfile {
    /// Skip the SASL layer and send the AMQP header directly.
    #[default]
    None,
    Anonymous,
    Plain {
        username: String,
        password: String,
    },
    External,
    /// Caller-supplied mechanism.
    #[serde(skip)]
    Custom(Arc<dyn SaslMechanism>),
}

impl SaslProfile {
    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        SaslProfile::Plain {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn custom(mechanism: impl SaslMechanism + 'static) -> Self {
        SaslProfile::Custom(Arc::new(mechanism))
    }

    /// The mechanism to negotiate, or `None` to skip SASL.
    pub fn mechanism(&self) -> Option<Arc<dyn SaslMechanism>> {
        match self {
            SaslProfile::None => None,
            SaslProfile::Anonymous => Some(Arc::new(Anonymous)),
            SaslProfile::Plain { username, password } => {
                Some(Arc::new(Plain::new(username.clone(), password.clone())))
            }
            SaslProfile::External => Some(Arc::new(External)),
            SaslProfile::Custom(mechanism) => Some(mechanism.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslState {
    Idle,
    MechanismsReceived,
    InitSent,
    ChallengeReceived,
    ResponseSent,
    OutcomeReceived,
    Done,
    Failed,
}

/// Client side of the SASL exchange.
#[derive(Debug)]
pub struct SaslNegotiator {
    state: SaslState,
    mechanism: Arc<dyn SaslMechanism>,
    hostname: Option<String>,
}

impl SaslNegotiator {
    pub fn new(mechanism: Arc<dyn SaslMechanism>, hostname: Option<String>) -> Self {
        Self {
            state: SaslState::Idle,
            mechanism,
            hostname,
        }
    }

    pub fn state(&self) -> SaslState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == SaslState::Done
    }

    fn fail(&mut self, reason: String) -> AmqpError {
        self.state = SaslState::Failed;
        AmqpError::SaslNegotiationFailed(reason)
    }

    /// Feed one frame from the peer; returns the reply frame, if any.
    pub fn handle(&mut self, frame: SaslFrame) -> Result<Option<SaslFrame>> {
        match (self.state, frame) {
            (SaslState::Idle, SaslFrame::Mechanisms(offered)) => {
                self.state = SaslState::MechanismsReceived;
                let mechanism = self.mechanism.clone();
                let name = mechanism.name();
                if !offered.mechanisms.iter().any(|m| m.as_str() == name) {
                    let offered: Vec<&str> =
                        offered.mechanisms.iter().map(Symbol::as_str).collect();
                    let reason = format!(
                        "mechanism {} not offered (peer offers {:?})",
                        name, offered
                    );
                    return Err(self.fail(reason));
                }
                debug!(mechanism = name, "sasl-init");
                self.state = SaslState::InitSent;
                Ok(Some(SaslFrame::Init(SaslInit {
                    mechanism: Symbol::from(name),
                    initial_response: self.mechanism.initial_response(),
                    hostname: self.hostname.clone(),
                })))
            }
            (SaslState::InitSent | SaslState::ResponseSent, SaslFrame::Challenge(challenge)) => {
                self.state = SaslState::ChallengeReceived;
                let response = match self.mechanism.respond(&challenge) {
                    Ok(response) => response,
                    Err(e) => return Err(self.fail(e.to_string())),
                };
                self.state = SaslState::ResponseSent;
                Ok(Some(SaslFrame::Response(response)))
            }
            (SaslState::InitSent | SaslState::ResponseSent, SaslFrame::Outcome(outcome)) => {
                self.state = SaslState::OutcomeReceived;
                if outcome.code != SaslCode::Ok {
                    return Err(self.fail(format!("authentication failed ({:?})", outcome.code)));
                }
                debug!(mechanism = self.mechanism.name(), "sasl outcome ok");
                self.state = SaslState::Done;
                Ok(None)
            }
            (state, frame) => Err(self.fail(format!(
                "unexpected {} in state {:?}",
                frame.name(),
                state
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SaslMechanisms, SaslOutcome};

    fn offer(names: &[&str]) -> SaslFrame {
        SaslFrame::Mechanisms(SaslMechanisms {
            mechanisms: names.iter().map(|n| Symbol::from(*n)).collect(),
        })
    }

    fn outcome(code: SaslCode) -> SaslFrame {
        SaslFrame::Outcome(SaslOutcome {
            code,
            additional_data: None,
        })
    }

    #[derive(Debug)]
    struct Echo;

    impl SaslMechanism for Echo {
        fn name(&self) -> &str {
            "X-ECHO"
        }

        fn initial_response(&self) -> Option<Bytes> {
            None
        }

        fn respond(&self, challenge: &[u8]) -> Result<Bytes> {
            Ok(Bytes::copy_from_slice(challenge))
        }
    }

    #[test]
    fn test_plain_initial_response() {
        let plain = Plain::new("guest", "secret");
        assert_eq!(
            plain.initial_response().unwrap(),
            Bytes::from_static(b"\0guest\0secret")
        );
        assert!(!format!("{:?}", plain).contains("secret"));
    }

    #[test]
    fn test_plain_success() {
        let mut negotiator = SaslNegotiator::new(Arc::new(Plain::new("u", "p")), None);
        let reply = negotiator.handle(offer(&["ANONYMOUS", "PLAIN"])).unwrap();
        match reply {
            Some(SaslFrame::Init(init)) => assert_eq!(init.mechanism.as_str(), "PLAIN"),
            other => panic!("expected init, got {:?}", other),
        }
        assert_eq!(negotiator.state(), SaslState::InitSent);
        assert_eq!(negotiator.handle(outcome(SaslCode::Ok)).unwrap(), None);
        assert!(negotiator.is_done());
    }

    #[test]
    fn test_auth_failure() {
        let mut negotiator = SaslNegotiator::new(Arc::new(Plain::new("u", "bad")), None);
        negotiator.handle(offer(&["PLAIN"])).unwrap();
        let err = negotiator.handle(outcome(SaslCode::Auth)).unwrap_err();
        assert!(matches!(err, AmqpError::SaslNegotiationFailed(_)));
        assert_eq!(negotiator.state(), SaslState::Failed);
    }

    #[test]
    fn test_mechanism_not_offered() {
        let mut negotiator = SaslNegotiator::new(Arc::new(External), None);
        let err = negotiator.handle(offer(&["PLAIN"])).unwrap_err();
        assert!(err.to_string().contains("EXTERNAL"));
    }

    #[test]
    fn test_challenge_round() {
        let mut negotiator = SaslNegotiator::new(Arc::new(Echo), Some("host".into()));
        negotiator.handle(offer(&["X-ECHO"])).unwrap();
        let reply = negotiator
            .handle(SaslFrame::Challenge(Bytes::from_static(b"nonce")))
            .unwrap();
        assert_eq!(reply, Some(SaslFrame::Response(Bytes::from_static(b"nonce"))));
        assert_eq!(negotiator.state(), SaslState::ResponseSent);
        negotiator.handle(outcome(SaslCode::Ok)).unwrap();
        assert!(negotiator.is_done());
    }

    #[test]
    fn test_challenge_without_support() {
        let mut negotiator = SaslNegotiator::new(Arc::new(Anonymous), None);
        negotiator.handle(offer(&["ANONYMOUS"])).unwrap();
        assert!(negotiator
            .handle(SaslFrame::Challenge(Bytes::new()))
            .is_err());
    }

    #[test]
    fn test_unexpected_frame() {
        let mut negotiator = SaslNegotiator::new(Arc::new(Anonymous), None);
        assert!(negotiator.handle(outcome(SaslCode::Ok)).is_err());
    }

    #[test]
    fn test_profile_from_json() {
        let profile: SaslProfile =
            serde_json::from_str(r#"{"mechanism":"plain","username":"a","password":"b"}"#)
                .unwrap();
        assert_eq!(profile.mechanism().unwrap().name(), "PLAIN");
        let none: SaslProfile = serde_json::from_str(r#"{"mechanism":"none"}"#).unwrap();
        assert!(none.mechanism().is_none());
    }
}
