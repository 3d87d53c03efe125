//! Error types for amqpwire.

use thiserror::Error;

use crate::protocol::{conditions, ErrorCondition};

/// Main error type for all amqpwire operations.
#[derive(Debug, Error)]
pub enum AmqpError {
    /// I/O error on the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport could not be established or failed mid-stream.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Bytes on the wire do not form a valid AMQP encoding.
    #[error("Malformed encoding: {0}")]
    MalformedEncoding(String),

    /// A frame declared a size larger than the negotiated maximum.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameSizeExceeded { size: u32, max: u32 },

    /// A peer-supplied sequence number fell outside the expected window.
    #[error("Invalid sequence number comparison: {0}")]
    InvalidSequenceNumberComparison(String),

    /// SASL exchange ended without success.
    #[error("SASL negotiation failed: {0}")]
    SaslNegotiationFailed(String),

    /// Sender has no link credit (non-blocking send only).
    #[error("Insufficient link credit")]
    InsufficientCredit,

    /// Caller-supplied deadline elapsed.
    #[error("Operation timed out")]
    Timeout,

    /// Frame arrived for a channel with no mapped session.
    #[error("Channel {0} not found")]
    ChannelNotFound(u16),

    /// Frame referenced a handle with no attached link.
    #[error("Handle {0} not found")]
    HandleNotFound(u32),

    /// Nothing was received from the peer within the idle deadline.
    #[error("Idle timeout expired")]
    IdleTimeout,

    /// Connection is closed; carries the peer's or local error, if any.
    #[error("Connection closed{}", describe(.0))]
    ConnectionClosed(Option<ErrorCondition>),

    /// Session has ended.
    #[error("Session ended{}", describe(.0))]
    SessionEnded(Option<ErrorCondition>),

    /// Link has been detached.
    #[error("Link detached{}", describe(.0))]
    LinkDetached(Option<ErrorCondition>),

    /// Operation not valid in the entity's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Address string could not be parsed or has no transport.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// TLS setup or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Configuration could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Peer violated the protocol in a way not covered above.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A configured limit (channels, handles, message size) was reached.
    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),
}

fn describe(condition: &Option<ErrorCondition>) -> String {
    match condition {
        Some(c) => format!(": {}", c),
        None => String::new(),
    }
}

impl AmqpError {
    /// The standard error condition a peer should see when this error
    /// tears down a connection, session or link.
    pub fn to_condition(&self) -> ErrorCondition {
        let (symbol, description) = match self {
            AmqpError::MalformedEncoding(msg) => (conditions::DECODE_ERROR, msg.clone()),
            AmqpError::FrameSizeExceeded { .. } => (conditions::FRAMING_ERROR, self.to_string()),
            AmqpError::InvalidSequenceNumberComparison(msg) => {
                (conditions::INVALID_FIELD, msg.clone())
            }
            AmqpError::ChannelNotFound(_) => (conditions::NOT_FOUND, self.to_string()),
            AmqpError::HandleNotFound(_) => (conditions::UNATTACHED_HANDLE, self.to_string()),
            AmqpError::IdleTimeout => (conditions::RESOURCE_LIMIT_EXCEEDED, self.to_string()),
            AmqpError::ResourceLimitExceeded(msg) => {
                (conditions::RESOURCE_LIMIT_EXCEEDED, msg.clone())
            }
            AmqpError::Protocol(msg) => (conditions::NOT_ALLOWED, msg.clone()),
            AmqpError::InvalidState(msg) => (conditions::ILLEGAL_STATE, msg.clone()),
            AmqpError::ConnectionClosed(Some(c))
            | AmqpError::SessionEnded(Some(c))
            | AmqpError::LinkDetached(Some(c)) => return c.clone(),
            other => (conditions::INTERNAL_ERROR, other.to_string()),
        };
        ErrorCondition::new(symbol).with_description(description)
    }

    /// True if the error ends the whole connection.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            AmqpError::Io(_)
                | AmqpError::Transport(_)
                | AmqpError::MalformedEncoding(_)
                | AmqpError::FrameSizeExceeded { .. }
                | AmqpError::InvalidSequenceNumberComparison(_)
                | AmqpError::SaslNegotiationFailed(_)
                | AmqpError::ChannelNotFound(_)
                | AmqpError::IdleTimeout
                | AmqpError::ConnectionClosed(_)
                | AmqpError::Protocol(_)
        )
    }
}

/// Result type alias using AmqpError.
pub type Result<T> = std::result::Result<T, AmqpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_maps_to_framing_error() {
        let err = AmqpError::FrameSizeExceeded {
            size: 1024,
            max: 512,
        };
        let cond = err.to_condition();
        assert_eq!(cond.condition.as_str(), "amqp:connection:framing-error");
        assert!(cond.description.unwrap().contains("1024"));
        assert!(err.is_connection_fatal());
    }

    #[test]
    fn test_closed_display_includes_condition() {
        let err = AmqpError::ConnectionClosed(Some(
            ErrorCondition::new(conditions::NOT_ALLOWED).with_description("nope"),
        ));
        let text = err.to_string();
        assert!(text.starts_with("Connection closed: amqp:not-allowed"));
        assert!(text.contains("nope"));

        assert_eq!(AmqpError::LinkDetached(None).to_string(), "Link detached");
    }

    #[test]
    fn test_local_errors_are_recoverable() {
        assert!(!AmqpError::InsufficientCredit.is_connection_fatal());
        assert!(!AmqpError::Timeout.is_connection_fatal());
        assert!(!AmqpError::LinkDetached(None).is_connection_fatal());
    }

    #[test]
    fn test_remote_condition_passes_through() {
        let remote = ErrorCondition::new(conditions::UNAUTHORIZED_ACCESS);
        let err = AmqpError::SessionEnded(Some(remote.clone()));
        assert_eq!(err.to_condition(), remote);
    }
}
