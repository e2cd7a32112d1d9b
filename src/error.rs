//! Routing core error types

use std::fmt;

use crate::protocol::ReasonCode;

/// Errors surfaced by the routing core to its transport collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Malformed topic name or topic filter
    InvalidTopic(&'static str),
    /// A configured capacity was reached; the operation was not applied
    ResourceExhausted(&'static str),
    /// ACL hook denied the operation
    NotAuthorized,
    /// Acknowledgement for a packet identifier with no matching entry
    UnknownPacketId(u16),
    /// Protocol violation, the connection must be closed
    ProtocolViolation(&'static str),
    /// The broker service is no longer running
    Shutdown,
}

impl BrokerError {
    /// Failure code reported in SUBACK for a refused filter
    pub fn suback_code(&self) -> ReasonCode {
        match self {
            BrokerError::InvalidTopic(_) => ReasonCode::TopicFilterInvalid,
            BrokerError::ResourceExhausted(_) => ReasonCode::QuotaExceeded,
            BrokerError::NotAuthorized => ReasonCode::NotAuthorized,
            _ => ReasonCode::UnspecifiedError,
        }
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTopic(msg) => write!(f, "invalid topic: {}", msg),
            Self::ResourceExhausted(msg) => write!(f, "resource exhausted: {}", msg),
            Self::NotAuthorized => write!(f, "not authorized"),
            Self::UnknownPacketId(id) => write!(f, "unknown packet identifier: {}", id),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::Shutdown => write!(f, "broker shut down"),
        }
    }
}

impl std::error::Error for BrokerError {}
