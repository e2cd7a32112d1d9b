//! Reason codes carried in acknowledgements produced by the core
//!
//! Values follow the MQTT v5.0 table. v3.1.1 collaborators only need the
//! SUBACK projection provided by [`ReasonCode::to_v3_suback_code`].

use std::fmt;

use super::QoS;

/// MQTT v5.0 Reason Code (subset produced by the routing core)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[derive(Default)]
pub enum ReasonCode {
    /// Success / Granted QoS 0
    #[default]
    Success = 0x00,
    /// Granted QoS 1
    GrantedQoS1 = 0x01,
    /// Granted QoS 2
    GrantedQoS2 = 0x02,
    /// No matching subscribers
    NoMatchingSubscribers = 0x10,
    /// No subscription existed
    NoSubscriptionExisted = 0x11,
    /// Unspecified error
    UnspecifiedError = 0x80,
    /// Implementation specific error
    ImplementationError = 0x83,
    /// Not authorized
    NotAuthorized = 0x87,
    /// Topic Filter invalid
    TopicFilterInvalid = 0x8F,
    /// Topic Name invalid
    TopicNameInvalid = 0x90,
    /// Packet Identifier not found
    PacketIdNotFound = 0x92,
    /// Quota exceeded
    QuotaExceeded = 0x97,
    /// Wildcard Subscriptions not supported
    WildcardSubsNotSupported = 0xA2,
}

impl ReasonCode {
    /// Create a ReasonCode from a byte value
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(ReasonCode::Success),
            0x01 => Some(ReasonCode::GrantedQoS1),
            0x02 => Some(ReasonCode::GrantedQoS2),
            0x10 => Some(ReasonCode::NoMatchingSubscribers),
            0x11 => Some(ReasonCode::NoSubscriptionExisted),
            0x80 => Some(ReasonCode::UnspecifiedError),
            0x83 => Some(ReasonCode::ImplementationError),
            0x87 => Some(ReasonCode::NotAuthorized),
            0x8F => Some(ReasonCode::TopicFilterInvalid),
            0x90 => Some(ReasonCode::TopicNameInvalid),
            0x92 => Some(ReasonCode::PacketIdNotFound),
            0x97 => Some(ReasonCode::QuotaExceeded),
            0xA2 => Some(ReasonCode::WildcardSubsNotSupported),
            _ => None,
        }
    }

    /// Reason code granting the given QoS in a SUBACK
    pub fn granted(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => ReasonCode::Success,
            QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
            QoS::ExactlyOnce => ReasonCode::GrantedQoS2,
        }
    }

    /// Check if this reason code indicates success
    #[inline]
    pub fn is_success(self) -> bool {
        (self as u8) < 0x80
    }

    /// Check if this reason code indicates failure
    #[inline]
    pub fn is_error(self) -> bool {
        (self as u8) >= 0x80
    }

    /// MQTT v3.1.1 SUBACK return code: granted QoS or 0x80 for any failure
    pub fn to_v3_suback_code(self) -> u8 {
        match self {
            ReasonCode::Success | ReasonCode::GrantedQoS1 | ReasonCode::GrantedQoS2 => self as u8,
            _ => 0x80,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasonCode::Success => write!(f, "Success"),
            ReasonCode::GrantedQoS1 => write!(f, "Granted QoS 1"),
            ReasonCode::GrantedQoS2 => write!(f, "Granted QoS 2"),
            ReasonCode::NoMatchingSubscribers => write!(f, "No matching subscribers"),
            ReasonCode::NoSubscriptionExisted => write!(f, "No subscription existed"),
            ReasonCode::UnspecifiedError => write!(f, "Unspecified error"),
            ReasonCode::ImplementationError => write!(f, "Implementation specific error"),
            ReasonCode::NotAuthorized => write!(f, "Not authorized"),
            ReasonCode::TopicFilterInvalid => write!(f, "Topic Filter invalid"),
            ReasonCode::TopicNameInvalid => write!(f, "Topic Name invalid"),
            ReasonCode::PacketIdNotFound => write!(f, "Packet Identifier not found"),
            ReasonCode::QuotaExceeded => write!(f, "Quota exceeded"),
            ReasonCode::WildcardSubsNotSupported => {
                write!(f, "Wildcard Subscriptions not supported")
            }
        }
    }
}
