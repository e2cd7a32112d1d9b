//! Serializable snapshot records
//!
//! Plain-data mirrors of the runtime types, encoded with bincode. Enums are
//! stored as their wire bytes.

use bincode::{Decode, Encode};

use crate::session::DeliveryState;

/// One message store record
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SnapshotMessage {
    /// Store id at export time; only meaningful inside one snapshot
    pub id: u64,
    pub origin: Option<String>,
    pub topic: String,
    pub qos: u8,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// A persistent session and everything it still owes or is owed
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SnapshotSession {
    pub client_id: String,
    pub username: Option<String>,
    pub subscriptions: Vec<SnapshotSubscription>,
    /// Outbound queue, front first
    pub outbound: Vec<SnapshotEntry>,
    /// Inbound QoS 2 entries awaiting PUBREL
    pub inbound: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SnapshotSubscription {
    pub filter: String,
    /// Subscription options byte as sent in SUBSCRIBE
    pub options: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SnapshotEntry {
    pub packet_id: Option<u16>,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    pub state: u8,
    /// [`SnapshotMessage::id`] of the referenced record
    pub message_id: u64,
}

pub(super) fn state_to_u8(state: DeliveryState) -> u8 {
    match state {
        DeliveryState::Queued => 0,
        DeliveryState::WaitingForPubAck => 1,
        DeliveryState::WaitingForPubRec => 2,
        DeliveryState::WaitingForPubComp => 3,
        DeliveryState::Received => 4,
        DeliveryState::WaitingForPubRel => 5,
    }
}

pub(super) fn state_from_u8(v: u8) -> Option<DeliveryState> {
    match v {
        0 => Some(DeliveryState::Queued),
        1 => Some(DeliveryState::WaitingForPubAck),
        2 => Some(DeliveryState::WaitingForPubRec),
        3 => Some(DeliveryState::WaitingForPubComp),
        4 => Some(DeliveryState::Received),
        5 => Some(DeliveryState::WaitingForPubRel),
        _ => None,
    }
}
