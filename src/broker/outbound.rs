//! Outbound collaborator
//!
//! The broker never encodes packets. Deliveries and acknowledgements are
//! handed to an [`Outbound`] implementation owned by the transport layer.
//! [`ChannelOutbound`] forwards them to per-client tokio channels, which is
//! what a connection writer task (or a test) reads from.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::protocol::{AckKind, QoS, ReasonCode};

/// A PUBLISH to send to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: Arc<str>,
    pub qos: QoS,
    pub payload: Bytes,
    pub retain: bool,
    pub dup: bool,
    /// Present for QoS 1 and 2
    pub packet_id: Option<u16>,
}

/// Packet-level sink for everything the broker sends
pub trait Outbound: Send + Sync {
    fn deliver_to_client(&self, client_id: &str, delivery: Delivery);

    fn send_ack(&self, client_id: &str, kind: AckKind, packet_id: u16, reason: ReasonCode);

    fn send_suback(&self, client_id: &str, packet_id: u16, codes: Vec<ReasonCode>);

    fn send_unsuback(&self, client_id: &str, packet_id: u16, codes: Vec<ReasonCode>);
}

/// Packet forwarded by [`ChannelOutbound`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPacket {
    Publish(Delivery),
    Ack {
        kind: AckKind,
        packet_id: u16,
        reason: ReasonCode,
    },
    SubAck {
        packet_id: u16,
        codes: Vec<ReasonCode>,
    },
    UnsubAck {
        packet_id: u16,
        codes: Vec<ReasonCode>,
    },
}

/// [`Outbound`] backed by one bounded channel per connected client
///
/// Packets for clients without a registered channel are dropped. A full
/// channel drops the packet as well; QoS 1/2 deliveries are recovered by the
/// retry sweep.
pub struct ChannelOutbound {
    clients: DashMap<Arc<str>, mpsc::Sender<OutboundPacket>>,
    capacity: usize,
}

impl ChannelOutbound {
    pub fn new(capacity: usize) -> Self {
        Self {
            clients: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Open a channel for a client, replacing any previous one
    pub fn register(&self, client_id: &str) -> mpsc::Receiver<OutboundPacket> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.clients.insert(Arc::from(client_id), tx);
        rx
    }

    pub fn unregister(&self, client_id: &str) {
        self.clients.remove(client_id);
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    fn send(&self, client_id: &str, packet: OutboundPacket) {
        let Some(tx) = self.clients.get(client_id) else {
            trace!(client_id = %client_id, "no outbound channel, dropping packet");
            return;
        };
        match tx.try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client_id = %client_id, "outbound channel full, dropping packet");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(client_id = %client_id, "outbound channel closed");
            }
        }
    }
}

impl Default for ChannelOutbound {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Outbound for ChannelOutbound {
    fn deliver_to_client(&self, client_id: &str, delivery: Delivery) {
        self.send(client_id, OutboundPacket::Publish(delivery));
    }

    fn send_ack(&self, client_id: &str, kind: AckKind, packet_id: u16, reason: ReasonCode) {
        self.send(
            client_id,
            OutboundPacket::Ack {
                kind,
                packet_id,
                reason,
            },
        );
    }

    fn send_suback(&self, client_id: &str, packet_id: u16, codes: Vec<ReasonCode>) {
        self.send(client_id, OutboundPacket::SubAck { packet_id, codes });
    }

    fn send_unsuback(&self, client_id: &str, packet_id: u16, codes: Vec<ReasonCode>) {
        self.send(client_id, OutboundPacket::UnsubAck { packet_id, codes });
    }
}

impl<T: Outbound + ?Sized> Outbound for Arc<T> {
    fn deliver_to_client(&self, client_id: &str, delivery: Delivery) {
        (**self).deliver_to_client(client_id, delivery)
    }

    fn send_ack(&self, client_id: &str, kind: AckKind, packet_id: u16, reason: ReasonCode) {
        (**self).send_ack(client_id, kind, packet_id, reason)
    }

    fn send_suback(&self, client_id: &str, packet_id: u16, codes: Vec<ReasonCode>) {
        (**self).send_suback(client_id, packet_id, codes)
    }

    fn send_unsuback(&self, client_id: &str, packet_id: u16, codes: Vec<ReasonCode>) {
        (**self).send_unsuback(client_id, packet_id, codes)
    }
}
