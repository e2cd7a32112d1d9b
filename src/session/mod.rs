//! Client sessions and the QoS delivery state machine
//!
//! A session owns the client's outbound delivery queue (FIFO, broker to
//! client), its inbound QoS 2 entries (client to broker, keyed by the
//! client's packet identifier) and the index of its subscriptions back into
//! the trie. Sessions never talk to the network: operations that require a
//! packet to be sent return [`Transmit`] values for the broker to hand to its
//! outbound collaborator.
//!
//! Outbound QoS 1: `Queued -> WaitingForPubAck -> done`
//! Outbound QoS 2: `Queued -> WaitingForPubRec -> WaitingForPubComp -> done`
//! Inbound QoS 2:  `Received -> WaitingForPubRel -> done`

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};

use crate::protocol::{QoS, SubscriptionOptions};
use crate::store::MessageRef;
use crate::topic::NodeId;


/// Session connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session is connected
    Connected,
    /// Session is disconnected but persisted
    Disconnected,
}

/// Direction of a delivery entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Broker to client
    Outbound,
    /// Client to broker
    Inbound,
}

/// Delivery state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    /// Waiting for an inflight slot
    Queued,
    /// PUBLISH sent, waiting for PUBACK
    WaitingForPubAck,
    /// PUBLISH sent, waiting for PUBREC
    WaitingForPubRec,
    /// PUBREL sent, waiting for PUBCOMP
    WaitingForPubComp,
    /// Inbound QoS 2 PUBLISH accepted
    Received,
    /// PUBREC sent, waiting for PUBREL
    WaitingForPubRel,
}

/// One in-flight delivery to or from a client
#[derive(Debug, Clone)]
pub struct DeliveryEntry {
    pub direction: Direction,
    /// Assigned when the entry leaves `Queued` (outbound) or taken from the
    /// client's PUBLISH (inbound). Never zero.
    pub packet_id: Option<u16>,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub state: DeliveryState,
    pub message: MessageRef,
    /// Enqueue time, then last transmission time once in flight
    pub timestamp: Instant,
}

impl DeliveryEntry {
    fn outbound(message: MessageRef, qos: QoS, retain: bool, now: Instant) -> Self {
        Self {
            direction: Direction::Outbound,
            packet_id: None,
            qos,
            retain,
            dup: false,
            state: DeliveryState::Queued,
            message,
            timestamp: now,
        }
    }

    fn inbound(packet_id: u16, message: MessageRef, now: Instant) -> Self {
        Self {
            direction: Direction::Inbound,
            packet_id: Some(packet_id),
            qos: QoS::ExactlyOnce,
            retain: message.retain(),
            dup: false,
            state: DeliveryState::Received,
            message,
            timestamp: now,
        }
    }

    /// Packet to (re)send for this entry's current state
    fn transmit(&self) -> Option<Transmit> {
        match self.state {
            DeliveryState::Queued
            | DeliveryState::WaitingForPubAck
            | DeliveryState::WaitingForPubRec => Some(Transmit::Publish {
                packet_id: self.packet_id,
                qos: self.qos,
                retain: self.retain,
                dup: self.dup,
                message: self.message.clone(),
            }),
            DeliveryState::WaitingForPubComp => self
                .packet_id
                .map(|packet_id| Transmit::PubRel { packet_id }),
            DeliveryState::Received | DeliveryState::WaitingForPubRel => None,
        }
    }
}

/// A packet the broker must send on behalf of a session
#[derive(Debug, Clone)]
pub enum Transmit {
    Publish {
        packet_id: Option<u16>,
        qos: QoS,
        retain: bool,
        dup: bool,
        message: MessageRef,
    },
    PubRel {
        packet_id: u16,
    },
}

/// Outcome of an outbound acknowledgement
#[derive(Debug)]
pub enum AckOutcome {
    /// Handshake finished; the entry was removed
    Completed(DeliveryEntry),
    /// PUBREC accepted (or repeated); PUBREL must be sent
    Release(u16),
    /// No entry in a state expecting this acknowledgement
    Unknown,
}

/// Outcome of an inbound QoS 2 PUBLISH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// New entry stored in `Received`
    Stored,
    /// Packet id already awaiting PUBREL; nothing stored
    Duplicate,
    /// Too many entries awaiting PUBREL; nothing stored
    QuotaExceeded,
}

/// Per-session capacity limits (0 = unlimited)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_inflight: usize,
    pub max_queued_messages: usize,
    pub max_awaiting_rel: usize,
    pub max_subscriptions: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_inflight: 20,
            max_queued_messages: 1000,
            max_awaiting_rel: 100,
            max_subscriptions: 0,
        }
    }
}

/// Subscription entry in session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSubscription {
    /// Trie node holding this client's leaf
    pub node: NodeId,
    pub options: SubscriptionOptions,
}

/// Client session
#[derive(Debug)]
pub struct Session {
    /// Client identifier
    pub client_id: Arc<str>,
    pub username: Option<Arc<str>>,
    /// Session discarded on disconnect
    pub clean_session: bool,
    state: SessionState,
    limits: SessionLimits,
    /// Subscriptions by filter
    subscriptions: AHashMap<String, SessionSubscription>,
    outbound: VecDeque<DeliveryEntry>,
    inbound: AHashMap<u16, DeliveryEntry>,
    /// Outbound packet identifiers currently in flight
    packet_ids: AHashSet<u16>,
    next_packet_id: u16,
    inflight: usize,
    pub connected_at: Instant,
    pub disconnected_at: Option<Instant>,
}

impl Session {
    pub fn new(
        client_id: Arc<str>,
        username: Option<Arc<str>>,
        clean_session: bool,
        limits: SessionLimits,
    ) -> Self {
        Self {
            client_id,
            username,
            clean_session,
            state: SessionState::Connected,
            limits,
            subscriptions: AHashMap::new(),
            outbound: VecDeque::new(),
            inbound: AHashMap::new(),
            packet_ids: AHashSet::new(),
            next_packet_id: 1,
            inflight: 0,
            connected_at: Instant::now(),
            disconnected_at: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Get next available packet identifier, skipping 0 and ids in flight
    fn next_packet_id(&mut self) -> Option<u16> {
        if self.packet_ids.len() >= u16::MAX as usize {
            return None;
        }
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }

            if !self.packet_ids.contains(&id) {
                return Some(id);
            }
        }
    }

    // ---- subscriptions ----

    pub fn subscription(&self, filter: &str) -> Option<&SessionSubscription> {
        self.subscriptions.get(filter)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = (&str, &SessionSubscription)> {
        self.subscriptions.iter().map(|(f, s)| (f.as_str(), s))
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// True if one more distinct filter would exceed the subscription limit
    pub fn subscription_limit_reached(&self, filter: &str) -> bool {
        self.limits.max_subscriptions > 0
            && !self.subscriptions.contains_key(filter)
            && self.subscriptions.len() >= self.limits.max_subscriptions
    }

    pub fn add_subscription(&mut self, filter: String, node: NodeId, options: SubscriptionOptions) {
        self.subscriptions
            .insert(filter, SessionSubscription { node, options });
    }

    pub fn remove_subscription(&mut self, filter: &str) -> Option<SessionSubscription> {
        self.subscriptions.remove(filter)
    }

    /// Remove and return every subscription
    pub fn take_subscriptions(&mut self) -> Vec<(String, SessionSubscription)> {
        self.subscriptions.drain().collect()
    }

    // ---- outbound ----

    /// Append a delivery to the outbound queue.
    ///
    /// Returns false if the queue is full; the message is not queued.
    pub fn enqueue(&mut self, message: MessageRef, qos: QoS, retain: bool) -> bool {
        if self.limits.max_queued_messages > 0
            && self.outbound.len() >= self.limits.max_queued_messages
        {
            return false;
        }
        if self.outbound.try_reserve(1).is_err() {
            return false;
        }
        self.outbound
            .push_back(DeliveryEntry::outbound(message, qos, retain, Instant::now()));
        true
    }

    /// Send what the inflight window allows, front to back.
    ///
    /// QoS 0 entries are sent and removed. QoS 1/2 entries are promoted out
    /// of `Queued` while the window has room; the first entry that cannot be
    /// promoted stops the walk so per-client order is kept.
    pub fn pump(&mut self, now: Instant) -> Vec<Transmit> {
        let mut out = Vec::new();
        if !self.is_connected() {
            return out;
        }

        let mut i = 0;
        while i < self.outbound.len() {
            if self.outbound[i].state != DeliveryState::Queued {
                i += 1;
                continue;
            }

            if self.outbound[i].qos == QoS::AtMostOnce {
                if let Some(entry) = self.outbound.remove(i) {
                    out.extend(entry.transmit());
                }
                continue;
            }

            if self.limits.max_inflight > 0 && self.inflight >= self.limits.max_inflight {
                break;
            }
            let Some(packet_id) = self.next_packet_id() else {
                break;
            };

            let entry = &mut self.outbound[i];
            entry.packet_id = Some(packet_id);
            entry.state = match entry.qos {
                QoS::ExactlyOnce => DeliveryState::WaitingForPubRec,
                _ => DeliveryState::WaitingForPubAck,
            };
            entry.timestamp = now;
            out.extend(entry.transmit());

            self.packet_ids.insert(packet_id);
            self.inflight += 1;
            i += 1;
        }

        out
    }

    fn position(&self, packet_id: u16, state: DeliveryState) -> Option<usize> {
        self.outbound
            .iter()
            .position(|e| e.packet_id == Some(packet_id) && e.state == state)
    }

    fn complete(&mut self, index: usize) -> Option<DeliveryEntry> {
        let entry = self.outbound.remove(index)?;
        if let Some(packet_id) = entry.packet_id {
            self.packet_ids.remove(&packet_id);
        }
        self.inflight = self.inflight.saturating_sub(1);
        Some(entry)
    }

    /// PUBACK from the client
    pub fn on_puback(&mut self, packet_id: u16) -> AckOutcome {
        self.position(packet_id, DeliveryState::WaitingForPubAck)
            .and_then(|i| self.complete(i))
            .map_or(AckOutcome::Unknown, AckOutcome::Completed)
    }

    /// PUBREC from the client
    pub fn on_pubrec(&mut self, packet_id: u16, now: Instant) -> AckOutcome {
        if let Some(i) = self.position(packet_id, DeliveryState::WaitingForPubRec) {
            let entry = &mut self.outbound[i];
            entry.state = DeliveryState::WaitingForPubComp;
            entry.timestamp = now;
            return AckOutcome::Release(packet_id);
        }
        // Repeated PUBREC after our PUBREL was lost
        if self
            .position(packet_id, DeliveryState::WaitingForPubComp)
            .is_some()
        {
            return AckOutcome::Release(packet_id);
        }
        AckOutcome::Unknown
    }

    /// PUBCOMP from the client
    pub fn on_pubcomp(&mut self, packet_id: u16) -> AckOutcome {
        self.position(packet_id, DeliveryState::WaitingForPubComp)
            .and_then(|i| self.complete(i))
            .map_or(AckOutcome::Unknown, AckOutcome::Completed)
    }

    /// Re-send entries whose last transmission is older than `interval`
    pub fn retry(&mut self, now: Instant, interval: Duration) -> Vec<Transmit> {
        let mut out = Vec::new();
        if !self.is_connected() {
            return out;
        }

        for entry in self.outbound.iter_mut() {
            if entry.state == DeliveryState::Queued
                || now.saturating_duration_since(entry.timestamp) < interval
            {
                continue;
            }
            if entry.state != DeliveryState::WaitingForPubComp {
                entry.dup = true;
            }
            entry.timestamp = now;
            out.extend(entry.transmit());
        }

        out
    }

    // ---- inbound ----

    /// Accept an inbound QoS 2 PUBLISH
    pub fn receive_inbound(&mut self, packet_id: u16, message: MessageRef) -> InboundOutcome {
        if self.inbound.contains_key(&packet_id) {
            return InboundOutcome::Duplicate;
        }
        if self.limits.max_awaiting_rel > 0 && self.inbound.len() >= self.limits.max_awaiting_rel
        {
            return InboundOutcome::QuotaExceeded;
        }
        if self.inbound.try_reserve(1).is_err() {
            return InboundOutcome::QuotaExceeded;
        }
        self.inbound
            .insert(packet_id, DeliveryEntry::inbound(packet_id, message, Instant::now()));
        InboundOutcome::Stored
    }

    /// True if an inbound QoS 2 entry with this packet id awaits PUBREL
    pub fn awaiting_release(&self, packet_id: u16) -> bool {
        self.inbound.contains_key(&packet_id)
    }

    /// PUBREC has been sent for an inbound entry
    pub fn inbound_acknowledged(&mut self, packet_id: u16) {
        if let Some(entry) = self.inbound.get_mut(&packet_id) {
            if entry.state == DeliveryState::Received {
                entry.state = DeliveryState::WaitingForPubRel;
            }
        }
    }

    /// PUBREL from the client: release the stored inbound entry, if any
    pub fn on_pubrel(&mut self, packet_id: u16) -> Option<DeliveryEntry> {
        self.inbound.remove(&packet_id)
    }

    // ---- lifecycle ----

    /// Stop transmitting. QoS 0 entries still waiting are discarded unless
    /// `keep_qos0` is set.
    pub fn freeze(&mut self, keep_qos0: bool) {
        self.state = SessionState::Disconnected;
        self.disconnected_at = Some(Instant::now());
        if !keep_qos0 {
            self.outbound
                .retain(|e| !(e.qos == QoS::AtMostOnce && e.state == DeliveryState::Queued));
        }
    }

    /// Resume a frozen session: re-send everything in flight, then pump.
    pub fn resume(&mut self, now: Instant) -> Vec<Transmit> {
        self.state = SessionState::Connected;
        self.connected_at = now;
        self.disconnected_at = None;

        let mut out = Vec::new();
        for entry in self.outbound.iter_mut() {
            if entry.state == DeliveryState::Queued {
                continue;
            }
            if entry.state != DeliveryState::WaitingForPubComp {
                entry.dup = true;
            }
            entry.timestamp = now;
            out.extend(entry.transmit());
        }
        out.extend(self.pump(now));
        out
    }

    /// Drop all delivery state, returning the removed entries
    pub fn clear(&mut self) -> Vec<DeliveryEntry> {
        self.packet_ids.clear();
        self.inflight = 0;
        let mut dropped: Vec<DeliveryEntry> = self.outbound.drain(..).collect();
        dropped.extend(self.inbound.drain().map(|(_, e)| e));
        dropped
    }

    // ---- introspection ----

    pub fn outbound(&self) -> impl Iterator<Item = &DeliveryEntry> {
        self.outbound.iter()
    }

    pub fn inbound(&self) -> impl Iterator<Item = &DeliveryEntry> {
        self.inbound.values()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight
    }

    pub fn queued_count(&self) -> usize {
        self.outbound.len() - self.inflight
    }

    pub fn awaiting_rel_count(&self) -> usize {
        self.inbound.len()
    }

    /// Re-insert an outbound entry as exported (snapshot import)
    pub(crate) fn restore_outbound(&mut self, entry: DeliveryEntry) {
        if entry.state != DeliveryState::Queued {
            if let Some(packet_id) = entry.packet_id {
                self.packet_ids.insert(packet_id);
            }
            self.inflight += 1;
        }
        self.outbound.push_back(entry);
    }

    /// Re-insert an inbound entry as exported (snapshot import)
    pub(crate) fn restore_inbound(&mut self, entry: DeliveryEntry) {
        if let Some(packet_id) = entry.packet_id {
            self.inbound.insert(packet_id, entry);
        }
    }
}
