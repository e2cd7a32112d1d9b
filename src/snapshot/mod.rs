//! Bulk export and import of broker state
//!
//! A [`Snapshot`] holds the retained messages, every persistent session
//! (subscriptions plus queued, in-flight and awaiting-PUBREL entries) and the
//! message records they reference. Each record is written once, so deliveries
//! that shared a record before export share one after import.
//!
//! Clean sessions are not exported. Imported sessions start disconnected and
//! are resumed by the client's next non-clean CONNECT.

mod models;


use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use ahash::{AHashMap, AHashSet};
use bincode::{Decode, Encode};
use bytes::Bytes;
use tracing::{debug, info};

pub use models::{SnapshotEntry, SnapshotMessage, SnapshotSession, SnapshotSubscription};

use crate::broker::Broker;
use crate::protocol::{QoS, SubscriptionOptions};
use crate::session::{DeliveryEntry, DeliveryState, Direction, Session};
use crate::store::{MessageRef, StoredMessage};
use crate::topic::{split_levels, tokenize, validate_publish_topic, Leaf};

const SNAPSHOT_VERSION: u32 = 1;

/// Errors produced while encoding, decoding or importing a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    Encode(String),
    Decode(String),
    /// Decoded fine but the content is inconsistent
    Invalid(String),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "snapshot encode error: {}", e),
            Self::Decode(e) => write!(f, "snapshot decode error: {}", e),
            Self::Invalid(e) => write!(f, "invalid snapshot: {}", e),
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<bincode::error::EncodeError> for SnapshotError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for SnapshotError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Exported broker state
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Snapshot {
    pub version: u32,
    /// Every record referenced below, ordered by id
    pub messages: Vec<SnapshotMessage>,
    /// Ids of retained records; the topic is the record's own
    pub retained: Vec<u64>,
    /// Persistent sessions ordered by client id
    pub sessions: Vec<SnapshotSession>,
}

impl Snapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let (snapshot, _): (Snapshot, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard())?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Invalid(format!(
                "unsupported version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}

fn record_message(messages: &mut BTreeMap<u64, SnapshotMessage>, message: &StoredMessage) -> u64 {
    messages
        .entry(message.id())
        .or_insert_with(|| SnapshotMessage {
            id: message.id(),
            origin: message.origin().map(|o| o.to_string()),
            topic: message.topic().to_string(),
            qos: message.qos() as u8,
            payload: message.payload().to_vec(),
            retain: message.retain(),
        });
    message.id()
}

fn export_entry(
    messages: &mut BTreeMap<u64, SnapshotMessage>,
    entry: &DeliveryEntry,
) -> SnapshotEntry {
    SnapshotEntry {
        packet_id: entry.packet_id,
        qos: entry.qos as u8,
        retain: entry.retain,
        dup: entry.dup,
        state: models::state_to_u8(entry.state),
        message_id: record_message(messages, &entry.message),
    }
}

/// A session decoded and checked, ready to be installed
struct PendingSession {
    client_id: Arc<str>,
    username: Option<Arc<str>>,
    subscriptions: Vec<(String, SubscriptionOptions)>,
    outbound: Vec<DeliveryEntry>,
    inbound: Vec<DeliveryEntry>,
}

fn invalid(msg: impl Into<String>) -> SnapshotError {
    SnapshotError::Invalid(msg.into())
}

fn import_entry(
    entry: &SnapshotEntry,
    direction: Direction,
    records: &AHashMap<u64, MessageRef>,
    now: Instant,
) -> Result<DeliveryEntry, SnapshotError> {
    let qos = QoS::from_u8(entry.qos).ok_or_else(|| invalid("bad entry QoS"))?;
    let state = models::state_from_u8(entry.state).ok_or_else(|| invalid("bad entry state"))?;
    let message = records
        .get(&entry.message_id)
        .cloned()
        .ok_or_else(|| invalid(format!("unknown message id {}", entry.message_id)))?;

    let state_ok = match direction {
        Direction::Outbound => !matches!(
            state,
            DeliveryState::Received | DeliveryState::WaitingForPubRel
        ),
        Direction::Inbound => matches!(
            state,
            DeliveryState::Received | DeliveryState::WaitingForPubRel
        ),
    };
    if !state_ok {
        return Err(invalid("entry state does not fit its direction"));
    }
    let qos_ok = match state {
        DeliveryState::Queued => true,
        DeliveryState::WaitingForPubAck => qos == QoS::AtLeastOnce,
        DeliveryState::WaitingForPubRec
        | DeliveryState::WaitingForPubComp
        | DeliveryState::Received
        | DeliveryState::WaitingForPubRel => qos == QoS::ExactlyOnce,
    };
    if !qos_ok {
        return Err(invalid("entry QoS does not fit its state"));
    }
    match (state, entry.packet_id) {
        (DeliveryState::Queued, None) => {}
        (DeliveryState::Queued, Some(_)) => {
            return Err(invalid("queued entry with packet identifier"));
        }
        (_, Some(id)) if id != 0 => {}
        _ => return Err(invalid("in-flight entry without packet identifier")),
    }

    Ok(DeliveryEntry {
        direction,
        packet_id: entry.packet_id,
        qos,
        retain: entry.retain,
        dup: entry.dup,
        state,
        message,
        timestamp: now,
    })
}

/// Packet identifiers are unique per client and direction
fn check_unique_packet_ids(entries: &[DeliveryEntry]) -> Result<(), SnapshotError> {
    let mut seen = AHashSet::with_capacity(entries.len());
    for id in entries.iter().filter_map(|e| e.packet_id) {
        if !seen.insert(id) {
            return Err(invalid(format!("duplicate packet identifier {}", id)));
        }
    }
    Ok(())
}

impl Broker {
    /// Export retained messages and persistent sessions
    pub fn export_snapshot(&self) -> Snapshot {
        let mut messages = BTreeMap::new();

        let retained = self
            .trie
            .all_retained()
            .iter()
            .map(|m| record_message(&mut messages, m))
            .collect();

        let mut sessions: Vec<SnapshotSession> = self
            .sessions
            .values()
            .filter(|s| !s.clean_session)
            .map(|session| {
                let mut subscriptions: Vec<SnapshotSubscription> = session
                    .subscriptions()
                    .map(|(filter, sub)| SnapshotSubscription {
                        filter: filter.to_string(),
                        options: sub.options.to_byte(),
                    })
                    .collect();
                subscriptions.sort_by(|a, b| a.filter.cmp(&b.filter));

                let outbound = session
                    .outbound()
                    .map(|e| export_entry(&mut messages, e))
                    .collect();

                let mut inbound: Vec<&DeliveryEntry> = session.inbound().collect();
                inbound.sort_by_key(|e| e.packet_id);
                let inbound = inbound
                    .into_iter()
                    .map(|e| export_entry(&mut messages, e))
                    .collect();

                SnapshotSession {
                    client_id: session.client_id.to_string(),
                    username: session.username.as_ref().map(|u| u.to_string()),
                    subscriptions,
                    outbound,
                    inbound,
                }
            })
            .collect();
        sessions.sort_by(|a, b| a.client_id.cmp(&b.client_id));

        debug!(
            messages = messages.len(),
            sessions = sessions.len(),
            "snapshot exported"
        );

        Snapshot {
            version: SNAPSHOT_VERSION,
            messages: messages.into_values().collect(),
            retained,
            sessions,
        }
    }

    /// Install the contents of a snapshot.
    ///
    /// The snapshot is checked completely before anything is applied.
    /// Retained messages replace those on the same topic; imported sessions
    /// replace live sessions with the same client id. A trie capacity error
    /// while installing stops the import, leaving what was already installed.
    pub fn import_snapshot(&mut self, snapshot: Snapshot) -> Result<(), SnapshotError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(invalid(format!("unsupported version {}", snapshot.version)));
        }
        let now = Instant::now();

        let mut records: AHashMap<u64, MessageRef> =
            AHashMap::with_capacity(snapshot.messages.len());
        for m in snapshot.messages {
            let qos = QoS::from_u8(m.qos).ok_or_else(|| invalid("bad message QoS"))?;
            validate_publish_topic(&m.topic).map_err(|e| invalid(e.to_string()))?;
            let record = self.store.store(
                m.origin.map(Arc::from),
                Arc::from(m.topic),
                qos,
                Bytes::from(m.payload),
                m.retain,
            );
            records.insert(m.id, record);
        }

        let retained = snapshot
            .retained
            .iter()
            .map(|id| {
                records
                    .get(id)
                    .cloned()
                    .ok_or_else(|| invalid(format!("unknown retained message id {}", id)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut pending = Vec::with_capacity(snapshot.sessions.len());
        for s in &snapshot.sessions {
            let subscriptions = s
                .subscriptions
                .iter()
                .map(|sub| {
                    tokenize(&sub.filter).map_err(|e| invalid(e.to_string()))?;
                    let options = SubscriptionOptions::from_byte(sub.options)
                        .ok_or_else(|| invalid("bad subscription options"))?;
                    Ok((sub.filter.clone(), options))
                })
                .collect::<Result<Vec<_>, SnapshotError>>()?;
            let outbound = s
                .outbound
                .iter()
                .map(|e| import_entry(e, Direction::Outbound, &records, now))
                .collect::<Result<Vec<_>, _>>()?;
            let inbound = s
                .inbound
                .iter()
                .map(|e| import_entry(e, Direction::Inbound, &records, now))
                .collect::<Result<Vec<_>, _>>()?;
            check_unique_packet_ids(&outbound)?;
            check_unique_packet_ids(&inbound)?;

            pending.push(PendingSession {
                client_id: Arc::from(s.client_id.as_str()),
                username: s.username.as_deref().map(Arc::from),
                subscriptions,
                outbound,
                inbound,
            });
        }
        drop(records);

        for message in retained {
            let levels = split_levels(message.topic());
            let previous = self
                .trie
                .set_retained(&levels, Some(message.clone()))
                .map_err(|e| invalid(e.to_string()))?;
            let removed = previous.map_or(0, |p| p.payload().len());
            self.retained_bytes =
                (self.retained_bytes + message.payload().len()).saturating_sub(removed);
        }

        let session_count = pending.len();
        for p in pending {
            self.discard_session(&p.client_id);

            let mut session = Session::new(
                p.client_id.clone(),
                p.username,
                false,
                self.config().session_limits(),
            );
            session.freeze(true);

            for (filter, options) in p.subscriptions {
                let levels = tokenize(&filter).map_err(|e| invalid(e.to_string()))?;
                let node = match self
                    .trie
                    .subscribe(&levels, Leaf::new(p.client_id.clone(), options))
                {
                    Ok((node, _)) => node,
                    Err(e) => {
                        for (_, sub) in session.take_subscriptions() {
                            self.trie.remove_leaf(sub.node, &p.client_id);
                        }
                        return Err(invalid(e.to_string()));
                    }
                };
                session.add_subscription(filter.clone(), node, options);
                if let Some(m) = self.metrics() {
                    m.subscription_added();
                }
            }
            for entry in p.outbound {
                if entry.state != DeliveryState::Queued {
                    if let Some(m) = self.metrics() {
                        m.inflight_started(entry.qos);
                    }
                }
                session.restore_outbound(entry);
            }
            for entry in p.inbound {
                session.restore_inbound(entry);
            }

            self.sessions.insert(p.client_id, session);
        }

        if let Some(m) = self.metrics() {
            m.update_retained(self.trie.retained_count(), self.retained_bytes);
            m.update_stored(self.store.len());
        }
        info!(
            retained = self.trie.retained_count(),
            sessions = session_count,
            "snapshot imported"
        );
        Ok(())
    }
}
