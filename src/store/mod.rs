//! Message store
//!
//! One [`StoredMessage`] is created per accepted publish and shared by every
//! delivery it produces. Ownership is expressed with [`MessageRef`], an `Arc`
//! handle: each queue entry and each retained slot holds one clone, and the
//! record is destroyed when the last clone is dropped. The store itself only
//! keeps weak index entries so it can look records up by id and count them;
//! a record removes its own index entry when it is destroyed.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::protocol::QoS;

/// Broker-assigned store identifier
pub type MessageId = u64;

/// Shared handle to a stored message
pub type MessageRef = Arc<StoredMessage>;

/// Weak id -> record index shared between the store and its records
#[derive(Default)]
struct StoreIndex {
    records: Mutex<AHashMap<MessageId, Weak<StoredMessage>>>,
    bytes: AtomicUsize,
}

/// Immutable published payload
pub struct StoredMessage {
    id: MessageId,
    /// Publishing client, `None` for broker-internal messages
    origin: Option<Arc<str>>,
    topic: Arc<str>,
    qos: QoS,
    payload: Bytes,
    retain: bool,
    stored_at: Instant,
    index: Weak<StoreIndex>,
}

impl StoredMessage {
    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn origin(&self) -> Option<&Arc<str>> {
        self.origin.as_ref()
    }

    pub fn topic(&self) -> &Arc<str> {
        &self.topic
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    pub fn stored_at(&self) -> Instant {
        self.stored_at
    }
}

impl fmt::Debug for StoredMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredMessage")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .field("payload_len", &self.payload.len())
            .field("retain", &self.retain)
            .finish()
    }
}

impl Drop for StoredMessage {
    fn drop(&mut self) {
        if let Some(index) = self.index.upgrade() {
            index.records.lock().remove(&self.id);
            index.bytes.fetch_sub(self.payload.len(), Ordering::Relaxed);
        }
    }
}

/// Reference-counted table of published payloads
pub struct MessageStore {
    next_id: AtomicU64,
    index: Arc<StoreIndex>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            index: Arc::new(StoreIndex::default()),
        }
    }

    /// Store a payload. The returned handle is the caller's own reference.
    pub fn store(
        &self,
        origin: Option<Arc<str>>,
        topic: Arc<str>,
        qos: QoS,
        payload: Bytes,
        retain: bool,
    ) -> MessageRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.insert(id, origin, topic, qos, payload, retain)
    }

    fn insert(
        &self,
        id: MessageId,
        origin: Option<Arc<str>>,
        topic: Arc<str>,
        qos: QoS,
        payload: Bytes,
        retain: bool,
    ) -> MessageRef {
        let len = payload.len();
        let message = Arc::new(StoredMessage {
            id,
            origin,
            topic,
            qos,
            payload,
            retain,
            stored_at: Instant::now(),
            index: Arc::downgrade(&self.index),
        });
        self.index
            .records
            .lock()
            .insert(id, Arc::downgrade(&message));
        self.index.bytes.fetch_add(len, Ordering::Relaxed);
        message
    }

    /// Look up a live record
    pub fn get(&self, id: MessageId) -> Option<MessageRef> {
        let weak = self.index.records.lock().get(&id).cloned()?;
        weak.upgrade()
    }

    /// Number of outstanding references to a record, excluding the lookup
    /// itself. `None` once the record has been destroyed.
    pub fn ref_count(&self, id: MessageId) -> Option<usize> {
        self.get(id).map(|message| Arc::strong_count(&message) - 1)
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.index.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total payload bytes held by live records
    pub fn bytes(&self) -> usize {
        self.index.bytes.load(Ordering::Relaxed)
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}
