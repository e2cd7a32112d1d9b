//! Broker routing core
//!
//! [`Broker`] is the context object that ties the subscription trie, the
//! message store and the client sessions together. The transport layer
//! decodes packets and calls the `on_*` entry points; everything the broker
//! needs to send goes out through the [`Outbound`] collaborator. Access
//! control and event notification are delegated to [`Hooks`].
//!
//! The broker is single-owner (`&mut self`). [`service::BrokerService`] wraps
//! it in a tokio task for concurrent callers.

mod lifecycle;
pub mod outbound;
mod publish;
mod qos;
pub mod service;
mod subscribe;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;
use tracing::trace;

pub use outbound::{ChannelOutbound, Delivery, Outbound, OutboundPacket};
pub use service::{BrokerHandle, BrokerService};

use crate::config::Config;
use crate::hooks::{DefaultHooks, HookResult, Hooks};
use crate::metrics::Metrics;
use crate::protocol::{AckKind, QoS, ReasonCode, SubscriptionOptions};
use crate::session::{Session, SessionLimits, Transmit};
use crate::store::MessageStore;
use crate::topic::SubscriptionTrie;

/// Routing-relevant subset of the configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Highest QoS granted to subscriptions and accepted from publishers
    pub max_qos: QoS,
    pub retain_available: bool,
    pub wildcard_subscriptions: bool,
    /// Queue QoS 0 messages for disconnected persistent sessions
    pub queue_qos0_messages: bool,
    /// Re-send retained messages when an existing subscription is replaced
    /// with `SendAtSubscribe`
    pub resend_retained_on_resubscribe: bool,
    /// Maximum topic levels (0 = unlimited)
    pub max_topic_levels: usize,
    /// Maximum non-root trie nodes (0 = unlimited)
    pub max_trie_nodes: usize,
    pub retry_interval: Duration,
    pub max_inflight: usize,
    pub max_queued_messages: usize,
    pub max_awaiting_rel: usize,
    pub max_subscriptions: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for BrokerConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_qos: QoS::from_u8(config.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
            retain_available: config.mqtt.retain_available,
            wildcard_subscriptions: config.mqtt.wildcard_subscriptions,
            queue_qos0_messages: config.mqtt.queue_qos0_messages,
            resend_retained_on_resubscribe: config.mqtt.resend_retained_on_resubscribe,
            max_topic_levels: config.limits.max_topic_levels,
            max_trie_nodes: config.limits.max_trie_nodes,
            retry_interval: config.limits.retry_interval,
            max_inflight: config.limits.max_inflight,
            max_queued_messages: config.limits.max_queued_messages,
            max_awaiting_rel: config.limits.max_awaiting_rel,
            max_subscriptions: config.limits.max_subscriptions,
        }
    }
}

impl BrokerConfig {
    /// Limits applied to every new session
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_inflight: self.max_inflight,
            max_queued_messages: self.max_queued_messages,
            max_awaiting_rel: self.max_awaiting_rel,
            max_subscriptions: self.max_subscriptions,
        }
    }
}

/// A decoded PUBLISH from a client
#[derive(Debug, Clone)]
pub struct InboundPublish {
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
    pub retain: bool,
    pub dup: bool,
    /// Present for QoS 1 and 2
    pub packet_id: Option<u16>,
}

impl InboundPublish {
    pub fn new(topic: impl Into<String>, qos: QoS, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            qos,
            payload: payload.into(),
            retain: false,
            dup: false,
            packet_id: None,
        }
    }

    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = Some(packet_id);
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }
}

/// One topic filter of a SUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub filter: String,
    pub options: SubscriptionOptions,
}

impl SubscribeRequest {
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            options: SubscriptionOptions::with_qos(qos),
        }
    }

    pub fn with_options(filter: impl Into<String>, options: SubscriptionOptions) -> Self {
        Self {
            filter: filter.into(),
            options,
        }
    }
}

/// MQTT routing core
pub struct Broker {
    config: BrokerConfig,
    pub(crate) trie: SubscriptionTrie,
    pub(crate) store: MessageStore,
    pub(crate) sessions: AHashMap<Arc<str>, Session>,
    /// Payload bytes held by retained slots
    pub(crate) retained_bytes: usize,
    hooks: Arc<dyn Hooks>,
    outbound: Arc<dyn Outbound>,
    metrics: Option<Arc<Metrics>>,
}

impl Broker {
    /// Create a broker with hooks that allow everything
    pub fn new(config: BrokerConfig, outbound: Arc<dyn Outbound>) -> Self {
        Self::with_hooks(config, outbound, Arc::new(DefaultHooks))
    }

    /// Create a broker with custom hooks
    pub fn with_hooks(
        config: BrokerConfig,
        outbound: Arc<dyn Outbound>,
        hooks: Arc<dyn Hooks>,
    ) -> Self {
        Self {
            trie: SubscriptionTrie::with_node_limit(config.max_trie_nodes),
            store: MessageStore::new(),
            sessions: AHashMap::new(),
            retained_bytes: 0,
            config,
            hooks,
            outbound,
            metrics: None,
        }
    }

    /// Attach a metrics registry
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    // ---- introspection ----

    pub fn session(&self, client_id: &str) -> Option<&Session> {
        self.sessions.get(client_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn trie(&self) -> &SubscriptionTrie {
        &self.trie
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn retained_count(&self) -> usize {
        self.trie.retained_count()
    }

    // ---- hook passthroughs for the transport layer ----

    /// Authenticate a CONNECT
    pub async fn check_credentials(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        self.hooks
            .check_credentials(client_id, username, password)
            .await
    }

    /// Pre-shared key lookup for a TLS-PSK handshake
    pub async fn preshared_key(
        &self,
        identity: &str,
        hint: Option<&str>,
    ) -> HookResult<Option<Vec<u8>>> {
        self.hooks.get_preshared_key(identity, hint).await
    }

    // ---- shared helpers ----

    fn send_ack(&self, client_id: &str, kind: AckKind, packet_id: u16, reason: ReasonCode) {
        trace!(client_id = %client_id, packet_id, "sending {}", kind);
        self.outbound.send_ack(client_id, kind, packet_id, reason);
    }

    fn update_store_metrics(&self) {
        if let Some(m) = &self.metrics {
            m.update_stored(self.store.len());
        }
    }

    fn update_retained_metrics(&self) {
        if let Some(m) = &self.metrics {
            m.update_retained(self.trie.retained_count(), self.retained_bytes);
        }
    }

    /// Pump one session and hand the result to the outbound collaborator
    fn flush_session(&mut self, client_id: &str, now: Instant) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        let transmits = session.pump(now);
        dispatch(
            self.outbound.as_ref(),
            self.metrics.as_deref(),
            client_id,
            transmits,
            false,
        );
    }
}

/// Turn session transmits into outbound calls.
///
/// `resend` marks PUBREL transmits as retransmissions; PUBLISH transmits
/// carry their own DUP flag.
fn dispatch(
    outbound: &dyn Outbound,
    metrics: Option<&Metrics>,
    client_id: &str,
    transmits: Vec<Transmit>,
    resend: bool,
) {
    for transmit in transmits {
        match transmit {
            Transmit::Publish {
                packet_id,
                qos,
                retain,
                dup,
                message,
            } => {
                if let Some(m) = metrics {
                    m.publish_sent();
                    if dup {
                        m.retransmitted(qos);
                    } else if qos != QoS::AtMostOnce {
                        m.inflight_started(qos);
                    }
                }
                trace!(
                    client_id = %client_id,
                    topic = %message.topic(),
                    qos = %qos,
                    dup,
                    "delivering message"
                );
                outbound.deliver_to_client(
                    client_id,
                    Delivery {
                        topic: message.topic().clone(),
                        qos,
                        payload: message.payload().clone(),
                        retain,
                        dup,
                        packet_id,
                    },
                );
            }
            Transmit::PubRel { packet_id } => {
                if resend {
                    if let Some(m) = metrics {
                        m.retransmitted(QoS::ExactlyOnce);
                    }
                }
                outbound.send_ack(client_id, AckKind::PubRel, packet_id, ReasonCode::Success);
            }
        }
    }
}
