//! VibeMQ router - message routing and delivery-guarantee core
//!
//! The engine behind an MQTT v3.1.1/v5.0 broker: a wildcard subscription
//! trie with retained messages, a reference-counted message store, per-client
//! delivery queues and the QoS 0/1/2 state machines. Packet framing and
//! sockets belong to the transport layer, which feeds decoded packets into
//! [`Broker`] and receives outgoing packets through [`broker::Outbound`].

pub mod acl;
pub mod broker;
pub mod config;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod topic;

pub use acl::AclProvider;
pub use broker::{
    Broker, BrokerConfig, BrokerHandle, BrokerService, ChannelOutbound, Delivery, InboundPublish,
    Outbound, OutboundPacket, SubscribeRequest,
};
pub use config::Config;
pub use error::BrokerError;
pub use hooks::{AclAccess, CompositeHooks, DefaultHooks, Hooks};
pub use metrics::Metrics;
pub use protocol::{AckKind, QoS, ReasonCode, RetainHandling, SubscriptionOptions};
pub use snapshot::{Snapshot, SnapshotError};
pub use store::{MessageRef, MessageStore};
pub use topic::SubscriptionTrie;
