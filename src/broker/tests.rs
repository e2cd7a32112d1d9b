//! Broker routing tests

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use super::*;
use crate::acl::AclProvider;
use crate::config::{AclConfig, AclRole, AclUser};
use crate::error::BrokerError;
use crate::hooks::Hooks;
use crate::protocol::RetainHandling;

fn broker_with(config: BrokerConfig) -> (Broker, Arc<ChannelOutbound>) {
    let outbound = Arc::new(ChannelOutbound::new(256));
    let broker = Broker::new(config, outbound.clone());
    (broker, outbound)
}

async fn connect(
    broker: &mut Broker,
    outbound: &ChannelOutbound,
    client_id: &str,
    clean_session: bool,
) -> mpsc::Receiver<OutboundPacket> {
    let rx = outbound.register(client_id);
    broker
        .on_client_connected(client_id, None, clean_session)
        .await;
    rx
}

fn drain(rx: &mut mpsc::Receiver<OutboundPacket>) -> Vec<OutboundPacket> {
    let mut packets = Vec::new();
    while let Ok(packet) = rx.try_recv() {
        packets.push(packet);
    }
    packets
}

fn deliveries(rx: &mut mpsc::Receiver<OutboundPacket>) -> Vec<Delivery> {
    drain(rx)
        .into_iter()
        .filter_map(|p| match p {
            OutboundPacket::Publish(d) => Some(d),
            _ => None,
        })
        .collect()
}

fn ack(kind: AckKind, packet_id: u16, reason: ReasonCode) -> OutboundPacket {
    OutboundPacket::Ack {
        kind,
        packet_id,
        reason,
    }
}

async fn subscribe(broker: &mut Broker, client_id: &str, filter: &str, qos: QoS) -> ReasonCode {
    broker
        .on_subscribe_received(client_id, 1, vec![SubscribeRequest::new(filter, qos)])
        .await[0]
}

#[tokio::test]
async fn test_qos1_publish_reaches_wildcard_subscriber() {
    let (mut broker, outbound) = broker_with(BrokerConfig::default());
    let mut a = connect(&mut broker, &outbound, "a", true).await;
    let mut b = connect(&mut broker, &outbound, "b", true).await;

    assert_eq!(
        subscribe(&mut broker, "a", "sensors/+/temp", QoS::AtLeastOnce).await,
        ReasonCode::GrantedQoS1
    );
    drain(&mut a);

    broker
        .on_publish_received(
            "b",
            InboundPublish::new("sensors/kitchen/temp", QoS::AtLeastOnce, "21.5")
                .with_packet_id(10),
        )
        .await
        .unwrap();

    assert_eq!(
        drain(&mut b),
        vec![ack(AckKind::PubAck, 10, ReasonCode::Success)]
    );
    let got = deliveries(&mut a);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload, Bytes::from_static(b"21.5"));
    assert_eq!(got[0].qos, QoS::AtLeastOnce);
    assert_eq!(got[0].packet_id, Some(1));
    assert!(!got[0].retain);

    // Only the queue entry keeps the record alive
    assert_eq!(broker.store().len(), 1);
    broker.on_ack_received("a", 1, AckKind::PubAck).await;
    assert!(broker.store().is_empty());
    assert_eq!(broker.session("a").unwrap().outbound_len(), 0);
}

#[tokio::test]
async fn test_qos2_inbound_routed_once_at_pubrel() {
    let (mut broker, outbound) = broker_with(BrokerConfig::default());
    let mut a = connect(&mut broker, &outbound, "a", true).await;
    let mut b = connect(&mut broker, &outbound, "b", true).await;
    subscribe(&mut broker, "a", "t", QoS::ExactlyOnce).await;
    drain(&mut a);

    let publish = InboundPublish::new("t", QoS::ExactlyOnce, "once").with_packet_id(5);
    broker.on_publish_received("b", publish.clone()).await.unwrap();
    assert_eq!(drain(&mut b), vec![ack(AckKind::PubRec, 5, ReasonCode::Success)]);
    assert!(deliveries(&mut a).is_empty());

    // Retransmission before PUBREL is answered again and not routed
    broker
        .on_publish_received("b", publish.with_dup(true))
        .await
        .unwrap();
    assert_eq!(drain(&mut b), vec![ack(AckKind::PubRec, 5, ReasonCode::Success)]);
    assert_eq!(broker.session("b").unwrap().awaiting_rel_count(), 1);

    broker.on_ack_received("b", 5, AckKind::PubRel).await;
    assert_eq!(drain(&mut b), vec![ack(AckKind::PubComp, 5, ReasonCode::Success)]);
    assert_eq!(deliveries(&mut a).len(), 1);

    // Repeated PUBREL still completes the client's flow
    broker.on_ack_received("b", 5, AckKind::PubRel).await;
    assert_eq!(
        drain(&mut b),
        vec![ack(AckKind::PubComp, 5, ReasonCode::PacketIdNotFound)]
    );
    assert!(deliveries(&mut a).is_empty());
}

#[tokio::test]
async fn test_qos2_outbound_handshake_releases_record() {
    let (mut broker, outbound) = broker_with(BrokerConfig::default());
    let mut a = connect(&mut broker, &outbound, "a", true).await;
    subscribe(&mut broker, "a", "t", QoS::ExactlyOnce).await;
    drain(&mut a);

    broker
        .publish("t", Bytes::from_static(b"x"), QoS::ExactlyOnce, false)
        .await
        .unwrap();
    let got = deliveries(&mut a);
    assert_eq!(got[0].packet_id, Some(1));
    assert_eq!(got[0].qos, QoS::ExactlyOnce);

    broker.on_ack_received("a", 1, AckKind::PubRec).await;
    assert_eq!(drain(&mut a), vec![ack(AckKind::PubRel, 1, ReasonCode::Success)]);
    assert_eq!(broker.store().len(), 1);

    broker.on_ack_received("a", 1, AckKind::PubComp).await;
    assert!(broker.store().is_empty());

    // Late PUBCOMP is ignored
    broker.on_ack_received("a", 1, AckKind::PubComp).await;
    assert!(drain(&mut a).is_empty());
}

#[tokio::test]
async fn test_overlapping_filters_deliver_once_at_highest_qos() {
    let (mut broker, outbound) = broker_with(BrokerConfig::default());
    let mut a = connect(&mut broker, &outbound, "a", true).await;
    let codes = broker
        .on_subscribe_received(
            "a",
            3,
            vec![
                SubscribeRequest::new("a/+", QoS::AtMostOnce),
                SubscribeRequest::new("a/#", QoS::ExactlyOnce),
            ],
        )
        .await;
    assert_eq!(codes, vec![ReasonCode::Success, ReasonCode::GrantedQoS2]);
    assert_eq!(
        drain(&mut a),
        vec![OutboundPacket::SubAck {
            packet_id: 3,
            codes: codes.clone(),
        }]
    );

    broker
        .publish("a/b", Bytes::from_static(b"x"), QoS::ExactlyOnce, false)
        .await
        .unwrap();
    let got = deliveries(&mut a);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].qos, QoS::ExactlyOnce);
}

#[tokio::test]
async fn test_resubscribe_replaces_granted_qos() {
    let (mut broker, outbound) = broker_with(BrokerConfig::default());
    let mut a = connect(&mut broker, &outbound, "a", true).await;
    subscribe(&mut broker, "a", "t", QoS::AtMostOnce).await;
    subscribe(&mut broker, "a", "t", QoS::AtLeastOnce).await;
    assert_eq!(broker.trie().leaf_count(), 1);
    drain(&mut a);

    broker
        .publish("t", Bytes::from_static(b"x"), QoS::AtLeastOnce, false)
        .await
        .unwrap();
    let got = deliveries(&mut a);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn test_retained_set_delivered_then_cleared() {
    let (mut broker, outbound) = broker_with(BrokerConfig::default());
    let mut p = connect(&mut broker, &outbound, "p", true).await;
    broker
        .on_publish_received(
            "p",
            InboundPublish::new("x/y", QoS::AtMostOnce, "on").with_retain(true),
        )
        .await
        .unwrap();
    assert!(drain(&mut p).is_empty());
    assert_eq!(broker.retained_count(), 1);

    let mut c = connect(&mut broker, &outbound, "c", true).await;
    subscribe(&mut broker, "c", "x/+", QoS::AtLeastOnce).await;
    let packets = drain(&mut c);
    assert!(matches!(packets[0], OutboundPacket::SubAck { .. }));
    assert_eq!(packets.len(), 2);
    match &packets[1] {
        OutboundPacket::Publish(d) => {
            assert_eq!(d.payload, Bytes::from_static(b"on"));
            assert!(d.retain);
            // Record QoS 0 caps the delivery
            assert_eq!(d.qos, QoS::AtMostOnce);
        }
        other => panic!("expected retained publish, got {:?}", other),
    }

    broker
        .publish("x/y", Bytes::new(), QoS::AtMostOnce, true)
        .await
        .unwrap();
    assert_eq!(broker.retained_count(), 0);

    let mut d = connect(&mut broker, &outbound, "d", true).await;
    subscribe(&mut broker, "d", "x/+", QoS::AtLeastOnce).await;
    assert!(deliveries(&mut d).is_empty());
}

#[tokio::test]
async fn test_retained_lookup_follows_filter_depth() {
    let (mut broker, outbound) = broker_with(BrokerConfig::default());
    broker
        .publish("a/x/y/c", Bytes::from_static(b"deep"), QoS::AtMostOnce, true)
        .await
        .unwrap();
    broker
        .publish("a/x/c", Bytes::from_static(b"flat"), QoS::AtMostOnce, true)
        .await
        .unwrap();

    let mut c = connect(&mut broker, &outbound, "c", true).await;
    subscribe(&mut broker, "c", "a/+/c", QoS::AtMostOnce).await;
    let got = deliveries(&mut c);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload, Bytes::from_static(b"flat"));
}

#[tokio::test]
async fn test_retain_handling_options() {
    let config = BrokerConfig {
        resend_retained_on_resubscribe: false,
        ..BrokerConfig::default()
    };
    let (mut broker, outbound) = broker_with(config);
    broker
        .publish("r", Bytes::from_static(b"v"), QoS::AtMostOnce, true)
        .await
        .unwrap();
    let mut c = connect(&mut broker, &outbound, "c", true).await;

    let request = |handling| {
        vec![SubscribeRequest::with_options(
            "r",
            SubscriptionOptions {
                retain_handling: handling,
                ..SubscriptionOptions::with_qos(QoS::AtMostOnce)
            },
        )]
    };

    broker
        .on_subscribe_received("c", 1, request(RetainHandling::DoNotSend))
        .await;
    assert!(deliveries(&mut c).is_empty());
    broker.on_unsubscribe_received("c", 2, vec!["r".into()]).await;

    broker
        .on_subscribe_received("c", 3, request(RetainHandling::SendAtSubscribeIfNew))
        .await;
    assert_eq!(deliveries(&mut c).len(), 1);
    broker
        .on_subscribe_received("c", 4, request(RetainHandling::SendAtSubscribeIfNew))
        .await;
    assert!(deliveries(&mut c).is_empty());

    // Existing subscription and resend disabled
    broker
        .on_subscribe_received("c", 5, request(RetainHandling::SendAtSubscribe))
        .await;
    assert!(deliveries(&mut c).is_empty());
}

#[tokio::test]
async fn test_resubscribe_resends_retained_by_default() {
    let (mut broker, outbound) = broker_with(BrokerConfig::default());
    broker
        .publish("r", Bytes::from_static(b"v"), QoS::AtMostOnce, true)
        .await
        .unwrap();
    let mut c = connect(&mut broker, &outbound, "c", true).await;
    subscribe(&mut broker, "c", "r", QoS::AtMostOnce).await;
    subscribe(&mut broker, "c", "r", QoS::AtMostOnce).await;
    assert_eq!(deliveries(&mut c).len(), 2);
}

#[tokio::test]
async fn test_no_local_and_retain_as_published() {
    let (mut broker, outbound) = broker_with(BrokerConfig::default());
    let mut a = connect(&mut broker, &outbound, "a", true).await;
    let mut b = connect(&mut broker, &outbound, "b", true).await;

    broker
        .on_subscribe_received(
            "a",
            1,
            vec![SubscribeRequest::with_options(
                "t",
                SubscriptionOptions {
                    no_local: true,
                    ..SubscriptionOptions::with_qos(QoS::AtMostOnce)
                },
            )],
        )
        .await;
    broker
        .on_subscribe_received(
            "b",
            1,
            vec![SubscribeRequest::with_options(
                "t",
                SubscriptionOptions {
                    retain_as_published: true,
                    ..SubscriptionOptions::with_qos(QoS::AtMostOnce)
                },
            )],
        )
        .await;
    drain(&mut a);
    drain(&mut b);

    broker
        .on_publish_received(
            "a",
            InboundPublish::new("t", QoS::AtMostOnce, "x").with_retain(true),
        )
        .await
        .unwrap();

    assert!(deliveries(&mut a).is_empty());
    let got = deliveries(&mut b);
    assert_eq!(got.len(), 1);
    assert!(got[0].retain);

    // Internal publishes have no origin, so no_local never applies
    broker
        .publish("t", Bytes::from_static(b"y"), QoS::AtMostOnce, false)
        .await
        .unwrap();
    assert_eq!(deliveries(&mut a).len(), 1);
}

#[tokio::test]
async fn test_live_delivery_clears_retain_flag() {
    let (mut broker, outbound) = broker_with(BrokerConfig::default());
    let mut a = connect(&mut broker, &outbound, "a", true).await;
    subscribe(&mut broker, "a", "t", QoS::AtMostOnce).await;
    drain(&mut a);

    broker
        .publish("t", Bytes::from_static(b"x"), QoS::AtMostOnce, true)
        .await
        .unwrap();
    assert!(!deliveries(&mut a)[0].retain);
}

fn acl_hooks() -> Arc<AclProvider> {
    Arc::new(AclProvider::new(&AclConfig {
        enabled: true,
        users: vec![AclUser {
            username: "reader".to_string(),
            role: "reader".to_string(),
        }],
        roles: vec![AclRole {
            name: "reader".to_string(),
            publish: vec![],
            subscribe: vec!["#".to_string()],
        }],
        ..AclConfig::default()
    }))
}

#[tokio::test]
async fn test_acl_denied_publish_is_acked_and_dropped() {
    let outbound = Arc::new(ChannelOutbound::new(64));
    let metrics = Arc::new(Metrics::new().unwrap());
    let mut broker = Broker::with_hooks(BrokerConfig::default(), outbound.clone(), acl_hooks())
        .with_metrics(metrics.clone());

    let mut r = outbound.register("r");
    broker.on_client_connected("r", Some("reader"), true).await;
    assert_eq!(subscribe(&mut broker, "r", "t", QoS::AtLeastOnce).await, ReasonCode::GrantedQoS1);
    drain(&mut r);

    let mut p = connect(&mut broker, &outbound, "p", true).await;
    broker
        .on_publish_received(
            "p",
            InboundPublish::new("t", QoS::AtLeastOnce, "x").with_packet_id(9),
        )
        .await
        .unwrap();
    assert_eq!(
        drain(&mut p),
        vec![ack(AckKind::PubAck, 9, ReasonCode::NotAuthorized)]
    );
    assert!(deliveries(&mut r).is_empty());
    assert!(broker.store().is_empty());

    // Anonymous clients have no subscribe grant
    assert_eq!(
        subscribe(&mut broker, "p", "t", QoS::AtMostOnce).await,
        ReasonCode::NotAuthorized
    );
    assert_eq!(
        metrics
            .acl_denials_total
            .with_label_values(&["publish"])
            .get(),
        1
    );
}

#[tokio::test]
async fn test_malformed_publish_requires_disconnect() {
    let (mut broker, outbound) = broker_with(BrokerConfig::default());
    let _p = connect(&mut broker, &outbound, "p", true).await;

    let err = broker
        .on_publish_received("p", InboundPublish::new("a/+", QoS::AtMostOnce, "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidTopic(_)));

    let err = broker
        .on_publish_received("p", InboundPublish::new("a", QoS::AtLeastOnce, "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ProtocolViolation(_)));

    let err = broker
        .on_publish_received(
            "p",
            InboundPublish::new("a", QoS::AtMostOnce, "x").with_dup(true),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ProtocolViolation(_)));
}

#[tokio::test]
async fn test_subscribe_refusals_are_per_filter() {
    let config = BrokerConfig {
        max_subscriptions: 2,
        max_qos: QoS::AtLeastOnce,
        ..BrokerConfig::default()
    };
    let (mut broker, outbound) = broker_with(config);
    let _a = connect(&mut broker, &outbound, "a", true).await;

    let codes = broker
        .on_subscribe_received(
            "a",
            1,
            vec![
                SubscribeRequest::new("a/#/b", QoS::AtMostOnce),
                SubscribeRequest::new("ok/1", QoS::ExactlyOnce),
                SubscribeRequest::new("ok/2", QoS::AtMostOnce),
                SubscribeRequest::new("ok/3", QoS::AtMostOnce),
                SubscribeRequest::new("ok/1", QoS::AtMostOnce),
            ],
        )
        .await;
    assert_eq!(
        codes,
        vec![
            ReasonCode::TopicFilterInvalid,
            ReasonCode::GrantedQoS1,
            ReasonCode::Success,
            ReasonCode::QuotaExceeded,
            ReasonCode::Success,
        ]
    );
    assert_eq!(broker.session("a").unwrap().subscription_count(), 2);
}

#[tokio::test]
async fn test_wildcards_refused_when_disabled() {
    let config = BrokerConfig {
        wildcard_subscriptions: false,
        ..BrokerConfig::default()
    };
    let (mut broker, outbound) = broker_with(config);
    let _a = connect(&mut broker, &outbound, "a", true).await;
    assert_eq!(
        subscribe(&mut broker, "a", "a/+", QoS::AtMostOnce).await,
        ReasonCode::WildcardSubsNotSupported
    );
    assert_eq!(broker.trie().leaf_count(), 0);
}

#[tokio::test]
async fn test_trie_node_limit_leaves_trie_untouched() {
    let config = BrokerConfig {
        max_trie_nodes: 2,
        ..BrokerConfig::default()
    };
    let (mut broker, outbound) = broker_with(config);
    let _a = connect(&mut broker, &outbound, "a", true).await;
    assert_eq!(
        subscribe(&mut broker, "a", "a/b", QoS::AtMostOnce).await,
        ReasonCode::Success
    );
    let nodes = broker.trie().node_count();

    assert_eq!(
        subscribe(&mut broker, "a", "c/d", QoS::AtMostOnce).await,
        ReasonCode::QuotaExceeded
    );
    assert_eq!(broker.trie().node_count(), nodes);
    assert!(broker.session("a").unwrap().subscription("c/d").is_none());
}

#[tokio::test]
async fn test_unsubscribe_codes_and_pruning() {
    let (mut broker, outbound) = broker_with(BrokerConfig::default());
    let mut a = connect(&mut broker, &outbound, "a", true).await;
    subscribe(&mut broker, "a", "x/y/z", QoS::AtMostOnce).await;
    drain(&mut a);

    let codes = broker
        .on_unsubscribe_received(
            "a",
            7,
            vec!["x/y/z".into(), "nope".into(), "bad/#/x".into()],
        )
        .await;
    assert_eq!(
        codes,
        vec![
            ReasonCode::Success,
            ReasonCode::NoSubscriptionExisted,
            ReasonCode::TopicFilterInvalid,
        ]
    );
    assert_eq!(
        drain(&mut a),
        vec![OutboundPacket::UnsubAck {
            packet_id: 7,
            codes,
        }]
    );
    assert_eq!(broker.trie().node_count(), 1);
}

#[tokio::test]
async fn test_dollar_topics_skip_root_wildcards() {
    let (mut broker, outbound) = broker_with(BrokerConfig::default());
    let mut all = connect(&mut broker, &outbound, "all", true).await;
    let mut sys = connect(&mut broker, &outbound, "sys", true).await;
    subscribe(&mut broker, "all", "#", QoS::AtMostOnce).await;
    subscribe(&mut broker, "sys", "$SYS/#", QoS::AtMostOnce).await;
    drain(&mut all);
    drain(&mut sys);

    broker
        .publish("$SYS/uptime", Bytes::from_static(b"1"), QoS::AtMostOnce, false)
        .await
        .unwrap();
    assert!(deliveries(&mut all).is_empty());
    assert_eq!(deliveries(&mut sys).len(), 1);
}

#[tokio::test]
async fn test_inflight_window_keeps_order() {
    let config = BrokerConfig {
        max_inflight: 1,
        ..BrokerConfig::default()
    };
    let (mut broker, outbound) = broker_with(config);
    let mut a = connect(&mut broker, &outbound, "a", true).await;
    subscribe(&mut broker, "a", "t", QoS::AtLeastOnce).await;
    drain(&mut a);

    for payload in ["1", "2"] {
        broker
            .publish("t", Bytes::from(payload), QoS::AtLeastOnce, false)
            .await
            .unwrap();
    }
    let first = deliveries(&mut a);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].payload, Bytes::from_static(b"1"));

    broker.on_ack_received("a", 1, AckKind::PubAck).await;
    let second = deliveries(&mut a);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].payload, Bytes::from_static(b"2"));
    assert_eq!(second[0].packet_id, Some(2));
}

#[tokio::test]
async fn test_offline_session_queues_and_resumes() {
    let (mut broker, outbound) = broker_with(BrokerConfig::default());
    let mut c = connect(&mut broker, &outbound, "c", false).await;
    subscribe(&mut broker, "c", "t", QoS::AtLeastOnce).await;
    drain(&mut c);

    broker.on_client_disconnected("c", false).await;
    for (payload, qos) in [
        ("m1", QoS::AtLeastOnce),
        ("m0", QoS::AtMostOnce),
        ("m2", QoS::AtLeastOnce),
    ] {
        broker
            .publish("t", Bytes::from(payload), qos, false)
            .await
            .unwrap();
    }
    assert!(deliveries(&mut c).is_empty());
    assert_eq!(broker.session("c").unwrap().outbound_len(), 2);

    assert!(broker.on_client_connected("c", None, false).await);
    let got = deliveries(&mut c);
    let payloads: Vec<_> = got.iter().map(|d| d.payload.clone()).collect();
    assert_eq!(payloads, vec![Bytes::from("m1"), Bytes::from("m2")]);
    assert!(got.iter().all(|d| !d.dup));
}

#[tokio::test]
async fn test_resume_resends_inflight_with_dup() {
    let (mut broker, outbound) = broker_with(BrokerConfig::default());
    let mut c = connect(&mut broker, &outbound, "c", false).await;
    subscribe(&mut broker, "c", "t", QoS::AtLeastOnce).await;
    broker
        .publish("t", Bytes::from_static(b"x"), QoS::AtLeastOnce, false)
        .await
        .unwrap();
    assert_eq!(deliveries(&mut c)[0].packet_id, Some(1));

    broker.on_client_disconnected("c", false).await;
    assert!(broker.on_client_connected("c", None, false).await);

    let got = deliveries(&mut c);
    assert_eq!(got.len(), 1);
    assert!(got[0].dup);
    assert_eq!(got[0].packet_id, Some(1));
}

/// Records connection events in order
#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<String>>,
}

#[async_trait]
impl Hooks for EventLog {
    async fn on_client_connected(&self, client_id: &str, _username: Option<&str>) {
        self.events.lock().push(format!("connected {}", client_id));
    }

    async fn on_client_disconnected(&self, client_id: &str, clean_session: bool) {
        self.events
            .lock()
            .push(format!("disconnected {} clean={}", client_id, clean_session));
    }
}

#[tokio::test]
async fn test_takeover_resumes_session_and_reports_disconnect() {
    let log = Arc::new(EventLog::default());
    let outbound = Arc::new(ChannelOutbound::new(64));
    let mut broker = Broker::with_hooks(BrokerConfig::default(), outbound.clone(), log.clone());
    let mut c = connect(&mut broker, &outbound, "c", false).await;
    subscribe(&mut broker, "c", "t", QoS::AtLeastOnce).await;
    broker
        .publish("t", Bytes::from_static(b"x"), QoS::AtLeastOnce, false)
        .await
        .unwrap();
    let first = deliveries(&mut c);
    assert_eq!(first.len(), 1);
    assert!(!first[0].dup);

    // Second CONNECT without a disconnect in between
    assert!(broker.on_client_connected("c", None, false).await);
    let resent = deliveries(&mut c);
    assert_eq!(resent.len(), 1);
    assert!(resent[0].dup);
    assert_eq!(resent[0].packet_id, Some(1));

    let session = broker.session("c").unwrap();
    assert!(session.is_connected());
    assert_eq!(session.subscription_count(), 1);
    assert_eq!(
        *log.events.lock(),
        vec![
            "connected c".to_string(),
            "disconnected c clean=false".to_string(),
            "connected c".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_takeover_of_clean_session_starts_fresh() {
    let (mut broker, outbound) = broker_with(BrokerConfig::default());
    let _c = connect(&mut broker, &outbound, "c", true).await;
    subscribe(&mut broker, "c", "t", QoS::AtLeastOnce).await;

    assert!(!broker.on_client_connected("c", None, false).await);
    assert_eq!(broker.trie().leaf_count(), 0);
    assert_eq!(broker.session("c").unwrap().subscription_count(), 0);
}

#[tokio::test]
async fn test_clean_connect_discards_previous_session() {
    let (mut broker, outbound) = broker_with(BrokerConfig::default());
    let _c = connect(&mut broker, &outbound, "c", false).await;
    subscribe(&mut broker, "c", "t", QoS::AtLeastOnce).await;
    broker.on_client_disconnected("c", false).await;
    broker
        .publish("t", Bytes::from_static(b"x"), QoS::AtLeastOnce, false)
        .await
        .unwrap();
    assert_eq!(broker.store().len(), 1);

    assert!(!broker.on_client_connected("c", None, true).await);
    assert_eq!(broker.trie().leaf_count(), 0);
    assert!(broker.store().is_empty());
    assert_eq!(broker.session("c").unwrap().outbound_len(), 0);

    broker.on_client_disconnected("c", true).await;
    assert_eq!(broker.session_count(), 0);
}

#[tokio::test]
async fn test_queue_overflow_drops_newest() {
    let config = BrokerConfig {
        max_inflight: 1,
        max_queued_messages: 2,
        ..BrokerConfig::default()
    };
    let metrics = Arc::new(Metrics::new().unwrap());
    let outbound = Arc::new(ChannelOutbound::new(64));
    let mut broker = Broker::new(config, outbound.clone()).with_metrics(metrics.clone());
    let mut a = connect(&mut broker, &outbound, "a", true).await;
    subscribe(&mut broker, "a", "t", QoS::AtLeastOnce).await;
    drain(&mut a);

    for payload in ["1", "2", "3"] {
        broker
            .publish("t", Bytes::from(payload), QoS::AtLeastOnce, false)
            .await
            .unwrap();
    }
    assert_eq!(broker.session("a").unwrap().outbound_len(), 2);
    assert_eq!(metrics.publish_messages_dropped.get(), 1);
    let first = deliveries(&mut a);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].payload, Bytes::from("1"));

    broker.on_ack_received("a", 1, AckKind::PubAck).await;
    let got = deliveries(&mut a);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload, Bytes::from("2"));
}

#[tokio::test]
async fn test_awaiting_rel_quota() {
    let config = BrokerConfig {
        max_awaiting_rel: 1,
        ..BrokerConfig::default()
    };
    let (mut broker, outbound) = broker_with(config);
    let mut p = connect(&mut broker, &outbound, "p", true).await;

    for packet_id in [1, 2] {
        broker
            .on_publish_received(
                "p",
                InboundPublish::new("t", QoS::ExactlyOnce, "x").with_packet_id(packet_id),
            )
            .await
            .unwrap();
    }
    assert_eq!(
        drain(&mut p),
        vec![
            ack(AckKind::PubRec, 1, ReasonCode::Success),
            ack(AckKind::PubRec, 2, ReasonCode::QuotaExceeded),
        ]
    );
    assert_eq!(broker.store().len(), 1);
}

#[tokio::test]
async fn test_retry_resends_expired_entries() {
    let metrics = Arc::new(Metrics::new().unwrap());
    let outbound = Arc::new(ChannelOutbound::new(64));
    let mut broker = Broker::new(BrokerConfig::default(), outbound.clone())
        .with_metrics(metrics.clone());
    let mut a = connect(&mut broker, &outbound, "a", true).await;
    subscribe(&mut broker, "a", "t", QoS::AtLeastOnce).await;
    broker
        .publish("t", Bytes::from_static(b"x"), QoS::AtLeastOnce, false)
        .await
        .unwrap();
    drain(&mut a);

    broker.retry_unacked(Instant::now());
    assert!(drain(&mut a).is_empty());

    broker.retry_unacked(Instant::now() + Duration::from_secs(60));
    let got = deliveries(&mut a);
    assert_eq!(got.len(), 1);
    assert!(got[0].dup);
    assert_eq!(metrics.qos1_retransmits.get(), 1);
}

#[tokio::test]
async fn test_unknown_ack_is_ignored() {
    let (mut broker, outbound) = broker_with(BrokerConfig::default());
    let mut a = connect(&mut broker, &outbound, "a", true).await;
    broker.on_ack_received("a", 42, AckKind::PubAck).await;
    broker.on_ack_received("a", 42, AckKind::PubRec).await;
    broker.on_ack_received("ghost", 1, AckKind::PubComp).await;
    assert!(drain(&mut a).is_empty());
}

#[test]
fn test_broker_config_from_config() {
    let mut config = Config::default();
    config.mqtt.max_qos = 1;
    config.limits.max_inflight = 5;
    config.limits.retry_interval = Duration::from_secs(3);

    let broker_config = BrokerConfig::from(&config);
    assert_eq!(broker_config.max_qos, QoS::AtLeastOnce);
    assert_eq!(broker_config.retry_interval, Duration::from_secs(3));
    assert_eq!(broker_config.session_limits().max_inflight, 5);
    assert!(broker_config.resend_retained_on_resubscribe);
}
