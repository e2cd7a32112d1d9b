//! Prometheus metrics for the routing core
//!
//! The collaborator that owns the HTTP surface renders them with
//! [`Metrics::gather_text`].

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::protocol::QoS;

/// All routing metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Publish metrics
    pub publish_messages_received: IntCounter,
    pub publish_messages_sent: IntCounter,
    pub publish_messages_dropped: IntCounter,

    // Subscription metrics
    pub subscriptions_current: IntGauge,
    pub subscriptions_total: IntCounter,
    pub unsubscriptions_total: IntCounter,

    // Retained messages
    pub retained_messages_current: IntGauge,
    pub retained_bytes_current: IntGauge,

    // Message store
    pub stored_messages_current: IntGauge,

    // QoS metrics
    pub inflight_messages: IntGaugeVec,
    pub qos1_retransmits: IntCounter,
    pub qos2_retransmits: IntCounter,

    // Authorization
    pub acl_denials_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let publish_messages_received = IntCounter::with_opts(Opts::new(
            "vibemq_publish_messages_received_total",
            "Total PUBLISH packets received",
        ))?;

        let publish_messages_sent = IntCounter::with_opts(Opts::new(
            "vibemq_publish_messages_sent_total",
            "Total PUBLISH packets sent",
        ))?;

        let publish_messages_dropped = IntCounter::with_opts(Opts::new(
            "vibemq_publish_messages_dropped_total",
            "Total PUBLISH messages dropped due to queue overflow",
        ))?;

        let subscriptions_current = IntGauge::with_opts(Opts::new(
            "vibemq_subscriptions_current",
            "Current number of active subscriptions",
        ))?;

        let subscriptions_total = IntCounter::with_opts(Opts::new(
            "vibemq_subscriptions_total",
            "Total subscriptions created since startup",
        ))?;

        let unsubscriptions_total = IntCounter::with_opts(Opts::new(
            "vibemq_unsubscriptions_total",
            "Total unsubscriptions since startup",
        ))?;

        let retained_messages_current = IntGauge::with_opts(Opts::new(
            "vibemq_retained_messages_current",
            "Current number of retained messages",
        ))?;

        let retained_bytes_current = IntGauge::with_opts(Opts::new(
            "vibemq_retained_bytes_current",
            "Current bytes used by retained messages",
        ))?;

        let stored_messages_current = IntGauge::with_opts(Opts::new(
            "vibemq_stored_messages_current",
            "Current number of live message store records",
        ))?;

        let inflight_messages = IntGaugeVec::new(
            Opts::new(
                "vibemq_inflight_messages",
                "Current inflight messages by QoS level",
            ),
            &["qos"],
        )?;

        let qos1_retransmits = IntCounter::with_opts(Opts::new(
            "vibemq_qos1_retransmits_total",
            "Total QoS 1 message retransmissions",
        ))?;

        let qos2_retransmits = IntCounter::with_opts(Opts::new(
            "vibemq_qos2_retransmits_total",
            "Total QoS 2 message retransmissions",
        ))?;

        let acl_denials_total = IntCounterVec::new(
            Opts::new(
                "vibemq_acl_denials_total",
                "Total operations refused by ACL hooks",
            ),
            &["action"],
        )?;

        registry.register(Box::new(publish_messages_received.clone()))?;
        registry.register(Box::new(publish_messages_sent.clone()))?;
        registry.register(Box::new(publish_messages_dropped.clone()))?;
        registry.register(Box::new(subscriptions_current.clone()))?;
        registry.register(Box::new(subscriptions_total.clone()))?;
        registry.register(Box::new(unsubscriptions_total.clone()))?;
        registry.register(Box::new(retained_messages_current.clone()))?;
        registry.register(Box::new(retained_bytes_current.clone()))?;
        registry.register(Box::new(stored_messages_current.clone()))?;
        registry.register(Box::new(inflight_messages.clone()))?;
        registry.register(Box::new(qos1_retransmits.clone()))?;
        registry.register(Box::new(qos2_retransmits.clone()))?;
        registry.register(Box::new(acl_denials_total.clone()))?;

        Ok(Metrics {
            registry,
            publish_messages_received,
            publish_messages_sent,
            publish_messages_dropped,
            subscriptions_current,
            subscriptions_total,
            unsubscriptions_total,
            retained_messages_current,
            retained_bytes_current,
            stored_messages_current,
            inflight_messages,
            qos1_retransmits,
            qos2_retransmits,
            acl_denials_total,
        })
    }

    // Helper methods for common operations

    pub fn publish_received(&self) {
        self.publish_messages_received.inc();
    }

    pub fn publish_sent(&self) {
        self.publish_messages_sent.inc();
    }

    pub fn publish_dropped(&self) {
        self.publish_messages_dropped.inc();
    }

    pub fn subscription_added(&self) {
        self.subscriptions_current.inc();
        self.subscriptions_total.inc();
    }

    pub fn subscription_removed(&self) {
        self.subscriptions_current.dec();
        self.unsubscriptions_total.inc();
    }

    /// Track the retained set after it changed
    pub fn update_retained(&self, count: usize, bytes: usize) {
        self.retained_messages_current.set(count as i64);
        self.retained_bytes_current.set(bytes as i64);
    }

    pub fn update_stored(&self, records: usize) {
        self.stored_messages_current.set(records as i64);
    }

    pub fn inflight_started(&self, qos: QoS) {
        self.inflight_messages
            .with_label_values(&[qos_label(qos)])
            .inc();
    }

    pub fn inflight_finished(&self, qos: QoS) {
        self.inflight_messages
            .with_label_values(&[qos_label(qos)])
            .dec();
    }

    pub fn retransmitted(&self, qos: QoS) {
        match qos {
            QoS::AtLeastOnce => self.qos1_retransmits.inc(),
            QoS::ExactlyOnce => self.qos2_retransmits.inc(),
            QoS::AtMostOnce => {}
        }
    }

    pub fn acl_denied(&self, action: &str) {
        self.acl_denials_total.with_label_values(&[action]).inc();
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn qos_label(qos: QoS) -> &'static str {
    match qos {
        QoS::AtMostOnce => "0",
        QoS::AtLeastOnce => "1",
        QoS::ExactlyOnce => "2",
    }
}
