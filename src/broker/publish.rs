//! PUBLISH handling and message routing

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use super::{dispatch, Broker, InboundPublish};
use crate::error::BrokerError;
use crate::hooks::AclAccess;
use crate::protocol::{AckKind, QoS, ReasonCode};
use crate::session::InboundOutcome;
use crate::store::MessageRef;
use crate::topic::{split_levels, validate_publish_topic_with_max_levels};

impl Broker {
    /// Handle a decoded PUBLISH from a connected client.
    ///
    /// `Err` means the connection must be dropped. Everything else, ACL
    /// denials included, is answered with the acknowledgement the QoS level
    /// requires and reported as `Ok`.
    pub async fn on_publish_received(
        &mut self,
        client_id: &str,
        publish: InboundPublish,
    ) -> Result<(), BrokerError> {
        if let Some(m) = &self.metrics {
            m.publish_received();
        }

        let packet_id = match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) if publish.dup => {
                return Err(BrokerError::ProtocolViolation("DUP flag set on QoS 0 publish"));
            }
            (QoS::AtMostOnce, _) => 0,
            (_, Some(id)) if id != 0 => id,
            _ => {
                return Err(BrokerError::ProtocolViolation(
                    "QoS > 0 publish without packet identifier",
                ));
            }
        };

        if publish.qos > self.config.max_qos {
            return Err(BrokerError::ProtocolViolation("QoS not supported"));
        }

        if let Err(e) =
            validate_publish_topic_with_max_levels(&publish.topic, self.config.max_topic_levels)
        {
            warn!(client_id = %client_id, topic = %publish.topic, "invalid publish topic: {}", e);
            return Err(e);
        }

        let (client_id, username) = match self.sessions.get(client_id) {
            Some(session) => (session.client_id.clone(), session.username.clone()),
            None => return Err(BrokerError::ProtocolViolation("publish without a session")),
        };

        // Retransmitted QoS 2 publish still waiting for PUBREL: answer again,
        // route nothing
        if publish.qos == QoS::ExactlyOnce
            && self
                .sessions
                .get(&client_id)
                .is_some_and(|s| s.awaiting_release(packet_id))
        {
            debug!(client_id = %client_id, packet_id, "duplicate QoS 2 publish");
            self.send_ack(&client_id, AckKind::PubRec, packet_id, ReasonCode::Success);
            return Ok(());
        }

        let allowed = match self
            .hooks
            .check_acl(&client_id, username.as_deref(), &publish.topic, AclAccess::Publish)
            .await
        {
            Ok(allowed) => allowed,
            Err(e) => {
                error!(client_id = %client_id, "publish ACL hook failed: {}", e);
                false
            }
        };

        if !allowed {
            debug!(
                client_id = %client_id,
                topic = %publish.topic,
                "publish denied by ACL"
            );
            if let Some(m) = &self.metrics {
                m.acl_denied(AclAccess::Publish.as_str());
            }
            match publish.qos {
                QoS::AtMostOnce => {}
                QoS::AtLeastOnce => {
                    self.send_ack(&client_id, AckKind::PubAck, packet_id, ReasonCode::NotAuthorized)
                }
                QoS::ExactlyOnce => {
                    self.send_ack(&client_id, AckKind::PubRec, packet_id, ReasonCode::NotAuthorized)
                }
            }
            return Ok(());
        }

        trace!(
            client_id = %client_id,
            topic = %publish.topic,
            qos = %publish.qos,
            "publish received"
        );

        let retain = publish.retain && self.config.retain_available;
        let message = self.store.store(
            Some(client_id.clone()),
            Arc::from(publish.topic),
            publish.qos,
            publish.payload,
            retain,
        );

        match publish.qos {
            QoS::AtMostOnce => {
                self.route_message(message).await;
            }
            QoS::AtLeastOnce => {
                self.route_message(message).await;
                self.send_ack(&client_id, AckKind::PubAck, packet_id, ReasonCode::Success);
            }
            QoS::ExactlyOnce => {
                let outcome = match self.sessions.get_mut(&client_id) {
                    Some(session) => session.receive_inbound(packet_id, message),
                    None => InboundOutcome::QuotaExceeded,
                };
                match outcome {
                    InboundOutcome::Stored | InboundOutcome::Duplicate => {
                        self.send_ack(&client_id, AckKind::PubRec, packet_id, ReasonCode::Success);
                        if let Some(session) = self.sessions.get_mut(&client_id) {
                            session.inbound_acknowledged(packet_id);
                        }
                    }
                    InboundOutcome::QuotaExceeded => {
                        warn!(
                            client_id = %client_id,
                            packet_id,
                            "too many QoS 2 messages awaiting PUBREL"
                        );
                        self.send_ack(
                            &client_id,
                            AckKind::PubRec,
                            packet_id,
                            ReasonCode::QuotaExceeded,
                        );
                    }
                }
                self.update_store_metrics();
            }
        }

        Ok(())
    }

    /// Publish a broker-internal message (no originating client)
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError> {
        validate_publish_topic_with_max_levels(topic, self.config.max_topic_levels)?;
        let qos = qos.min(self.config.max_qos);
        let retain = retain && self.config.retain_available;
        let message = self
            .store
            .store(None, Arc::from(topic), qos, payload, retain);
        self.route_message(message).await;
        Ok(())
    }

    /// Update the retained slot, fan the message out to matching sessions
    /// and release the caller's reference
    pub(super) async fn route_message(&mut self, message: MessageRef) {
        if message.retain() {
            self.update_retained(&message);
        }

        let now = Instant::now();
        let origin = message.origin().cloned();
        let matched = {
            let levels = split_levels(message.topic());
            self.trie.publish_match_filtered(&levels, |leaf| {
                !(leaf.options.no_local && origin.as_ref() == Some(&leaf.client_id))
            })
        };

        for (client_id, subscriber) in matched {
            let Some(session) = self.sessions.get_mut(&client_id) else {
                continue;
            };

            let qos = message.qos().min(subscriber.qos);
            if !session.is_connected() && qos == QoS::AtMostOnce && !self.config.queue_qos0_messages
            {
                continue;
            }

            let retain = subscriber.retain_as_published && message.retain();
            if !session.enqueue(message.clone(), qos, retain) {
                warn!(
                    client_id = %client_id,
                    topic = %message.topic(),
                    "outbound queue full, dropping message"
                );
                if let Some(m) = &self.metrics {
                    m.publish_dropped();
                }
                continue;
            }

            let transmits = session.pump(now);
            dispatch(
                self.outbound.as_ref(),
                self.metrics.as_deref(),
                &client_id,
                transmits,
                false,
            );
        }

        self.hooks
            .on_message_published(message.topic(), message.payload(), message.qos())
            .await;

        drop(message);
        self.update_store_metrics();
    }

    /// Install or clear the retained message for the message's topic
    fn update_retained(&mut self, message: &MessageRef) {
        let levels = split_levels(message.topic());
        let replacement = if message.payload().is_empty() {
            None
        } else {
            Some(message.clone())
        };

        match self.trie.set_retained(&levels, replacement) {
            Ok(previous) => {
                let removed = previous.map_or(0, |p| p.payload().len());
                self.retained_bytes =
                    (self.retained_bytes + message.payload().len()).saturating_sub(removed);
                if message.payload().is_empty() {
                    debug!(topic = %message.topic(), "retained message cleared");
                }
                self.update_retained_metrics();
            }
            Err(e) => {
                warn!(topic = %message.topic(), "retained message not stored: {}", e);
            }
        }
    }
}
