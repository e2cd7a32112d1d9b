//! SUBSCRIBE and UNSUBSCRIBE handling

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use super::{Broker, SubscribeRequest};
use crate::error::BrokerError;
use crate::hooks::AclAccess;
use crate::protocol::{QoS, ReasonCode, RetainHandling};
use crate::store::MessageRef;
use crate::topic::{is_wildcard_filter, tokenize_with_max_levels, Leaf, SubscribeOutcome};

/// Result of admitting one filter
struct Granted {
    qos: QoS,
    retained: Vec<MessageRef>,
}

impl Broker {
    /// Handle a decoded SUBSCRIBE.
    ///
    /// Each filter is admitted or refused on its own; the returned codes (also
    /// sent as the SUBACK) are in request order. Retained messages matching the
    /// admitted filters are delivered right after the SUBACK.
    pub async fn on_subscribe_received(
        &mut self,
        client_id: &str,
        packet_id: u16,
        requests: Vec<SubscribeRequest>,
    ) -> Vec<ReasonCode> {
        let mut codes = Vec::with_capacity(requests.len());
        let mut retained: Vec<(MessageRef, QoS)> = Vec::new();

        let Some(client_id) = self.sessions.get(client_id).map(|s| s.client_id.clone()) else {
            warn!(client_id = %client_id, "subscribe without a session");
            codes.resize(requests.len(), ReasonCode::UnspecifiedError);
            self.outbound.send_suback(client_id, packet_id, codes.clone());
            return codes;
        };

        for request in &requests {
            if !self.config.wildcard_subscriptions && is_wildcard_filter(&request.filter) {
                debug!(
                    client_id = %client_id,
                    filter = %request.filter,
                    "wildcard subscription refused"
                );
                codes.push(ReasonCode::WildcardSubsNotSupported);
                continue;
            }

            match self.subscribe_filter(&client_id, request).await {
                Ok(granted) => {
                    debug!(
                        client_id = %client_id,
                        filter = %request.filter,
                        qos = %granted.qos,
                        "subscribed"
                    );
                    retained.extend(granted.retained.into_iter().map(|m| (m, granted.qos)));
                    codes.push(ReasonCode::granted(granted.qos));
                }
                Err(e) => {
                    debug!(
                        client_id = %client_id,
                        filter = %request.filter,
                        "subscription refused: {}",
                        e
                    );
                    codes.push(e.suback_code());
                }
            }
        }

        self.outbound
            .send_suback(&client_id, packet_id, codes.clone());

        if !retained.is_empty() {
            self.deliver_retained(&client_id, retained);
        }

        codes
    }

    async fn subscribe_filter(
        &mut self,
        client_id: &Arc<str>,
        request: &SubscribeRequest,
    ) -> Result<Granted, BrokerError> {
        let levels = tokenize_with_max_levels(&request.filter, self.config.max_topic_levels)?;

        let username = self
            .sessions
            .get(client_id)
            .and_then(|s| s.username.clone());
        let allowed = match self
            .hooks
            .check_acl(
                client_id,
                username.as_deref(),
                &request.filter,
                AclAccess::Subscribe,
            )
            .await
        {
            Ok(allowed) => allowed,
            Err(e) => {
                error!(client_id = %client_id, "subscribe ACL hook failed: {}", e);
                false
            }
        };
        if !allowed {
            if let Some(m) = &self.metrics {
                m.acl_denied(AclAccess::Subscribe.as_str());
            }
            return Err(BrokerError::NotAuthorized);
        }

        let session = self
            .sessions
            .get_mut(client_id)
            .ok_or(BrokerError::ProtocolViolation("subscribe without a session"))?;
        if session.subscription_limit_reached(&request.filter) {
            return Err(BrokerError::ResourceExhausted("subscription limit reached"));
        }

        let mut options = request.options;
        options.qos = options.qos.min(self.config.max_qos);

        let (node, outcome) = self
            .trie
            .subscribe(&levels, Leaf::new(client_id.clone(), options))?;
        session.add_subscription(request.filter.clone(), node, options);

        if outcome == SubscribeOutcome::New {
            if let Some(m) = &self.metrics {
                m.subscription_added();
            }
        }

        let send_retained = self.config.retain_available
            && match options.retain_handling {
                RetainHandling::SendAtSubscribe => {
                    outcome == SubscribeOutcome::New
                        || self.config.resend_retained_on_resubscribe
                }
                RetainHandling::SendAtSubscribeIfNew => outcome == SubscribeOutcome::New,
                RetainHandling::DoNotSend => false,
            };

        let retained = if send_retained {
            self.trie.retained_matching(&levels)
        } else {
            Vec::new()
        };

        Ok(Granted {
            qos: options.qos,
            retained,
        })
    }

    /// Queue retained messages for a new subscription and send what the
    /// inflight window allows
    fn deliver_retained(&mut self, client_id: &Arc<str>, retained: Vec<(MessageRef, QoS)>) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        for (message, granted) in retained {
            let qos = message.qos().min(granted);
            if !session.enqueue(message, qos, true) {
                warn!(client_id = %client_id, "outbound queue full, dropping retained message");
                if let Some(m) = &self.metrics {
                    m.publish_dropped();
                }
            }
        }
        self.flush_session(client_id, Instant::now());
    }

    /// Handle a decoded UNSUBSCRIBE.
    ///
    /// Returns one code per filter (also sent as the UNSUBACK).
    pub async fn on_unsubscribe_received(
        &mut self,
        client_id: &str,
        packet_id: u16,
        filters: Vec<String>,
    ) -> Vec<ReasonCode> {
        let mut codes = Vec::with_capacity(filters.len());

        for filter in &filters {
            let removed = self
                .sessions
                .get_mut(client_id)
                .and_then(|s| s.remove_subscription(filter));

            let code = match removed {
                Some(sub) => {
                    self.trie.remove_leaf(sub.node, client_id);
                    if let Some(m) = &self.metrics {
                        m.subscription_removed();
                    }
                    debug!(client_id = %client_id, filter = %filter, "unsubscribed");
                    ReasonCode::Success
                }
                None => match tokenize_with_max_levels(filter, self.config.max_topic_levels) {
                    Ok(_) => ReasonCode::NoSubscriptionExisted,
                    Err(_) => ReasonCode::TopicFilterInvalid,
                },
            };
            codes.push(code);
        }

        self.outbound
            .send_unsuback(client_id, packet_id, codes.clone());
        codes
    }
}
