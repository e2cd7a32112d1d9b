//! QoS 1/2 acknowledgement handling and the retry sweep

use std::time::Instant;

use tracing::{debug, trace};

use super::{dispatch, Broker};
use crate::error::BrokerError;
use crate::protocol::{AckKind, ReasonCode};
use crate::session::AckOutcome;

impl Broker {
    /// Handle PUBACK, PUBREC, PUBREL or PUBCOMP from a client.
    ///
    /// Acknowledgements that match no entry are logged and ignored.
    pub async fn on_ack_received(&mut self, client_id: &str, packet_id: u16, kind: AckKind) {
        let result = match kind {
            AckKind::PubRel => self.handle_pubrel(client_id, packet_id).await,
            _ => self.handle_outbound_ack(client_id, packet_id, kind),
        };
        if let Err(e) = result {
            debug!(client_id = %client_id, "{} ignored: {}", kind, e);
        }
    }

    fn handle_outbound_ack(
        &mut self,
        client_id: &str,
        packet_id: u16,
        kind: AckKind,
    ) -> Result<(), BrokerError> {
        let now = Instant::now();
        let session = self
            .sessions
            .get_mut(client_id)
            .ok_or(BrokerError::UnknownPacketId(packet_id))?;

        let outcome = match kind {
            AckKind::PubAck => session.on_puback(packet_id),
            AckKind::PubRec => session.on_pubrec(packet_id, now),
            AckKind::PubComp => session.on_pubcomp(packet_id),
            AckKind::PubRel => AckOutcome::Unknown,
        };

        match outcome {
            AckOutcome::Completed(entry) => {
                trace!(client_id = %client_id, packet_id, "{} completed delivery", kind);
                if let Some(m) = &self.metrics {
                    m.inflight_finished(entry.qos);
                }
                // Releasing the entry's reference may free the record
                drop(entry);
                self.update_store_metrics();
                // A slot opened in the inflight window
                self.flush_session(client_id, now);
                Ok(())
            }
            AckOutcome::Release(packet_id) => {
                self.send_ack(client_id, AckKind::PubRel, packet_id, ReasonCode::Success);
                Ok(())
            }
            AckOutcome::Unknown => Err(BrokerError::UnknownPacketId(packet_id)),
        }
    }

    /// Release an inbound QoS 2 message: route it once, answer PUBCOMP.
    ///
    /// PUBCOMP is sent even when nothing is stored under `packet_id`, so a
    /// client retrying PUBREL after a lost PUBCOMP can finish its flow.
    async fn handle_pubrel(&mut self, client_id: &str, packet_id: u16) -> Result<(), BrokerError> {
        let released = self
            .sessions
            .get_mut(client_id)
            .and_then(|s| s.on_pubrel(packet_id));

        let Some(entry) = released else {
            self.send_ack(
                client_id,
                AckKind::PubComp,
                packet_id,
                ReasonCode::PacketIdNotFound,
            );
            return Err(BrokerError::UnknownPacketId(packet_id));
        };

        self.send_ack(client_id, AckKind::PubComp, packet_id, ReasonCode::Success);
        self.route_message(entry.message).await;
        Ok(())
    }

    /// Re-send every waiting outbound entry of a connected session whose last
    /// transmission is older than the retry interval
    pub fn retry_unacked(&mut self, now: Instant) {
        let interval = self.config.retry_interval;
        for (client_id, session) in self.sessions.iter_mut() {
            let transmits = session.retry(now, interval);
            if transmits.is_empty() {
                continue;
            }
            debug!(
                client_id = %client_id,
                count = transmits.len(),
                "retransmitting unacknowledged messages"
            );
            dispatch(
                self.outbound.as_ref(),
                self.metrics.as_deref(),
                client_id,
                transmits,
                true,
            );
        }
    }
}
