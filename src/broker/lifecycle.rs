//! Session attach and detach

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use super::{dispatch, Broker};
use crate::session::{DeliveryState, Direction, Session};

impl Broker {
    /// Attach a client after a successful CONNECT.
    ///
    /// A clean session discards whatever the broker held for this client id.
    /// Otherwise an existing session is resumed: in-flight deliveries are
    /// re-sent and queued ones pumped. Connecting while already connected
    /// (takeover) detaches the old connection first.
    ///
    /// Returns the CONNACK session-present flag.
    pub async fn on_client_connected(
        &mut self,
        client_id: &str,
        username: Option<&str>,
        clean_session: bool,
    ) -> bool {
        let now = Instant::now();
        let username: Option<Arc<str>> = username.map(Arc::from);

        let taken_over = self
            .sessions
            .get(client_id)
            .filter(|existing| existing.is_connected())
            .map(|existing| existing.clean_session);
        if let Some(discard) = taken_over {
            debug!(client_id = %client_id, "session taken over by new connection");
            self.detach(client_id, discard);
            self.hooks.on_client_disconnected(client_id, discard).await;
        }

        if clean_session {
            self.discard_session(client_id);
        }

        let session_present = match self.sessions.get_mut(client_id) {
            Some(session) => {
                session.username = username.clone();
                let transmits = session.resume(now);
                dispatch(
                    self.outbound.as_ref(),
                    self.metrics.as_deref(),
                    client_id,
                    transmits,
                    true,
                );
                true
            }
            None => {
                let client: Arc<str> = Arc::from(client_id);
                let session = Session::new(
                    client.clone(),
                    username.clone(),
                    clean_session,
                    self.config.session_limits(),
                );
                self.sessions.insert(client, session);
                false
            }
        };

        info!(
            client_id = %client_id,
            clean_session,
            session_present,
            "client connected"
        );
        self.hooks
            .on_client_connected(client_id, username.as_deref())
            .await;

        session_present
    }

    /// Detach a client whose connection closed.
    ///
    /// Clean sessions (or `clean_session` requested here) are discarded;
    /// persistent ones are kept and accumulate deliveries while offline.
    pub async fn on_client_disconnected(&mut self, client_id: &str, clean_session: bool) {
        let Some(session) = self.sessions.get(client_id) else {
            debug!(client_id = %client_id, "disconnect for unknown client");
            return;
        };
        let discard = clean_session || session.clean_session;
        self.detach(client_id, discard);

        info!(client_id = %client_id, discard, "client disconnected");
        self.hooks
            .on_client_disconnected(client_id, discard)
            .await;
    }

    fn detach(&mut self, client_id: &str, discard: bool) {
        if discard {
            self.discard_session(client_id);
        } else if let Some(session) = self.sessions.get_mut(client_id) {
            session.freeze(self.config.queue_qos0_messages);
        }
    }

    /// Remove a session, its trie leaves and every queued reference
    pub(crate) fn discard_session(&mut self, client_id: &str) {
        let Some(mut session) = self.sessions.remove(client_id) else {
            return;
        };

        for (filter, sub) in session.take_subscriptions() {
            self.trie.remove_leaf(sub.node, client_id);
            if let Some(m) = &self.metrics {
                m.subscription_removed();
            }
            debug!(client_id = %client_id, filter = %filter, "subscription removed with session");
        }

        for entry in session.clear() {
            let in_flight = entry.direction == Direction::Outbound
                && entry.state != DeliveryState::Queued;
            if in_flight {
                if let Some(m) = &self.metrics {
                    m.inflight_finished(entry.qos);
                }
            }
        }

        drop(session);
        self.update_store_metrics();
    }
}
