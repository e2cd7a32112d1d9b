//! Async service around a [`Broker`]
//!
//! One tokio task owns the broker and processes commands in arrival order,
//! so every trie mutation, match and queue operation is serialized without
//! locks. A ticker drives the retry sweep. [`BrokerHandle`] is the cloneable
//! front door used by connection tasks.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{Broker, InboundPublish, SubscribeRequest};
use crate::error::BrokerError;
use crate::protocol::{AckKind, QoS, ReasonCode};
use crate::snapshot::{Snapshot, SnapshotError};

const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Shortest period of the retry ticker
const MIN_RETRY_TICK: Duration = Duration::from_millis(10);

fn retry_tick(retry_interval: Duration) -> Duration {
    if retry_interval < MIN_RETRY_TICK {
        warn!(
            requested = ?retry_interval,
            used = ?MIN_RETRY_TICK,
            "retry interval too short, clamping"
        );
        return MIN_RETRY_TICK;
    }
    retry_interval
}

enum Command {
    Connect {
        client_id: String,
        username: Option<String>,
        clean_session: bool,
        reply: oneshot::Sender<bool>,
    },
    Publish {
        client_id: String,
        publish: InboundPublish,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    InternalPublish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    Subscribe {
        client_id: String,
        packet_id: u16,
        requests: Vec<SubscribeRequest>,
        reply: oneshot::Sender<Vec<ReasonCode>>,
    },
    Unsubscribe {
        client_id: String,
        packet_id: u16,
        filters: Vec<String>,
        reply: oneshot::Sender<Vec<ReasonCode>>,
    },
    Ack {
        client_id: String,
        packet_id: u16,
        kind: AckKind,
        reply: oneshot::Sender<()>,
    },
    Disconnect {
        client_id: String,
        clean_session: bool,
        reply: oneshot::Sender<()>,
    },
    ExportSnapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    ImportSnapshot {
        snapshot: Snapshot,
        reply: oneshot::Sender<Result<(), SnapshotError>>,
    },
}

/// Task that owns a [`Broker`]
pub struct BrokerService {
    broker: Broker,
    rx: mpsc::Receiver<Command>,
    shutdown_rx: broadcast::Receiver<()>,
    retry_interval: Duration,
}

impl BrokerService {
    /// Start the service. The join handle yields the broker back once the
    /// service stops, either through [`BrokerHandle::shutdown`] or when every
    /// handle has been dropped.
    pub fn spawn(broker: Broker, retry_interval: Duration) -> (BrokerHandle, JoinHandle<Broker>) {
        let retry_interval = retry_tick(retry_interval);
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let service = BrokerService {
            broker,
            rx,
            shutdown_rx,
            retry_interval,
        };
        let task = tokio::spawn(service.run());

        (
            BrokerHandle {
                tx,
                shutdown: shutdown_tx,
            },
            task,
        )
    }

    async fn run(mut self) -> Broker {
        let mut ticker = tokio::time::interval(self.retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    debug!("broker service shutting down");
                    break;
                }
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        debug!("all broker handles dropped");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.broker.retry_unacked(Instant::now());
                }
            }
        }

        self.broker
    }

    async fn handle(&mut self, command: Command) {
        // A dropped reply receiver means the caller went away; nothing to do
        match command {
            Command::Connect {
                client_id,
                username,
                clean_session,
                reply,
            } => {
                let present = self
                    .broker
                    .on_client_connected(&client_id, username.as_deref(), clean_session)
                    .await;
                let _ = reply.send(present);
            }
            Command::Publish {
                client_id,
                publish,
                reply,
            } => {
                let result = self.broker.on_publish_received(&client_id, publish).await;
                let _ = reply.send(result);
            }
            Command::InternalPublish {
                topic,
                payload,
                qos,
                retain,
                reply,
            } => {
                let result = self.broker.publish(&topic, payload, qos, retain).await;
                let _ = reply.send(result);
            }
            Command::Subscribe {
                client_id,
                packet_id,
                requests,
                reply,
            } => {
                let codes = self
                    .broker
                    .on_subscribe_received(&client_id, packet_id, requests)
                    .await;
                let _ = reply.send(codes);
            }
            Command::Unsubscribe {
                client_id,
                packet_id,
                filters,
                reply,
            } => {
                let codes = self
                    .broker
                    .on_unsubscribe_received(&client_id, packet_id, filters)
                    .await;
                let _ = reply.send(codes);
            }
            Command::Ack {
                client_id,
                packet_id,
                kind,
                reply,
            } => {
                self.broker
                    .on_ack_received(&client_id, packet_id, kind)
                    .await;
                let _ = reply.send(());
            }
            Command::Disconnect {
                client_id,
                clean_session,
                reply,
            } => {
                self.broker
                    .on_client_disconnected(&client_id, clean_session)
                    .await;
                let _ = reply.send(());
            }
            Command::ExportSnapshot { reply } => {
                let _ = reply.send(self.broker.export_snapshot());
            }
            Command::ImportSnapshot { snapshot, reply } => {
                let _ = reply.send(self.broker.import_snapshot(snapshot));
            }
        }
    }
}

/// Cloneable handle to a running [`BrokerService`]
///
/// Every method fails with [`BrokerError::Shutdown`] once the service has
/// stopped.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<Command>,
    shutdown: broadcast::Sender<()>,
}

impl BrokerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| BrokerError::Shutdown)?;
        rx.await.map_err(|_| BrokerError::Shutdown)
    }

    pub async fn connect(
        &self,
        client_id: &str,
        username: Option<&str>,
        clean_session: bool,
    ) -> Result<bool, BrokerError> {
        self.request(|reply| Command::Connect {
            client_id: client_id.to_string(),
            username: username.map(str::to_string),
            clean_session,
            reply,
        })
        .await
    }

    /// Forward a client PUBLISH. The outer error means the service is gone;
    /// the inner one asks the caller to drop the connection.
    pub async fn publish_received(
        &self,
        client_id: &str,
        publish: InboundPublish,
    ) -> Result<(), BrokerError> {
        self.request(|reply| Command::Publish {
            client_id: client_id.to_string(),
            publish,
            reply,
        })
        .await?
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError> {
        self.request(|reply| Command::InternalPublish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            reply,
        })
        .await?
    }

    pub async fn subscribe(
        &self,
        client_id: &str,
        packet_id: u16,
        requests: Vec<SubscribeRequest>,
    ) -> Result<Vec<ReasonCode>, BrokerError> {
        self.request(|reply| Command::Subscribe {
            client_id: client_id.to_string(),
            packet_id,
            requests,
            reply,
        })
        .await
    }

    pub async fn unsubscribe(
        &self,
        client_id: &str,
        packet_id: u16,
        filters: Vec<String>,
    ) -> Result<Vec<ReasonCode>, BrokerError> {
        self.request(|reply| Command::Unsubscribe {
            client_id: client_id.to_string(),
            packet_id,
            filters,
            reply,
        })
        .await
    }

    pub async fn ack(
        &self,
        client_id: &str,
        packet_id: u16,
        kind: AckKind,
    ) -> Result<(), BrokerError> {
        self.request(|reply| Command::Ack {
            client_id: client_id.to_string(),
            packet_id,
            kind,
            reply,
        })
        .await
    }

    pub async fn disconnect(
        &self,
        client_id: &str,
        clean_session: bool,
    ) -> Result<(), BrokerError> {
        self.request(|reply| Command::Disconnect {
            client_id: client_id.to_string(),
            clean_session,
            reply,
        })
        .await
    }

    pub async fn export_snapshot(&self) -> Result<Snapshot, BrokerError> {
        self.request(|reply| Command::ExportSnapshot { reply }).await
    }

    /// Import a snapshot into the running broker
    pub async fn import_snapshot(
        &self,
        snapshot: Snapshot,
    ) -> Result<Result<(), SnapshotError>, BrokerError> {
        self.request(|reply| Command::ImportSnapshot { snapshot, reply })
            .await
    }

    /// Ask the service to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::broker::{BrokerConfig, ChannelOutbound};

    #[test]
    fn test_retry_tick_is_clamped() {
        assert_eq!(retry_tick(Duration::ZERO), MIN_RETRY_TICK);
        assert_eq!(retry_tick(Duration::from_secs(20)), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_spawn_with_zero_retry_interval() {
        let broker = Broker::new(BrokerConfig::default(), Arc::new(ChannelOutbound::default()));
        let (handle, join) = BrokerService::spawn(broker, Duration::ZERO);

        assert!(!handle.connect("c", None, true).await.unwrap());
        handle.shutdown();
        let broker = join.await.unwrap();
        assert_eq!(broker.session_count(), 1);
    }
}
