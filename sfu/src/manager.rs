use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use confab::protocol::{
    CallMode, ClientEnvelope, ClientMessage, ErrorCategory, PeerId, RoomId, ServerMessage,
    SfuResponse,
};
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    backend::MediaBackend,
    config::ServerConfig,
    error::{Error, RoomErrorKind},
    metrics::{HealthSummary, Metrics},
    peer::Outbox,
    room::JoinParams,
    worker::{Worker, WorkerHandle},
};

/// Entry point of the server. Spreads rooms over workers and routes every message of a
/// connection to the worker owning its room.
#[derive(Clone)]
pub struct RoomManager {
    inner: Arc<Inner>,
}

struct Inner {
    workers: Vec<WorkerHandle>,
    next_worker: AtomicUsize,
    rooms: Arc<DashMap<RoomId, usize>>,
    connections: DashMap<PeerId, Connection>,
    metrics: Metrics,
}

struct Connection {
    outbox: Outbox,
    room: Option<RoomId>,
}

/// Inbound side of one signaling connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub peer_id: PeerId,
    pub inbound: mpsc::UnboundedSender<ClientEnvelope>,
}

impl std::fmt::Debug for RoomManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("confab_sfu::RoomManager")
            .field("workers", &self.inner.workers.len())
            .field("rooms", &self.inner.rooms.len())
            .field("connections", &self.inner.connections.len())
            .finish()
    }
}

impl RoomManager {
    /// Starts `config.worker_count` workers. Must be called inside a tokio runtime.
    pub fn new(config: ServerConfig, backend: Arc<dyn MediaBackend>) -> Result<Self, Error> {
        let metrics = Metrics::new()?;
        let rooms = Arc::new(DashMap::new());
        let workers = (0..config.worker_count.max(1))
            .map(|index| {
                Worker::spawn(
                    index,
                    &config,
                    backend.clone(),
                    rooms.clone(),
                    metrics.clone(),
                )
            })
            .collect();

        Ok(Self {
            inner: Arc::new(Inner {
                workers,
                next_worker: AtomicUsize::new(0),
                rooms,
                connections: DashMap::new(),
                metrics,
            }),
        })
    }

    pub(crate) fn register(&self, outbox: Outbox) -> PeerId {
        let peer_id = Uuid::new_v4().to_string();
        self.inner
            .connections
            .insert(peer_id.clone(), Connection { outbox, room: None });
        peer_id
    }

    /// Registers a connection whose outgoing messages go to `outbox`. Messages sent to the
    /// returned handle are processed in order; dropping it disconnects the peer.
    pub fn connect(&self, outbox: Outbox) -> ConnectionHandle {
        let peer_id = self.register(outbox);
        let (tx, mut rx) = mpsc::unbounded_channel::<ClientEnvelope>();

        let manager = self.clone();
        let id = peer_id.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                manager.handle(&id, envelope).await;
            }
            manager.disconnect(&id).await;
        });

        ConnectionHandle {
            peer_id,
            inbound: tx,
        }
    }

    pub async fn handle(&self, peer_id: &str, envelope: ClientEnvelope) {
        let ClientEnvelope {
            request_id,
            message,
        } = envelope;
        let action = message.action();
        tracing::debug!("peer {} sent {}", peer_id, action);

        let result = match message {
            ClientMessage::Ping => {
                self.send(peer_id, ServerMessage::Pong);
                return;
            }
            ClientMessage::JoinRoom {
                room_id,
                identity,
                mode,
                media,
                create,
                rtp_capabilities,
            } => {
                let failed_room = room_id.clone();
                match self.outbox(peer_id) {
                    Some(outbox) => {
                        let join = JoinParams {
                            peer_id: peer_id.to_string(),
                            identity,
                            media,
                            rtp_capabilities,
                            outbox,
                        };
                        let result = self.join(peer_id, room_id, mode, create, join).await;
                        if request_id.is_none() {
                            if let Err(err) = &result {
                                self.join_failed(peer_id, failed_room, err);
                            }
                        }
                        result
                    }
                    None => Err(Error::not_joined()),
                }
            }
            ClientMessage::LeaveRoom { .. } => {
                self.leave(peer_id).await;
                Ok(SfuResponse::Ack)
            }
            message => match self.current_room(peer_id) {
                Some((room_id, worker)) => {
                    worker
                        .request(room_id, peer_id.to_string(), message)
                        .await
                }
                None => Err(Error::not_joined()),
            },
        };

        match result {
            Ok(payload) => {
                if let Some(request_id) = request_id {
                    self.send(
                        peer_id,
                        ServerMessage::Response {
                            request_id,
                            payload,
                        },
                    );
                }
            }
            Err(err) => {
                let category = err.category();
                self.inner.metrics.error(category);
                tracing::warn!("{} of peer {} failed: {}", action, peer_id, err);
                if let Some(request_id) = request_id {
                    self.send(
                        peer_id,
                        ServerMessage::Failure {
                            request_id,
                            category,
                            message: err.to_string(),
                        },
                    );
                }
            }
        }
    }

    async fn join(
        &self,
        peer_id: &str,
        room_id: RoomId,
        mode: CallMode,
        create: bool,
        join: JoinParams,
    ) -> Result<SfuResponse, Error> {
        let previous = self
            .inner
            .connections
            .get(peer_id)
            .and_then(|c| c.room.clone());
        if let Some(previous) = previous {
            if previous != room_id {
                self.leave(peer_id).await;
            }
        }

        let worker = if create {
            let index = *self
                .inner
                .rooms
                .entry(room_id.clone())
                .or_insert_with(|| self.next_worker());
            self.worker(index)?
        } else {
            self.worker_of(&room_id).ok_or_else(|| {
                Error::new_room(
                    format!("room {} does not exist", room_id),
                    RoomErrorKind::NotFoundError,
                )
            })?
        };

        let response = worker.join(room_id.clone(), mode, create, join).await?;
        if let Some(mut connection) = self.inner.connections.get_mut(peer_id) {
            connection.room = Some(room_id);
        }
        Ok(response)
    }

    /// Leaves the current room, if any.
    pub async fn leave(&self, peer_id: &str) -> bool {
        let room_id = self
            .inner
            .connections
            .get_mut(peer_id)
            .and_then(|mut c| c.room.take());
        let Some(room_id) = room_id else {
            return false;
        };
        match self.worker_of(&room_id) {
            Some(worker) => worker.leave(room_id, peer_id.to_string()).await,
            None => false,
        }
    }

    pub async fn disconnect(&self, peer_id: &str) {
        self.leave(peer_id).await;
        self.inner.connections.remove(peer_id);
        tracing::debug!("peer {} disconnected", peer_id);
    }

    pub async fn summary(&self) -> HealthSummary {
        let mut rooms = vec![];
        for worker in self.inner.workers.iter() {
            rooms.extend(worker.summary().await);
        }
        rooms.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.inner.metrics.summary(rooms)
    }

    /// Prometheus text exposition of the server metrics.
    pub fn export(&self) -> Result<String, Error> {
        self.inner.metrics.export()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn is_ready(&self) -> bool {
        self.inner.workers.iter().all(WorkerHandle::is_running)
    }

    /// Closes every room on every worker.
    pub async fn close(&self) {
        for worker in self.inner.workers.iter() {
            worker.close().await;
        }
    }

    fn join_failed(&self, peer_id: &str, room_id: RoomId, err: &Error) {
        let message = match err.category() {
            ErrorCategory::RoomNotFound => ServerMessage::RoomNotFound { room_id },
            _ => ServerMessage::RoomError {
                message: err.to_string(),
            },
        };
        self.send(peer_id, message);
    }

    fn send(&self, peer_id: &str, message: ServerMessage) {
        if let Some(connection) = self.inner.connections.get(peer_id) {
            if connection.outbox.send(message).is_err() {
                tracing::debug!("connection of peer {} is already closed", peer_id);
            }
        }
    }

    fn outbox(&self, peer_id: &str) -> Option<Outbox> {
        self.inner
            .connections
            .get(peer_id)
            .map(|c| c.outbox.clone())
    }

    fn current_room(&self, peer_id: &str) -> Option<(RoomId, WorkerHandle)> {
        let room_id = self.inner.connections.get(peer_id)?.room.clone()?;
        let worker = self.worker_of(&room_id)?;
        Some((room_id, worker))
    }

    fn worker_of(&self, room_id: &str) -> Option<WorkerHandle> {
        let index = *self.inner.rooms.get(room_id)?;
        self.inner.workers.get(index).cloned()
    }

    fn worker(&self, index: usize) -> Result<WorkerHandle, Error> {
        self.inner.workers.get(index).cloned().ok_or_else(|| {
            Error::new_room(
                format!("worker {} does not exist", index),
                RoomErrorKind::WorkerClosedError,
            )
        })
    }

    fn next_worker(&self) -> usize {
        self.inner.next_worker.fetch_add(1, Ordering::Relaxed) % self.inner.workers.len()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use confab::protocol::{
        Direction, DtlsParameters, DtlsRole, Identity, MediaKind, MediaState, RtpParameters,
    };

    use super::*;
    use crate::backend::test::backend;

    fn config() -> ServerConfig {
        ServerConfig {
            worker_count: 2,
            empty_room_grace: Duration::from_secs(30),
            stats_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    fn manager() -> RoomManager {
        RoomManager::new(config(), Arc::new(backend())).expect("failed to start manager")
    }

    struct Client {
        handle: ConnectionHandle,
        inbox: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl Client {
        fn new(manager: &RoomManager) -> Self {
            let (tx, inbox) = mpsc::unbounded_channel();
            Self {
                handle: manager.connect(tx),
                inbox,
            }
        }

        fn send(&self, request_id: u64, message: ClientMessage) {
            self.handle
                .inbound
                .send(ClientEnvelope {
                    request_id: Some(request_id),
                    message,
                })
                .expect("connection task is gone");
        }

        async fn drain(&mut self) -> Vec<ServerMessage> {
            settle().await;
            let mut messages = vec![];
            while let Ok(message) = self.inbox.try_recv() {
                messages.push(message);
            }
            messages
        }

        async fn response(&mut self, request_id: u64) -> Result<SfuResponse, ErrorCategory> {
            let messages = self.drain().await;
            messages
                .into_iter()
                .find_map(|m| match m {
                    ServerMessage::Response {
                        request_id: id,
                        payload,
                    } if id == request_id => Some(Ok(payload)),
                    ServerMessage::Failure {
                        request_id: id,
                        category,
                        ..
                    } if id == request_id => Some(Err(category)),
                    _ => None,
                })
                .expect("no answer to the request")
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn join_room(room_id: &str, user_id: &str, mode: CallMode, create: bool) -> ClientMessage {
        ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
            identity: Identity {
                user_id: user_id.to_string(),
                display_name: user_id.to_uppercase(),
            },
            mode,
            media: MediaState::default(),
            create,
            rtp_capabilities: None,
        }
    }

    async fn room_exists(manager: &RoomManager, room_id: &str) -> bool {
        manager.summary().await.rooms.iter().any(|r| r.id == room_id)
    }

    #[tokio::test]
    async fn joining_a_missing_room_without_create_fails() {
        let manager = manager();
        let mut alice = Client::new(&manager);

        alice.send(1, join_room("nowhere", "alice", CallMode::Sfu, false));
        assert_eq!(
            alice.response(1).await.err(),
            Some(ErrorCategory::RoomNotFound)
        );

        alice.send(2, join_room("nowhere", "alice", CallMode::Sfu, true));
        assert!(matches!(alice.response(2).await, Ok(SfuResponse::Joined(_))));
    }

    #[tokio::test]
    async fn join_without_request_id_reports_room_not_found_event() {
        let manager = manager();
        let mut alice = Client::new(&manager);
        alice
            .handle
            .inbound
            .send(ClientEnvelope {
                request_id: None,
                message: join_room("nowhere", "alice", CallMode::Mesh, false),
            })
            .expect("connection task is gone");

        let messages = alice.drain().await;
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::RoomNotFound { room_id } if room_id == "nowhere")));
    }

    #[tokio::test]
    async fn joining_with_another_mode_is_a_room_error() {
        let manager = manager();
        let mut alice = Client::new(&manager);
        let mut bob = Client::new(&manager);

        alice.send(1, join_room("standup", "alice", CallMode::Mesh, true));
        assert!(matches!(alice.response(1).await, Ok(SfuResponse::Ack)));

        bob.send(1, join_room("standup", "bob", CallMode::Sfu, true));
        assert_eq!(bob.response(1).await.err(), Some(ErrorCategory::Room));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_rooms_are_deleted_after_the_grace_period() {
        let manager = manager();
        let mut alice = Client::new(&manager);

        alice.send(1, join_room("standup", "alice", CallMode::Sfu, true));
        alice.response(1).await.expect("join failed");
        alice.send(2, ClientMessage::LeaveRoom {
            room_id: "standup".to_string(),
        });
        alice.response(2).await.expect("leave failed");

        tokio::time::advance(Duration::from_secs(29)).await;
        settle().await;
        assert!(room_exists(&manager, "standup").await);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert!(!room_exists(&manager, "standup").await);

        alice.send(3, join_room("standup", "alice", CallMode::Sfu, false));
        assert_eq!(
            alice.response(3).await.err(),
            Some(ErrorCategory::RoomNotFound)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejoining_during_the_grace_period_keeps_the_room() {
        let manager = manager();
        let mut alice = Client::new(&manager);

        alice.send(1, join_room("standup", "alice", CallMode::Mesh, true));
        alice.response(1).await.expect("join failed");
        alice.send(2, ClientMessage::LeaveRoom {
            room_id: "standup".to_string(),
        });
        alice.response(2).await.expect("leave failed");

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        alice.send(3, join_room("standup", "alice", CallMode::Mesh, false));
        alice.response(3).await.expect("rejoin failed");

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(room_exists(&manager, "standup").await);
    }

    #[tokio::test]
    async fn disconnect_closes_producers_and_notifies_consumers() {
        let manager = manager();
        let mut alice = Client::new(&manager);
        let mut bob = Client::new(&manager);

        alice.send(1, join_room("standup", "alice", CallMode::Sfu, true));
        let info = match alice.response(1).await {
            Ok(SfuResponse::Joined(info)) => info,
            other => panic!("unexpected join response {:?}", other),
        };
        bob.send(1, join_room("standup", "bob", CallMode::Sfu, false));
        bob.response(1).await.expect("join failed");

        alice.send(2, ClientMessage::ConnectTransport {
            direction: Direction::Send,
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Client,
                fingerprints: vec![],
            },
        });
        alice.response(2).await.expect("connect failed");
        alice.send(3, ClientMessage::Produce {
            kind: MediaKind::Audio,
            rtp_parameters: RtpParameters::default(),
        });
        let producer_id = match alice.response(3).await {
            Ok(SfuResponse::Produced { producer_id }) => producer_id,
            other => panic!("unexpected produce response {:?}", other),
        };

        let announced = bob.drain().await;
        assert!(announced.iter().any(|m| matches!(
            m,
            ServerMessage::NewProducer { producer } if producer.producer_id == producer_id
        )));

        bob.send(2, ClientMessage::Consume {
            producer_id: producer_id.clone(),
            rtp_capabilities: info.router_rtp_capabilities.clone(),
        });
        let consumer = match bob.response(2).await {
            Ok(SfuResponse::Consumed(consumer)) => consumer,
            other => panic!("unexpected consume response {:?}", other),
        };
        assert!(consumer.paused);

        drop(alice);
        let messages = bob.drain().await;
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::ConsumerClosed { consumer_id, .. } if *consumer_id == consumer.id
        )));
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::ProducerClosed { producer_id: id, .. } if *id == producer_id
        )));
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::UserLeft { .. })));
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let manager = manager();
        let mut alice = Client::new(&manager);
        alice.send(1, ClientMessage::Ping);
        let messages = alice.drain().await;
        assert!(matches!(messages.as_slice(), [ServerMessage::Pong]));
    }

    #[tokio::test]
    async fn requests_before_joining_are_invalid() {
        let manager = manager();
        let mut alice = Client::new(&manager);
        alice.send(1, ClientMessage::CloseProducer {
            kind: MediaKind::Video,
        });
        assert_eq!(
            alice.response(1).await.err(),
            Some(ErrorCategory::InvalidRequest)
        );

        let text = manager.export().expect("failed to export");
        assert!(text.contains("confab_errors_total{category=\"invalid-request\"} 1"));
    }

    #[tokio::test]
    async fn joined_peers_show_up_in_health_and_metrics() {
        let manager = manager();
        let mut alice = Client::new(&manager);
        alice.send(1, join_room("standup", "alice", CallMode::Sfu, true));
        alice.response(1).await.expect("join failed");

        let summary = manager.summary().await;
        assert_eq!(summary.status, "ok");
        assert_eq!(summary.rooms.len(), 1);
        assert_eq!(summary.rooms[0].peers, 1);
        assert!(manager.is_ready());

        let text = manager.export().expect("failed to export");
        assert!(text.contains("confab_active_peers 1"));
        assert!(text.contains("confab_active_transports 2"));
    }
}
