use std::{collections::HashMap, sync::Arc, time::Duration};

use confab::protocol::{CallMode, ClientMessage, PeerId, RoomId, SfuResponse};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use crate::{
    backend::MediaBackend,
    config::ServerConfig,
    error::{Error, RoomErrorKind},
    metrics::{Metrics, RoomSummary},
    room::{JoinParams, Room},
    router::Router,
};

pub(crate) enum WorkerCommand {
    Join {
        room_id: RoomId,
        mode: CallMode,
        create: bool,
        join: JoinParams,
        reply: oneshot::Sender<Result<SfuResponse, Error>>,
    },
    Request {
        room_id: RoomId,
        peer_id: PeerId,
        message: ClientMessage,
        reply: oneshot::Sender<Result<SfuResponse, Error>>,
    },
    Leave {
        room_id: RoomId,
        peer_id: PeerId,
        reply: oneshot::Sender<bool>,
    },
    DeleteIfEmpty {
        room_id: RoomId,
        generation: u64,
    },
    Summary {
        reply: oneshot::Sender<Vec<RoomSummary>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Address of a worker task.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub index: usize,
    sender: mpsc::UnboundedSender<WorkerCommand>,
}

impl WorkerHandle {
    fn closed() -> Error {
        Error::new_room(
            "worker is not running".to_string(),
            RoomErrorKind::WorkerClosedError,
        )
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> WorkerCommand,
    ) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .map_err(|_| Self::closed())?;
        rx.await.map_err(|_| Self::closed())
    }

    pub(crate) async fn join(
        &self,
        room_id: RoomId,
        mode: CallMode,
        create: bool,
        join: JoinParams,
    ) -> Result<SfuResponse, Error> {
        self.call(|reply| WorkerCommand::Join {
            room_id,
            mode,
            create,
            join,
            reply,
        })
        .await?
    }

    pub(crate) async fn request(
        &self,
        room_id: RoomId,
        peer_id: PeerId,
        message: ClientMessage,
    ) -> Result<SfuResponse, Error> {
        self.call(|reply| WorkerCommand::Request {
            room_id,
            peer_id,
            message,
            reply,
        })
        .await?
    }

    pub(crate) async fn leave(&self, room_id: RoomId, peer_id: PeerId) -> bool {
        self.call(|reply| WorkerCommand::Leave {
            room_id,
            peer_id,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub(crate) async fn summary(&self) -> Vec<RoomSummary> {
        self.call(|reply| WorkerCommand::Summary { reply })
            .await
            .unwrap_or_default()
    }

    pub(crate) async fn close(&self) {
        let _ = self.call(|reply| WorkerCommand::Close { reply }).await;
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// An actor owning a share of the rooms. Rooms are only touched from its task.
pub(crate) struct Worker {
    index: usize,
    rooms: HashMap<RoomId, Room>,
    backend: Arc<dyn MediaBackend>,
    room_index: Arc<DashMap<RoomId, usize>>,
    metrics: Metrics,
    empty_room_grace: Duration,
    commands: mpsc::WeakUnboundedSender<WorkerCommand>,
}

impl Worker {
    pub(crate) fn spawn(
        index: usize,
        config: &ServerConfig,
        backend: Arc<dyn MediaBackend>,
        room_index: Arc<DashMap<RoomId, usize>>,
        metrics: Metrics,
    ) -> WorkerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            index,
            rooms: HashMap::new(),
            backend,
            room_index,
            metrics,
            empty_room_grace: config.empty_room_grace,
            commands: tx.downgrade(),
        };
        let stats_interval = config.stats_interval;
        tokio::spawn(async move {
            worker.run(rx, stats_interval).await;
        });

        WorkerHandle { index, sender: tx }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
        stats_interval: Duration,
    ) {
        tracing::debug!("worker {} started", self.index);
        let mut stats = tokio::time::interval(stats_interval);
        stats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(WorkerCommand::Close { reply }) => {
                            self.close_all().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle(command).await,
                        None => {
                            self.close_all().await;
                            break;
                        }
                    }
                }
                _ = stats.tick() => {
                    for room in self.rooms.values_mut() {
                        room.collect_stats().await;
                    }
                }
            }
        }
        tracing::debug!("worker {} finished", self.index);
    }

    async fn handle(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Join {
                room_id,
                mode,
                create,
                join,
                reply,
            } => {
                let result = self.join(&room_id, mode, create, join).await;
                let _ = reply.send(result);
            }
            WorkerCommand::Request {
                room_id,
                peer_id,
                message,
                reply,
            } => {
                let result = match self.rooms.get_mut(&room_id) {
                    Some(room) => room.handle(&peer_id, message).await,
                    None => Err(room_not_found(&room_id)),
                };
                let _ = reply.send(result);
            }
            WorkerCommand::Leave {
                room_id,
                peer_id,
                reply,
            } => {
                let left = match self.rooms.get_mut(&room_id) {
                    Some(room) => room.leave(&peer_id).await,
                    None => false,
                };
                self.schedule_if_empty(&room_id);
                let _ = reply.send(left);
            }
            WorkerCommand::DeleteIfEmpty {
                room_id,
                generation,
            } => self.delete_if_empty(&room_id, generation).await,
            WorkerCommand::Summary { reply } => {
                let _ = reply.send(self.rooms.values().map(Room::summary).collect());
            }
            WorkerCommand::Close { .. } => {}
        }
    }

    async fn join(
        &mut self,
        room_id: &str,
        mode: CallMode,
        create: bool,
        join: JoinParams,
    ) -> Result<SfuResponse, Error> {
        if !self.rooms.contains_key(room_id) {
            if !create {
                return Err(room_not_found(room_id));
            }
            let room = match self.open_room(room_id, mode).await {
                Ok(room) => room,
                Err(err) => {
                    let index = self.index;
                    self.room_index.remove_if(room_id, |_, worker| *worker == index);
                    return Err(err);
                }
            };
            self.rooms.insert(room_id.to_string(), room);
        }
        self.room_index.insert(room_id.to_string(), self.index);

        let room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| room_not_found(room_id))?;
        if room.mode != mode {
            return Err(Error::new_room(
                format!("room {} is a {} room", room_id, mode_name(room.mode)),
                RoomErrorKind::ModeMismatchError,
            ));
        }
        let result = room.join(join).await;
        self.schedule_if_empty(room_id);
        result
    }

    async fn open_room(&self, room_id: &str, mode: CallMode) -> Result<Room, Error> {
        let router = match mode {
            CallMode::Sfu => Some(Router::new(self.backend.create_router(room_id).await?)),
            CallMode::Mesh => None,
        };
        tracing::info!(
            "room {} ({}) opened on worker {}",
            room_id,
            mode_name(mode),
            self.index
        );
        Ok(Room::new(
            room_id.to_string(),
            mode,
            router,
            self.metrics.clone(),
        ))
    }

    /// Deletes `room_id` after the grace period unless somebody joins meanwhile.
    fn schedule_if_empty(&self, room_id: &str) {
        let generation = match self.rooms.get(room_id) {
            Some(room) if room.is_empty() => room.generation,
            _ => return,
        };
        tracing::debug!(
            "room {} is empty, deleting it in {:?}",
            room_id,
            self.empty_room_grace
        );

        let commands = self.commands.clone();
        let grace = self.empty_room_grace;
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(WorkerCommand::DeleteIfEmpty {
                    room_id,
                    generation,
                });
            }
        });
    }

    async fn delete_if_empty(&mut self, room_id: &str, generation: u64) {
        let expired = self
            .rooms
            .get(room_id)
            .map(|room| room.is_empty() && room.generation == generation)
            .unwrap_or(false);
        if !expired {
            return;
        }
        if let Some(mut room) = self.rooms.remove(room_id) {
            room.close().await;
        }
        let index = self.index;
        self.room_index.remove_if(room_id, |_, worker| *worker == index);
    }

    async fn close_all(&mut self) {
        for (room_id, mut room) in self.rooms.drain() {
            room.close().await;
            self.room_index.remove(&room_id);
        }
    }
}

fn room_not_found(room_id: &str) -> Error {
    Error::new_room(
        format!("room {} does not exist", room_id),
        RoomErrorKind::NotFoundError,
    )
}

fn mode_name(mode: CallMode) -> &'static str {
    match mode {
        CallMode::Mesh => "mesh",
        CallMode::Sfu => "sfu",
    }
}
