use std::collections::HashMap;

use chrono::{DateTime, Utc};
use confab::protocol::{
    CallMode, ClientMessage, Direction, DtlsParameters, Identity, Layers, MediaKind, MediaState,
    PeerId, ProducerInfo, RoomId, RtpCapabilities, RtpParameters, ServerMessage, SfuJoinInfo,
    SfuResponse,
};

use crate::{
    consumer::{Consumer, DEFAULT_PRIORITY},
    error::{
        ConsumerErrorKind, Error, PeerErrorKind, ProducerErrorKind, RoomErrorKind,
        TransportErrorKind,
    },
    metrics::{Metrics, RoomSummary},
    peer::{Outbox, Peer},
    producer::Producer,
    router::Router,
    transport::Transport,
};

/// What a connection sends along with `join-room`.
#[derive(Debug)]
pub struct JoinParams {
    pub peer_id: PeerId,
    pub identity: Identity,
    pub media: MediaState,
    pub rtp_capabilities: Option<RtpCapabilities>,
    pub outbox: Outbox,
}

/// A call room and its resource graph: peers, their transports, producers and consumers.
///
/// A room is owned by exactly one worker task; every method runs inside that task, so a
/// cascade started by one method completes before the next command of the room is handled.
#[derive(Debug)]
pub struct Room {
    pub id: RoomId,
    pub mode: CallMode,
    pub created_at: DateTime<Utc>,
    /// Bumped on every join, so a pending deletion can tell the room was reused meanwhile.
    pub generation: u64,
    router: Option<Router>,
    peers: HashMap<PeerId, Peer>,
    producers: HashMap<String, Producer>,
    consumers: HashMap<String, Consumer>,
    metrics: Metrics,
}

impl Room {
    pub fn new(id: RoomId, mode: CallMode, router: Option<Router>, metrics: Metrics) -> Self {
        metrics.room_opened();
        Self {
            id,
            mode,
            created_at: Utc::now(),
            generation: 0,
            router,
            peers: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            metrics,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            id: self.id.clone(),
            mode: self.mode,
            peers: self.peers.len(),
            created_at: self.created_at,
        }
    }

    pub async fn join(&mut self, join: JoinParams) -> Result<SfuResponse, Error> {
        self.generation += 1;

        if let Some(peer) = self.peers.get_mut(&join.peer_id) {
            tracing::debug!("peer {} joined room {} again, replaying", join.peer_id, self.id);
            peer.replace_outbox(join.outbox);
            if join.rtp_capabilities.is_some() {
                peer.rtp_capabilities = join.rtp_capabilities;
            }
            return self.welcome(&join.peer_id);
        }

        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.identity.user_id == join.identity.user_id)
            .map(|p| p.id.clone())
            .collect();
        for peer_id in stale {
            tracing::info!(
                "peer {} of user {} is superseded by {}",
                peer_id,
                join.identity.user_id,
                join.peer_id
            );
            self.remove_peer(&peer_id).await;
        }

        let mut peer = Peer::new(join.peer_id.clone(), join.identity, join.media, join.outbox);
        peer.rtp_capabilities = join.rtp_capabilities;

        if let Some(router) = self.router.clone() {
            let send = router.backend().create_transport(Direction::Send).await?;
            let recv = match router.backend().create_transport(Direction::Recv).await {
                Ok(recv) => recv,
                Err(err) => {
                    router.backend().close_transport(&send.id).await;
                    return Err(err);
                }
            };
            self.metrics.transport_opened();
            self.metrics.transport_opened();
            peer.set_transport(Transport::new(send));
            peer.set_transport(Transport::new(recv));
        }

        tracing::info!("peer {} joined room {}", peer.id, self.id);
        self.metrics.peer_joined();
        let participant = peer.participant();
        self.peers.insert(join.peer_id.clone(), peer);
        self.broadcast(&join.peer_id, ServerMessage::UserJoined { participant });

        self.welcome(&join.peer_id)
    }

    /// Sends the room state to `peer_id` and builds the join response.
    fn welcome(&self, peer_id: &str) -> Result<SfuResponse, Error> {
        let peer = self.peer(peer_id)?;
        let participants = self.peers.values().map(Peer::participant).collect();

        let sfu = match (&self.router, &peer.send_transport, &peer.recv_transport) {
            (Some(router), Some(send), Some(recv)) => Some(SfuJoinInfo {
                router_rtp_capabilities: router.rtp_capabilities().clone(),
                send_transport: send.params.clone(),
                recv_transport: recv.params.clone(),
                existing_producers: self.existing_producers(peer_id),
            }),
            _ => None,
        };

        peer.send(ServerMessage::ExistingParticipants {
            room_id: self.id.clone(),
            self_peer_id: peer_id.to_string(),
            participants,
            sfu: sfu.clone(),
        });

        Ok(match sfu {
            Some(info) => SfuResponse::Joined(info),
            None => SfuResponse::Ack,
        })
    }

    fn existing_producers(&self, peer_id: &str) -> Vec<ProducerInfo> {
        let mut producers: Vec<&Producer> = self
            .producers
            .values()
            .filter(|p| p.peer_id != peer_id)
            .collect();
        producers.sort_by_key(|p| p.created_at);
        producers.into_iter().map(Producer::info).collect()
    }

    /// Removes a peer with every resource it owns. Returns whether the peer was here.
    pub async fn leave(&mut self, peer_id: &str) -> bool {
        self.remove_peer(peer_id).await
    }

    async fn remove_peer(&mut self, peer_id: &str) -> bool {
        let (producer_ids, consumer_ids) = match self.peers.get(peer_id) {
            Some(peer) => (
                peer.producers.values().cloned().collect::<Vec<_>>(),
                peer.consumers.values().cloned().collect::<Vec<_>>(),
            ),
            None => return false,
        };
        for producer_id in producer_ids {
            self.close_producer_by_id(&producer_id).await;
        }
        for consumer_id in consumer_ids {
            self.close_consumer_by_id(&consumer_id, false).await;
        }

        if let Some(mut peer) = self.peers.remove(peer_id) {
            for direction in [Direction::Send, Direction::Recv] {
                if let Some(transport) = peer.take_transport(direction) {
                    self.close_transport(transport).await;
                }
            }
        }
        self.metrics.peer_left();
        tracing::info!("peer {} left room {}", peer_id, self.id);
        self.broadcast(
            peer_id,
            ServerMessage::UserLeft {
                peer_id: peer_id.to_string(),
            },
        );
        true
    }

    async fn close_transport(&self, transport: Transport) {
        if let Some(router) = &self.router {
            router.backend().close_transport(transport.id()).await;
        }
        self.metrics.transport_closed();
    }

    /// Closes a producer and, before returning, every consumer forwarding it.
    async fn close_producer_by_id(&mut self, producer_id: &str) -> Option<ProducerInfo> {
        let producer = self.producers.remove(producer_id)?;
        for consumer_id in producer.consumers.iter() {
            self.close_consumer_by_id(consumer_id, true).await;
        }
        if let Some(router) = &self.router {
            router.backend().close_producer(producer_id).await;
        }
        if let Some(owner) = self.peers.get_mut(&producer.peer_id) {
            if owner.producers.get(&producer.kind).map(String::as_str) == Some(producer_id) {
                owner.producers.remove(&producer.kind);
            }
        }
        self.metrics.producer_closed(producer.kind);
        tracing::debug!("producer {} ({}) of peer {} closed", producer_id, producer.kind, producer.peer_id);

        self.broadcast(
            &producer.peer_id,
            ServerMessage::ProducerClosed {
                producer_id: producer_id.to_string(),
                peer_id: producer.peer_id.clone(),
                kind: producer.kind,
            },
        );
        Some(producer.info())
    }

    async fn close_consumer_by_id(&mut self, consumer_id: &str, notify: bool) {
        let consumer = match self.consumers.remove(consumer_id) {
            Some(consumer) => consumer,
            None => return,
        };
        if let Some(producer) = self.producers.get_mut(&consumer.producer_id) {
            producer.consumers.remove(consumer_id);
        }
        if let Some(router) = &self.router {
            router.backend().close_consumer(consumer_id).await;
        }
        if let Some(peer) = self.peers.get_mut(&consumer.peer_id) {
            peer.consumers.remove(&consumer.producer_id);
            if notify {
                peer.send(ServerMessage::ConsumerClosed {
                    consumer_id: consumer_id.to_string(),
                    producer_id: consumer.producer_id.clone(),
                });
            }
        }
        self.metrics.consumer_closed();
    }

    /// Dispatches every request of a joined peer other than join and leave.
    pub async fn handle(&mut self, peer_id: &str, message: ClientMessage) -> Result<SfuResponse, Error> {
        match message {
            ClientMessage::Offer {
                target_peer_id,
                description,
                kind,
            } => self.relay(
                peer_id,
                &target_peer_id,
                ServerMessage::ReceiveOffer {
                    from_peer_id: peer_id.to_string(),
                    description,
                    kind,
                },
            ),
            ClientMessage::Answer {
                target_peer_id,
                description,
                kind,
            } => self.relay(
                peer_id,
                &target_peer_id,
                ServerMessage::ReceiveAnswer {
                    from_peer_id: peer_id.to_string(),
                    description,
                    kind,
                },
            ),
            ClientMessage::IceCandidate {
                target_peer_id,
                candidate,
                kind,
            } => self.relay(
                peer_id,
                &target_peer_id,
                ServerMessage::ReceiveIceCandidate {
                    from_peer_id: peer_id.to_string(),
                    candidate,
                    kind,
                },
            ),
            ClientMessage::ToggleMedia { kind, enabled, .. } => {
                self.toggle_media(peer_id, kind, enabled)
            }
            ClientMessage::ScreenState { active, .. } => self.screen_state(peer_id, active),
            ClientMessage::ConnectTransport {
                direction,
                dtls_parameters,
            } => {
                self.connect_transport(peer_id, direction, dtls_parameters)
                    .await
            }
            ClientMessage::Produce {
                kind,
                rtp_parameters,
            } => self.produce(peer_id, kind, rtp_parameters).await,
            ClientMessage::Consume {
                producer_id,
                rtp_capabilities,
            } => self.consume(peer_id, &producer_id, rtp_capabilities).await,
            ClientMessage::ResumeConsumer { consumer_id } => {
                self.set_consumer_paused(peer_id, &consumer_id, false).await
            }
            ClientMessage::PauseConsumer { consumer_id } => {
                self.set_consumer_paused(peer_id, &consumer_id, true).await
            }
            ClientMessage::SetConsumerLayers {
                consumer_id,
                layers,
            } => {
                self.set_consumer_layers(peer_id, &consumer_id, layers)
                    .await
            }
            ClientMessage::SetConsumerPriority {
                consumer_id,
                priority,
            } => {
                self.set_consumer_priority(peer_id, &consumer_id, priority)
                    .await
            }
            ClientMessage::RequestKeyframe { consumer_id } => {
                self.request_key_frame(peer_id, &consumer_id).await
            }
            ClientMessage::CloseProducer { kind } => self.close_producer(peer_id, kind).await,
            ClientMessage::RecreateTransport { direction } => {
                self.recreate_transport(peer_id, direction).await
            }
            other => Err(Error::new_room(
                format!("{} is not a room request", other.action()),
                RoomErrorKind::NotJoinedError,
            )),
        }
    }

    /// Forwards a mesh negotiation message to `target_peer_id`.
    fn relay(&self, from: &str, target_peer_id: &str, message: ServerMessage) -> Result<SfuResponse, Error> {
        self.peer(from)?;
        match self.peers.get(target_peer_id) {
            Some(target) => target.send(message),
            None => tracing::warn!(
                "dropping message from {} for {}, not a member of room {}",
                from,
                target_peer_id,
                self.id
            ),
        }
        Ok(SfuResponse::Ack)
    }

    fn toggle_media(&mut self, peer_id: &str, kind: MediaKind, enabled: bool) -> Result<SfuResponse, Error> {
        self.peer_mut(peer_id)?.media.set(kind, enabled);
        self.broadcast(
            peer_id,
            ServerMessage::MediaToggled {
                peer_id: peer_id.to_string(),
                kind,
                enabled,
            },
        );
        Ok(SfuResponse::Ack)
    }

    fn screen_state(&mut self, peer_id: &str, active: bool) -> Result<SfuResponse, Error> {
        self.peer_mut(peer_id)?.media.screen = active;
        self.broadcast(
            peer_id,
            ServerMessage::ScreenStateChanged {
                peer_id: peer_id.to_string(),
                active,
            },
        );
        Ok(SfuResponse::Ack)
    }

    async fn connect_transport(
        &mut self,
        peer_id: &str,
        direction: Direction,
        dtls_parameters: DtlsParameters,
    ) -> Result<SfuResponse, Error> {
        let router = self.sfu_router()?;
        let transport = self
            .peer_mut(peer_id)?
            .transport_mut(direction)
            .ok_or_else(|| transport_missing(peer_id, direction))?;

        if !transport.connected {
            router
                .backend()
                .connect_transport(transport.id(), &dtls_parameters)
                .await?;
            transport.connected = true;
            tracing::debug!("{} transport {} of peer {} connected", direction, transport.id(), peer_id);
        }
        Ok(SfuResponse::TransportConnected {
            transport_id: transport.id().to_string(),
        })
    }

    async fn produce(
        &mut self,
        peer_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<SfuResponse, Error> {
        let router = self.sfu_router()?;
        let peer = self.peer(peer_id)?;
        let transport_id = peer
            .send_transport
            .as_ref()
            .ok_or_else(|| transport_missing(peer_id, Direction::Send))?
            .id()
            .to_string();
        let rtp_parameters = router.producer_rtp_parameters(kind, &rtp_parameters);

        if let Some(existing) = peer.producers.get(&kind) {
            let retry = self
                .producers
                .get(existing)
                .filter(|p| p.is_retry_of(&transport_id, &rtp_parameters))
                .map(|p| p.id.clone());
            if let Some(producer_id) = retry {
                tracing::debug!("produce of {} by {} repeated, keeping {}", kind, peer_id, producer_id);
                return Ok(SfuResponse::Produced { producer_id });
            }
            let replaced = existing.clone();
            tracing::debug!("producer {} ({}) of peer {} is replaced", replaced, kind, peer_id);
            self.close_producer_by_id(&replaced).await;
        }

        let producer_id = router
            .backend()
            .produce(&transport_id, kind, &rtp_parameters)
            .await?;
        let producer = Producer::new(
            producer_id.clone(),
            peer_id.to_string(),
            kind,
            transport_id,
            rtp_parameters,
        );
        let info = producer.info();
        self.producers.insert(producer_id.clone(), producer);
        self.peer_mut(peer_id)?
            .producers
            .insert(kind, producer_id.clone());
        self.metrics.producer_opened(kind);
        tracing::info!("peer {} produces {} as {}", peer_id, kind, producer_id);

        self.broadcast(peer_id, ServerMessage::NewProducer { producer: info });
        Ok(SfuResponse::Produced { producer_id })
    }

    async fn consume(
        &mut self,
        peer_id: &str,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<SfuResponse, Error> {
        let router = self.sfu_router()?;
        let peer = self.peer(peer_id)?;
        if let Some(existing) = peer
            .consumers
            .get(producer_id)
            .and_then(|id| self.consumers.get(id))
        {
            return Ok(SfuResponse::Consumed(existing.params()));
        }
        let transport_id = peer
            .recv_transport
            .as_ref()
            .ok_or_else(|| transport_missing(peer_id, Direction::Recv))?
            .id()
            .to_string();

        let producer = self.producers.get(producer_id).ok_or_else(|| {
            Error::new_producer(
                format!("producer {} does not exist", producer_id),
                ProducerErrorKind::NotFoundError,
            )
        })?;
        if producer.peer_id == peer_id {
            return Err(Error::new_consumer(
                format!("peer {} cannot consume its own producer", peer_id),
                ConsumerErrorKind::CannotConsumeError,
            ));
        }
        let rtp_parameters = router
            .consumer_rtp_parameters(&producer.rtp_parameters, &rtp_capabilities)
            .ok_or_else(|| {
                Error::new_consumer(
                    format!("peer {} cannot decode producer {}", peer_id, producer_id),
                    ConsumerErrorKind::CannotConsumeError,
                )
            })?;
        let kind = producer.kind;
        let producer_peer_id = producer.peer_id.clone();

        let consumer_id = router
            .backend()
            .consume(&transport_id, producer_id, &rtp_parameters)
            .await?;
        let consumer = Consumer {
            id: consumer_id.clone(),
            peer_id: peer_id.to_string(),
            producer_id: producer_id.to_string(),
            producer_peer_id,
            kind,
            transport_id,
            rtp_parameters,
            paused: true,
            priority: DEFAULT_PRIORITY,
            preferred_layers: None,
        };
        let params = consumer.params();

        if let Some(producer) = self.producers.get_mut(producer_id) {
            producer.consumers.insert(consumer_id.clone());
        }
        let peer = self.peer_mut(peer_id)?;
        peer.consumers
            .insert(producer_id.to_string(), consumer_id.clone());
        peer.rtp_capabilities = Some(rtp_capabilities);
        self.consumers.insert(consumer_id, consumer);
        self.metrics.consumer_opened();

        Ok(SfuResponse::Consumed(params))
    }

    fn owned_consumer(&mut self, peer_id: &str, consumer_id: &str) -> Result<&mut Consumer, Error> {
        self.consumers
            .get_mut(consumer_id)
            .filter(|c| c.peer_id == peer_id)
            .ok_or_else(|| {
                Error::new_consumer(
                    format!("consumer {} does not exist", consumer_id),
                    ConsumerErrorKind::NotFoundError,
                )
            })
    }

    async fn set_consumer_paused(
        &mut self,
        peer_id: &str,
        consumer_id: &str,
        paused: bool,
    ) -> Result<SfuResponse, Error> {
        let router = self.sfu_router()?;
        let consumer = self.owned_consumer(peer_id, consumer_id)?;
        if consumer.paused != paused {
            router
                .backend()
                .set_consumer_paused(consumer_id, paused)
                .await?;
            consumer.paused = paused;
        }
        Ok(SfuResponse::Ack)
    }

    async fn set_consumer_layers(
        &mut self,
        peer_id: &str,
        consumer_id: &str,
        layers: Layers,
    ) -> Result<SfuResponse, Error> {
        let router = self.sfu_router()?;
        let consumer = self.owned_consumer(peer_id, consumer_id)?;
        let layers = consumer.clamp_layers(layers);
        router
            .backend()
            .set_consumer_preferred_layers(consumer_id, layers)
            .await?;
        consumer.preferred_layers = Some(layers);
        Ok(SfuResponse::Ack)
    }

    async fn set_consumer_priority(
        &mut self,
        peer_id: &str,
        consumer_id: &str,
        priority: u8,
    ) -> Result<SfuResponse, Error> {
        let router = self.sfu_router()?;
        let priority = Consumer::check_priority(priority)?;
        let consumer = self.owned_consumer(peer_id, consumer_id)?;
        router
            .backend()
            .set_consumer_priority(consumer_id, priority)
            .await?;
        consumer.priority = priority;
        Ok(SfuResponse::Ack)
    }

    async fn request_key_frame(&mut self, peer_id: &str, consumer_id: &str) -> Result<SfuResponse, Error> {
        let router = self.sfu_router()?;
        self.owned_consumer(peer_id, consumer_id)?;
        router.backend().request_key_frame(consumer_id).await?;
        Ok(SfuResponse::Ack)
    }

    async fn close_producer(&mut self, peer_id: &str, kind: MediaKind) -> Result<SfuResponse, Error> {
        let producer_id = self.peer(peer_id)?.producers.get(&kind).cloned();
        if let Some(producer_id) = producer_id {
            self.close_producer_by_id(&producer_id).await;
        }
        Ok(SfuResponse::Ack)
    }

    async fn recreate_transport(
        &mut self,
        peer_id: &str,
        direction: Direction,
    ) -> Result<SfuResponse, Error> {
        let router = self.sfu_router()?;
        let peer = self.peer(peer_id)?;
        match direction {
            Direction::Send => {
                let producer_ids: Vec<String> = peer.producers.values().cloned().collect();
                for producer_id in producer_ids {
                    self.close_producer_by_id(&producer_id).await;
                }
            }
            Direction::Recv => {
                let consumer_ids: Vec<String> = peer.consumers.values().cloned().collect();
                for consumer_id in consumer_ids {
                    self.close_consumer_by_id(&consumer_id, false).await;
                }
            }
        }
        if let Some(old) = self.peer_mut(peer_id)?.take_transport(direction) {
            self.close_transport(old).await;
        }

        let transport = router.backend().create_transport(direction).await?;
        self.metrics.transport_opened();
        self.peer_mut(peer_id)?
            .set_transport(Transport::new(transport.clone()));
        tracing::info!("{} transport of peer {} recreated as {}", direction, peer_id, transport.id);

        let existing_producers = match direction {
            Direction::Recv => self.existing_producers(peer_id),
            Direction::Send => vec![],
        };
        Ok(SfuResponse::TransportRecreated {
            transport,
            existing_producers,
        })
    }

    /// Adds the media bytes moved since the last call to the metrics.
    pub async fn collect_stats(&mut self) {
        let router = match &self.router {
            Some(router) => router.clone(),
            None => return,
        };
        for peer in self.peers.values_mut() {
            for direction in [Direction::Send, Direction::Recv] {
                if let Some(transport) = peer.transport_mut(direction) {
                    match router.backend().transport_stats(transport.id()).await {
                        Ok(stats) => {
                            let (received, sent) = transport.advance(stats);
                            self.metrics.bytes(received, sent);
                        }
                        Err(err) => tracing::warn!("failed to read stats of {}: {}", transport.id(), err),
                    }
                }
            }
        }
    }

    /// Closes every peer and the router.
    pub async fn close(&mut self) {
        let peer_ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        for peer_id in peer_ids {
            self.remove_peer(&peer_id).await;
        }
        if let Some(router) = self.router.take() {
            router.close().await;
        }
        self.metrics.room_closed();
        tracing::info!("room {} closed", self.id);
    }

    fn broadcast(&self, except: &str, message: ServerMessage) {
        self.peers
            .values()
            .filter(|p| p.id != except)
            .for_each(|p| p.send(message.clone()));
    }

    fn sfu_router(&self) -> Result<Router, Error> {
        self.router.clone().ok_or_else(|| {
            Error::new_room(
                format!("room {} is a mesh room", self.id),
                RoomErrorKind::ModeMismatchError,
            )
        })
    }

    fn peer(&self, peer_id: &str) -> Result<&Peer, Error> {
        self.peers.get(peer_id).ok_or_else(|| peer_missing(peer_id))
    }

    fn peer_mut(&mut self, peer_id: &str) -> Result<&mut Peer, Error> {
        self.peers.get_mut(peer_id).ok_or_else(|| peer_missing(peer_id))
    }
}

fn peer_missing(peer_id: &str) -> Error {
    Error::new_peer(
        format!("peer {} is not in this room", peer_id),
        PeerErrorKind::NotFoundError,
    )
}

fn transport_missing(peer_id: &str, direction: Direction) -> Error {
    Error::new_transport(
        format!("peer {} has no {} transport", peer_id, direction),
        TransportErrorKind::NotFoundError,
    )
}
