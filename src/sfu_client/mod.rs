//! SFU calls: one send and one receive transport per session, producers for local media and
//! consumers for everything the other peers produce.
//!
//! Like the mesh engine this is a single task consuming one queue. Transport callbacks, retry
//! timers, signaling events and commands from the session all arrive through it.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use enclose::enc;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::RecoveryConfig,
    error::{DeviceErrorKind, Error, RoomErrorKind, SignalingErrorKind, TransportErrorKind},
    media::{LocalMedia, LocalTrack},
    protocol::{
        CallMode, ClientMessage, Direction, DtlsParameters, Identity, Layers, MediaKind,
        Participant, PeerId, ProducerInfo, RoomId, RtpParameters, ServerMessage, SfuJoinInfo,
        SfuResponse,
    },
    quality::{LayerControl, QualityLevel, QualitySample, StatsSource},
    session::CallEvent,
    signaling::{JoinRequest, SignalEvent, SignalingClient},
    speaker::EnergySource,
};

pub mod device;
pub mod simulcast;

pub use device::{
    Device, LocalProducer, RecvTransport, RemoteConsumer, SendTransport, TransportHandler,
    TransportState,
};

/// Priority given to the consumer of the dominant speaker's video.
const DOMINANT_PRIORITY: u8 = 255;
const BACKGROUND_PRIORITY: u8 = 1;

pub(crate) enum SfuCommand {
    Join {
        room_id: RoomId,
        identity: Identity,
        create: bool,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    SetMediaEnabled {
        kind: MediaKind,
        enabled: bool,
        track: Option<LocalTrack>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    StartScreenShare {
        track: LocalTrack,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    StopScreenShare {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    SetPreferredLayers {
        consumer_id: String,
        layers: Layers,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    SetPriority {
        consumer_id: String,
        priority: u8,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    RequestKeyFrame {
        consumer_id: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    OverrideQuality {
        peer_id: PeerId,
        pinned: bool,
        reply: oneshot::Sender<Vec<String>>,
    },
    ApplyQuality {
        consumer_id: String,
        level: QualityLevel,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    DominantSpeaker {
        peer_id: Option<PeerId>,
        reply: oneshot::Sender<SpeakerBoost>,
    },
    CollectStats {
        reply: oneshot::Sender<Vec<(String, QualitySample)>>,
    },
    CollectEnergy {
        reply: oneshot::Sender<Vec<(PeerId, f32)>>,
    },
    Snapshot {
        reply: oneshot::Sender<SfuSnapshot>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) enum SfuInput {
    Signal(SignalEvent),
    TransportState {
        direction: Direction,
        transport_id: String,
        state: TransportState,
    },
    RetryElapsed {
        direction: Direction,
        generation: u64,
    },
    Command(SfuCommand),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSummary {
    pub id: String,
    pub producer_id: String,
    pub peer_id: PeerId,
    pub kind: MediaKind,
}

/// Video consumers whose layers follow the dominant speaker. `promoted` should be pinned
/// to [`QualityLevel::High`], `demoted` returned to automatic selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpeakerBoost {
    pub promoted: Vec<String>,
    pub demoted: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SfuSnapshot {
    pub room_id: Option<RoomId>,
    pub local_peer_id: Option<PeerId>,
    pub participants: Vec<Participant>,
    pub send_transport: Option<String>,
    pub recv_transport: Option<String>,
    pub producers: Vec<(MediaKind, String)>,
    pub consumers: Vec<ConsumerSummary>,
    pub recovering: Vec<Direction>,
}

struct ConsumerEntry {
    consumer: Arc<dyn RemoteConsumer>,
    peer_id: PeerId,
    kind: MediaKind,
    producer_id: String,
}

/// An ongoing transport recovery. Retry timers carry the generation they were scheduled for,
/// so a timer from an earlier recovery never acts on a later one.
struct Recovery {
    generation: u64,
    attempts: u32,
    /// Kinds that were being produced when the send transport broke.
    kinds: Vec<MediaKind>,
}

#[derive(Default)]
pub struct SfuState {
    pub room_id: Option<RoomId>,
    pub local_peer_id: Option<PeerId>,
    pub participants: HashMap<PeerId, Participant>,
    send_transport: Option<Arc<dyn SendTransport>>,
    recv_transport: Option<Arc<dyn RecvTransport>>,
    producers: HashMap<MediaKind, Arc<dyn LocalProducer>>,
    consumers: HashMap<String, ConsumerEntry>,
    overridden: HashSet<String>,
    /// Consumers pinned high because their peer is the dominant speaker.
    boosted: HashSet<String>,
    recoveries: HashMap<Direction, Recovery>,
    next_generation: u64,
}

/// Handle to a running [`SfuEngine`].
#[derive(Clone)]
pub struct SfuHandle {
    inputs: mpsc::UnboundedSender<SfuInput>,
}

impl SfuHandle {
    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SfuCommand,
    ) -> Result<T, Error> {
        let (reply, response) = oneshot::channel();
        self.inputs
            .send(SfuInput::Command(command(reply)))
            .map_err(|_| Self::stopped())?;
        response.await.map_err(|_| Self::stopped())
    }

    fn stopped() -> Error {
        Error::new_room(
            "sfu session has stopped".to_string(),
            RoomErrorKind::NotJoinedError,
        )
    }

    pub async fn join(&self, room_id: &str, identity: Identity, create: bool) -> Result<(), Error> {
        self.call(|reply| SfuCommand::Join {
            room_id: room_id.to_string(),
            identity,
            create,
            reply,
        })
        .await?
    }

    pub async fn set_media_enabled(
        &self,
        kind: MediaKind,
        enabled: bool,
        track: Option<LocalTrack>,
    ) -> Result<(), Error> {
        self.call(|reply| SfuCommand::SetMediaEnabled {
            kind,
            enabled,
            track,
            reply,
        })
        .await?
    }

    pub async fn start_screen_share(&self, track: LocalTrack) -> Result<(), Error> {
        self.call(|reply| SfuCommand::StartScreenShare { track, reply })
            .await?
    }

    pub async fn stop_screen_share(&self) -> Result<(), Error> {
        self.call(|reply| SfuCommand::StopScreenShare { reply })
            .await?
    }

    pub async fn set_preferred_layers(&self, consumer_id: &str, layers: Layers) -> Result<(), Error> {
        self.call(|reply| SfuCommand::SetPreferredLayers {
            consumer_id: consumer_id.to_string(),
            layers,
            reply,
        })
        .await?
    }

    pub async fn set_priority(&self, consumer_id: &str, priority: u8) -> Result<(), Error> {
        self.call(|reply| SfuCommand::SetPriority {
            consumer_id: consumer_id.to_string(),
            priority,
            reply,
        })
        .await?
    }

    pub async fn request_key_frame(&self, consumer_id: &str) -> Result<(), Error> {
        self.call(|reply| SfuCommand::RequestKeyFrame {
            consumer_id: consumer_id.to_string(),
            reply,
        })
        .await?
    }

    /// Marks the video consumers of `peer_id` as manually pinned (or not) and returns their ids.
    pub async fn override_quality(&self, peer_id: &str, pinned: bool) -> Result<Vec<String>, Error> {
        self.call(|reply| SfuCommand::OverrideQuality {
            peer_id: peer_id.to_string(),
            pinned,
            reply,
        })
        .await
    }

    /// Gives the dominant speaker's video the top priority and reports whose layers to pin.
    pub async fn dominant_speaker(&self, peer_id: Option<PeerId>) -> Result<SpeakerBoost, Error> {
        self.call(|reply| SfuCommand::DominantSpeaker { peer_id, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<SfuSnapshot, Error> {
        self.call(|reply| SfuCommand::Snapshot { reply }).await
    }

    /// Closes every transport, producer and consumer, stops local media and leaves the room.
    pub async fn leave(&self) -> Result<(), Error> {
        self.call(|reply| SfuCommand::Leave { reply }).await
    }
}

#[async_trait]
impl StatsSource for SfuHandle {
    async fn video_consumer_stats(&self) -> Result<Vec<(String, QualitySample)>, Error> {
        self.call(|reply| SfuCommand::CollectStats { reply }).await
    }
}

#[async_trait]
impl LayerControl for SfuHandle {
    async fn apply_quality(&self, consumer_id: &str, level: QualityLevel) -> Result<(), Error> {
        self.call(|reply| SfuCommand::ApplyQuality {
            consumer_id: consumer_id.to_string(),
            level,
            reply,
        })
        .await?
    }
}

#[async_trait]
impl EnergySource for SfuHandle {
    async fn energies(&self) -> Result<Vec<(PeerId, f32)>, Error> {
        self.call(|reply| SfuCommand::CollectEnergy { reply }).await
    }
}

/// Wires transport callbacks to signaling round trips and transport state to the engine queue.
struct SignalingTransportHandler {
    signaling: SignalingClient,
    inputs: mpsc::WeakUnboundedSender<SfuInput>,
}

#[async_trait]
impl TransportHandler for SignalingTransportHandler {
    async fn on_connect(
        &self,
        direction: Direction,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), Error> {
        match self
            .signaling
            .request(ClientMessage::ConnectTransport {
                direction,
                dtls_parameters,
            })
            .await?
        {
            SfuResponse::TransportConnected { transport_id } => {
                tracing::debug!("{} transport {} connected", direction, transport_id);
                Ok(())
            }
            SfuResponse::Ack => Ok(()),
            other => Err(unexpected("connect-transport", other)),
        }
    }

    async fn on_produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String, Error> {
        match self
            .signaling
            .request(ClientMessage::Produce {
                kind,
                rtp_parameters,
            })
            .await?
        {
            SfuResponse::Produced { producer_id } => Ok(producer_id),
            other => Err(unexpected("produce", other)),
        }
    }

    fn on_state_change(&self, direction: Direction, transport_id: &str, state: TransportState) {
        tracing::debug!("{} transport {} is {:?}", direction, transport_id, state);
        if let Some(inputs) = self.inputs.upgrade() {
            let _ = inputs.send(SfuInput::TransportState {
                direction,
                transport_id: transport_id.to_string(),
                state,
            });
        }
    }
}

fn unexpected(action: &str, response: SfuResponse) -> Error {
    Error::new_signaling(
        format!("unexpected response to {}: {:?}", action, response),
        SignalingErrorKind::UnexpectedResponseError,
    )
}

fn consumer_missing(consumer_id: &str) -> Error {
    Error::new_transport(
        format!("consumer {} does not exist", consumer_id),
        TransportErrorKind::ConsumeError,
    )
}

pub struct SfuEngine {
    state: SfuState,
    media: LocalMedia,
    signaling: SignalingClient,
    device: Arc<dyn Device>,
    handler: Arc<dyn TransportHandler>,
    config: RecoveryConfig,
    events: broadcast::Sender<CallEvent>,
    inputs: mpsc::WeakUnboundedSender<SfuInput>,
    shutdown: CancellationToken,
}

impl SfuEngine {
    pub fn spawn(
        signaling: SignalingClient,
        device: Arc<dyn Device>,
        media: LocalMedia,
        config: RecoveryConfig,
        events: broadcast::Sender<CallEvent>,
    ) -> SfuHandle {
        let (inputs, inputs_receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let mut signal_receiver = signaling.subscribe();
        let forward = inputs.downgrade();
        tokio::spawn(enc!((shutdown) async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = signal_receiver.recv() => match event {
                        Ok(event) => {
                            let Some(inputs) = forward.upgrade() else {
                                break;
                            };
                            if inputs.send(SfuInput::Signal(event)).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("sfu session skipped {} signaling events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("sfu signaling forwarder finished");
        }));

        let handler = Arc::new(SignalingTransportHandler {
            signaling: signaling.clone(),
            inputs: inputs.downgrade(),
        });
        let engine = SfuEngine {
            state: SfuState::default(),
            media,
            signaling,
            device,
            handler,
            config,
            events,
            inputs: inputs.downgrade(),
            shutdown,
        };
        tokio::spawn(engine.run(inputs_receiver));

        SfuHandle { inputs }
    }

    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<SfuInput>) {
        while let Some(input) = inputs.recv().await {
            match input {
                SfuInput::Command(SfuCommand::Leave { reply }) => {
                    self.leave().await;
                    let _ = reply.send(());
                    self.shutdown.cancel();
                    tracing::info!("sfu session finished");
                    return;
                }
                input => self.handle_input(input).await,
            }
        }
        self.leave().await;
        self.shutdown.cancel();
        tracing::info!("sfu session finished");
    }

    async fn handle_input(&mut self, input: SfuInput) {
        match input {
            SfuInput::Signal(SignalEvent::Message(message)) => self.handle_message(message).await,
            SfuInput::Signal(SignalEvent::Disconnected) => {
                self.emit(CallEvent::SignalingDisconnected)
            }
            SfuInput::Signal(SignalEvent::Reconnected) => {
                // The replayed join answers with a fresh existing-participants.
                self.emit(CallEvent::SignalingReconnected)
            }
            SfuInput::TransportState {
                direction,
                transport_id,
                state,
            } => self.handle_transport_state(direction, transport_id, state),
            SfuInput::RetryElapsed {
                direction,
                generation,
            } => self.handle_retry(direction, generation).await,
            SfuInput::Command(command) => self.handle_command(command).await,
        }
    }

    async fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::ExistingParticipants {
                room_id,
                self_peer_id,
                participants,
                sfu,
            } => {
                self.state.room_id = Some(room_id.clone());
                self.state.local_peer_id = Some(self_peer_id.clone());
                self.state.participants = participants
                    .iter()
                    .filter(|p| p.peer_id != self_peer_id)
                    .map(|p| (p.peer_id.clone(), p.clone()))
                    .collect();

                if let Some(info) = sfu {
                    let current = self.state.send_transport.as_ref().map(|t| t.id().to_string());
                    if current.as_deref() != Some(info.send_transport.id.as_str()) {
                        tracing::info!("rebuilding transports for room {}", room_id);
                        if let Err(err) = self.establish(info).await {
                            tracing::error!("failed to rebuild transports: {}", err);
                            self.emit(CallEvent::SessionLost {
                                reason: err.to_string(),
                            });
                        }
                    }
                }
                self.emit(CallEvent::Joined {
                    room_id,
                    self_peer_id,
                    participants,
                });
            }
            ServerMessage::UserJoined { participant } => {
                tracing::info!("{} joined", participant.peer_id);
                self.state
                    .participants
                    .insert(participant.peer_id.clone(), participant.clone());
                self.emit(CallEvent::ParticipantJoined(participant));
            }
            ServerMessage::UserLeft { peer_id } => {
                tracing::info!("{} left", peer_id);
                self.state.participants.remove(&peer_id);
                let ids: Vec<String> = self
                    .state
                    .consumers
                    .iter()
                    .filter(|(_, entry)| entry.peer_id == peer_id)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in ids {
                    self.close_consumer(&id).await;
                }
                self.emit(CallEvent::ParticipantLeft { peer_id });
            }
            ServerMessage::NewProducer { producer } => {
                let producer_id = producer.producer_id.clone();
                if let Err(err) = self.consume(producer).await {
                    tracing::error!("failed to consume {}: {}", producer_id, err);
                }
            }
            ServerMessage::ProducerClosed { producer_id, .. } => {
                let ids: Vec<String> = self
                    .state
                    .consumers
                    .iter()
                    .filter(|(_, entry)| entry.producer_id == producer_id)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in ids {
                    self.close_consumer(&id).await;
                }
            }
            ServerMessage::ConsumerClosed { consumer_id, .. } => {
                self.close_consumer(&consumer_id).await;
            }
            ServerMessage::MediaToggled {
                peer_id,
                kind,
                enabled,
            } => {
                if let Some(participant) = self.state.participants.get_mut(&peer_id) {
                    participant.media.set(kind, enabled);
                }
                self.emit(CallEvent::MediaToggled {
                    peer_id,
                    kind,
                    enabled,
                });
            }
            ServerMessage::ScreenStateChanged { peer_id, active } => {
                if let Some(participant) = self.state.participants.get_mut(&peer_id) {
                    participant.media.screen = active;
                }
                self.emit(CallEvent::ScreenShareChanged { peer_id, active });
            }
            ServerMessage::RoomNotFound { room_id } => {
                self.emit(CallEvent::RoomError {
                    message: format!("room {} does not exist", room_id),
                });
            }
            ServerMessage::RoomError { message } => {
                self.emit(CallEvent::RoomError { message });
            }
            other => {
                tracing::debug!("sfu session ignores {:?}", other);
            }
        }
    }

    async fn handle_command(&mut self, command: SfuCommand) {
        match command {
            SfuCommand::Join {
                room_id,
                identity,
                create,
                reply,
            } => {
                let result = self.join(room_id, identity, create).await;
                let _ = reply.send(result);
            }
            SfuCommand::SetMediaEnabled {
                kind,
                enabled,
                track,
                reply,
            } => {
                let result = self.set_media_enabled(kind, enabled, track).await;
                let _ = reply.send(result);
            }
            SfuCommand::StartScreenShare { track, reply } => {
                let result = self.start_screen_share(track).await;
                let _ = reply.send(result);
            }
            SfuCommand::StopScreenShare { reply } => {
                let result = self.stop_screen_share().await;
                let _ = reply.send(result);
            }
            SfuCommand::SetPreferredLayers {
                consumer_id,
                layers,
                reply,
            } => {
                let result = self.set_preferred_layers(&consumer_id, layers).await;
                let _ = reply.send(result);
            }
            SfuCommand::SetPriority {
                consumer_id,
                priority,
                reply,
            } => {
                let result = self.set_priority(&consumer_id, priority).await;
                let _ = reply.send(result);
            }
            SfuCommand::RequestKeyFrame { consumer_id, reply } => {
                let result = self.request_key_frame(&consumer_id).await;
                let _ = reply.send(result);
            }
            SfuCommand::OverrideQuality {
                peer_id,
                pinned,
                reply,
            } => {
                let ids = self.video_consumers_of(&peer_id);
                for id in ids.iter() {
                    if pinned {
                        self.state.overridden.insert(id.clone());
                        self.state.boosted.remove(id);
                    } else {
                        self.state.overridden.remove(id);
                    }
                }
                let _ = reply.send(ids);
            }
            SfuCommand::ApplyQuality {
                consumer_id,
                level,
                reply,
            } => {
                let result = self.apply_quality(&consumer_id, level).await;
                let _ = reply.send(result);
            }
            SfuCommand::DominantSpeaker { peer_id, reply } => {
                let boost = self.dominant_speaker(peer_id).await;
                let _ = reply.send(boost);
            }
            SfuCommand::CollectStats { reply } => {
                let _ = reply.send(self.collect_stats().await);
            }
            SfuCommand::CollectEnergy { reply } => {
                let _ = reply.send(self.collect_energy().await);
            }
            SfuCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SfuCommand::Leave { reply } => {
                self.leave().await;
                let _ = reply.send(());
            }
        }
    }

    async fn join(&mut self, room_id: RoomId, identity: Identity, create: bool) -> Result<(), Error> {
        let join = JoinRequest {
            room_id: room_id.clone(),
            identity,
            mode: CallMode::Sfu,
            media: self.media.state(),
            create,
            rtp_capabilities: Some(self.device.rtp_capabilities()),
        };
        match self.signaling.join_room_request(join).await? {
            SfuResponse::Joined(info) => {
                self.state.room_id = Some(room_id);
                self.establish(info).await
            }
            other => Err(unexpected("join-room", other)),
        }
    }

    /// Builds both transports from scratch, consumes what the room already produces and
    /// produces every live local track.
    async fn establish(&mut self, info: SfuJoinInfo) -> Result<(), Error> {
        self.close_media_paths().await;
        self.state.recoveries.clear();

        if !self.device.loaded() {
            self.device.load(&info.router_rtp_capabilities).await?;
        }
        let send = self
            .device
            .create_send_transport(&info.send_transport, self.handler.clone())
            .await?;
        let recv = self
            .device
            .create_recv_transport(&info.recv_transport, self.handler.clone())
            .await?;
        tracing::info!("send transport {} and recv transport {} created", send.id(), recv.id());
        self.state.send_transport = Some(send);
        self.state.recv_transport = Some(recv);

        for producer in info.existing_producers {
            let producer_id = producer.producer_id.clone();
            if let Err(err) = self.consume(producer).await {
                tracing::error!("failed to consume {}: {}", producer_id, err);
            }
        }

        for kind in MediaKind::ALL {
            if let Some(track) = self.media.sendable(kind) {
                if let Err(err) = self.produce(kind, track).await {
                    tracing::error!("failed to produce {}: {}", kind, err);
                }
            }
        }
        Ok(())
    }

    async fn produce(&mut self, kind: MediaKind, track: LocalTrack) -> Result<(), Error> {
        if self.state.producers.contains_key(&kind) {
            tracing::debug!("{} is already produced", kind);
            return Ok(());
        }
        if !self.device.can_produce(kind) {
            return Err(Error::new_device(
                format!("device cannot produce {}", kind),
                DeviceErrorKind::UnsupportedError,
            ));
        }
        let send = self
            .state
            .send_transport
            .clone()
            .ok_or_else(|| Error::transport_missing(Direction::Send))?;

        let producer = send.produce(track, simulcast::encodings(kind)).await?;
        tracing::info!("producing {} as {}", kind, producer.id());
        self.state.producers.insert(kind, producer);
        Ok(())
    }

    async fn consume(&mut self, producer: ProducerInfo) -> Result<(), Error> {
        if self.state.local_peer_id.as_deref() == Some(producer.peer_id.as_str()) {
            return Ok(());
        }
        if self
            .state
            .consumers
            .values()
            .any(|entry| entry.producer_id == producer.producer_id)
        {
            return Ok(());
        }
        let recv = self
            .state
            .recv_transport
            .clone()
            .ok_or_else(|| Error::transport_missing(Direction::Recv))?;

        let response = self
            .signaling
            .request(ClientMessage::Consume {
                producer_id: producer.producer_id.clone(),
                rtp_capabilities: self.device.rtp_capabilities(),
            })
            .await;
        let params = match response {
            Ok(SfuResponse::Consumed(params)) => params,
            Ok(other) => return Err(unexpected("consume", other)),
            Err(err) if err.is_resource_not_found() => {
                tracing::debug!("producer {} is already gone: {}", producer.producer_id, err);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let consumer = recv.consume(&params).await?;
        let resumed = self
            .signaling
            .request(ClientMessage::ResumeConsumer {
                consumer_id: params.id.clone(),
            })
            .await;
        if let Err(err) = resumed {
            consumer.close().await;
            if err.is_resource_not_found() {
                tracing::debug!("consumer {} closed before resume", params.id);
                return Ok(());
            }
            return Err(err);
        }
        consumer.resume().await?;

        tracing::info!(
            "consuming {} of {} as {}",
            params.kind,
            params.peer_id,
            params.id
        );
        self.state.consumers.insert(
            params.id.clone(),
            ConsumerEntry {
                consumer,
                peer_id: params.peer_id.clone(),
                kind: params.kind,
                producer_id: params.producer_id,
            },
        );
        self.emit(CallEvent::RemoteTrack {
            peer_id: params.peer_id,
            kind: params.kind,
            track_id: params.id,
        });
        Ok(())
    }

    async fn close_consumer(&mut self, consumer_id: &str) {
        let Some(entry) = self.state.consumers.remove(consumer_id) else {
            return;
        };
        self.state.overridden.remove(consumer_id);
        self.state.boosted.remove(consumer_id);
        entry.consumer.close().await;
        tracing::debug!("consumer {} closed", consumer_id);
        self.emit(CallEvent::RemoteTrackEnded {
            peer_id: entry.peer_id,
            kind: entry.kind,
            track_id: consumer_id.to_string(),
        });
    }

    async fn close_producer(&mut self, kind: MediaKind) {
        let Some(producer) = self.state.producers.remove(&kind) else {
            return;
        };
        producer.close().await;
        if let Err(err) = self
            .signaling
            .request(ClientMessage::CloseProducer { kind })
            .await
        {
            tracing::warn!("failed to close {} producer {}: {}", kind, producer.id(), err);
        }
    }

    fn handle_transport_state(
        &mut self,
        direction: Direction,
        transport_id: String,
        state: TransportState,
    ) {
        let current = match direction {
            Direction::Send => self.state.send_transport.as_ref().map(|t| t.id().to_string()),
            Direction::Recv => self.state.recv_transport.as_ref().map(|t| t.id().to_string()),
        };
        if current.as_deref() != Some(transport_id.as_str()) {
            tracing::debug!("state {:?} of old transport {} ignored", state, transport_id);
            return;
        }

        if state == TransportState::Connected {
            if self.state.recoveries.remove(&direction).is_some() {
                tracing::info!("{} transport recovered on its own", direction);
            }
            return;
        }
        if !state.is_broken() || self.state.recoveries.contains_key(&direction) {
            return;
        }

        self.state.next_generation += 1;
        let generation = self.state.next_generation;
        let kinds = match direction {
            Direction::Send => {
                let mut kinds: Vec<MediaKind> = self.state.producers.keys().copied().collect();
                kinds.sort();
                kinds
            }
            Direction::Recv => vec![],
        };
        tracing::warn!("{} transport {} is {:?}, recovering", direction, transport_id, state);
        self.state.recoveries.insert(
            direction,
            Recovery {
                generation,
                attempts: 0,
                kinds,
            },
        );
        self.schedule_retry(direction, generation);
    }

    fn schedule_retry(&self, direction: Direction, generation: u64) {
        let Some(inputs) = self.inputs.upgrade() else {
            return;
        };
        let delay = self.config.transport_retry_delay;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = sleep(delay) => {
                    let _ = inputs.send(SfuInput::RetryElapsed { direction, generation });
                }
            }
        });
    }

    async fn handle_retry(&mut self, direction: Direction, generation: u64) {
        let (attempt, kinds) = match self.state.recoveries.get_mut(&direction) {
            Some(recovery) if recovery.generation == generation => {
                recovery.attempts += 1;
                (recovery.attempts, recovery.kinds.clone())
            }
            _ => return,
        };

        match self.recreate(direction, &kinds).await {
            Ok(()) => {
                tracing::info!("{} transport recreated after {} attempts", direction, attempt);
                self.state.recoveries.remove(&direction);
                self.emit(CallEvent::TransportRecovered { direction });
            }
            Err(err) if attempt >= self.config.transport_retry_limit => {
                tracing::error!(
                    "{} transport recovery gave up after {} attempts: {}",
                    direction,
                    attempt,
                    err
                );
                self.state.recoveries.remove(&direction);
                let err = Error::new_transport(
                    format!("{} transport could not be recreated: {}", direction, err),
                    TransportErrorKind::RecoveryExhaustedError,
                );
                self.emit(CallEvent::SessionLost {
                    reason: err.to_string(),
                });
            }
            Err(err) => {
                tracing::warn!(
                    "{} transport recovery attempt {} failed: {}",
                    direction,
                    attempt,
                    err
                );
                self.schedule_retry(direction, generation);
            }
        }
    }

    async fn recreate(&mut self, direction: Direction, kinds: &[MediaKind]) -> Result<(), Error> {
        let (transport, existing_producers) = match self
            .signaling
            .request(ClientMessage::RecreateTransport { direction })
            .await?
        {
            SfuResponse::TransportRecreated {
                transport,
                existing_producers,
            } => (transport, existing_producers),
            other => return Err(unexpected("recreate-transport", other)),
        };

        match direction {
            Direction::Send => {
                // The server closed the old producers along with the old transport.
                for (_, producer) in self.state.producers.drain() {
                    producer.close().await;
                }
                if let Some(old) = self.state.send_transport.take() {
                    old.close().await;
                }
                let send = self
                    .device
                    .create_send_transport(&transport, self.handler.clone())
                    .await?;
                self.state.send_transport = Some(send);

                for kind in kinds {
                    match self.media.sendable(*kind) {
                        Some(track) => self.produce(*kind, track).await?,
                        None => tracing::debug!("{} ended meanwhile, not restored", kind),
                    }
                }
            }
            Direction::Recv => {
                let ids: Vec<String> = self.state.consumers.keys().cloned().collect();
                for id in ids {
                    self.close_consumer(&id).await;
                }
                if let Some(old) = self.state.recv_transport.take() {
                    old.close().await;
                }
                let recv = self
                    .device
                    .create_recv_transport(&transport, self.handler.clone())
                    .await?;
                self.state.recv_transport = Some(recv);

                for producer in existing_producers {
                    let producer_id = producer.producer_id.clone();
                    if let Err(err) = self.consume(producer).await {
                        tracing::error!("failed to consume {} again: {}", producer_id, err);
                    }
                }
            }
        }
        Ok(())
    }

    async fn set_media_enabled(
        &mut self,
        kind: MediaKind,
        enabled: bool,
        track: Option<LocalTrack>,
    ) -> Result<(), Error> {
        if let Some(track) = track {
            self.media.insert(track);
        }
        self.media.set_enabled(kind, enabled);

        if enabled {
            let Some(track) = self.media.sendable(kind) else {
                self.media.set_enabled(kind, false);
                return Err(Error::new_device(
                    format!("no live {} source", kind),
                    DeviceErrorKind::NotLoadedError,
                ));
            };
            if self.state.send_transport.is_some() {
                self.produce(kind, track).await?;
            }
        } else {
            self.close_producer(kind).await;
        }

        if let Some(room_id) = self.state.room_id.clone() {
            self.signaling.emit(ClientMessage::ToggleMedia {
                room_id,
                kind,
                enabled,
            })?;
        }
        Ok(())
    }

    async fn start_screen_share(&mut self, track: LocalTrack) -> Result<(), Error> {
        if track.kind() != MediaKind::Screen {
            return Err(Error::new_device(
                format!("{} source cannot be shared as a screen", track.kind()),
                DeviceErrorKind::UnsupportedError,
            ));
        }
        self.media.insert(track.clone());
        if self.state.send_transport.is_some() {
            self.produce(MediaKind::Screen, track).await?;
        }
        if let Some(room_id) = self.state.room_id.clone() {
            self.signaling.emit(ClientMessage::ScreenState {
                room_id,
                active: true,
            })?;
        }
        Ok(())
    }

    async fn stop_screen_share(&mut self) -> Result<(), Error> {
        self.close_producer(MediaKind::Screen).await;
        if let Some(track) = self.media.remove(MediaKind::Screen) {
            track.stop();
        }
        if let Some(room_id) = self.state.room_id.clone() {
            self.signaling.emit(ClientMessage::ScreenState {
                room_id,
                active: false,
            })?;
        }
        Ok(())
    }

    async fn set_preferred_layers(&mut self, consumer_id: &str, layers: Layers) -> Result<(), Error> {
        if !self.state.consumers.contains_key(consumer_id) {
            return Err(consumer_missing(consumer_id));
        }
        self.signaling
            .request(ClientMessage::SetConsumerLayers {
                consumer_id: consumer_id.to_string(),
                layers,
            })
            .await?;
        Ok(())
    }

    async fn set_priority(&mut self, consumer_id: &str, priority: u8) -> Result<(), Error> {
        if priority == 0 {
            return Err(Error::new_transport(
                "consumer priority ranges from 1 to 255".to_string(),
                TransportErrorKind::ConsumeError,
            ));
        }
        if !self.state.consumers.contains_key(consumer_id) {
            return Err(consumer_missing(consumer_id));
        }
        self.signaling
            .request(ClientMessage::SetConsumerPriority {
                consumer_id: consumer_id.to_string(),
                priority,
            })
            .await?;
        Ok(())
    }

    async fn request_key_frame(&mut self, consumer_id: &str) -> Result<(), Error> {
        if !self.state.consumers.contains_key(consumer_id) {
            return Err(consumer_missing(consumer_id));
        }
        self.signaling
            .request(ClientMessage::RequestKeyframe {
                consumer_id: consumer_id.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn apply_quality(&mut self, consumer_id: &str, level: QualityLevel) -> Result<(), Error> {
        let peer_id = self
            .state
            .consumers
            .get(consumer_id)
            .map(|entry| entry.peer_id.clone())
            .ok_or_else(|| consumer_missing(consumer_id))?;
        self.set_preferred_layers(consumer_id, level.layers()).await?;
        self.emit(CallEvent::QualityChanged {
            peer_id,
            consumer_id: consumer_id.to_string(),
            level,
        });
        Ok(())
    }

    async fn dominant_speaker(&mut self, dominant: Option<PeerId>) -> SpeakerBoost {
        tracing::debug!("dominant speaker is now {:?}", dominant);
        let mut targets: Vec<(String, bool)> = self
            .state
            .consumers
            .iter()
            .filter(|(id, entry)| entry.kind == MediaKind::Video && !self.state.overridden.contains(*id))
            .map(|(id, entry)| (id.clone(), dominant.as_deref() == Some(entry.peer_id.as_str())))
            .collect();
        targets.sort();

        let mut promoted = vec![];
        for (consumer_id, is_dominant) in targets {
            let priority = if is_dominant {
                DOMINANT_PRIORITY
            } else {
                BACKGROUND_PRIORITY
            };
            if let Err(err) = self.set_priority(&consumer_id, priority).await {
                tracing::warn!("failed to set priority of {}: {}", consumer_id, err);
                continue;
            }
            if is_dominant {
                promoted.push(consumer_id);
            }
        }

        let mut demoted: Vec<String> = self
            .state
            .boosted
            .iter()
            .filter(|id| !promoted.contains(*id))
            .cloned()
            .collect();
        demoted.sort();
        self.state.boosted = promoted.iter().cloned().collect();

        self.emit(CallEvent::DominantSpeaker { peer_id: dominant });
        SpeakerBoost { promoted, demoted }
    }

    fn video_consumers_of(&self, peer_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .consumers
            .iter()
            .filter(|(_, entry)| entry.peer_id == peer_id && entry.kind.is_video())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    async fn collect_stats(&self) -> Vec<(String, QualitySample)> {
        let mut samples = vec![];
        for (id, entry) in self.state.consumers.iter() {
            if !entry.kind.is_video() {
                continue;
            }
            if let Some(sample) = entry.consumer.stats().await {
                samples.push((id.clone(), sample));
            }
        }
        samples
    }

    async fn collect_energy(&self) -> Vec<(PeerId, f32)> {
        let mut energies = vec![];
        for entry in self.state.consumers.values() {
            if entry.kind != MediaKind::Audio {
                continue;
            }
            if let Some(level) = entry.consumer.audio_level().await {
                energies.push((entry.peer_id.clone(), level));
            }
        }
        energies
    }

    fn snapshot(&self) -> SfuSnapshot {
        let mut producers: Vec<(MediaKind, String)> = self
            .state
            .producers
            .iter()
            .map(|(kind, producer)| (*kind, producer.id().to_string()))
            .collect();
        producers.sort();
        let mut consumers: Vec<ConsumerSummary> = self
            .state
            .consumers
            .iter()
            .map(|(id, entry)| ConsumerSummary {
                id: id.clone(),
                producer_id: entry.producer_id.clone(),
                peer_id: entry.peer_id.clone(),
                kind: entry.kind,
            })
            .collect();
        consumers.sort_by(|a, b| a.id.cmp(&b.id));

        SfuSnapshot {
            room_id: self.state.room_id.clone(),
            local_peer_id: self.state.local_peer_id.clone(),
            participants: self.state.participants.values().cloned().collect(),
            send_transport: self.state.send_transport.as_ref().map(|t| t.id().to_string()),
            recv_transport: self.state.recv_transport.as_ref().map(|t| t.id().to_string()),
            producers,
            consumers,
            recovering: self.state.recoveries.keys().copied().collect(),
        }
    }

    /// Closes consumers, producers and both transports locally.
    async fn close_media_paths(&mut self) {
        for (_, entry) in self.state.consumers.drain() {
            entry.consumer.close().await;
        }
        self.state.overridden.clear();
        self.state.boosted.clear();
        for (_, producer) in self.state.producers.drain() {
            producer.close().await;
        }
        if let Some(send) = self.state.send_transport.take() {
            send.close().await;
        }
        if let Some(recv) = self.state.recv_transport.take() {
            recv.close().await;
        }
    }

    async fn leave(&mut self) {
        self.close_media_paths().await;
        self.media.stop_all();
        if let Err(err) = self.signaling.leave_room().await {
            tracing::warn!("failed to send leave-room: {}", err);
        }
        self.state = SfuState::default();
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex as StdMutex,
        },
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{
        config::SignalingConfig,
        media::test::FakeSource,
        protocol::{
            ConsumerParams, ErrorCategory, MediaState, RtpCapabilities, RtpEncoding,
            TransportParams,
        },
        signaling::test::{FakeConnector, ServerEnd},
    };

    pub(crate) struct FakeProducer {
        id: String,
        kind: MediaKind,
        pub(crate) closed: AtomicBool,
    }

    #[async_trait]
    impl LocalProducer for FakeProducer {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> MediaKind {
            self.kind
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) struct FakeConsumer {
        id: String,
        producer_id: String,
        kind: MediaKind,
        pub(crate) paused: AtomicBool,
        pub(crate) closed: AtomicBool,
    }

    #[async_trait]
    impl RemoteConsumer for FakeConsumer {
        fn id(&self) -> &str {
            &self.id
        }

        fn producer_id(&self) -> &str {
            &self.producer_id
        }

        fn kind(&self) -> MediaKind {
            self.kind
        }

        async fn resume(&self) -> Result<(), Error> {
            self.paused.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn pause(&self) -> Result<(), Error> {
            self.paused.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stats(&self) -> Option<QualitySample> {
            Some(QualitySample {
                at: Instant::now(),
                bitrate: 2_000_000,
                packet_loss: 0.0,
                rtt: 20.0,
            })
        }

        async fn audio_level(&self) -> Option<f32> {
            Some(0.5)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) struct FakeSendTransport {
        id: String,
        handler: Arc<dyn TransportHandler>,
        connected: AtomicBool,
        pub(crate) closed: AtomicBool,
        pub(crate) producers: StdMutex<Vec<Arc<FakeProducer>>>,
    }

    #[async_trait]
    impl SendTransport for FakeSendTransport {
        fn id(&self) -> &str {
            &self.id
        }

        async fn produce(
            &self,
            track: LocalTrack,
            encodings: Vec<RtpEncoding>,
        ) -> Result<Arc<dyn LocalProducer>, Error> {
            if !self.connected.swap(true, Ordering::SeqCst) {
                self.handler
                    .on_connect(Direction::Send, DtlsParameters::default())
                    .await?;
            }
            let kind = track.kind();
            let id = self
                .handler
                .on_produce(
                    kind,
                    RtpParameters {
                        encodings,
                        ..Default::default()
                    },
                )
                .await?;
            let producer = Arc::new(FakeProducer {
                id,
                kind,
                closed: AtomicBool::new(false),
            });
            self.producers.lock().unwrap().push(producer.clone());
            Ok(producer)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) struct FakeRecvTransport {
        id: String,
        handler: Arc<dyn TransportHandler>,
        connected: AtomicBool,
        pub(crate) closed: AtomicBool,
        pub(crate) consumers: StdMutex<Vec<Arc<FakeConsumer>>>,
    }

    #[async_trait]
    impl RecvTransport for FakeRecvTransport {
        fn id(&self) -> &str {
            &self.id
        }

        async fn consume(&self, params: &ConsumerParams) -> Result<Arc<dyn RemoteConsumer>, Error> {
            if !self.connected.swap(true, Ordering::SeqCst) {
                self.handler
                    .on_connect(Direction::Recv, DtlsParameters::default())
                    .await?;
            }
            let consumer = Arc::new(FakeConsumer {
                id: params.id.clone(),
                producer_id: params.producer_id.clone(),
                kind: params.kind,
                paused: AtomicBool::new(params.paused),
                closed: AtomicBool::new(false),
            });
            self.consumers.lock().unwrap().push(consumer.clone());
            Ok(consumer)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeDevice {
        loaded: AtomicBool,
        pub(crate) send_transports: StdMutex<Vec<Arc<FakeSendTransport>>>,
        pub(crate) recv_transports: StdMutex<Vec<Arc<FakeRecvTransport>>>,
    }

    impl FakeDevice {
        pub(crate) fn report_send(&self, state: TransportState) {
            let transport = self
                .send_transports
                .lock()
                .unwrap()
                .last()
                .cloned()
                .expect("no send transport");
            transport
                .handler
                .on_state_change(Direction::Send, &transport.id, state);
        }

        fn consumer(&self, consumer_id: &str) -> Arc<FakeConsumer> {
            self.recv_transports
                .lock()
                .unwrap()
                .iter()
                .flat_map(|t| t.consumers.lock().unwrap().clone())
                .find(|c| c.id == consumer_id)
                .expect("consumer was never created")
        }
    }

    #[async_trait]
    impl Device for FakeDevice {
        async fn load(&self, _router_rtp_capabilities: &RtpCapabilities) -> Result<(), Error> {
            self.loaded.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn loaded(&self) -> bool {
            self.loaded.load(Ordering::SeqCst)
        }

        fn rtp_capabilities(&self) -> RtpCapabilities {
            RtpCapabilities::default()
        }

        fn can_produce(&self, _kind: MediaKind) -> bool {
            true
        }

        async fn create_send_transport(
            &self,
            params: &TransportParams,
            handler: Arc<dyn TransportHandler>,
        ) -> Result<Arc<dyn SendTransport>, Error> {
            let transport = Arc::new(FakeSendTransport {
                id: params.id.clone(),
                handler,
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                producers: StdMutex::new(vec![]),
            });
            self.send_transports.lock().unwrap().push(transport.clone());
            Ok(transport)
        }

        async fn create_recv_transport(
            &self,
            params: &TransportParams,
            handler: Arc<dyn TransportHandler>,
        ) -> Result<Arc<dyn RecvTransport>, Error> {
            let transport = Arc::new(FakeRecvTransport {
                id: params.id.clone(),
                handler,
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                consumers: StdMutex::new(vec![]),
            });
            self.recv_transports.lock().unwrap().push(transport.clone());
            Ok(transport)
        }
    }

    pub(crate) fn transport(direction: Direction, id: &str) -> TransportParams {
        TransportParams {
            id: id.to_string(),
            direction,
            ice_parameters: Default::default(),
            ice_candidates: vec![],
            dtls_parameters: Default::default(),
        }
    }

    pub(crate) fn remote_producers() -> Vec<ProducerInfo> {
        [
            ("p2-audio", "p2", MediaKind::Audio),
            ("p2-video", "p2", MediaKind::Video),
            ("p3-video", "p3", MediaKind::Video),
        ]
        .iter()
        .map(|(id, peer, kind)| ProducerInfo {
            producer_id: id.to_string(),
            peer_id: peer.to_string(),
            kind: *kind,
        })
        .collect()
    }

    pub(crate) fn join_info() -> SfuJoinInfo {
        SfuJoinInfo {
            router_rtp_capabilities: RtpCapabilities::default(),
            send_transport: transport(Direction::Send, "send-1"),
            recv_transport: transport(Direction::Recv, "recv-1"),
            existing_producers: remote_producers(),
        }
    }

    pub(crate) fn participant(peer_id: &str) -> Participant {
        Participant {
            peer_id: peer_id.to_string(),
            identity: Identity {
                user_id: format!("user-{}", peer_id),
                display_name: peer_id.to_uppercase(),
            },
            media: MediaState {
                audio: true,
                video: true,
                screen: false,
            },
        }
    }

    #[derive(Default, Clone, Copy)]
    pub(crate) struct ServerOptions {
        pub(crate) fail_recreate: bool,
        pub(crate) missing_room: bool,
    }

    /// Answers every request the way a healthy SFU server would and records what it got.
    pub(crate) fn spawn_server(
        mut end: ServerEnd,
        options: ServerOptions,
    ) -> Arc<StdMutex<Vec<ClientMessage>>> {
        let log = Arc::new(StdMutex::new(Vec::new()));
        tokio::spawn(enc!((log) async move {
            let mut produced = 0u32;
            let mut recreated = 1u32;
            while let Some(text) = end.from_client.recv().await {
                let envelope: crate::protocol::ClientEnvelope =
                    serde_json::from_str(&text).expect("client sent malformed json");
                log.lock().unwrap().push(envelope.message.clone());
                let Some(request_id) = envelope.request_id else {
                    continue;
                };
                let fail = |category, message: &str| ServerMessage::Failure {
                    request_id,
                    category,
                    message: message.to_string(),
                };
                let respond = |payload| ServerMessage::Response {
                    request_id,
                    payload,
                };
                let reply = match envelope.message {
                    ClientMessage::JoinRoom { room_id, create, .. } => {
                        if options.missing_room && !create {
                            fail(ErrorCategory::RoomNotFound, "no such room")
                        } else {
                            end.send(ServerMessage::ExistingParticipants {
                                room_id,
                                self_peer_id: "p1".to_string(),
                                participants: vec![participant("p2"), participant("p3")],
                                sfu: Some(join_info()),
                            });
                            respond(SfuResponse::Joined(join_info()))
                        }
                    }
                    ClientMessage::ConnectTransport { direction, .. } => {
                        respond(SfuResponse::TransportConnected {
                            transport_id: direction.to_string(),
                        })
                    }
                    ClientMessage::Produce { kind, .. } => {
                        produced += 1;
                        respond(SfuResponse::Produced {
                            producer_id: format!("local-{}-{}", kind, produced),
                        })
                    }
                    ClientMessage::Consume { producer_id, .. } => {
                        match remote_producers()
                            .into_iter()
                            .find(|p| p.producer_id == producer_id)
                        {
                            Some(producer) => respond(SfuResponse::Consumed(ConsumerParams {
                                id: format!("cons-{}", producer.producer_id),
                                producer_id: producer.producer_id,
                                peer_id: producer.peer_id,
                                kind: producer.kind,
                                rtp_parameters: Default::default(),
                                paused: true,
                                priority: 1,
                            })),
                            None => fail(ErrorCategory::ResourceNotFound, "producer is closed"),
                        }
                    }
                    ClientMessage::RecreateTransport { direction } => {
                        if options.fail_recreate {
                            fail(ErrorCategory::Transport, "no transport for you")
                        } else {
                            recreated += 1;
                            respond(SfuResponse::TransportRecreated {
                                transport: transport(direction, &format!("{}-{}", direction, recreated)),
                                existing_producers: match direction {
                                    Direction::Send => vec![],
                                    Direction::Recv => remote_producers(),
                                },
                            })
                        }
                    }
                    _ => respond(SfuResponse::Ack),
                };
                end.send(reply);
            }
        }));
        log
    }

    pub(crate) struct Harness {
        pub(crate) handle: SfuHandle,
        pub(crate) device: Arc<FakeDevice>,
        pub(crate) log: Arc<StdMutex<Vec<ClientMessage>>>,
        pub(crate) events: broadcast::Receiver<CallEvent>,
    }

    impl Harness {
        async fn new(options: ServerOptions, recovery: RecoveryConfig) -> Self {
            let (connector, mut ends) = FakeConnector::new();
            let signaling = SignalingClient::connect(connector, SignalingConfig::default())
                .await
                .expect("failed to connect");
            let log = spawn_server(ends.recv().await.expect("no link"), options);

            let mut media = LocalMedia::default();
            media.insert(FakeSource::new(MediaKind::Audio));
            media.insert(FakeSource::new(MediaKind::Video));

            let device = Arc::new(FakeDevice::default());
            let (events, receiver) = broadcast::channel(256);
            let handle = SfuEngine::spawn(signaling, device.clone(), media, recovery, events);
            Self {
                handle,
                device,
                log,
                events: receiver,
            }
        }

        async fn joined() -> Self {
            let h = Self::new(ServerOptions::default(), RecoveryConfig::default()).await;
            h.handle
                .join("room", participant("p1").identity, false)
                .await
                .expect("join");
            h
        }

        fn sent(&self, action: &str) -> Vec<ClientMessage> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.action() == action)
                .cloned()
                .collect()
        }

        async fn wait_for(&self, condition: impl Fn(&SfuSnapshot) -> bool) -> SfuSnapshot {
            for _ in 0..200 {
                let snapshot = self.handle.snapshot().await.expect("snapshot");
                if condition(&snapshot) {
                    return snapshot;
                }
                sleep(Duration::from_millis(10)).await;
            }
            panic!("sfu session never reached the expected state");
        }

        async fn next_event(&mut self, matches: impl Fn(&CallEvent) -> bool) -> CallEvent {
            loop {
                let event = self.events.recv().await.expect("event stream closed");
                if matches(&event) {
                    return event;
                }
            }
        }
    }

    fn produced_kinds(messages: &[ClientMessage]) -> Vec<MediaKind> {
        let mut kinds: Vec<MediaKind> = messages
            .iter()
            .filter_map(|m| match m {
                ClientMessage::Produce { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect();
        kinds.sort();
        kinds
    }

    #[tokio::test]
    async fn join_consumes_existing_producers_and_produces_local_media() {
        let h = Harness::joined().await;
        let snapshot = h.handle.snapshot().await.expect("snapshot");

        assert_eq!(snapshot.send_transport.as_deref(), Some("send-1"));
        assert_eq!(snapshot.recv_transport.as_deref(), Some("recv-1"));
        assert_eq!(
            snapshot.producers.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
            vec![MediaKind::Audio, MediaKind::Video]
        );
        assert_eq!(snapshot.consumers.len(), 3);

        // Camera video goes out as three simulcast layers.
        let video = h
            .sent("produce")
            .into_iter()
            .find_map(|m| match m {
                ClientMessage::Produce {
                    kind: MediaKind::Video,
                    rtp_parameters,
                } => Some(rtp_parameters),
                _ => None,
            })
            .expect("video produced");
        assert_eq!(video.encodings.len(), 3);

        assert_eq!(h.sent("resume-consumer").len(), 3);
        assert!(!h.device.consumer("cons-p2-video").paused.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn send_transport_recovery_restores_both_producers_once() {
        let mut h = Harness::joined().await;
        h.wait_for(|s| s.local_peer_id.is_some()).await;

        // Two failure reports for the same transport collapse into one recovery.
        h.device.report_send(TransportState::Disconnected);
        h.device.report_send(TransportState::Failed);

        match h
            .next_event(|e| matches!(e, CallEvent::TransportRecovered { .. }))
            .await
        {
            CallEvent::TransportRecovered { direction } => assert_eq!(direction, Direction::Send),
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(h.sent("recreate-transport").len(), 1);
        let log = h.log.lock().unwrap().clone();
        let recreate = log
            .iter()
            .position(|m| m.action() == "recreate-transport")
            .expect("recreate sent");
        assert_eq!(
            produced_kinds(&log[recreate..]),
            vec![MediaKind::Audio, MediaKind::Video]
        );

        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.send_transport.as_deref(), Some("send-2"));
        assert_eq!(snapshot.producers.len(), 2);
        assert!(snapshot.recovering.is_empty());

        let first = h.device.send_transports.lock().unwrap()[0].clone();
        assert!(first.closed.load(Ordering::SeqCst));
        assert!(first
            .producers
            .lock()
            .unwrap()
            .iter()
            .all(|p| p.closed.load(Ordering::SeqCst)));
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_gives_up_after_the_retry_limit() {
        let options = ServerOptions {
            fail_recreate: true,
            ..Default::default()
        };
        let recovery = RecoveryConfig {
            transport_retry_limit: 3,
            transport_retry_delay: Duration::from_secs(1),
        };
        let mut h = Harness::new(options, recovery).await;
        h.handle
            .join("room", participant("p1").identity, false)
            .await
            .expect("join");

        h.device.report_send(TransportState::Failed);
        h.next_event(|e| matches!(e, CallEvent::SessionLost { .. }))
            .await;
        assert_eq!(h.sent("recreate-transport").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnected_transport_cancels_recovery() {
        let h = Harness::joined().await;
        h.device.report_send(TransportState::Disconnected);
        h.device.report_send(TransportState::Connected);
        sleep(Duration::from_secs(10)).await;

        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert!(snapshot.recovering.is_empty());
        assert!(h.sent("recreate-transport").is_empty());
    }

    #[tokio::test]
    async fn closed_producers_and_departed_peers_close_consumers() {
        let h = Harness::joined().await;
        assert_eq!(h.handle.snapshot().await.expect("snapshot").consumers.len(), 3);

        h.handle
            .inputs
            .send(SfuInput::Signal(SignalEvent::Message(ServerMessage::ProducerClosed {
                producer_id: "p3-video".to_string(),
                peer_id: "p3".to_string(),
                kind: MediaKind::Video,
            })))
            .expect("engine stopped");
        let snapshot = h.wait_for(|s| s.consumers.len() == 2).await;
        assert!(snapshot.consumers.iter().all(|c| c.peer_id == "p2"));
        assert!(h.device.consumer("cons-p3-video").closed.load(Ordering::SeqCst));

        h.handle
            .inputs
            .send(SfuInput::Signal(SignalEvent::Message(ServerMessage::UserLeft {
                peer_id: "p2".to_string(),
            })))
            .expect("engine stopped");
        h.wait_for(|s| s.consumers.is_empty()).await;
        assert!(h.device.consumer("cons-p2-audio").closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn consuming_a_vanished_producer_is_not_an_error() {
        let mut h = Harness::joined().await;
        h.handle
            .inputs
            .send(SfuInput::Signal(SignalEvent::Message(ServerMessage::NewProducer {
                producer: ProducerInfo {
                    producer_id: "gone".to_string(),
                    peer_id: "p2".to_string(),
                    kind: MediaKind::Screen,
                },
            })))
            .expect("engine stopped");
        h.handle
            .inputs
            .send(SfuInput::Signal(SignalEvent::Message(ServerMessage::RoomError {
                message: "barrier".to_string(),
            })))
            .expect("engine stopped");

        loop {
            match h.events.recv().await.expect("event stream closed") {
                CallEvent::RoomError { message } => {
                    assert_eq!(message, "barrier");
                    break;
                }
                CallEvent::SessionLost { reason } => panic!("session lost: {}", reason),
                _ => continue,
            }
        }
        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.consumers.len(), 3);
        assert_eq!(h.sent("consume").len(), 4);
    }

    #[tokio::test]
    async fn dominant_speaker_gets_priority_and_a_layer_pin() {
        let mut h = Harness::joined().await;
        let pinned = h.handle.override_quality("p2", true).await.expect("override");
        assert_eq!(pinned, vec!["cons-p2-video".to_string()]);

        let boost = h
            .handle
            .dominant_speaker(Some("p3".to_string()))
            .await
            .expect("speaker");
        assert_eq!(
            boost,
            SpeakerBoost {
                promoted: vec!["cons-p3-video".to_string()],
                demoted: vec![],
            }
        );
        h.next_event(|e| matches!(e, CallEvent::DominantSpeaker { .. }))
            .await;

        // p2 is pinned manually and keeps its settings.
        let priorities: Vec<(String, u8)> = h
            .sent("set-consumer-priority")
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::SetConsumerPriority {
                    consumer_id,
                    priority,
                } => Some((consumer_id, priority)),
                _ => None,
            })
            .collect();
        assert_eq!(priorities, vec![("cons-p3-video".to_string(), 255)]);
        // Layers are left to the quality monitor, which pins them.
        assert!(h.sent("set-consumer-layers").is_empty());

        let boost = h.handle.dominant_speaker(None).await.expect("speaker");
        assert_eq!(
            boost,
            SpeakerBoost {
                promoted: vec![],
                demoted: vec!["cons-p3-video".to_string()],
            }
        );
        let again = h.handle.dominant_speaker(None).await.expect("speaker");
        assert_eq!(again, SpeakerBoost::default());
    }

    #[tokio::test]
    async fn stats_and_energy_come_from_the_right_consumers() {
        let h = Harness::joined().await;
        let mut stats = h.handle.video_consumer_stats().await.expect("stats");
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        let ids: Vec<&str> = stats.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["cons-p2-video", "cons-p3-video"]);

        let energies = h.handle.energies().await.expect("energies");
        assert_eq!(energies, vec![("p2".to_string(), 0.5)]);
    }

    #[tokio::test]
    async fn disabling_video_closes_the_producer_and_toggles() {
        let h = Harness::joined().await;
        h.handle
            .set_media_enabled(MediaKind::Video, false, None)
            .await
            .expect("disable");

        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert_eq!(
            snapshot.producers.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
            vec![MediaKind::Audio]
        );
        assert_eq!(h.sent("close-producer").len(), 1);

        h.handle
            .set_media_enabled(MediaKind::Video, true, None)
            .await
            .expect("enable");
        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.producers.len(), 2);
    }

    #[tokio::test]
    async fn leave_closes_transports_and_stops_the_session() {
        let h = Harness::joined().await;
        h.handle.leave().await.expect("leave");

        let send = h.device.send_transports.lock().unwrap()[0].clone();
        let recv = h.device.recv_transports.lock().unwrap()[0].clone();
        assert!(send.closed.load(Ordering::SeqCst));
        assert!(recv.closed.load(Ordering::SeqCst));
        assert!(h.device.consumer("cons-p2-audio").closed.load(Ordering::SeqCst));
        assert!(h.handle.snapshot().await.is_err());
    }
}
