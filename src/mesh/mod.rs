//! Full-mesh calls: one peer connection per remote peer and media kind.
//!
//! Everything is driven by a single task. Signaling messages, connection state reports,
//! settle timers and user commands are all queued into it, so two negotiations on the same
//! slot never interleave.
use std::{collections::HashMap, sync::Arc};

use enclose::enc;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::session_description::RTCSessionDescription,
};

use crate::{
    config::MeshConfig,
    error::{DeviceErrorKind, Error, NegotiationErrorKind, RoomErrorKind},
    media::{LocalMedia, LocalSource, LocalTrack},
    protocol::{
        CallMode, ClientMessage, Identity, MediaKind, Participant, PeerId, RoomId, ServerMessage,
    },
    session::CallEvent,
    signaling::{JoinRequest, SignalEvent, SignalingClient},
};

pub mod bundle;
pub mod peer_connection;
pub mod rtc;
pub mod state;

pub use bundle::ConnectionBundle;
pub use peer_connection::{
    ConnectionStatus, PeerConnection, PeerConnectionEvent, PeerConnectionFactory, SlotEvent,
};
pub use state::{NegotiationState, Role};

use bundle::Slot;
use state::{AnswerDecision, OfferDecision, SlotMachine};

pub(crate) enum MeshCommand {
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
    Snapshot {
        reply: oneshot::Sender<MeshSnapshot>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) enum MeshInput {
    Signal(SignalEvent),
    SettleElapsed {
        peer_id: PeerId,
        kind: MediaKind,
        epoch: u64,
    },
    Command(MeshCommand),
}

/// Point-in-time view of the mesh, for diagnostics and UI.
#[derive(Debug, Clone, Default)]
pub struct MeshSnapshot {
    pub room_id: Option<RoomId>,
    pub local_peer_id: Option<PeerId>,
    pub participants: Vec<Participant>,
    pub connections: HashMap<PeerId, Vec<(MediaKind, NegotiationState)>>,
}

#[derive(Default)]
pub struct MeshState {
    pub room_id: Option<RoomId>,
    pub local_peer_id: Option<PeerId>,
    pub participants: HashMap<PeerId, Participant>,
    pub bundles: HashMap<PeerId, ConnectionBundle>,
}

/// Handle to a running [`MeshEngine`].
#[derive(Clone)]
pub struct MeshHandle {
    inputs: mpsc::UnboundedSender<MeshInput>,
}

impl MeshHandle {
    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> MeshCommand,
    ) -> Result<T, Error> {
        let (reply, response) = oneshot::channel();
        self.inputs
            .send(MeshInput::Command(command(reply)))
            .map_err(|_| Self::stopped())?;
        response.await.map_err(|_| Self::stopped())
    }

    fn stopped() -> Error {
        Error::new_room(
            "mesh engine has stopped".to_string(),
            RoomErrorKind::NotJoinedError,
        )
    }

    /// Joins a mesh room. Peers are connected once the server lists them.
    pub async fn join(&self, room_id: &str, identity: Identity, create: bool) -> Result<(), Error> {
        self.call(|reply| MeshCommand::Join {
            room_id: room_id.to_string(),
            identity,
            create,
            reply,
        })
        .await?
    }

    /// Pauses or resumes sending `kind` to every peer without renegotiating.
    pub async fn set_media_enabled(
        &self,
        kind: MediaKind,
        enabled: bool,
        track: Option<LocalTrack>,
    ) -> Result<(), Error> {
        self.call(|reply| MeshCommand::SetMediaEnabled {
            kind,
            enabled,
            track,
            reply,
        })
        .await?
    }

    pub async fn start_screen_share(&self, track: LocalTrack) -> Result<(), Error> {
        self.call(|reply| MeshCommand::StartScreenShare { track, reply })
            .await?
    }

    pub async fn stop_screen_share(&self) -> Result<(), Error> {
        self.call(|reply| MeshCommand::StopScreenShare { reply })
            .await?
    }

    pub async fn snapshot(&self) -> Result<MeshSnapshot, Error> {
        self.call(|reply| MeshCommand::Snapshot { reply }).await
    }

    /// Closes every connection, stops local media and leaves the room.
    pub async fn leave(&self) -> Result<(), Error> {
        self.call(|reply| MeshCommand::Leave { reply }).await
    }
}

pub struct MeshEngine {
    state: MeshState,
    media: LocalMedia,
    signaling: SignalingClient,
    factory: Arc<dyn PeerConnectionFactory>,
    config: MeshConfig,
    events: broadcast::Sender<CallEvent>,
    inputs: mpsc::WeakUnboundedSender<MeshInput>,
    slot_events: mpsc::UnboundedSender<SlotEvent>,
    shutdown: CancellationToken,
}

impl MeshEngine {
    pub fn spawn(
        signaling: SignalingClient,
        factory: Arc<dyn PeerConnectionFactory>,
        media: LocalMedia,
        config: MeshConfig,
        events: broadcast::Sender<CallEvent>,
    ) -> MeshHandle {
        let (inputs, inputs_receiver) = mpsc::unbounded_channel();
        let (slot_events, slot_events_receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        // Subscribe before returning so nothing sent after the join is missed.
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
                            if inputs.send(MeshInput::Signal(event)).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("mesh engine skipped {} signaling events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("mesh signaling forwarder finished");
        }));

        let engine = MeshEngine {
            state: MeshState::default(),
            media,
            signaling,
            factory,
            config,
            events,
            inputs: inputs.downgrade(),
            slot_events,
            shutdown,
        };
        tokio::spawn(engine.run(inputs_receiver, slot_events_receiver));

        MeshHandle { inputs }
    }

    async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<MeshInput>,
        mut slot_events: mpsc::UnboundedReceiver<SlotEvent>,
    ) {
        loop {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(MeshInput::Command(MeshCommand::Leave { reply })) => {
                        self.leave().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(input) => self.handle_input(input).await,
                    None => {
                        self.leave().await;
                        break;
                    }
                },
                Some(event) = slot_events.recv() => self.handle_slot_event(event).await,
            }
        }
        self.shutdown.cancel();
        tracing::info!("mesh engine finished");
    }

    async fn handle_input(&mut self, input: MeshInput) {
        match input {
            MeshInput::Signal(SignalEvent::Message(message)) => self.handle_message(message).await,
            MeshInput::Signal(SignalEvent::Disconnected) => {
                self.emit(CallEvent::SignalingDisconnected)
            }
            MeshInput::Signal(SignalEvent::Reconnected) => {
                self.emit(CallEvent::SignalingReconnected)
            }
            MeshInput::SettleElapsed {
                peer_id,
                kind,
                epoch,
            } => self.handle_settle(peer_id, kind, epoch).await,
            MeshInput::Command(command) => self.handle_command(command).await,
        }
    }

    async fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::ExistingParticipants {
                room_id,
                self_peer_id,
                participants,
                ..
            } => {
                if self.state.local_peer_id.as_deref() != Some(self_peer_id.as_str())
                    && !self.state.bundles.is_empty()
                {
                    tracing::info!("rejoined as {}, dropping previous connections", self_peer_id);
                    self.close_bundles().await;
                }
                tracing::info!(
                    "joined room {} as {} with {} participants",
                    room_id,
                    self_peer_id,
                    participants.len()
                );
                self.state.room_id = Some(room_id.clone());
                self.state.local_peer_id = Some(self_peer_id.clone());
                self.state.participants.clear();
                for participant in participants.iter() {
                    self.discover(participant.clone()).await;
                }
                self.emit(CallEvent::Joined {
                    room_id,
                    self_peer_id,
                    participants,
                });
            }
            ServerMessage::UserJoined { participant } => {
                tracing::info!("{} joined", participant.peer_id);
                self.discover(participant.clone()).await;
                self.emit(CallEvent::ParticipantJoined(participant));
            }
            ServerMessage::UserLeft { peer_id } => {
                tracing::info!("{} left", peer_id);
                self.state.participants.remove(&peer_id);
                if let Some(bundle) = self.state.bundles.remove(&peer_id) {
                    bundle.close().await;
                }
                self.emit(CallEvent::ParticipantLeft { peer_id });
            }
            ServerMessage::ReceiveOffer {
                from_peer_id,
                description,
                kind,
            } => {
                if let Err(err) = self.accept_offer(&from_peer_id, description, kind).await {
                    tracing::error!("failed to answer {} offer from {}: {}", kind, from_peer_id, err);
                    self.fail_slot(&from_peer_id, kind);
                }
            }
            ServerMessage::ReceiveAnswer {
                from_peer_id,
                description,
                kind,
            } => self.apply_answer(&from_peer_id, description, kind).await,
            ServerMessage::ReceiveIceCandidate {
                from_peer_id,
                candidate,
                kind,
            } => self.add_remote_candidate(&from_peer_id, candidate, kind).await,
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
                // The slot stays while we still send our own screen over it.
                if !active && self.media.sendable(MediaKind::Screen).is_none() {
                    if let Some(bundle) = self.state.bundles.get_mut(&peer_id) {
                        bundle.close_slot(MediaKind::Screen).await;
                    }
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
                tracing::debug!("mesh engine ignores {:?}", other);
            }
        }
    }

    async fn handle_slot_event(&mut self, event: SlotEvent) {
        let SlotEvent {
            peer_id,
            kind,
            event,
        } = event;
        match event {
            PeerConnectionEvent::LocalCandidate(candidate) => {
                if self.slot_mut(&peer_id, kind).is_err() {
                    return;
                }
                if let Err(err) = self.signaling.emit(ClientMessage::IceCandidate {
                    target_peer_id: peer_id,
                    candidate,
                    kind,
                }) {
                    tracing::warn!("failed to send ICE candidate: {}", err);
                }
            }
            PeerConnectionEvent::StateChanged(status) => {
                let Ok(slot) = self.slot_mut(&peer_id, kind) else {
                    return;
                };
                slot.epoch += 1;
                match status {
                    ConnectionStatus::Connected => {
                        slot.failed = false;
                        slot.machine.connected();
                    }
                    ConnectionStatus::Failed => {
                        slot.failed = true;
                        slot.machine.fail();
                        let epoch = slot.epoch;
                        self.schedule_settle(peer_id.clone(), kind, epoch);
                    }
                    _ => {}
                }
                self.emit(CallEvent::ConnectionState {
                    peer_id,
                    kind,
                    status,
                });
            }
            PeerConnectionEvent::RemoteTrack { track_id, .. } => {
                self.emit(CallEvent::RemoteTrack {
                    peer_id,
                    kind,
                    track_id,
                });
            }
        }
    }

    async fn handle_command(&mut self, command: MeshCommand) {
        match command {
            MeshCommand::Join {
                room_id,
                identity,
                create,
                reply,
            } => {
                let result = self.join(room_id, identity, create).await;
                let _ = reply.send(result);
            }
            MeshCommand::SetMediaEnabled {
                kind,
                enabled,
                track,
                reply,
            } => {
                let result = self.set_media_enabled(kind, enabled, track).await;
                let _ = reply.send(result);
            }
            MeshCommand::StartScreenShare { track, reply } => {
                let result = self.start_screen_share(track).await;
                let _ = reply.send(result);
            }
            MeshCommand::StopScreenShare { reply } => {
                let result = self.stop_screen_share().await;
                let _ = reply.send(result);
            }
            MeshCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            MeshCommand::Leave { reply } => {
                self.leave().await;
                let _ = reply.send(());
            }
        }
    }

    async fn join(&mut self, room_id: RoomId, identity: Identity, create: bool) -> Result<(), Error> {
        let join = JoinRequest {
            room_id: room_id.clone(),
            identity,
            mode: CallMode::Mesh,
            media: self.media.state(),
            create,
            rtp_capabilities: None,
        };
        self.signaling.join_room_request(join).await?;
        tracing::debug!("join-room {} acknowledged", room_id);
        self.state.room_id = Some(room_id);
        Ok(())
    }

    async fn discover(&mut self, participant: Participant) {
        let peer_id = participant.peer_id.clone();
        if self.state.local_peer_id.as_deref() == Some(peer_id.as_str()) {
            return;
        }
        self.state.participants.insert(peer_id.clone(), participant);
        if self.state.bundles.contains_key(&peer_id) {
            return;
        }
        if let Err(err) = self.ensure_bundle(&peer_id) {
            tracing::error!("cannot connect to {}: {}", peer_id, err);
            return;
        }

        let mut kinds = vec![MediaKind::Audio, MediaKind::Video];
        if self.media.sendable(MediaKind::Screen).is_some() {
            kinds.push(MediaKind::Screen);
        }
        for kind in kinds {
            if let Err(err) = self.connect_slot(&peer_id, kind).await {
                tracing::error!("failed to connect {} to {}: {}", kind, peer_id, err);
            }
        }
    }

    fn ensure_bundle(&mut self, peer_id: &str) -> Result<(), Error> {
        let local = self.state.local_peer_id.clone().ok_or_else(|| {
            Error::new_room(
                "no local peer id before existing-participants".to_string(),
                RoomErrorKind::NotJoinedError,
            )
        })?;
        self.state
            .bundles
            .entry(peer_id.to_string())
            .or_insert_with(|| ConnectionBundle::new(peer_id.to_string(), state::role(&local, peer_id)));
        Ok(())
    }

    /// Creates the slot if it does not exist yet. Returns whether it was created.
    async fn ensure_slot(&mut self, peer_id: &str, kind: MediaKind) -> Result<bool, Error> {
        let role = match self.state.bundles.get(peer_id) {
            Some(bundle) if bundle.slots.contains_key(&kind) => return Ok(false),
            Some(bundle) => bundle.role,
            None => return Err(Error::peer_connection_missing(peer_id, kind)),
        };

        let connection = self
            .factory
            .create(peer_id, kind, self.slot_events.clone())
            .await?;
        self.attach_local_media(&connection, kind).await?;

        let machine = SlotMachine::new(role, self.config.ice_restart_limit);
        if let Some(bundle) = self.state.bundles.get_mut(peer_id) {
            bundle.slots.insert(kind, Slot::new(machine, connection));
        }
        Ok(true)
    }

    async fn attach_local_media(
        &self,
        connection: &Arc<dyn PeerConnection>,
        kind: MediaKind,
    ) -> Result<(), Error> {
        match self.media.track(kind).filter(|track| track.is_live()) {
            Some(track) => {
                connection.add_track(track).await?;
                if !self.media.is_enabled(kind) {
                    connection.replace_track(None).await?;
                }
            }
            None => connection.add_receiver().await?,
        }
        Ok(())
    }

    async fn connect_slot(&mut self, peer_id: &str, kind: MediaKind) -> Result<(), Error> {
        let created = self.ensure_slot(peer_id, kind).await?;
        if !created {
            let connection = self.slot_mut(peer_id, kind)?.connection.clone();
            let has_sender = connection.has_sender().await;
            match self.media.sendable(kind) {
                Some(track) if !has_sender => connection.add_track(track).await?,
                _ => return Ok(()),
            }
        }
        self.offer(peer_id, kind, false).await
    }

    async fn offer(&mut self, peer_id: &str, kind: MediaKind, ice_restart: bool) -> Result<(), Error> {
        let slot = self.slot_mut(peer_id, kind)?;
        if ice_restart {
            let attempt = slot.machine.begin_ice_restart()?;
            tracing::info!("ICE restart {} for {} ({})", attempt, peer_id, kind);
        } else if slot.machine.can_offer() {
            slot.machine.begin_local_offer()?;
        } else {
            tracing::debug!(
                "{} slot towards {} is busy in {:?}, not offering",
                kind,
                peer_id,
                slot.machine.state()
            );
            return Ok(());
        }
        let connection = slot.connection.clone();

        let created: Result<RTCSessionDescription, Error> = async {
            let offer = connection.create_offer(ice_restart).await?;
            connection.set_local_description(offer.clone()).await?;
            Ok::<_, Error>(offer)
        }
        .await;

        match created {
            Ok(offer) => self.signaling.emit(ClientMessage::Offer {
                target_peer_id: peer_id.to_string(),
                description: offer,
                kind,
            }),
            Err(err) => {
                if let Ok(slot) = self.slot_mut(peer_id, kind) {
                    slot.machine.revert_local_offer();
                }
                Err(err)
            }
        }
    }

    async fn accept_offer(
        &mut self,
        from: &str,
        description: RTCSessionDescription,
        kind: MediaKind,
    ) -> Result<(), Error> {
        self.ensure_bundle(from)?;
        self.ensure_slot(from, kind).await?;

        let slot = self.slot_mut(from, kind)?;
        let decision = slot.machine.receive_offer();
        let mut connection = slot.connection.clone();
        match decision {
            OfferDecision::Ignore => {
                tracing::debug!("ignoring colliding {} offer from {}", kind, from);
                return Ok(());
            }
            OfferDecision::RollbackAndAccept => {
                tracing::debug!("{} offer collision with {}, rolling back", kind, from);
                if let Err(err) = connection.rollback().await {
                    tracing::warn!("rollback towards {} failed, recreating: {}", from, err);
                    connection = self.recreate_connection(from, kind).await?;
                }
            }
            OfferDecision::Accept => {}
        }

        connection.set_remote_description(description).await?;
        self.slot_mut(from, kind)?.flush_candidates().await;

        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;
        self.slot_mut(from, kind)?.machine.answer_sent()?;

        self.signaling.emit(ClientMessage::Answer {
            target_peer_id: from.to_string(),
            description: answer,
            kind,
        })
    }

    async fn apply_answer(&mut self, from: &str, description: RTCSessionDescription, kind: MediaKind) {
        let Ok(slot) = self.slot_mut(from, kind) else {
            tracing::warn!("{} answer from {} has no connection", kind, from);
            return;
        };
        match slot.machine.receive_answer() {
            AnswerDecision::Stale => {
                tracing::debug!("dropping stale {} answer from {}", kind, from);
            }
            AnswerDecision::Apply => {
                let connection = slot.connection.clone();
                match connection.set_remote_description(description).await {
                    Ok(()) => {
                        if let Ok(slot) = self.slot_mut(from, kind) {
                            slot.flush_candidates().await;
                        }
                    }
                    Err(err) => {
                        tracing::error!("failed to apply {} answer from {}: {}", kind, from, err);
                        self.fail_slot(from, kind);
                    }
                }
            }
        }
    }

    async fn add_remote_candidate(
        &mut self,
        from: &str,
        candidate: RTCIceCandidateInit,
        kind: MediaKind,
    ) {
        let Ok(slot) = self.slot_mut(from, kind) else {
            tracing::debug!("{} candidate from {} has no connection", kind, from);
            return;
        };
        if slot.connection.has_remote_description().await {
            if let Err(err) = slot.connection.add_ice_candidate(candidate).await {
                tracing::error!("failed to add_ice_candidate: {}", err);
            }
        } else {
            tracing::debug!("Pending ICE candidate for {:?}", candidate);
            slot.pending_candidates.push(candidate);
        }
    }

    async fn recreate_connection(
        &mut self,
        peer_id: &str,
        kind: MediaKind,
    ) -> Result<Arc<dyn PeerConnection>, Error> {
        let old = self.slot_mut(peer_id, kind)?.connection.clone();
        if let Err(err) = old.close().await {
            tracing::warn!("failed to close {} connection to {}: {}", kind, peer_id, err);
        }
        let connection = self
            .factory
            .create(peer_id, kind, self.slot_events.clone())
            .await?;
        self.attach_local_media(&connection, kind).await?;

        let slot = self.slot_mut(peer_id, kind)?;
        slot.connection = connection.clone();
        slot.pending_candidates.clear();
        Ok(connection)
    }

    fn fail_slot(&mut self, peer_id: &str, kind: MediaKind) {
        let Ok(slot) = self.slot_mut(peer_id, kind) else {
            return;
        };
        slot.machine.fail();
        slot.failed = true;
        slot.epoch += 1;
        let epoch = slot.epoch;
        self.schedule_settle(peer_id.to_string(), kind, epoch);
    }

    fn schedule_settle(&self, peer_id: PeerId, kind: MediaKind, epoch: u64) {
        let Some(inputs) = self.inputs.upgrade() else {
            return;
        };
        let settle = self.config.ice_failure_settle;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = sleep(settle) => {
                    let _ = inputs.send(MeshInput::SettleElapsed { peer_id, kind, epoch });
                }
            }
        });
    }

    async fn handle_settle(&mut self, peer_id: PeerId, kind: MediaKind, epoch: u64) {
        let Ok(slot) = self.slot_mut(&peer_id, kind) else {
            return;
        };
        if slot.epoch != epoch || !slot.failed {
            return;
        }
        slot.machine.fail();

        match self.offer(&peer_id, kind, true).await {
            Ok(()) => {
                if let Ok(slot) = self.slot_mut(&peer_id, kind) {
                    let epoch = slot.epoch;
                    self.schedule_settle(peer_id, kind, epoch);
                }
            }
            Err(Error::NegotiationError(err))
                if err.kind == NegotiationErrorKind::IceRestartExhaustedError =>
            {
                tracing::error!("{} connection to {} is lost: {}", kind, peer_id, err);
                if let Some(bundle) = self.state.bundles.get_mut(&peer_id) {
                    bundle.close_slot(kind).await;
                }
                self.emit(CallEvent::ConnectionLost { peer_id, kind });
            }
            Err(err) => {
                tracing::error!("ICE restart towards {} ({}) failed: {}", peer_id, kind, err);
                self.schedule_settle(peer_id, kind, epoch);
            }
        }
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

        let outgoing = if enabled {
            match self.media.sendable(kind) {
                Some(track) => Some(track),
                None => {
                    self.media.set_enabled(kind, false);
                    return Err(Error::new_device(
                        format!("no live {} source", kind),
                        DeviceErrorKind::NotLoadedError,
                    ));
                }
            }
        } else {
            None
        };

        for peer_id in self.peer_ids() {
            let Ok(slot) = self.slot_mut(&peer_id, kind) else {
                continue;
            };
            let connection = slot.connection.clone();
            let has_sender = connection.has_sender().await;
            let result = match outgoing.clone() {
                None if has_sender => connection.replace_track(None).await,
                None => Ok(()),
                Some(track) if has_sender => {
                    connection.replace_track(Some(track)).await
                }
                // Nothing was ever sent on this slot, so a new sender has to be negotiated.
                Some(track) => match connection.add_track(track).await {
                    Ok(()) => self.offer(&peer_id, kind, false).await,
                    Err(err) => Err(err),
                },
            };
            if let Err(err) = result {
                tracing::warn!("failed to switch {} towards {}: {}", kind, peer_id, err);
            }
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
        self.media.insert(track);

        for peer_id in self.peer_ids() {
            if let Err(err) = self.connect_slot(&peer_id, MediaKind::Screen).await {
                tracing::error!("failed to share screen with {}: {}", peer_id, err);
            }
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
        if let Some(track) = self.media.remove(MediaKind::Screen) {
            track.stop();
        }

        for peer_id in self.peer_ids() {
            let remote_sharing = self
                .state
                .participants
                .get(&peer_id)
                .map(|p| p.media.screen)
                .unwrap_or(false);
            if remote_sharing {
                if let Ok(slot) = self.slot_mut(&peer_id, MediaKind::Screen) {
                    let connection = slot.connection.clone();
                    if connection.has_sender().await {
                        if let Err(err) = connection.replace_track(None).await {
                            tracing::warn!("failed to stop screen towards {}: {}", peer_id, err);
                        }
                    }
                }
            } else if let Some(bundle) = self.state.bundles.get_mut(&peer_id) {
                bundle.close_slot(MediaKind::Screen).await;
            }
        }

        if let Some(room_id) = self.state.room_id.clone() {
            self.signaling.emit(ClientMessage::ScreenState {
                room_id,
                active: false,
            })?;
        }
        Ok(())
    }

    fn snapshot(&self) -> MeshSnapshot {
        MeshSnapshot {
            room_id: self.state.room_id.clone(),
            local_peer_id: self.state.local_peer_id.clone(),
            participants: self.state.participants.values().cloned().collect(),
            connections: self
                .state
                .bundles
                .iter()
                .map(|(peer_id, bundle)| {
                    let states = bundle
                        .kinds()
                        .into_iter()
                        .filter_map(|kind| bundle.state(kind).map(|state| (kind, state)))
                        .collect();
                    (peer_id.clone(), states)
                })
                .collect(),
        }
    }

    async fn close_bundles(&mut self) {
        for (_, bundle) in self.state.bundles.drain() {
            bundle.close().await;
        }
    }

    async fn leave(&mut self) {
        self.close_bundles().await;
        self.media.stop_all();
        if let Err(err) = self.signaling.leave_room().await {
            tracing::warn!("failed to send leave-room: {}", err);
        }
        self.state = MeshState::default();
    }

    fn peer_ids(&self) -> Vec<PeerId> {
        self.state.bundles.keys().cloned().collect()
    }

    fn slot_mut(&mut self, peer_id: &str, kind: MediaKind) -> Result<&mut Slot, Error> {
        self.state
            .bundles
            .get_mut(peer_id)
            .and_then(|bundle| bundle.slots.get_mut(&kind))
            .ok_or_else(|| Error::peer_connection_missing(peer_id, kind))
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            Mutex as StdMutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

    use super::*;
    use crate::{
        config::SignalingConfig,
        media::test::FakeSource,
        protocol::{Identity, MediaState},
        signaling::test::{FakeConnector, ServerEnd},
    };

    fn description(sdp_type: RTCSdpType, sdp: &str) -> RTCSessionDescription {
        let mut description = RTCSessionDescription::default();
        description.sdp_type = sdp_type;
        description.sdp = sdp.to_string();
        description
    }

    #[derive(Default)]
    struct FakePeerConnection {
        calls: StdMutex<Vec<String>>,
        local: StdMutex<Option<RTCSessionDescription>>,
        remote: StdMutex<Option<RTCSessionDescription>>,
        has_sender: AtomicBool,
        offers: AtomicU32,
        restarts: AtomicU32,
        closed: AtomicBool,
    }

    impl FakePeerConnection {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn called(&self, call: &str) -> bool {
            self.calls.lock().unwrap().iter().any(|c| c == call)
        }
    }

    #[async_trait]
    impl PeerConnection for FakePeerConnection {
        async fn create_offer(&self, ice_restart: bool) -> Result<RTCSessionDescription, Error> {
            let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
            if ice_restart {
                self.restarts.fetch_add(1, Ordering::SeqCst);
            }
            Ok(description(RTCSdpType::Offer, &format!("offer-{}", n)))
        }

        async fn create_answer(&self) -> Result<RTCSessionDescription, Error> {
            Ok(description(RTCSdpType::Answer, "answer"))
        }

        async fn set_local_description(
            &self,
            description: RTCSessionDescription,
        ) -> Result<(), Error> {
            *self.local.lock().unwrap() = Some(description);
            Ok(())
        }

        async fn set_remote_description(
            &self,
            description: RTCSessionDescription,
        ) -> Result<(), Error> {
            self.record(format!("set_remote:{}", description.sdp));
            *self.remote.lock().unwrap() = Some(description);
            Ok(())
        }

        async fn rollback(&self) -> Result<(), Error> {
            self.record("rollback");
            *self.local.lock().unwrap() = None;
            Ok(())
        }

        async fn local_description(&self) -> Option<RTCSessionDescription> {
            self.local.lock().unwrap().clone()
        }

        async fn has_remote_description(&self) -> bool {
            self.remote.lock().unwrap().is_some()
        }

        async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
            self.record(format!("add_ice_candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn add_receiver(&self) -> Result<(), Error> {
            self.record("add_receiver");
            Ok(())
        }

        async fn has_sender(&self) -> bool {
            self.has_sender.load(Ordering::SeqCst)
        }

        async fn replace_track(&self, track: Option<LocalTrack>) -> Result<(), Error> {
            match track {
                Some(_) => self.record("replace_track:some"),
                None => self.record("replace_track:none"),
            }
            Ok(())
        }

        async fn add_track(&self, _track: LocalTrack) -> Result<(), Error> {
            self.record("add_track");
            self.has_sender.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<(), Error> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        created: StdMutex<Vec<(PeerId, MediaKind, Arc<FakePeerConnection>)>>,
        events: StdMutex<Option<mpsc::UnboundedSender<SlotEvent>>>,
    }

    impl FakeFactory {
        fn connection(&self, peer_id: &str, kind: MediaKind) -> Arc<FakePeerConnection> {
            self.created
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(p, k, _)| p == peer_id && *k == kind)
                .map(|(_, _, c)| c.clone())
                .expect("connection was never created")
        }

        fn report(&self, peer_id: &str, kind: MediaKind, status: ConnectionStatus) {
            let events = self.events.lock().unwrap().clone().expect("no connection yet");
            events
                .send(SlotEvent {
                    peer_id: peer_id.to_string(),
                    kind,
                    event: PeerConnectionEvent::StateChanged(status),
                })
                .expect("engine stopped");
        }
    }

    #[async_trait]
    impl PeerConnectionFactory for FakeFactory {
        async fn create(
            &self,
            remote_peer_id: &str,
            kind: MediaKind,
            events: mpsc::UnboundedSender<SlotEvent>,
        ) -> Result<Arc<dyn PeerConnection>, Error> {
            let connection = Arc::new(FakePeerConnection::default());
            self.created
                .lock()
                .unwrap()
                .push((remote_peer_id.to_string(), kind, connection.clone()));
            *self.events.lock().unwrap() = Some(events);
            Ok(connection)
        }
    }

    struct Harness {
        handle: MeshHandle,
        server: ServerEnd,
        factory: Arc<FakeFactory>,
        events: broadcast::Receiver<CallEvent>,
        audio: Arc<FakeSource>,
    }

    impl Harness {
        async fn new() -> Self {
            let (connector, mut ends) = FakeConnector::new();
            let signaling = SignalingClient::connect(connector, SignalingConfig::default())
                .await
                .expect("failed to connect");
            let server = ends.recv().await.expect("no link");

            let audio = FakeSource::new(MediaKind::Audio);
            let mut media = LocalMedia::default();
            media.insert(audio.clone());
            media.insert(FakeSource::new(MediaKind::Video));

            let factory = Arc::new(FakeFactory::default());
            let (events, receiver) = broadcast::channel(256);
            let handle = MeshEngine::spawn(
                signaling,
                factory.clone(),
                media,
                MeshConfig::default(),
                events,
            );

            Self {
                handle,
                server,
                factory,
                events: receiver,
                audio,
            }
        }

        fn join_as(&self, local: &str, remotes: &[&str]) {
            self.server.send(ServerMessage::ExistingParticipants {
                room_id: "room".to_string(),
                self_peer_id: local.to_string(),
                participants: remotes.iter().map(|id| participant(id)).collect(),
                sfu: None,
            });
        }

        async fn next_message(&mut self) -> ClientMessage {
            self.server.next_envelope().await.message
        }

        async fn expect_offer(&mut self, peer: &str, expected: MediaKind) {
            match self.next_message().await {
                ClientMessage::Offer {
                    target_peer_id,
                    kind,
                    ..
                } => {
                    assert_eq!(target_peer_id, peer);
                    assert_eq!(kind, expected);
                }
                other => panic!("expected offer, got {:?}", other),
            }
        }

        async fn wait_for(&self, condition: impl Fn(&MeshSnapshot) -> bool) -> MeshSnapshot {
            for _ in 0..200 {
                let snapshot = self.handle.snapshot().await.expect("snapshot");
                if condition(&snapshot) {
                    return snapshot;
                }
                sleep(Duration::from_millis(10)).await;
            }
            panic!("mesh never reached the expected state");
        }
    }

    fn participant(peer_id: &str) -> Participant {
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

    fn slot_state(snapshot: &MeshSnapshot, peer: &str, kind: MediaKind) -> Option<NegotiationState> {
        snapshot
            .connections
            .get(peer)?
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, state)| *state)
    }

    fn answer_from(peer: &str, kind: MediaKind) -> ServerMessage {
        ServerMessage::ReceiveAnswer {
            from_peer_id: peer.to_string(),
            description: description(RTCSdpType::Answer, &format!("answer-from-{}", peer)),
            kind,
        }
    }

    #[tokio::test]
    async fn joining_offers_every_kind_and_flushes_early_candidates() {
        let mut h = Harness::new().await;
        h.join_as("a", &["b"]);
        h.expect_offer("b", MediaKind::Audio).await;
        h.expect_offer("b", MediaKind::Video).await;

        h.server.send(ServerMessage::ReceiveIceCandidate {
            from_peer_id: "b".to_string(),
            candidate: RTCIceCandidateInit {
                candidate: "candidate:1".to_string(),
                ..Default::default()
            },
            kind: MediaKind::Audio,
        });
        h.server.send(answer_from("b", MediaKind::Audio));
        h.server.send(answer_from("b", MediaKind::Video));

        h.wait_for(|s| {
            slot_state(s, "b", MediaKind::Audio) == Some(NegotiationState::Stable)
                && slot_state(s, "b", MediaKind::Video) == Some(NegotiationState::Stable)
        })
        .await;

        let audio = h.factory.connection("b", MediaKind::Audio);
        let calls = audio.calls.lock().unwrap().clone();
        let answer = calls
            .iter()
            .position(|c| c == "set_remote:answer-from-b")
            .expect("answer applied");
        let candidate = calls
            .iter()
            .position(|c| c == "add_ice_candidate:candidate:1")
            .expect("candidate applied");
        assert!(answer < candidate);
    }

    #[tokio::test]
    async fn polite_side_rolls_back_and_drops_the_stale_answer() {
        let mut h = Harness::new().await;
        h.join_as("a", &["b"]);
        h.expect_offer("b", MediaKind::Audio).await;
        h.expect_offer("b", MediaKind::Video).await;

        h.server.send(ServerMessage::ReceiveOffer {
            from_peer_id: "b".to_string(),
            description: description(RTCSdpType::Offer, "offer-from-b"),
            kind: MediaKind::Audio,
        });
        match h.next_message().await {
            ClientMessage::Answer {
                target_peer_id,
                kind,
                ..
            } => {
                assert_eq!(target_peer_id, "b");
                assert_eq!(kind, MediaKind::Audio);
            }
            other => panic!("expected answer, got {:?}", other),
        }

        // b answers the offer a has already rolled back.
        h.server.send(answer_from("b", MediaKind::Audio));
        h.server.send(ServerMessage::MediaToggled {
            peer_id: "b".to_string(),
            kind: MediaKind::Audio,
            enabled: false,
        });
        let snapshot = h
            .wait_for(|s| s.participants.iter().any(|p| p.peer_id == "b" && !p.media.audio))
            .await;
        assert_eq!(
            slot_state(&snapshot, "b", MediaKind::Audio),
            Some(NegotiationState::Stable)
        );

        let audio = h.factory.connection("b", MediaKind::Audio);
        assert!(audio.called("rollback"));
        assert!(audio.called("set_remote:offer-from-b"));
        assert!(!audio.called("set_remote:answer-from-b"));
    }

    #[tokio::test]
    async fn impolite_side_ignores_the_colliding_offer() {
        let mut h = Harness::new().await;
        h.join_as("c", &["b"]);
        h.expect_offer("b", MediaKind::Audio).await;
        h.expect_offer("b", MediaKind::Video).await;

        h.server.send(ServerMessage::ReceiveOffer {
            from_peer_id: "b".to_string(),
            description: description(RTCSdpType::Offer, "offer-from-b"),
            kind: MediaKind::Audio,
        });
        h.server.send(answer_from("b", MediaKind::Audio));
        h.wait_for(|s| slot_state(s, "b", MediaKind::Audio) == Some(NegotiationState::Stable))
            .await;

        h.handle
            .set_media_enabled(MediaKind::Audio, false, None)
            .await
            .expect("toggle");
        // No answer was produced for the ignored offer.
        assert_eq!(h.next_message().await.action(), "toggle-media");

        let audio = h.factory.connection("b", MediaKind::Audio);
        assert!(!audio.called("rollback"));
        assert!(!audio.called("set_remote:offer-from-b"));
    }

    #[tokio::test]
    async fn toggling_media_never_renegotiates() {
        let mut h = Harness::new().await;
        h.join_as("a", &["b"]);
        h.expect_offer("b", MediaKind::Audio).await;
        h.expect_offer("b", MediaKind::Video).await;
        h.server.send(answer_from("b", MediaKind::Audio));
        h.server.send(answer_from("b", MediaKind::Video));
        h.wait_for(|s| slot_state(s, "b", MediaKind::Video) == Some(NegotiationState::Stable))
            .await;

        let video = h.factory.connection("b", MediaKind::Video);
        let before = video.local_description().await.expect("local description").sdp;

        h.handle
            .set_media_enabled(MediaKind::Video, false, None)
            .await
            .expect("disable");
        h.handle
            .set_media_enabled(MediaKind::Video, true, None)
            .await
            .expect("enable");

        for enabled in [false, true] {
            match h.next_message().await {
                ClientMessage::ToggleMedia {
                    kind, enabled: e, ..
                } => {
                    assert_eq!(kind, MediaKind::Video);
                    assert_eq!(e, enabled);
                }
                other => panic!("expected toggle-media, got {:?}", other),
            }
        }

        assert!(video.called("replace_track:none"));
        assert!(video.called("replace_track:some"));
        assert_eq!(video.offers.load(Ordering::SeqCst), 1);
        let after = video.local_description().await.expect("local description").sdp;
        assert_eq!(before, after);
    }

    #[tokio::test(start_paused = true)]
    async fn ice_restarts_are_bounded_then_connection_is_lost() {
        let mut h = Harness::new().await;
        h.join_as("b", &["a"]);
        h.expect_offer("a", MediaKind::Audio).await;
        h.expect_offer("a", MediaKind::Video).await;
        h.server.send(answer_from("a", MediaKind::Video));
        h.wait_for(|s| slot_state(s, "a", MediaKind::Video) == Some(NegotiationState::Stable))
            .await;

        h.factory.report("a", MediaKind::Video, ConnectionStatus::Failed);

        loop {
            match h.events.recv().await.expect("event stream closed") {
                CallEvent::ConnectionLost { peer_id, kind } => {
                    assert_eq!(peer_id, "a");
                    assert_eq!(kind, MediaKind::Video);
                    break;
                }
                _ => continue,
            }
        }

        let video = h.factory.connection("a", MediaKind::Video);
        assert_eq!(video.restarts.load(Ordering::SeqCst), 3);
        assert!(video.closed.load(Ordering::SeqCst));

        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert_eq!(slot_state(&snapshot, "a", MediaKind::Video), None);
        assert!(slot_state(&snapshot, "a", MediaKind::Audio).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnecting_before_settle_cancels_the_restart() {
        let mut h = Harness::new().await;
        h.join_as("b", &["a"]);
        h.expect_offer("a", MediaKind::Audio).await;
        h.expect_offer("a", MediaKind::Video).await;
        h.server.send(answer_from("a", MediaKind::Audio));
        h.wait_for(|s| slot_state(s, "a", MediaKind::Audio) == Some(NegotiationState::Stable))
            .await;

        h.factory.report("a", MediaKind::Audio, ConnectionStatus::Failed);
        h.factory.report("a", MediaKind::Audio, ConnectionStatus::Connected);
        sleep(Duration::from_secs(10)).await;
        h.handle.snapshot().await.expect("snapshot");

        let audio = h.factory.connection("a", MediaKind::Audio);
        assert_eq!(audio.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn user_left_closes_the_bundle() {
        let mut h = Harness::new().await;
        h.join_as("a", &["b", "c"]);
        for peer in ["b", "c"] {
            h.expect_offer(peer, MediaKind::Audio).await;
            h.expect_offer(peer, MediaKind::Video).await;
        }

        h.server.send(ServerMessage::UserLeft {
            peer_id: "b".to_string(),
        });
        let snapshot = h.wait_for(|s| !s.connections.contains_key("b")).await;
        assert!(snapshot.connections.contains_key("c"));
        assert!(snapshot.participants.iter().all(|p| p.peer_id != "b"));

        for kind in [MediaKind::Audio, MediaKind::Video] {
            assert!(h.factory.connection("b", kind).closed.load(Ordering::SeqCst));
            assert!(!h.factory.connection("c", kind).closed.load(Ordering::SeqCst));
        }
    }

    #[tokio::test]
    async fn leave_closes_everything_and_stops_the_engine() {
        let mut h = Harness::new().await;
        h.join_as("a", &["b"]);
        h.expect_offer("b", MediaKind::Audio).await;
        h.expect_offer("b", MediaKind::Video).await;

        h.handle.leave().await.expect("leave");

        assert!(h.factory.connection("b", MediaKind::Audio).closed.load(Ordering::SeqCst));
        assert!(h.factory.connection("b", MediaKind::Video).closed.load(Ordering::SeqCst));
        assert!(!h.audio.is_live());
        assert!(h.handle.snapshot().await.is_err());
    }

    #[tokio::test]
    async fn screen_share_opens_a_slot_per_peer() {
        let mut h = Harness::new().await;
        h.join_as("a", &["b"]);
        h.expect_offer("b", MediaKind::Audio).await;
        h.expect_offer("b", MediaKind::Video).await;

        h.handle
            .start_screen_share(FakeSource::new(MediaKind::Screen))
            .await
            .expect("share");
        h.expect_offer("b", MediaKind::Screen).await;
        assert_eq!(h.next_message().await.action(), "screen-state");

        h.handle.stop_screen_share().await.expect("stop");
        assert_eq!(h.next_message().await.action(), "screen-state");
        let snapshot = h.handle.snapshot().await.expect("snapshot");
        assert_eq!(slot_state(&snapshot, "b", MediaKind::Screen), None);
        assert!(h.factory.connection("b", MediaKind::Screen).closed.load(Ordering::SeqCst));
    }
}
