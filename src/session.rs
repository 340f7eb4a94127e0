//! The call controller contract the UI talks to.
//!
//! A [`CallSession`] picks one [`CallTransportStrategy`] when it starts and drives it for the
//! rest of its life. Everything the session learns comes back as [`CallEvent`]s.
use std::sync::Arc;

use async_trait::async_trait;
use enclose::enc;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};

use crate::{
    config::{MeshConfig, QualityConfig, SessionConfig, SpeakerConfig},
    error::{DeviceErrorKind, Error, RoomErrorKind, TransportErrorKind},
    media::{LocalMedia, LocalTrack, MediaDevices},
    mesh::{rtc::RtcPeerConnectionFactory, ConnectionStatus, MeshEngine, MeshHandle, PeerConnectionFactory},
    protocol::{CallMode, Direction, Identity, MediaKind, Participant, PeerId, RoomId},
    quality::{QualityLevel, QualityMonitor},
    sfu_client::{Device, SfuEngine, SfuHandle},
    signaling::{SignalingClient, SignalingConnector},
    speaker::SpeakerMonitor,
};

#[derive(Debug, Clone)]
pub enum CallEvent {
    Joined {
        room_id: RoomId,
        self_peer_id: PeerId,
        participants: Vec<Participant>,
    },
    ParticipantJoined(Participant),
    ParticipantLeft {
        peer_id: PeerId,
    },
    MediaToggled {
        peer_id: PeerId,
        kind: MediaKind,
        enabled: bool,
    },
    ScreenShareChanged {
        peer_id: PeerId,
        active: bool,
    },
    RemoteTrack {
        peer_id: PeerId,
        kind: MediaKind,
        track_id: String,
    },
    RemoteTrackEnded {
        peer_id: PeerId,
        kind: MediaKind,
        track_id: String,
    },
    /// Mesh only.
    ConnectionState {
        peer_id: PeerId,
        kind: MediaKind,
        status: ConnectionStatus,
    },
    /// A mesh connection that could not be restored by ICE restarts.
    ConnectionLost {
        peer_id: PeerId,
        kind: MediaKind,
    },
    TransportRecovered {
        direction: Direction,
    },
    /// The SFU session cannot be restored any more.
    SessionLost {
        reason: String,
    },
    QualityChanged {
        peer_id: PeerId,
        consumer_id: String,
        level: QualityLevel,
    },
    DominantSpeaker {
        peer_id: Option<PeerId>,
    },
    RoomError {
        message: String,
    },
    SignalingDisconnected,
    SignalingReconnected,
}

#[async_trait]
pub trait CallTransportStrategy: Send + Sync {
    fn mode(&self) -> CallMode;
    async fn join(&self, room_id: &str, identity: Identity, create: bool) -> Result<(), Error>;
    /// Returns once every resource of the call is closed and every task has stopped.
    async fn leave(&self) -> Result<(), Error>;
    async fn set_media_enabled(
        &self,
        kind: MediaKind,
        enabled: bool,
        track: Option<LocalTrack>,
    ) -> Result<(), Error>;
    async fn start_screen_share(&self, track: LocalTrack) -> Result<(), Error>;
    async fn stop_screen_share(&self) -> Result<(), Error>;
    /// Pins the received quality of a peer, `None` returns it to automatic.
    async fn set_quality(&self, peer_id: &str, level: Option<QualityLevel>) -> Result<(), Error>;
    fn events(&self) -> broadcast::Receiver<CallEvent>;
}

pub struct MeshStrategy {
    handle: MeshHandle,
    events: broadcast::Sender<CallEvent>,
}

impl MeshStrategy {
    pub fn new(
        signaling: SignalingClient,
        factory: Arc<dyn PeerConnectionFactory>,
        media: LocalMedia,
        config: MeshConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let handle = MeshEngine::spawn(signaling, factory, media, config, events.clone());
        Self { handle, events }
    }
}

#[async_trait]
impl CallTransportStrategy for MeshStrategy {
    fn mode(&self) -> CallMode {
        CallMode::Mesh
    }

    async fn join(&self, room_id: &str, identity: Identity, create: bool) -> Result<(), Error> {
        self.handle.join(room_id, identity, create).await
    }

    async fn leave(&self) -> Result<(), Error> {
        self.handle.leave().await
    }

    async fn set_media_enabled(
        &self,
        kind: MediaKind,
        enabled: bool,
        track: Option<LocalTrack>,
    ) -> Result<(), Error> {
        self.handle.set_media_enabled(kind, enabled, track).await
    }

    async fn start_screen_share(&self, track: LocalTrack) -> Result<(), Error> {
        self.handle.start_screen_share(track).await
    }

    async fn stop_screen_share(&self) -> Result<(), Error> {
        self.handle.stop_screen_share().await
    }

    async fn set_quality(&self, peer_id: &str, _level: Option<QualityLevel>) -> Result<(), Error> {
        Err(Error::new_device(
            format!("received quality of {} cannot be chosen in a mesh call", peer_id),
            DeviceErrorKind::UnsupportedError,
        ))
    }

    fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }
}

struct Monitors {
    quality: QualityMonitor,
    speaker: SpeakerMonitor,
    relay: JoinHandle<()>,
}

pub struct SfuStrategy {
    handle: SfuHandle,
    quality_config: QualityConfig,
    speaker_config: SpeakerConfig,
    monitors: Mutex<Option<Monitors>>,
    events: broadcast::Sender<CallEvent>,
}

impl SfuStrategy {
    pub fn new(
        signaling: SignalingClient,
        device: Arc<dyn Device>,
        media: LocalMedia,
        config: &SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let handle = SfuEngine::spawn(
            signaling,
            device,
            media,
            config.recovery.clone(),
            events.clone(),
        );
        Self {
            handle,
            quality_config: config.quality.clone(),
            speaker_config: config.speaker.clone(),
            monitors: Mutex::new(None),
            events,
        }
    }

    async fn start_monitors(&self) {
        let mut monitors = self.monitors.lock().await;
        if monitors.is_some() {
            return;
        }
        let handle = Arc::new(self.handle.clone());
        let quality = QualityMonitor::spawn(self.quality_config.clone(), handle.clone(), handle.clone());
        let (changes, mut change_receiver) = mpsc::unbounded_channel();
        let speaker = SpeakerMonitor::spawn(self.speaker_config.clone(), handle.clone(), changes);
        let overrides = quality.overrides();
        // Ends when the speaker monitor drops its sender.
        let relay = tokio::spawn(enc!((handle) async move {
            while let Some(change) = change_receiver.recv().await {
                let Ok(boost) = handle.dominant_speaker(change.current).await else {
                    break;
                };
                for consumer_id in boost.demoted.iter() {
                    overrides.set_quality(consumer_id, None);
                }
                for consumer_id in boost.promoted.iter() {
                    overrides.set_quality(consumer_id, Some(QualityLevel::High));
                }
            }
        }));
        *monitors = Some(Monitors {
            quality,
            speaker,
            relay,
        });
    }
}

#[async_trait]
impl CallTransportStrategy for SfuStrategy {
    fn mode(&self) -> CallMode {
        CallMode::Sfu
    }

    async fn join(&self, room_id: &str, identity: Identity, create: bool) -> Result<(), Error> {
        self.handle.join(room_id, identity, create).await?;
        self.start_monitors().await;
        Ok(())
    }

    async fn leave(&self) -> Result<(), Error> {
        if let Some(monitors) = self.monitors.lock().await.take() {
            monitors.quality.stop().await;
            monitors.speaker.stop().await;
            let _ = monitors.relay.await;
        }
        self.handle.leave().await
    }

    async fn set_media_enabled(
        &self,
        kind: MediaKind,
        enabled: bool,
        track: Option<LocalTrack>,
    ) -> Result<(), Error> {
        self.handle.set_media_enabled(kind, enabled, track).await
    }

    async fn start_screen_share(&self, track: LocalTrack) -> Result<(), Error> {
        self.handle.start_screen_share(track).await
    }

    async fn stop_screen_share(&self) -> Result<(), Error> {
        self.handle.stop_screen_share().await
    }

    async fn set_quality(&self, peer_id: &str, level: Option<QualityLevel>) -> Result<(), Error> {
        let monitors = self.monitors.lock().await;
        let Some(monitors) = monitors.as_ref() else {
            return Err(Error::new_room(
                "not in a call".to_string(),
                RoomErrorKind::NotJoinedError,
            ));
        };
        let consumers = self.handle.override_quality(peer_id, level.is_some()).await?;
        if consumers.is_empty() {
            return Err(Error::new_transport(
                format!("no video is received from {}", peer_id),
                TransportErrorKind::ConsumeError,
            ));
        }
        for consumer_id in consumers.iter() {
            monitors.quality.set_quality(consumer_id, level);
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }
}

pub struct CallSession {
    strategy: Arc<dyn CallTransportStrategy>,
    signaling: SignalingClient,
    devices: Arc<dyn MediaDevices>,
}

impl CallSession {
    /// Connects to signaling, acquires the microphone and camera and sets up the strategy for
    /// `config.mode`. SFU calls need the client-side media `device`.
    pub async fn start(
        config: SessionConfig,
        connector: Arc<dyn SignalingConnector>,
        devices: Arc<dyn MediaDevices>,
        device: Option<Arc<dyn Device>>,
    ) -> Result<Self, Error> {
        let signaling = SignalingClient::connect(connector, config.signaling.clone()).await?;
        let media = LocalMedia::acquire(devices.as_ref(), &[MediaKind::Audio, MediaKind::Video]).await;

        let strategy: Arc<dyn CallTransportStrategy> = match config.mode {
            CallMode::Mesh => {
                let factory = Arc::new(RtcPeerConnectionFactory::new(config.transport.clone())?);
                Arc::new(MeshStrategy::new(
                    signaling.clone(),
                    factory,
                    media,
                    config.mesh.clone(),
                ))
            }
            CallMode::Sfu => {
                let device = device.ok_or_else(|| {
                    Error::new_device(
                        "an sfu call needs a media device".to_string(),
                        DeviceErrorKind::NotLoadedError,
                    )
                })?;
                Arc::new(SfuStrategy::new(signaling.clone(), device, media, &config))
            }
        };
        tracing::info!("call session started in {:?} mode", config.mode);

        Ok(Self::with_strategy(strategy, signaling, devices))
    }

    pub fn with_strategy(
        strategy: Arc<dyn CallTransportStrategy>,
        signaling: SignalingClient,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        Self {
            strategy,
            signaling,
            devices,
        }
    }

    pub fn mode(&self) -> CallMode {
        self.strategy.mode()
    }

    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.strategy.events()
    }

    /// Joins `room_id`. A missing room is created by a second, final attempt.
    pub async fn join(&self, room_id: &str, identity: Identity) -> Result<(), Error> {
        match self.strategy.join(room_id, identity.clone(), false).await {
            Err(err) if err.is_room_not_found() => {
                tracing::info!("room {} does not exist yet, creating it", room_id);
                self.strategy.join(room_id, identity, true).await
            }
            result => result,
        }
    }

    pub async fn leave(&self) -> Result<(), Error> {
        let result = self.strategy.leave().await;
        self.signaling.close();
        result
    }

    /// Enables or disables a local kind. A source that has ended is acquired again.
    pub async fn set_media_enabled(&self, kind: MediaKind, enabled: bool) -> Result<(), Error> {
        match self.strategy.set_media_enabled(kind, enabled, None).await {
            Err(Error::DeviceError(err)) if enabled && err.kind == DeviceErrorKind::NotLoadedError => {
                tracing::debug!("{}, acquiring {} again", err, kind);
                let track = self.devices.acquire(kind).await?;
                self.strategy.set_media_enabled(kind, true, Some(track)).await
            }
            result => result,
        }
    }

    pub async fn start_screen_share(&self) -> Result<(), Error> {
        let track = self.devices.acquire(MediaKind::Screen).await?;
        self.strategy.start_screen_share(track).await
    }

    pub async fn stop_screen_share(&self) -> Result<(), Error> {
        self.strategy.stop_screen_share().await
    }

    pub async fn set_quality(&self, peer_id: &str, level: Option<QualityLevel>) -> Result<(), Error> {
        self.strategy.set_quality(peer_id, level).await
    }
}
