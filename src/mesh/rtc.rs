use std::sync::Arc;

use async_trait::async_trait;
use enclose::enc;
use tokio::sync::{mpsc, Mutex};
use webrtc::{
    api::{media_engine::MediaEngine, APIBuilder, API},
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_connection_state::RTCIceConnectionState,
    },
    peer_connection::{
        offer_answer_options::RTCOfferOptions,
        peer_connection_state::RTCPeerConnectionState,
        sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
        RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_receiver::RTCRtpReceiver, rtp_sender::RTCRtpSender,
        rtp_transceiver_direction::RTCRtpTransceiverDirection, RTCRtpTransceiver,
        RTCRtpTransceiverInit,
    },
    track::{track_local::TrackLocal, track_remote::TrackRemote},
};

use super::peer_connection::{
    ConnectionStatus, PeerConnection, PeerConnectionEvent, PeerConnectionFactory, SlotEvent,
};
use crate::{
    config::WebRTCTransportConfig,
    error::{DeviceErrorKind, Error, NegotiationErrorKind},
    media::LocalTrack,
    media_engine,
    protocol::{MediaKind, PeerId},
};

/// Creates webrtc-rs peer connections sharing one API instance.
pub struct RtcPeerConnectionFactory {
    api: API,
    config: WebRTCTransportConfig,
}

impl RtcPeerConnectionFactory {
    pub fn new(config: WebRTCTransportConfig) -> Result<Self, Error> {
        let mut me = MediaEngine::default();
        media_engine::register_default_codecs(&mut me)?;
        media_engine::register_extensions(&mut me)?;
        let api = APIBuilder::new()
            .with_media_engine(me)
            .with_setting_engine(config.setting_engine())
            .build();

        Ok(Self { api, config })
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerConnectionFactory {
    async fn create(
        &self,
        remote_peer_id: &str,
        kind: MediaKind,
        events: mpsc::UnboundedSender<SlotEvent>,
    ) -> Result<Arc<dyn PeerConnection>, Error> {
        let peer_connection = self
            .api
            .new_peer_connection(self.config.configuration())
            .await?;

        let connection = RtcPeerConnection {
            peer_id: remote_peer_id.to_string(),
            kind,
            peer_connection: Arc::new(peer_connection),
            sender: Mutex::new(None),
        };
        connection.hooks(events);

        tracing::debug!("RtcPeerConnection for {} ({}) is created", remote_peer_id, kind);

        Ok(Arc::new(connection))
    }
}

pub struct RtcPeerConnection {
    peer_id: PeerId,
    kind: MediaKind,
    peer_connection: Arc<RTCPeerConnection>,
    sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

impl RtcPeerConnection {
    fn hooks(&self, events: mpsc::UnboundedSender<SlotEvent>) {
        let peer = self.peer_connection.clone();
        let peer_id = self.peer_id.clone();
        let kind = self.kind;

        peer.on_ice_candidate(Box::new(enc!((events, peer_id)
            move |candidate: Option<RTCIceCandidate>| {
                Box::pin(enc!((events, peer_id) async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(SlotEvent {
                                peer_id,
                                kind,
                                event: PeerConnectionEvent::LocalCandidate(init),
                            });
                        }
                        Err(err) => tracing::error!("failed to serialize ICE candidate: {}", err),
                    }
                }))
            }
        )));

        peer.on_peer_connection_state_change(Box::new(enc!((events, peer_id)
            move |state: RTCPeerConnectionState| {
                Box::pin(enc!((events, peer_id) async move {
                    tracing::debug!("connection state for {} ({}) changed: {}", peer_id, kind, state);
                    let _ = events.send(SlotEvent {
                        peer_id,
                        kind,
                        event: PeerConnectionEvent::StateChanged(state.into()),
                    });
                }))
            }
        )));

        // ICE reports failure earlier than the aggregate connection state does.
        peer.on_ice_connection_state_change(Box::new(enc!((events, peer_id)
            move |state: RTCIceConnectionState| {
                Box::pin(enc!((events, peer_id) async move {
                    tracing::debug!("ICE state for {} ({}) changed: {}", peer_id, kind, state);
                    if state == RTCIceConnectionState::Failed {
                        let _ = events.send(SlotEvent {
                            peer_id,
                            kind,
                            event: PeerConnectionEvent::StateChanged(ConnectionStatus::Failed),
                        });
                    }
                }))
            }
        )));

        peer.on_track(Box::new(enc!((events, peer_id)
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                Box::pin(enc!((events, peer_id) async move {
                    tracing::info!("remote track from {}: id={}, ssrc={}", peer_id, track.id(), track.ssrc());
                    let _ = events.send(SlotEvent {
                        peer_id,
                        kind,
                        event: PeerConnectionEvent::RemoteTrack {
                            track_id: track.id(),
                            stream_id: track.stream_id(),
                        },
                    });
                }))
            }
        )));
    }

    fn rtc_track(track: &LocalTrack) -> Result<Arc<dyn TrackLocal + Send + Sync>, Error> {
        track.rtc_track().ok_or_else(|| {
            Error::new_device(
                format!("{} source {} cannot feed a peer connection", track.kind(), track.id()),
                DeviceErrorKind::UnsupportedError,
            )
        })
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<RTCSessionDescription, Error> {
        let offer = self
            .peer_connection
            .create_offer(Some(RTCOfferOptions {
                ice_restart,
                voice_activity_detection: false,
            }))
            .await?;
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, Error> {
        let answer = self.peer_connection.create_answer(None).await?;
        Ok(answer)
    }

    async fn set_local_description(&self, description: RTCSessionDescription) -> Result<(), Error> {
        self.peer_connection
            .set_local_description(description)
            .await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), Error> {
        self.peer_connection
            .set_remote_description(description)
            .await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), Error> {
        // webrtc-rs parses the SDP of a rollback description, so hand back the pending offer.
        let Some(mut rollback) = self.peer_connection.pending_local_description().await else {
            return Ok(());
        };
        rollback.sdp_type = RTCSdpType::Rollback;
        self.peer_connection.set_local_description(rollback).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<RTCSessionDescription> {
        self.peer_connection.local_description().await
    }

    async fn has_remote_description(&self) -> bool {
        self.peer_connection.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        self.peer_connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn add_receiver(&self) -> Result<(), Error> {
        self.peer_connection
            .add_transceiver_from_kind(
                self.kind.codec_type(),
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }

    async fn has_sender(&self) -> bool {
        self.sender.lock().await.is_some()
    }

    async fn replace_track(&self, track: Option<LocalTrack>) -> Result<(), Error> {
        let sender = self
            .sender
            .lock()
            .await
            .clone()
            .ok_or_else(|| {
                Error::new_negotiation(
                    format!("no {} sender towards {}", self.kind, self.peer_id),
                    NegotiationErrorKind::PeerConnectionError,
                )
            })?;
        let rtc_track = match track {
            Some(track) => Some(Self::rtc_track(&track)?),
            None => None,
        };
        sender.replace_track(rtc_track).await?;
        Ok(())
    }

    async fn add_track(&self, track: LocalTrack) -> Result<(), Error> {
        let rtc_track = Self::rtc_track(&track)?;
        let sender = self.peer_connection.add_track(rtc_track).await?;

        // Incoming RTCP has to be drained for interceptors to run.
        tokio::spawn(enc!((sender) async move {
            while sender.read_rtcp().await.is_ok() {}
        }));

        *self.sender.lock().await = Some(sender);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

impl Drop for RtcPeerConnection {
    fn drop(&mut self) {
        tracing::debug!("RtcPeerConnection for {} ({}) is dropped", self.peer_id, self.kind);
    }
}
