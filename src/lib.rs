#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Confab
//! Confab is the client side of a multi-party call: it joins a room over a signaling channel and
//! keeps audio, video and screen share flowing between the participants, either directly
//! between every pair of peers (mesh) or through a media server (SFU).
//! The server side lives in the `confab-sfu` crate of this workspace.
//!
//! ## Usage
//! Start a [`session::CallSession`] with a [`config::SessionConfig`], a
//! [`signaling::SignalingConnector`] and your [`media::MediaDevices`], join a room and follow
//! [`session::CallEvent`]s.

/// Configuration for sessions, signaling and [`webrtc::peer_connection::RTCPeerConnection`].
pub mod config;
pub mod error;
/// Local capture sources.
pub mod media;
/// Codecs and header extensions registered for mesh peer connections.
pub mod media_engine;
/// Full-mesh negotiation.
pub mod mesh;
/// Messages exchanged with the signaling server.
pub mod protocol;
/// Adaptive receive quality.
pub mod quality;
pub mod session;
/// SFU sessions.
pub mod sfu_client;
/// The signaling channel client.
pub mod signaling;
/// Dominant speaker detection.
pub mod speaker;
