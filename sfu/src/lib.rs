#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Confab SFU
//! The signaling and media routing server of confab. It relays mesh signaling between peers and
//! manages the SFU resource graph of every room: transports, producers and consumers.
//!
//! Rooms are spread over worker tasks by [`manager::RoomManager`]. Every message of a room is
//! handled by the worker owning it, one at a time. Media itself is delegated to a
//! [`backend::MediaBackend`].
//!
//! [Here](https://github.com/confab/confab/blob/master/sfu/examples/server.rs) is an example
//! server binary.

/// Media engine abstraction the rooms drive.
pub mod backend;
/// Configuration for [`manager::RoomManager`], [`router::Router`] and the transports.
pub mod config;
pub mod consumer;
pub mod error;
/// HTTP routes: the signaling WebSocket and the health, readiness and metrics endpoints.
pub mod http;
pub mod manager;
pub mod media_engine;
/// Prometheus metrics.
pub mod metrics;
pub mod peer;
pub mod producer;
pub mod room;
/// Router is a module that determines which media to distribute to whom.
pub mod router;
pub mod transport;
mod worker;
