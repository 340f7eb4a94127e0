//! The seam to the client-side SFU media engine.
//!
//! A [`Device`] knows what the local media stack can encode and decode and builds transports
//! from the parameters the server hands out. Signaling is never done by the device itself:
//! whatever has to reach the server goes through the [`TransportHandler`] of the transport.
use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::Error,
    media::LocalTrack,
    protocol::{
        ConsumerParams, Direction, DtlsParameters, MediaKind, RtpCapabilities, RtpEncoding,
        RtpParameters, TransportParams,
    },
    quality::QualitySample,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn is_broken(self) -> bool {
        matches!(self, TransportState::Disconnected | TransportState::Failed)
    }
}

#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// Called once, before the first media flows over the transport.
    async fn on_connect(
        &self,
        direction: Direction,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), Error>;
    /// Called for every new producer. Returns the producer id assigned by the server.
    async fn on_produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String, Error>;
    fn on_state_change(&self, direction: Direction, transport_id: &str, state: TransportState);
}

#[async_trait]
pub trait Device: Send + Sync {
    /// Negotiates the local capabilities against the router's.
    async fn load(&self, router_rtp_capabilities: &RtpCapabilities) -> Result<(), Error>;
    fn loaded(&self) -> bool;
    /// Local capabilities, narrowed to the router's once loaded.
    fn rtp_capabilities(&self) -> RtpCapabilities;
    fn can_produce(&self, kind: MediaKind) -> bool;
    async fn create_send_transport(
        &self,
        params: &TransportParams,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn SendTransport>, Error>;
    async fn create_recv_transport(
        &self,
        params: &TransportParams,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn RecvTransport>, Error>;
}

#[async_trait]
pub trait SendTransport: Send + Sync {
    fn id(&self) -> &str;
    async fn produce(
        &self,
        track: LocalTrack,
        encodings: Vec<RtpEncoding>,
    ) -> Result<Arc<dyn LocalProducer>, Error>;
    async fn close(&self);
}

#[async_trait]
pub trait RecvTransport: Send + Sync {
    fn id(&self) -> &str;
    async fn consume(&self, params: &ConsumerParams) -> Result<Arc<dyn RemoteConsumer>, Error>;
    async fn close(&self);
}

#[async_trait]
pub trait LocalProducer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    async fn close(&self);
}

#[async_trait]
pub trait RemoteConsumer: Send + Sync {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    async fn resume(&self) -> Result<(), Error>;
    async fn pause(&self) -> Result<(), Error>;
    /// Latest receive statistics, `None` until the first report.
    async fn stats(&self) -> Option<QualitySample>;
    /// Latest audio level, 0.0 to 1.0.
    async fn audio_level(&self) -> Option<f32>;
    async fn close(&self);
}
