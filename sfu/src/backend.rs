//! The seam to the media engine.
//!
//! A [`MediaBackend`] creates one [`RouterBackend`] per SFU room. The router backend owns the
//! media side of transports, producers and consumers; the resource graph in [`crate::room`]
//! decides when they are created and closed.
use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use confab::protocol::{
    Direction, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, Layers,
    MediaKind, RtpCapabilities, RtpParameters, TransportParams,
};
use dashmap::DashMap;
use uuid::Uuid;
use webrtc::{
    api::APIBuilder, dtls_transport::dtls_role::DTLSRole,
    ice_transport::ice_gatherer::RTCIceGatherOptions,
};

use crate::{
    config::{MediaConfig, ServerConfig, TransportConfig},
    error::{ConsumerErrorKind, Error, ProducerErrorKind, TransportErrorKind},
    media_engine,
};

/// Byte counters of one transport since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn create_router(&self, room_id: &str) -> Result<Arc<dyn RouterBackend>, Error>;
}

#[async_trait]
pub trait RouterBackend: Send + Sync {
    fn id(&self) -> &str;
    fn rtp_capabilities(&self) -> RtpCapabilities;
    async fn create_transport(&self, direction: Direction) -> Result<TransportParams, Error>;
    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), Error>;
    async fn transport_stats(&self, transport_id: &str) -> Result<TransportStats, Error>;
    async fn close_transport(&self, transport_id: &str);
    /// Returns the id of the new producer.
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<String, Error>;
    async fn close_producer(&self, producer_id: &str);
    /// Returns the id of the new consumer. Consumers start paused.
    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_parameters: &RtpParameters,
    ) -> Result<String, Error>;
    async fn set_consumer_paused(&self, consumer_id: &str, paused: bool) -> Result<(), Error>;
    async fn set_consumer_preferred_layers(
        &self,
        consumer_id: &str,
        layers: Layers,
    ) -> Result<(), Error>;
    async fn set_consumer_priority(&self, consumer_id: &str, priority: u8) -> Result<(), Error>;
    async fn request_key_frame(&self, consumer_id: &str) -> Result<(), Error>;
    async fn close_consumer(&self, consumer_id: &str);
    async fn close(&self);
}

/// Media backend living in this process.
///
/// It keeps the media side of the resource graph and hands out transport parameters: ICE
/// credentials from webrtc-ice, host candidates on the announced addresses and the DTLS
/// fingerprint of a certificate generated once per backend.
#[derive(Debug)]
pub struct LocalBackend {
    media: MediaConfig,
    transport: Arc<TransportConfig>,
    dtls_parameters: DtlsParameters,
    next_port: Arc<AtomicU32>,
}

impl LocalBackend {
    pub fn new(config: &ServerConfig) -> Result<Self, Error> {
        let dtls_parameters = Self::generate_dtls_parameters()?;
        Ok(Self::with_dtls_parameters(config, dtls_parameters))
    }

    pub fn with_dtls_parameters(config: &ServerConfig, dtls_parameters: DtlsParameters) -> Self {
        Self {
            media: config.media.clone(),
            transport: Arc::new(config.transport.clone()),
            dtls_parameters,
            next_port: Arc::new(AtomicU32::new(0)),
        }
    }

    fn generate_dtls_parameters() -> Result<DtlsParameters, Error> {
        let api = APIBuilder::new().build();
        let gatherer = Arc::new(api.new_ice_gatherer(RTCIceGatherOptions::default())?);
        let ice = Arc::new(api.new_ice_transport(gatherer));
        let dtls = api.new_dtls_transport(ice, vec![])?;
        let local = dtls.get_local_parameters()?;

        let role = match local.role {
            DTLSRole::Client => DtlsRole::Client,
            DTLSRole::Server => DtlsRole::Server,
            _ => DtlsRole::Auto,
        };
        Ok(DtlsParameters {
            role,
            fingerprints: local
                .fingerprints
                .into_iter()
                .map(|f| DtlsFingerprint {
                    algorithm: f.algorithm,
                    value: f.value,
                })
                .collect(),
        })
    }
}

#[async_trait]
impl MediaBackend for LocalBackend {
    async fn create_router(&self, room_id: &str) -> Result<Arc<dyn RouterBackend>, Error> {
        let router = LocalRouter {
            id: Uuid::new_v4().to_string(),
            capabilities: media_engine::router_rtp_capabilities(&self.media),
            transport: Arc::clone(&self.transport),
            dtls_parameters: self.dtls_parameters.clone(),
            next_port: Arc::clone(&self.next_port),
            transports: DashMap::new(),
            producers: DashMap::new(),
            consumers: DashMap::new(),
        };
        tracing::debug!("router {} created for room {}", router.id, room_id);
        Ok(Arc::new(router))
    }
}

#[derive(Debug)]
struct LocalTransport {
    direction: Direction,
    connected: bool,
    stats: TransportStats,
}

#[derive(Debug)]
struct LocalProducer {
    transport_id: String,
}

#[derive(Debug)]
struct LocalConsumer {
    transport_id: String,
    producer_id: String,
    paused: bool,
    layers: Option<Layers>,
    priority: u8,
}

#[derive(Debug)]
struct LocalRouter {
    id: String,
    capabilities: RtpCapabilities,
    transport: Arc<TransportConfig>,
    dtls_parameters: DtlsParameters,
    next_port: Arc<AtomicU32>,
    transports: DashMap<String, LocalTransport>,
    producers: DashMap<String, LocalProducer>,
    consumers: DashMap<String, LocalConsumer>,
}

// Host candidate type preference 126, local preference 65535, component 1.
const HOST_CANDIDATE_PRIORITY: u32 = (126 << 24) | (65535 << 8) | (256 - 1);

impl LocalRouter {
    fn ice_parameters(&self) -> IceParameters {
        IceParameters {
            username_fragment: self
                .transport
                .ice_username_fragment
                .clone()
                .unwrap_or_else(webrtc_ice::rand::generate_ufrag),
            password: self
                .transport
                .ice_password
                .clone()
                .unwrap_or_else(webrtc_ice::rand::generate_pwd),
            ice_lite: true,
        }
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % self.transport.ports();
        let port = self.transport.port_min.saturating_add(offset as u16);

        self.transport
            .announced_ips
            .iter()
            .filter(|ip| self.transport.announces(ip))
            .map(|ip: &IpAddr| IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: HOST_CANDIDATE_PRIORITY,
                address: ip.to_string(),
                port,
                protocol: "udp".to_string(),
                candidate_type: "host".to_string(),
            })
            .collect()
    }

    fn transport_missing(transport_id: &str) -> Error {
        Error::new_transport(
            format!("transport {} does not exist", transport_id),
            TransportErrorKind::NotFoundError,
        )
    }

    fn consumer_missing(consumer_id: &str) -> Error {
        Error::new_consumer(
            format!("consumer {} does not exist", consumer_id),
            ConsumerErrorKind::NotFoundError,
        )
    }

    fn expect_direction(&self, transport_id: &str, direction: Direction) -> Result<(), Error> {
        let transport = self
            .transports
            .get(transport_id)
            .ok_or_else(|| Self::transport_missing(transport_id))?;
        if transport.direction != direction {
            return Err(Error::new_transport(
                format!("transport {} is not a {} transport", transport_id, direction),
                TransportErrorKind::DirectionError,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RouterBackend for LocalRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_transport(&self, direction: Direction) -> Result<TransportParams, Error> {
        let id = Uuid::new_v4().to_string();
        let params = TransportParams {
            id: id.clone(),
            direction,
            ice_parameters: self.ice_parameters(),
            ice_candidates: self.ice_candidates(),
            dtls_parameters: self.dtls_parameters.clone(),
        };
        self.transports.insert(
            id,
            LocalTransport {
                direction,
                connected: false,
                stats: TransportStats::default(),
            },
        );
        Ok(params)
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), Error> {
        let mut transport = self
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| Self::transport_missing(transport_id))?;
        if dtls_parameters.fingerprints.is_empty() {
            tracing::warn!("transport {} connected without a fingerprint", transport_id);
        }
        transport.connected = true;
        Ok(())
    }

    async fn transport_stats(&self, transport_id: &str) -> Result<TransportStats, Error> {
        self.transports
            .get(transport_id)
            .map(|t| t.stats)
            .ok_or_else(|| Self::transport_missing(transport_id))
    }

    async fn close_transport(&self, transport_id: &str) {
        if let Some((_, transport)) = self.transports.remove(transport_id) {
            tracing::trace!(
                "{} transport {} closed, connected: {}",
                transport.direction,
                transport_id,
                transport.connected
            );
        }
        self.producers.retain(|_, p| p.transport_id != transport_id);
        self.consumers.retain(|_, c| c.transport_id != transport_id);
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<String, Error> {
        self.expect_direction(transport_id, Direction::Send)?;
        if let Some(codec) = rtp_parameters
            .codecs
            .iter()
            .find(|c| !self.capabilities.supports(&c.mime_type))
        {
            return Err(Error::new_producer(
                format!("{} is not supported for {}", codec.mime_type, kind),
                ProducerErrorKind::UnsupportedCodecError,
            ));
        }

        let id = Uuid::new_v4().to_string();
        self.producers.insert(
            id.clone(),
            LocalProducer {
                transport_id: transport_id.to_string(),
            },
        );
        Ok(id)
    }

    async fn close_producer(&self, producer_id: &str) {
        self.producers.remove(producer_id);
        self.consumers.retain(|_, c| c.producer_id != producer_id);
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        _rtp_parameters: &RtpParameters,
    ) -> Result<String, Error> {
        self.expect_direction(transport_id, Direction::Recv)?;
        if !self.producers.contains_key(producer_id) {
            return Err(Error::new_producer(
                format!("producer {} does not exist", producer_id),
                ProducerErrorKind::NotFoundError,
            ));
        }

        let id = Uuid::new_v4().to_string();
        self.consumers.insert(
            id.clone(),
            LocalConsumer {
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
                paused: true,
                layers: None,
                priority: 1,
            },
        );
        Ok(id)
    }

    async fn set_consumer_paused(&self, consumer_id: &str, paused: bool) -> Result<(), Error> {
        let mut consumer = self
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| Self::consumer_missing(consumer_id))?;
        consumer.paused = paused;
        Ok(())
    }

    async fn set_consumer_preferred_layers(
        &self,
        consumer_id: &str,
        layers: Layers,
    ) -> Result<(), Error> {
        let mut consumer = self
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| Self::consumer_missing(consumer_id))?;
        consumer.layers = Some(layers);
        Ok(())
    }

    async fn set_consumer_priority(&self, consumer_id: &str, priority: u8) -> Result<(), Error> {
        let mut consumer = self
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| Self::consumer_missing(consumer_id))?;
        consumer.priority = priority;
        Ok(())
    }

    async fn request_key_frame(&self, consumer_id: &str) -> Result<(), Error> {
        let consumer = self
            .consumers
            .get(consumer_id)
            .ok_or_else(|| Self::consumer_missing(consumer_id))?;
        tracing::trace!(
            "key frame requested for producer {} by consumer {} (paused: {}, layers: {:?}, priority: {})",
            consumer.producer_id,
            consumer_id,
            consumer.paused,
            consumer.layers,
            consumer.priority
        );
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &str) {
        self.consumers.remove(consumer_id);
    }

    async fn close(&self) {
        self.consumers.clear();
        self.producers.clear();
        self.transports.clear();
        tracing::debug!("router {} closed", self.id);
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::net::Ipv4Addr;

    use super::*;

    pub(crate) fn backend() -> LocalBackend {
        let config = ServerConfig {
            transport: TransportConfig {
                announced_ips: vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))],
                port_min: 40000,
                port_max: 40001,
                ..Default::default()
            },
            ..Default::default()
        };
        LocalBackend::with_dtls_parameters(
            &config,
            DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: "AB:CD".to_string(),
                }],
            },
        )
    }

    #[tokio::test]
    async fn transports_rotate_over_the_port_range() {
        let router = backend().create_router("r1").await.expect("no router");
        let ports: Vec<u16> = create_ports(&*router).await;
        assert_eq!(ports, vec![40000, 40001, 40000]);
    }

    async fn create_ports(router: &dyn RouterBackend) -> Vec<u16> {
        let mut ports = vec![];
        for _ in 0..3 {
            let params = router
                .create_transport(Direction::Send)
                .await
                .expect("failed to create transport");
            assert!(!params.ice_parameters.username_fragment.is_empty());
            ports.push(params.ice_candidates[0].port);
        }
        ports
    }

    #[tokio::test]
    async fn produce_needs_a_send_transport() {
        let router = backend().create_router("r1").await.expect("no router");
        let recv = router
            .create_transport(Direction::Recv)
            .await
            .expect("failed to create transport");
        let err = router
            .produce(&recv.id, MediaKind::Audio, &RtpParameters::default())
            .await
            .expect_err("produced on a recv transport");
        assert_eq!(err.category(), confab::protocol::ErrorCategory::InvalidRequest);
    }

    #[tokio::test]
    async fn closing_a_producer_drops_its_consumers() {
        let router = backend().create_router("r1").await.expect("no router");
        let send = router.create_transport(Direction::Send).await.expect("send");
        let recv = router.create_transport(Direction::Recv).await.expect("recv");
        let producer = router
            .produce(&send.id, MediaKind::Video, &RtpParameters::default())
            .await
            .expect("failed to produce");
        let consumer = router
            .consume(&recv.id, &producer, &RtpParameters::default())
            .await
            .expect("failed to consume");

        router.close_producer(&producer).await;
        assert!(router.set_consumer_paused(&consumer, false).await.is_err());
        assert!(router
            .consume(&recv.id, &producer, &RtpParameters::default())
            .await
            .is_err());
    }
}
