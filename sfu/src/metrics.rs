use std::time::Instant;

use chrono::{DateTime, Utc};
use confab::protocol::{CallMode, ErrorCategory, MediaKind, RoomId};
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use serde::Serialize;

use crate::error::Error;

/// Prometheus metrics of one [`crate::manager::RoomManager`].
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started: Instant,
    uptime: IntGauge,
    active_rooms: IntGauge,
    active_peers: IntGauge,
    active_transports: IntGauge,
    active_producers: IntGaugeVec,
    active_consumers: IntGauge,
    rooms_total: IntCounter,
    peers_total: IntCounter,
    errors_total: IntCounterVec,
    bytes_total: IntCounterVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("confab_sfu::Metrics")
            .field("uptime_seconds", &self.uptime_seconds())
            .field("active_rooms", &self.active_rooms.get())
            .field("active_peers", &self.active_peers.get())
            .finish()
    }
}

impl Metrics {
    pub fn new() -> Result<Self, Error> {
        let registry = Registry::new();

        let uptime = IntGauge::new("confab_uptime_seconds", "Seconds since the server started")?;
        let active_rooms = IntGauge::new("confab_active_rooms", "Number of open rooms")?;
        let active_peers = IntGauge::new("confab_active_peers", "Number of joined peers")?;
        let active_transports =
            IntGauge::new("confab_active_transports", "Number of open transports")?;
        let active_producers = IntGaugeVec::new(
            Opts::new("confab_active_producers", "Number of open producers"),
            &["kind"],
        )?;
        let active_consumers =
            IntGauge::new("confab_active_consumers", "Number of open consumers")?;
        let rooms_total = IntCounter::new("confab_rooms_total", "Total number of rooms created")?;
        let peers_total = IntCounter::new("confab_peers_total", "Total number of peers joined")?;
        let errors_total = IntCounterVec::new(
            Opts::new("confab_errors_total", "Total number of failed requests"),
            &["category"],
        )?;
        let bytes_total = IntCounterVec::new(
            Opts::new("confab_bytes_total", "Total number of media bytes"),
            &["direction"],
        )?;

        registry.register(Box::new(uptime.clone()))?;
        registry.register(Box::new(active_rooms.clone()))?;
        registry.register(Box::new(active_peers.clone()))?;
        registry.register(Box::new(active_transports.clone()))?;
        registry.register(Box::new(active_producers.clone()))?;
        registry.register(Box::new(active_consumers.clone()))?;
        registry.register(Box::new(rooms_total.clone()))?;
        registry.register(Box::new(peers_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(bytes_total.clone()))?;

        Ok(Self {
            registry,
            started: Instant::now(),
            uptime,
            active_rooms,
            active_peers,
            active_transports,
            active_producers,
            active_consumers,
            rooms_total,
            peers_total,
            errors_total,
            bytes_total,
        })
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub(crate) fn room_opened(&self) {
        self.active_rooms.inc();
        self.rooms_total.inc();
    }

    pub(crate) fn room_closed(&self) {
        self.active_rooms.dec();
    }

    pub(crate) fn peer_joined(&self) {
        self.active_peers.inc();
        self.peers_total.inc();
    }

    pub(crate) fn peer_left(&self) {
        self.active_peers.dec();
    }

    pub(crate) fn transport_opened(&self) {
        self.active_transports.inc();
    }

    pub(crate) fn transport_closed(&self) {
        self.active_transports.dec();
    }

    pub(crate) fn producer_opened(&self, kind: MediaKind) {
        self.active_producers
            .with_label_values(&[&kind.to_string()])
            .inc();
    }

    pub(crate) fn producer_closed(&self, kind: MediaKind) {
        self.active_producers
            .with_label_values(&[&kind.to_string()])
            .dec();
    }

    pub(crate) fn consumer_opened(&self) {
        self.active_consumers.inc();
    }

    pub(crate) fn consumer_closed(&self) {
        self.active_consumers.dec();
    }

    pub(crate) fn error(&self, category: ErrorCategory) {
        self.errors_total
            .with_label_values(&[&category.to_string()])
            .inc();
    }

    pub(crate) fn bytes(&self, received: u64, sent: u64) {
        self.bytes_total
            .with_label_values(&["received"])
            .inc_by(received);
        self.bytes_total.with_label_values(&["sent"]).inc_by(sent);
    }

    /// Renders every metric in the prometheus text exposition format.
    pub fn export(&self) -> Result<String, Error> {
        self.uptime.set(self.uptime_seconds() as i64);

        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| Error::MetricsError(prometheus::Error::Msg(e.to_string())))
    }

    pub fn summary(&self, rooms: Vec<RoomSummary>) -> HealthSummary {
        HealthSummary {
            status: "ok".to_string(),
            uptime_seconds: self.uptime_seconds(),
            rooms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: RoomId,
    pub mode: CallMode,
    pub peers: usize,
    pub created_at: DateTime<Utc>,
}

/// Body of the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub status: String,
    pub uptime_seconds: u64,
    pub rooms: Vec<RoomSummary>,
}
