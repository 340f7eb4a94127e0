use confab::protocol::{Direction, TransportParams};

use crate::backend::TransportStats;

/// One direction of a peer's media path to the router.
#[derive(Debug, Clone)]
pub struct Transport {
    pub params: TransportParams,
    pub connected: bool,
    /// Counters already reported to metrics.
    pub reported: TransportStats,
}

impl Transport {
    pub fn new(params: TransportParams) -> Self {
        Self {
            params,
            connected: false,
            reported: TransportStats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.params.id
    }

    pub fn direction(&self) -> Direction {
        self.params.direction
    }

    /// Returns the bytes received and sent since the last report and remembers `latest`.
    pub fn advance(&mut self, latest: TransportStats) -> (u64, u64) {
        let received = latest
            .bytes_received
            .saturating_sub(self.reported.bytes_received);
        let sent = latest.bytes_sent.saturating_sub(self.reported.bytes_sent);
        self.reported = latest;
        (received, sent)
    }
}

#[cfg(test)]
mod test {
    use confab::protocol::{DtlsParameters, IceParameters};

    use super::*;

    #[test]
    fn advance_reports_deltas_only() {
        let mut transport = Transport::new(TransportParams {
            id: "t1".to_string(),
            direction: Direction::Send,
            ice_parameters: IceParameters::default(),
            ice_candidates: vec![],
            dtls_parameters: DtlsParameters::default(),
        });
        let first = TransportStats {
            bytes_received: 1000,
            bytes_sent: 10,
        };
        assert_eq!(transport.advance(first), (1000, 10));
        let second = TransportStats {
            bytes_received: 1500,
            bytes_sent: 10,
        };
        assert_eq!(transport.advance(second), (500, 0));
    }
}
