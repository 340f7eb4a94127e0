//! Dominant speaker detection from per-peer audio energy.
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{config::SpeakerConfig, error::Error, protocol::PeerId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakerChange {
    pub previous: Option<PeerId>,
    pub current: Option<PeerId>,
}

#[derive(Debug)]
pub struct ActiveSpeakerDetector {
    config: SpeakerConfig,
    windows: HashMap<PeerId, VecDeque<f32>>,
    history: VecDeque<(Instant, PeerId, f32)>,
    current: Option<PeerId>,
}

impl ActiveSpeakerDetector {
    pub fn new(config: SpeakerConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
            history: VecDeque::new(),
            current: None,
        }
    }

    pub fn dominant(&self) -> Option<&PeerId> {
        self.current.as_ref()
    }

    pub fn record(&mut self, peer_id: &str, energy: f32, at: Instant) {
        let energy = energy.clamp(0.0, 1.0);
        let window = self.windows.entry(peer_id.to_string()).or_default();
        window.push_back(energy);
        while window.len() > self.config.window.max(1) {
            window.pop_front();
        }

        self.history.push_back((at, peer_id.to_string(), energy));
        let horizon = self.config.dominance_window * 2;
        while let Some((oldest, _, _)) = self.history.front() {
            if at.saturating_duration_since(*oldest) > horizon {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn forget(&mut self, peer_id: &str) {
        self.windows.remove(peer_id);
        self.history.retain(|(_, p, _)| p != peer_id);
    }

    pub fn tracked(&self) -> Vec<PeerId> {
        self.windows.keys().cloned().collect()
    }

    /// Drops every peer that is not in `live`, e.g. peers that left or stopped sending audio.
    pub fn retain<'a>(&mut self, live: impl IntoIterator<Item = &'a str>) {
        let live: HashSet<&str> = live.into_iter().collect();
        for peer_id in self.tracked() {
            if !live.contains(peer_id.as_str()) {
                tracing::trace!("forgetting audio level of {}", peer_id);
                self.forget(&peer_id);
            }
        }
    }

    fn average(&self, peer_id: &str) -> f32 {
        match self.windows.get(peer_id) {
            Some(window) if !window.is_empty() => {
                window.iter().sum::<f32>() / window.len() as f32
            }
            _ => 0.0,
        }
    }

    /// Share of the peer's recent samples that are above the threshold.
    fn consistency(&self, peer_id: &str, now: Instant) -> f32 {
        let since = now
            .checked_sub(self.config.dominance_window)
            .unwrap_or(now);
        let (total, loud) = self
            .history
            .iter()
            .filter(|(at, p, _)| p == peer_id && *at >= since)
            .fold((0usize, 0usize), |(total, loud), (_, _, energy)| {
                let loud = if *energy > self.config.energy_threshold {
                    loud + 1
                } else {
                    loud
                };
                (total + 1, loud)
            });
        if total == 0 {
            0.0
        } else {
            loud as f32 / total as f32
        }
    }

    fn select(&self, now: Instant) -> Option<PeerId> {
        let mut best: Option<(&PeerId, f32)> = None;
        let mut tied = false;
        for peer_id in self.windows.keys() {
            let average = self.average(peer_id);
            if average <= self.config.energy_threshold {
                continue;
            }
            let score = average * self.consistency(peer_id, now);
            if score <= 0.0 {
                continue;
            }
            match best {
                Some((_, top)) if (score - top).abs() < f32::EPSILON => tied = true,
                Some((_, top)) if score < top => {}
                _ => {
                    best = Some((peer_id, score));
                    tied = false;
                }
            }
        }
        if tied {
            return None;
        }
        best.map(|(peer_id, _)| peer_id.clone())
    }

    /// Re-evaluates the dominant speaker and reports it only when it changed.
    pub fn evaluate(&mut self, now: Instant) -> Option<SpeakerChange> {
        let next = self.select(now);
        if next == self.current {
            return None;
        }
        let previous = std::mem::replace(&mut self.current, next.clone());
        Some(SpeakerChange {
            previous,
            current: next,
        })
    }
}

/// Audio energy per remote peer, 0.0 to 1.0.
#[async_trait]
pub trait EnergySource: Send + Sync {
    async fn energies(&self) -> Result<Vec<(PeerId, f32)>, Error>;
}

/// Samples an [`EnergySource`] and forwards dominant speaker changes.
pub struct SpeakerMonitor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SpeakerMonitor {
    pub fn spawn(
        config: SpeakerConfig,
        source: Arc<dyn EnergySource>,
        changes: mpsc::UnboundedSender<SpeakerChange>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = config.sample_interval;
        let mut detector = ActiveSpeakerDetector::new(config);

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let energies = match source.energies().await {
                            Ok(energies) => energies,
                            Err(err) => {
                                tracing::debug!("no audio levels this round: {}", err);
                                continue;
                            }
                        };
                        let now = Instant::now();
                        detector.retain(energies.iter().map(|(peer_id, _)| peer_id.as_str()));
                        for (peer_id, energy) in energies.iter() {
                            tracing::trace!("audio level of {}: {:.3}", peer_id, energy);
                            detector.record(peer_id, *energy, now);
                        }
                        if let Some(change) = detector.evaluate(now) {
                            tracing::debug!("dominant speaker: {:?} -> {:?}", change.previous, change.current);
                            if changes.send(change).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            tracing::debug!("speaker monitor finished");
        });

        Self { cancel, task }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    fn config() -> SpeakerConfig {
        SpeakerConfig::default()
    }

    #[test]
    fn sustained_speaker_beats_a_spike() {
        let mut detector = ActiveSpeakerDetector::new(config());
        let start = Instant::now();
        for i in 0..15u64 {
            let at = start + Duration::from_millis(100 * i);
            detector.record("a", 0.3, at);
            detector.record("b", 0.0, at);
        }
        let end = start + Duration::from_millis(1500);
        detector.record("a", 0.3, end);
        detector.record("b", 0.9, end);

        let change = detector.evaluate(end).expect("a change");
        assert_eq!(change.current.as_deref(), Some("a"));
        assert_eq!(detector.dominant().map(String::as_str), Some("a"));
    }

    #[test]
    fn silence_has_no_speaker() {
        let mut detector = ActiveSpeakerDetector::new(config());
        let now = Instant::now();
        detector.record("a", 0.01, now);
        detector.record("b", 0.02, now);
        assert_eq!(detector.evaluate(now), None);
        assert_eq!(detector.dominant(), None);
    }

    #[test]
    fn equal_speakers_tie() {
        let mut detector = ActiveSpeakerDetector::new(config());
        let start = Instant::now();
        for i in 0..10u64 {
            let at = start + Duration::from_millis(100 * i);
            detector.record("a", 0.4, at);
            detector.record("b", 0.4, at);
        }
        assert_eq!(detector.evaluate(start + Duration::from_millis(900)), None);
    }

    #[test]
    fn only_changes_are_reported() {
        let mut detector = ActiveSpeakerDetector::new(config());
        let start = Instant::now();
        for i in 0..10u64 {
            detector.record("a", 0.5, start + Duration::from_millis(100 * i));
        }
        let now = start + Duration::from_millis(900);
        assert!(detector.evaluate(now).is_some());
        assert_eq!(detector.evaluate(now), None);

        // a goes quiet long enough for the window to drain.
        for i in 10..25u64 {
            detector.record("a", 0.0, start + Duration::from_millis(100 * i));
        }
        let change = detector
            .evaluate(start + Duration::from_millis(2400))
            .expect("speaker lost");
        assert_eq!(change.previous.as_deref(), Some("a"));
        assert_eq!(change.current, None);
    }

    #[test]
    fn departed_peers_are_dropped() {
        let mut detector = ActiveSpeakerDetector::new(config());
        let start = Instant::now();
        for i in 0..10u64 {
            let at = start + Duration::from_millis(100 * i);
            detector.record("a", 0.1, at);
            detector.record("b", 0.6, at);
        }
        let now = start + Duration::from_millis(900);
        let change = detector.evaluate(now).expect("a change");
        assert_eq!(change.current.as_deref(), Some("b"));

        detector.retain(["a"]);
        assert_eq!(detector.tracked(), vec!["a".to_string()]);
        assert!(detector.history.iter().all(|(_, p, _)| p == "a"));

        let change = detector.evaluate(now).expect("b left");
        assert_eq!(change.previous.as_deref(), Some("b"));
        assert_eq!(change.current.as_deref(), Some("a"));
    }

    struct Levels;

    #[async_trait]
    impl EnergySource for Levels {
        async fn energies(&self) -> Result<Vec<(PeerId, f32)>, Error> {
            Ok(vec![("a".to_string(), 0.02), ("b".to_string(), 0.6)])
        }
    }

    struct Departing(std::sync::Mutex<usize>);

    #[async_trait]
    impl EnergySource for Departing {
        async fn energies(&self) -> Result<Vec<(PeerId, f32)>, Error> {
            let mut round = self.0.lock().unwrap();
            *round += 1;
            if *round <= 10 {
                Ok(vec![("a".to_string(), 0.1), ("b".to_string(), 0.6)])
            } else {
                Ok(vec![("a".to_string(), 0.1)])
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_hands_over_when_the_speaker_leaves() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = SpeakerMonitor::spawn(config(), Arc::new(Departing(Default::default())), tx);
        let first = rx.recv().await.expect("a change");
        assert_eq!(first.current.as_deref(), Some("b"));
        let second = rx.recv().await.expect("b left");
        assert_eq!(second.previous.as_deref(), Some("b"));
        assert_eq!(second.current.as_deref(), Some("a"));
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_forwards_the_dominant_speaker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = SpeakerMonitor::spawn(config(), Arc::new(Levels), tx);
        let change = rx.recv().await.expect("a change");
        assert_eq!(change.current.as_deref(), Some("b"));
        monitor.stop().await;
    }
}
