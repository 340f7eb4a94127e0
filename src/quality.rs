//! Adaptive receive quality for SFU video consumers.
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{config::QualityConfig, error::Error, protocol::Layers};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Low,
    Medium,
    High,
}

impl QualityLevel {
    /// Simulcast layers requested from the server for this level.
    pub fn layers(self) -> Layers {
        match self {
            QualityLevel::Low => Layers {
                spatial: 0,
                temporal: 2,
            },
            QualityLevel::Medium => Layers {
                spatial: 1,
                temporal: 2,
            },
            QualityLevel::High => Layers {
                spatial: 2,
                temporal: 2,
            },
        }
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QualityLevel::Low => write!(f, "low"),
            QualityLevel::Medium => write!(f, "medium"),
            QualityLevel::High => write!(f, "high"),
        }
    }
}

/// Receive statistics of one consumer at one instant.
#[derive(Debug, Clone, Copy)]
pub struct QualitySample {
    pub at: Instant,
    /// Available bitrate in bits per second.
    pub bitrate: u64,
    /// Packet loss in percent.
    pub packet_loss: f64,
    /// Round trip time in milliseconds.
    pub rtt: f64,
}

#[derive(Debug)]
struct ConsumerQuality {
    samples: VecDeque<QualitySample>,
    current: QualityLevel,
    candidate: Option<(QualityLevel, usize)>,
    pinned: Option<QualityLevel>,
}

impl ConsumerQuality {
    fn new(current: QualityLevel) -> Self {
        Self {
            samples: VecDeque::new(),
            current,
            candidate: None,
            pinned: None,
        }
    }
}

/// Picks a [`QualityLevel`] per consumer from a sliding window of samples.
#[derive(Debug)]
pub struct QualityController {
    config: QualityConfig,
    consumers: HashMap<String, ConsumerQuality>,
}

impl QualityController {
    pub fn new(config: QualityConfig) -> Self {
        Self {
            config,
            consumers: HashMap::new(),
        }
    }

    pub fn track(&mut self, consumer_id: &str, initial: QualityLevel) {
        self.consumers
            .entry(consumer_id.to_string())
            .or_insert_with(|| ConsumerQuality::new(initial));
    }

    pub fn forget(&mut self, consumer_id: &str) {
        self.consumers.remove(consumer_id);
    }

    pub fn tracked(&self) -> Vec<String> {
        self.consumers.keys().cloned().collect()
    }

    pub fn current(&self, consumer_id: &str) -> Option<QualityLevel> {
        self.consumers
            .get(consumer_id)
            .map(|c| c.pinned.unwrap_or(c.current))
    }

    pub fn recommend(&self, bitrate: f64, packet_loss: f64) -> QualityLevel {
        if packet_loss > self.config.poor_loss_percent {
            return QualityLevel::Low;
        }
        let by_bitrate = if bitrate >= self.config.high_bitrate as f64 {
            QualityLevel::High
        } else if bitrate >= self.config.medium_bitrate as f64 {
            QualityLevel::Medium
        } else {
            QualityLevel::Low
        };
        if packet_loss > self.config.acceptable_loss_percent {
            by_bitrate.min(QualityLevel::Medium)
        } else {
            by_bitrate
        }
    }

    /// Adds a sample and returns the level to apply, if it changed.
    pub fn record(&mut self, consumer_id: &str, sample: QualitySample) -> Option<QualityLevel> {
        let window = self.config.window.max(1);
        let warmup = self.config.warmup_samples;
        let confirm = self.config.confirm_samples.max(1);

        let (bitrate, packet_loss) = {
            let entry = self.consumers.get_mut(consumer_id)?;
            if entry.pinned.is_some() {
                return None;
            }
            entry.samples.push_back(sample);
            while entry.samples.len() > window {
                entry.samples.pop_front();
            }
            if entry.samples.len() < warmup {
                return None;
            }
            let n = entry.samples.len() as f64;
            let bitrate = entry.samples.iter().map(|s| s.bitrate as f64).sum::<f64>() / n;
            let packet_loss = entry.samples.iter().map(|s| s.packet_loss).sum::<f64>() / n;
            (bitrate, packet_loss)
        };

        let level = self.recommend(bitrate, packet_loss);
        let entry = self.consumers.get_mut(consumer_id)?;
        if level == entry.current {
            entry.candidate = None;
            return None;
        }

        let count = match entry.candidate {
            Some((candidate, count)) if candidate == level => count + 1,
            _ => 1,
        };
        tracing::trace!(
            "consumer {} recommends {} ({}/{}), bitrate={:.0}, loss={:.1}%",
            consumer_id,
            level,
            count,
            confirm,
            bitrate,
            packet_loss
        );
        if count >= confirm {
            entry.current = level;
            entry.candidate = None;
            Some(level)
        } else {
            entry.candidate = Some((level, count));
            None
        }
    }

    /// Pins a level, or returns to automatic selection with `None`.
    /// Returns the level to apply right away.
    pub fn set_quality(
        &mut self,
        consumer_id: &str,
        level: Option<QualityLevel>,
    ) -> Option<QualityLevel> {
        let entry = self
            .consumers
            .entry(consumer_id.to_string())
            .or_insert_with(|| ConsumerQuality::new(QualityLevel::High));
        entry.samples.clear();
        entry.candidate = None;
        entry.pinned = level;
        if let Some(level) = level {
            entry.current = level;
        }
        level
    }
}

/// Where the monitor reads consumer statistics from.
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn video_consumer_stats(&self) -> Result<Vec<(String, QualitySample)>, Error>;
}

/// Where the monitor applies its decisions.
#[async_trait]
pub trait LayerControl: Send + Sync {
    async fn apply_quality(&self, consumer_id: &str, level: QualityLevel) -> Result<(), Error>;
}

enum QualityCommand {
    SetQuality {
        consumer_id: String,
        level: Option<QualityLevel>,
    },
}

/// Pins levels on a running [`QualityMonitor`] from other tasks.
#[derive(Clone)]
pub struct QualityOverrides {
    commands: mpsc::UnboundedSender<QualityCommand>,
}

impl QualityOverrides {
    /// Pins `level`, or returns the consumer to automatic selection with `None`.
    pub fn set_quality(&self, consumer_id: &str, level: Option<QualityLevel>) {
        if self
            .commands
            .send(QualityCommand::SetQuality {
                consumer_id: consumer_id.to_string(),
                level,
            })
            .is_err()
        {
            tracing::debug!("quality monitor is stopped, ignoring level of {}", consumer_id);
        }
    }
}

/// Periodically feeds a [`QualityController`] and applies what it decides.
pub struct QualityMonitor {
    commands: mpsc::UnboundedSender<QualityCommand>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl QualityMonitor {
    pub fn spawn(
        config: QualityConfig,
        stats: Arc<dyn StatsSource>,
        control: Arc<dyn LayerControl>,
    ) -> Self {
        let (commands, mut command_receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let period = config.interval;
        let mut controller = QualityController::new(config);

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    Some(command) = command_receiver.recv() => match command {
                        QualityCommand::SetQuality { consumer_id, level } => {
                            match controller.set_quality(&consumer_id, level) {
                                Some(level) => {
                                    tracing::info!("quality of {} pinned to {}", consumer_id, level);
                                    if let Err(err) = control.apply_quality(&consumer_id, level).await {
                                        tracing::warn!("failed to apply quality to {}: {}", consumer_id, err);
                                    }
                                }
                                None => tracing::info!("quality of {} is automatic again", consumer_id),
                            }
                        }
                    },
                    _ = ticker.tick() => {
                        Self::tick(&mut controller, stats.as_ref(), control.as_ref()).await;
                    }
                }
            }
            tracing::debug!("quality monitor finished");
        });

        Self {
            commands,
            cancel,
            task,
        }
    }

    async fn tick(
        controller: &mut QualityController,
        stats: &dyn StatsSource,
        control: &dyn LayerControl,
    ) {
        let samples = match stats.video_consumer_stats().await {
            Ok(samples) => samples,
            Err(err) => {
                tracing::debug!("no consumer stats this round: {}", err);
                return;
            }
        };

        let live: HashSet<&str> = samples.iter().map(|(id, _)| id.as_str()).collect();
        for consumer_id in controller.tracked() {
            if !live.contains(consumer_id.as_str()) {
                controller.forget(&consumer_id);
            }
        }

        for (consumer_id, sample) in samples.iter() {
            controller.track(consumer_id, QualityLevel::High);
            if let Some(level) = controller.record(consumer_id, *sample) {
                tracing::info!("switching consumer {} to {} quality", consumer_id, level);
                if let Err(err) = control.apply_quality(consumer_id, level).await {
                    tracing::warn!("failed to apply quality to {}: {}", consumer_id, err);
                }
            }
        }
    }

    pub fn set_quality(&self, consumer_id: &str, level: Option<QualityLevel>) {
        self.overrides().set_quality(consumer_id, level);
    }

    pub fn overrides(&self) -> QualityOverrides {
        QualityOverrides {
            commands: self.commands.clone(),
        }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::Mutex as StdMutex,
        time::Duration,
    };

    use super::*;

    fn sample(bitrate: u64, packet_loss: f64) -> QualitySample {
        QualitySample {
            at: Instant::now(),
            bitrate,
            packet_loss,
            rtt: 40.0,
        }
    }

    fn controller() -> QualityController {
        let mut controller = QualityController::new(QualityConfig::default());
        controller.track("c1", QualityLevel::High);
        controller
    }

    #[test]
    fn recommendation_tiers() {
        let c = controller();
        assert_eq!(c.recommend(2_000_000.0, 0.0), QualityLevel::High);
        assert_eq!(c.recommend(600_000.0, 0.0), QualityLevel::Medium);
        assert_eq!(c.recommend(100_000.0, 0.0), QualityLevel::Low);
        assert_eq!(c.recommend(2_000_000.0, 5.0), QualityLevel::Medium);
        assert_eq!(c.recommend(100_000.0, 5.0), QualityLevel::Low);
        assert_eq!(c.recommend(2_000_000.0, 15.0), QualityLevel::Low);
    }

    #[test]
    fn nothing_changes_during_warmup() {
        let mut c = controller();
        assert_eq!(c.record("c1", sample(50_000, 40.0)), None);
        assert_eq!(c.record("c1", sample(50_000, 40.0)), None);
        assert_eq!(c.current("c1"), Some(QualityLevel::High));
    }

    #[test]
    fn a_change_needs_consecutive_confirmation() {
        let mut c = controller();
        for _ in 0..3 {
            assert_eq!(c.record("c1", sample(2_000_000, 0.0)), None);
        }
        // Three bad rounds in a row: only the third one switches.
        assert_eq!(c.record("c1", sample(2_000_000, 60.0)), None);
        assert_eq!(c.record("c1", sample(2_000_000, 60.0)), None);
        assert_eq!(c.record("c1", sample(2_000_000, 60.0)), Some(QualityLevel::Low));
        assert_eq!(c.current("c1"), Some(QualityLevel::Low));
        // Already applied, so no repeated decision.
        assert_eq!(c.record("c1", sample(2_000_000, 60.0)), None);
    }

    #[test]
    fn recovery_needs_three_good_evaluations_in_a_row() {
        let mut c = controller();
        let poor: Vec<_> = (0..5)
            .map(|_| c.record("c1", sample(100_000, 0.0)))
            .collect();
        assert_eq!(poor, vec![None, None, None, None, Some(QualityLevel::Low)]);

        // Two good samples are never enough.
        assert_eq!(c.record("c1", sample(2_000_000, 0.0)), None);
        assert_eq!(c.record("c1", sample(2_000_000, 0.0)), None);
        assert_eq!(c.current("c1"), Some(QualityLevel::Low));

        // The poor samples still in the window hold the average back, so the way up goes
        // through medium, each step confirmed three times.
        let good: Vec<_> = (0..6)
            .map(|_| c.record("c1", sample(2_000_000, 0.0)))
            .collect();
        assert_eq!(
            good,
            vec![
                Some(QualityLevel::Medium),
                None,
                None,
                None,
                None,
                Some(QualityLevel::High),
            ]
        );
        assert_eq!(c.current("c1"), Some(QualityLevel::High));
    }

    #[test]
    fn interrupted_streak_starts_over() {
        let mut c = QualityController::new(QualityConfig {
            window: 1,
            warmup_samples: 1,
            ..Default::default()
        });
        c.track("c1", QualityLevel::High);
        assert_eq!(c.record("c1", sample(100_000, 0.0)), None);
        assert_eq!(c.record("c1", sample(100_000, 0.0)), None);
        assert_eq!(c.record("c1", sample(2_000_000, 0.0)), None);
        assert_eq!(c.record("c1", sample(100_000, 0.0)), None);
        assert_eq!(c.record("c1", sample(100_000, 0.0)), None);
        assert_eq!(c.record("c1", sample(100_000, 0.0)), Some(QualityLevel::Low));
    }

    #[test]
    fn manual_override_suspends_and_resumes_automatic_selection() {
        let mut c = controller();
        assert_eq!(c.set_quality("c1", Some(QualityLevel::Low)), Some(QualityLevel::Low));
        for _ in 0..6 {
            assert_eq!(c.record("c1", sample(2_000_000, 0.0)), None);
        }
        assert_eq!(c.current("c1"), Some(QualityLevel::Low));

        assert_eq!(c.set_quality("c1", None), None);
        // Fresh window: warmup again, then three confirmations.
        let decisions: Vec<_> = (0..5)
            .map(|_| c.record("c1", sample(2_000_000, 0.0)))
            .collect();
        assert_eq!(decisions, vec![None, None, None, None, Some(QualityLevel::High)]);
    }

    struct FixedStats(Vec<(String, u64, f64)>);

    #[async_trait]
    impl StatsSource for FixedStats {
        async fn video_consumer_stats(&self) -> Result<Vec<(String, QualitySample)>, Error> {
            Ok(self
                .0
                .iter()
                .map(|(id, bitrate, loss)| (id.clone(), sample(*bitrate, *loss)))
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingControl(StdMutex<Vec<(String, QualityLevel)>>);

    #[async_trait]
    impl LayerControl for RecordingControl {
        async fn apply_quality(&self, consumer_id: &str, level: QualityLevel) -> Result<(), Error> {
            self.0.lock().unwrap().push((consumer_id.to_string(), level));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_applies_decisions_on_its_interval() {
        let stats = Arc::new(FixedStats(vec![("c1".to_string(), 100_000, 0.0)]));
        let control = Arc::new(RecordingControl::default());
        let monitor = QualityMonitor::spawn(QualityConfig::default(), stats, control.clone());

        // Warmup (3 samples) overlaps with the 3 confirmations, so the fifth tick decides.
        tokio::time::sleep(Duration::from_secs(3 * 4) + Duration::from_millis(100)).await;
        monitor.stop().await;

        let applied = control.0.lock().unwrap().clone();
        assert_eq!(applied, vec![("c1".to_string(), QualityLevel::Low)]);
    }

    #[tokio::test(start_paused = true)]
    async fn pinned_level_holds_until_released() {
        let stats = Arc::new(FixedStats(vec![("c1".to_string(), 100_000, 0.0)]));
        let control = Arc::new(RecordingControl::default());
        let monitor = QualityMonitor::spawn(QualityConfig::default(), stats, control.clone());
        let overrides = monitor.overrides();

        overrides.set_quality("c1", Some(QualityLevel::High));
        // Far more ticks than a downgrade needs.
        tokio::time::sleep(Duration::from_secs(3 * 10)).await;
        assert_eq!(
            control.0.lock().unwrap().clone(),
            vec![("c1".to_string(), QualityLevel::High)]
        );

        overrides.set_quality("c1", None);
        tokio::time::sleep(Duration::from_secs(3 * 6)).await;
        monitor.stop().await;
        assert_eq!(
            control.0.lock().unwrap().clone(),
            vec![
                ("c1".to_string(), QualityLevel::High),
                ("c1".to_string(), QualityLevel::Low),
            ]
        );
    }
}
