//! Adaptive bitrate control.
//!
//! Network-quality samples (loss, jitter, RTT) are fed in by whoever
//! measures them. A strategy turns the averaged samples into a new target
//! bitrate, which is pushed to the codec and announced to an observer.
//! Changes are rate-limited by a stability period so noisy measurements
//! do not make the bitrate thrash.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use voip_bench_common::{ConfigError, MetricsContext, SharedCodec};

/// Default number of samples and bitrate changes kept for statistics.
pub const DEFAULT_HISTORY_LEN: usize = 100;

/// Adaptation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Low thresholds, steep decreases, small additive increases
    Conservative,
    /// Middle ground, additive increases
    #[default]
    Balanced,
    /// High thresholds, gentle decreases, multiplicative increases
    Quality,
}

struct Thresholds {
    loss: f64,
    jitter_ms: f64,
    rtt_ms: f64,
}

impl Strategy {
    // ---
    fn thresholds(self) -> Thresholds {
        // ---
        match self {
            Strategy::Conservative => Thresholds {
                loss: 0.03,
                jitter_ms: 20.0,
                rtt_ms: 200.0,
            },
            Strategy::Balanced => Thresholds {
                loss: 0.05,
                jitter_ms: 30.0,
                rtt_ms: 300.0,
            },
            Strategy::Quality => Thresholds {
                loss: 0.10,
                jitter_ms: 50.0,
                rtt_ms: 500.0,
            },
        }
    }

    /// Multiplier applied on excess loss; `severity` is in `[0, 1]`.
    fn loss_factor(self, severity: f64) -> f64 {
        // ---
        match self {
            Strategy::Conservative => 0.5 - 0.3 * severity,
            Strategy::Balanced => 0.8 - 0.2 * severity,
            Strategy::Quality => 0.9 - 0.1 * severity,
        }
    }

    fn jitter_factor(self) -> f64 {
        match self {
            Strategy::Conservative => 0.85,
            Strategy::Balanced => 0.9,
            Strategy::Quality => 0.95,
        }
    }

    fn rtt_factor(self) -> f64 {
        match self {
            Strategy::Conservative => 0.9,
            Strategy::Balanced => 0.95,
            Strategy::Quality => 0.97,
        }
    }

    fn increase(self, current: f64, max: f64) -> f64 {
        // ---
        let headroom = (max - current).max(0.0);
        match self {
            Strategy::Conservative => current + (headroom * 0.05).max(500.0),
            Strategy::Balanced => current + (headroom * 0.1).max(1000.0),
            Strategy::Quality => current * 1.2,
        }
    }

    /// Computes the next bitrate for one network sample.
    ///
    /// Loss above threshold wins over jitter, which wins over RTT. With
    /// no threshold exceeded the bitrate grows. The result is always
    /// within `[min, max]`.
    pub fn adapt(self, current: u32, sample: &NetworkSample, min: u32, max: u32) -> u32 {
        // ---
        let t = self.thresholds();
        let current_f = current as f64;

        let next = if sample.packet_loss > t.loss {
            let severity = (sample.packet_loss / (2.0 * t.loss)).min(1.0);
            current_f * self.loss_factor(severity)
        } else if sample.jitter_ms > t.jitter_ms {
            current_f * self.jitter_factor()
        } else if sample.rtt_ms > t.rtt_ms {
            current_f * self.rtt_factor()
        } else {
            self.increase(current_f, max as f64)
        };

        (next.round() as u32).clamp(min, max)
    }

    fn is_congested(self, sample: &NetworkSample) -> bool {
        // ---
        let t = self.thresholds();
        sample.packet_loss > t.loss || sample.jitter_ms > t.jitter_ms || sample.rtt_ms > t.rtt_ms
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "conservative" | "aggressive" => Ok(Strategy::Conservative),
            "balanced" => Ok(Strategy::Balanced),
            "quality" => Ok(Strategy::Quality),
            other => anyhow::bail!("unknown strategy: {other}"),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let s = match self {
            Strategy::Conservative => "conservative",
            Strategy::Balanced => "balanced",
            Strategy::Quality => "quality",
        };
        f.write_str(s)
    }
}

/// One network-quality measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NetworkSample {
    /// Loss rate in `[0, 1]`
    pub packet_loss: f64,
    pub jitter_ms: f64,
    pub rtt_ms: f64,
}

impl NetworkSample {
    // ---
    pub fn new(packet_loss: f64, jitter_ms: f64, rtt_ms: f64) -> Self {
        // ---
        Self {
            packet_loss: packet_loss.clamp(0.0, 1.0),
            jitter_ms: jitter_ms.max(0.0),
            rtt_ms: rtt_ms.max(0.0),
        }
    }

    fn mean<'a>(samples: impl ExactSizeIterator<Item = &'a NetworkSample>) -> Option<Self> {
        // ---
        let n = samples.len();
        if n == 0 {
            return None;
        }
        let sum = samples.fold(NetworkSample::default(), |acc, s| NetworkSample {
            packet_loss: acc.packet_loss + s.packet_loss,
            jitter_ms: acc.jitter_ms + s.jitter_ms,
            rtt_ms: acc.rtt_ms + s.rtt_ms,
        });
        Some(NetworkSample {
            packet_loss: sum.packet_loss / n as f64,
            jitter_ms: sum.jitter_ms / n as f64,
            rtt_ms: sum.rtt_ms / n as f64,
        })
    }
}

/// Bitrate controller configuration.
#[derive(Debug, Clone)]
pub struct BitrateConfig {
    // ---
    pub min_bitrate: u32,
    pub max_bitrate: u32,
    pub start_bitrate: u32,

    /// Minimum time between two applied changes
    pub stability_period: Duration,

    /// Bound on the sample and bitrate histories
    pub history_len: usize,

    pub strategy: Strategy,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        // ---
        Self {
            min_bitrate: 6_000,
            max_bitrate: 64_000,
            start_bitrate: 24_000,
            stability_period: Duration::from_secs(2),
            history_len: DEFAULT_HISTORY_LEN,
            strategy: Strategy::default(),
        }
    }
}

impl BitrateConfig {
    // ---
    /// Checks the bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBitrateBounds`] if `min` is zero or
    /// greater than `max`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // ---
        if self.min_bitrate == 0 || self.min_bitrate > self.max_bitrate {
            return Err(ConfigError::InvalidBitrateBounds {
                min: self.min_bitrate,
                max: self.max_bitrate,
            });
        }
        Ok(())
    }
}

/// Controller counters and averages.
#[derive(Debug, Clone, PartialEq)]
pub struct BitrateStats {
    pub current_bitrate: u32,
    pub strategy: Strategy,
    pub adjustments_up: u64,
    pub adjustments_down: u64,
    /// Adaptations made while a threshold was exceeded
    pub congestion_events: u64,
    /// Samples held back by the stability period
    pub stability_events: u64,
    pub samples: u64,
    pub avg_packet_loss: f64,
    pub avg_jitter_ms: f64,
    pub avg_rtt_ms: f64,
    /// Applied bitrates, oldest first, starting with the initial one
    pub bitrate_history: Vec<u32>,
}

/// Called with every new bitrate. Errors are logged, never propagated.
pub type BitrateObserver = Arc<dyn Fn(u32) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug)]
struct ControllerState {
    current: u32,
    strategy: Strategy,

    history: VecDeque<NetworkSample>,
    /// Samples received since the last applied change
    pending: Vec<NetworkSample>,
    bitrate_history: VecDeque<u32>,
    last_change: Option<Instant>,

    adjustments_up: u64,
    adjustments_down: u64,
    congestion_events: u64,
    stability_events: u64,
    samples: u64,
}

impl ControllerState {
    // ---
    fn new(start: u32, strategy: Strategy) -> Self {
        // ---
        Self {
            current: start,
            strategy,
            history: VecDeque::new(),
            pending: Vec::new(),
            bitrate_history: VecDeque::from([start]),
            last_change: None,
            adjustments_up: 0,
            adjustments_down: 0,
            congestion_events: 0,
            stability_events: 0,
            samples: 0,
        }
    }
}

/// Adaptive bitrate controller.
///
/// Cloning yields another handle to the same controller, so a periodic
/// task and a sample-feeding caller serialize through one lock.
///
/// # Example
///
/// ```
/// use sender::bitrate::{BitrateConfig, BitrateController};
///
/// let controller = BitrateController::new(BitrateConfig::default()).unwrap();
/// controller.update_network_stats(0.20, 10.0, 50.0);
/// assert!(controller.current_bitrate() < 24_000);
/// ```
#[derive(Clone)]
pub struct BitrateController {
    // ---
    config: BitrateConfig,
    state: Arc<Mutex<ControllerState>>,
    codec: Option<SharedCodec>,
    observer: Option<BitrateObserver>,
    metrics: Option<MetricsContext>,
}

impl BitrateController {
    // ---
    /// Creates a controller starting at `start_bitrate` clamped into bounds.
    ///
    /// # Errors
    ///
    /// Returns error if the bounds are invalid.
    pub fn new(config: BitrateConfig) -> Result<Self, ConfigError> {
        // ---
        config.validate()?;
        let start = config
            .start_bitrate
            .clamp(config.min_bitrate, config.max_bitrate);
        let state = ControllerState::new(start, config.strategy);

        Ok(Self {
            config,
            state: Arc::new(Mutex::new(state)),
            codec: None,
            observer: None,
            metrics: None,
        })
    }

    /// Pushes every change into `codec` via `set_bitrate`.
    pub fn with_codec(mut self, codec: SharedCodec) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn with_metrics(self, metrics: MetricsContext) -> Self {
        // ---
        metrics
            .current_bitrate_bps
            .set(i64::from(self.current_bitrate()));
        Self {
            metrics: Some(metrics),
            ..self
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_bitrate(&self) -> u32 {
        self.lock().current
    }

    pub fn strategy(&self) -> Strategy {
        self.lock().strategy
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        // ---
        info!("Bitrate strategy set to {}", strategy);
        self.lock().strategy = strategy;
    }

    /// Records a measurement and adapts if the stability period allows.
    ///
    /// Returns the new bitrate if it changed.
    pub fn update_network_stats(&self, packet_loss: f64, jitter_ms: f64, rtt_ms: f64) -> Option<u32> {
        // ---
        let sample = NetworkSample::new(packet_loss, jitter_ms, rtt_ms);
        let change = {
            let mut state = self.lock();
            state.samples += 1;
            state.history.push_back(sample);
            while state.history.len() > self.config.history_len.max(1) {
                state.history.pop_front();
            }
            state.pending.push(sample);

            let gated = state
                .last_change
                .is_some_and(|at| at.elapsed() < self.config.stability_period);
            if gated {
                state.stability_events += 1;
                debug!("Holding sample inside stability period: {:?}", sample);
                None
            } else {
                self.adjust(&mut state)
            }
        };

        if let Some(bitrate) = change {
            self.publish(bitrate);
        }
        change
    }

    /// Adapts immediately from the samples gathered so far, ignoring the
    /// stability period. Returns the resulting bitrate.
    pub fn adapt_now(&self) -> u32 {
        // ---
        let (change, current) = {
            let mut state = self.lock();
            let change = self.adjust(&mut state);
            (change, state.current)
        };

        if let Some(bitrate) = change {
            self.publish(bitrate);
        }
        current
    }

    /// Runs one adaptation step. Returns the new bitrate if it changed.
    fn adjust(&self, state: &mut ControllerState) -> Option<u32> {
        // ---
        let sample = NetworkSample::mean(state.pending.iter())
            .or_else(|| state.history.back().copied())?;
        state.pending.clear();

        let strategy = state.strategy;
        if strategy.is_congested(&sample) {
            state.congestion_events += 1;
        }

        let next = strategy.adapt(
            state.current,
            &sample,
            self.config.min_bitrate,
            self.config.max_bitrate,
        );
        if next == state.current {
            return None;
        }

        if next > state.current {
            state.adjustments_up += 1;
        } else {
            state.adjustments_down += 1;
        }
        debug!(
            "Bitrate {} -> {} bps (loss {:.3}, jitter {:.1}ms, rtt {:.1}ms)",
            state.current, next, sample.packet_loss, sample.jitter_ms, sample.rtt_ms
        );

        state.current = next;
        state.last_change = Some(Instant::now());
        state.bitrate_history.push_back(next);
        while state.bitrate_history.len() > self.config.history_len.max(1) {
            state.bitrate_history.pop_front();
        }
        Some(next)
    }

    /// Pushes a new bitrate to the codec, metrics and observer.
    fn publish(&self, bitrate: u32) {
        // ---
        if let Some(codec) = &self.codec {
            let mut codec = codec.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = codec.set_bitrate(bitrate) {
                warn!("Codec rejected bitrate {}: {:#}", bitrate, e);
            }
        }
        if let Some(m) = &self.metrics {
            m.current_bitrate_bps.set(i64::from(bitrate));
        }
        if let Some(observer) = &self.observer {
            if let Err(e) = observer(bitrate) {
                error!("Bitrate observer failed: {:#}", e);
            }
        }
    }

    /// Clears history and counters and restarts at `start` (clamped).
    pub fn reset(&self, start: u32) {
        // ---
        let start = start.clamp(self.config.min_bitrate, self.config.max_bitrate);
        {
            let mut state = self.lock();
            let strategy = state.strategy;
            *state = ControllerState::new(start, strategy);
        }
        info!("Bitrate controller reset to {} bps", start);
        self.publish(start);
    }

    pub fn stats(&self) -> BitrateStats {
        // ---
        let state = self.lock();
        let avg = NetworkSample::mean(state.history.iter()).unwrap_or_default();
        BitrateStats {
            current_bitrate: state.current,
            strategy: state.strategy,
            adjustments_up: state.adjustments_up,
            adjustments_down: state.adjustments_down,
            congestion_events: state.congestion_events,
            stability_events: state.stability_events,
            samples: state.samples,
            avg_packet_loss: avg.packet_loss,
            avg_jitter_ms: avg.jitter_ms,
            avg_rtt_ms: avg.rtt_ms,
            bitrate_history: state.bitrate_history.iter().copied().collect(),
        }
    }

    /// Spawns a task calling [`adapt_now`](Self::adapt_now) every `interval`.
    pub fn spawn_periodic(&self, interval: Duration) -> AdaptationTask {
        // ---
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let controller = self.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        controller.adapt_now();
                    }
                }
            }
            debug!("Periodic bitrate adaptation stopped");
        });

        AdaptationTask { shutdown, handle }
    }
}

/// Handle to a periodic adaptation task.
pub struct AdaptationTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl AdaptationTask {
    // ---
    pub async fn stop(self) {
        // ---
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!("Adaptation task ended abnormally: {}", e);
        }
    }
}
