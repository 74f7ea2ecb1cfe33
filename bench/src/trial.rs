//! One benchmark trial: sender → relay + simulator → receiver → score.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use netsim::{NetworkConditions, Relay, RelayConfig, SimulatorConfig};
use receiver::quality::{
    jitter_statistics, latency_statistics, packet_loss_burst_ratio, packet_loss_ratio,
};
use receiver::{voip_metrics, JitterBufferConfig, Playout, PlayoutConfig, WavSink};
use sender::{read_wav, AudioData, BitrateConfig, BitrateController, RtpStream, Strategy};
use voip_bench_common::codec::FRAME_DURATION_MS;
use voip_bench_common::{CodecKind, MetricsContext, RtpPacket, RtpSession};

use crate::report::TrialReport;

/// Everything that defines a trial.
#[derive(Debug, Clone)]
pub struct TrialConfig {
    // ---
    pub conditions: NetworkConditions,

    /// Simulator seed; `None` seeds from entropy
    pub seed: Option<u64>,

    pub codec: CodecKind,

    /// Adaptive bitrate strategy; `None` keeps the bitrate fixed
    pub strategy: Option<Strategy>,
    pub bitrate: BitrateConfig,

    /// How often receiver statistics are fed to the bitrate controller
    pub feedback_interval: Duration,

    /// WAV input; a 440Hz tone of `duration` is used when absent
    pub input: Option<PathBuf>,
    pub duration: Duration,

    /// Pacing between packets
    pub frame_interval: Duration,

    pub jitter_buffer: JitterBufferConfig,

    /// Write the decoded playout to this WAV file
    pub output: Option<PathBuf>,

    /// Interface every endpoint binds to
    pub bind_addr: String,
}

impl Default for TrialConfig {
    fn default() -> Self {
        // ---
        Self {
            conditions: NetworkConditions::default(),
            seed: None,
            codec: CodecKind::default(),
            strategy: None,
            bitrate: BitrateConfig::default(),
            feedback_interval: Duration::from_millis(500),
            input: None,
            duration: Duration::from_secs(5),
            frame_interval: Duration::from_millis(FRAME_DURATION_MS as u64),
            jitter_buffer: JitterBufferConfig::default(),
            output: None,
            bind_addr: "127.0.0.1".into(),
        }
    }
}

impl TrialConfig {
    /// Worst-case time a packet can spend inside the simulator.
    fn max_transit(&self) -> Duration {
        // ---
        let c = &self.conditions;
        // Reorder delay tops out at 200ms, duplicate offset at 5ms
        let ms = c.latency_ms() + c.jitter_ms() + 205.0;
        Duration::from_micros((ms * 1000.0).round() as u64)
    }
}

/// Send time of each sequence number still in flight, and the one-way
/// delays measured so far.
#[derive(Default)]
struct LatencyTracker {
    in_flight: HashMap<u16, Instant>,
    samples_ms: Vec<f64>,
}

type SharedTracker = Arc<Mutex<LatencyTracker>>;

fn lock(tracker: &SharedTracker) -> MutexGuard<'_, LatencyTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A configured trial, optionally reporting into a metrics registry.
pub struct Trial {
    config: TrialConfig,
    metrics: Option<MetricsContext>,
}

impl Trial {
    // ---
    pub fn new(config: TrialConfig) -> Self {
        Self {
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs the trial to completion.
    ///
    /// # Errors
    ///
    /// Returns error if the trial cannot be set up: audio cannot be
    /// loaded, a codec cannot be created, or a socket cannot be bound.
    /// A network that delivers nothing is a valid outcome and yields a
    /// report with zero packets received.
    pub async fn run(self) -> Result<TrialReport> {
        // ---
        let config = &self.config;
        let audio = load_audio(config)?;

        // Receive side
        let decoder = config.codec.build().context("failed to create decoder")?;
        let sample_rate = decoder.sample_rate();
        let mut playout = Playout::new(
            PlayoutConfig {
                jitter: config.jitter_buffer.clone(),
                interval: config.frame_interval,
                ..PlayoutConfig::default()
            },
            decoder,
        )
        .with_capture();
        if let Some(path) = &config.output {
            playout = playout.with_sink(WavSink::create(path, sample_rate)?);
        }
        if let Some(m) = &self.metrics {
            playout = playout.with_metrics(m.clone());
        }

        let mut rx = RtpSession::open(&config.bind_addr, 0)
            .await
            .context("failed to open receiver session")?;
        if let Some(m) = &self.metrics {
            rx = rx.with_metrics(m.clone());
        }

        // Network
        let mut simulator = SimulatorConfig::new(config.conditions);
        simulator.seed = config.seed;
        let mut relay = Relay::start(
            RelayConfig {
                listen_addr: config.bind_addr.clone(),
                listen_port: 0,
                destination_host: config.bind_addr.clone(),
                destination_port: rx.local_addr().port(),
                simulator,
            },
            self.metrics.clone(),
        )
        .await
        .context("failed to start network relay")?;

        // Send side
        let mut tx = RtpSession::open(&config.bind_addr, 0)
            .await
            .context("failed to open sender session")?;
        tx.set_remote(&config.bind_addr, relay.local_addr().port())
            .await
            .context("failed to resolve relay address")?;
        if let Some(m) = &self.metrics {
            tx = tx.with_metrics(m.clone());
        }
        playout.expect_sequence(tx.sequence());

        let codec = config
            .codec
            .build_shared()
            .context("failed to create encoder")?;
        let controller = match config.strategy {
            Some(strategy) => {
                let mut controller = BitrateController::new(BitrateConfig {
                    strategy,
                    ..config.bitrate.clone()
                })?
                .with_codec(Arc::clone(&codec));
                if let Some(m) = &self.metrics {
                    controller = controller.with_metrics(m.clone());
                }
                // Start the codec where the controller starts
                controller.reset(controller.current_bitrate());
                Some(controller)
            }
            None => {
                codec
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .set_bitrate(config.bitrate.start_bitrate)?;
                None
            }
        };
        let codec_bitrate = codec
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bitrate();
        let mut stream = RtpStream::new(tx, codec);
        if let Some(m) = &self.metrics {
            stream = stream.with_metrics(m.clone());
        }

        // Wire the receiver
        let tracker: SharedTracker = Arc::default();
        rx.start_receiving(arrival_handler(playout.clone(), Arc::clone(&tracker)))?;
        let playout_task = playout.spawn();

        info!(
            "Trial: {:.1}s of {:?} over {:?}",
            audio.duration_secs(),
            config.codec,
            config.conditions
        );

        let started = Instant::now();
        let sent = send_all(
            config,
            &audio,
            &mut stream,
            &tracker,
            &playout,
            controller.as_ref(),
        )
        .await?;
        let send_elapsed = started.elapsed();

        // Let in-flight packets land, then tear down front to back
        if !relay.wait_idle(config.max_transit() + Duration::from_secs(1)).await {
            warn!("Simulator still had queued packets at teardown");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        rx.stop_receiving().await;
        playout_task.stop().await;
        playout.drain()?;
        let playout_report = playout.finish()?;
        let psnr = receiver::psnr(&audio.samples, &playout.take_captured());

        relay.stop().await;
        let relay_stats = relay.stats();
        let sender_stats = stream.close().await;
        rx.close().await;

        let received = playout_report.network.packets_received;
        let loss = packet_loss_ratio(sent, received);
        let trace = loss_trace(sent, &playout_report.network.loss_events());
        let (_, burst_ratio) = packet_loss_burst_ratio(&trace);
        let latency = latency_statistics(&lock(&tracker).samples_ms);
        let jitter = jitter_statistics(playout_report.network.jitter_samples());

        let final_bitrate = controller
            .as_ref()
            .map_or(codec_bitrate, BitrateController::current_bitrate);
        let quality = voip_metrics(
            loss,
            latency.mean,
            jitter.mean,
            final_bitrate,
            playout_report.mean_payload_bytes.round() as usize,
            FRAME_DURATION_MS as u32,
        );
        if let Some(m) = &self.metrics {
            m.mos.set(quality.mos);
        }

        let report = TrialReport {
            conditions: config.conditions,
            codec: config.codec,
            strategy: config.strategy,
            packets_sent: sent,
            packets_received: received,
            bytes_sent: sender_stats.bytes_sent,
            packet_loss: loss,
            burst_ratio,
            latency,
            jitter,
            quality,
            simulator: relay_stats.simulator,
            relay_forwarded: relay_stats.forwarded,
            jitter_buffer: playout_report.buffer,
            frames_decoded: playout_report.frames_decoded,
            frames_concealed: playout_report.frames_concealed,
            psnr,
            bitrate: controller.as_ref().map(BitrateController::stats),
            output: config.output.clone(),
            elapsed: send_elapsed,
        };
        info!("{}", report.summary_line());
        Ok(report)
    }
}

/// Runs a trial without metrics.
pub async fn run_trial(config: TrialConfig) -> Result<TrialReport> {
    Trial::new(config).run().await
}

fn load_audio(config: &TrialConfig) -> Result<AudioData> {
    // ---
    let sample_rate = voip_bench_common::codec::SAMPLE_RATE;
    match &config.input {
        Some(path) => read_wav(path, sample_rate),
        None => Ok(AudioData::tone(
            440.0,
            config.duration.as_secs_f64(),
            sample_rate,
        )),
    }
}

/// Receive handler: measures one-way delay on first arrival, then hands
/// the packet to the playout pipeline.
fn arrival_handler(playout: Playout, tracker: SharedTracker) -> voip_bench_common::PacketHandler {
    // ---
    Box::new(move |packet: RtpPacket, _from: SocketAddr| {
        let arrival = Instant::now();
        {
            let mut tracker = lock(&tracker);
            if let Some(sent_at) = tracker.in_flight.remove(&packet.sequence) {
                let delay = arrival.saturating_duration_since(sent_at);
                tracker.samples_ms.push(delay.as_secs_f64() * 1000.0);
            }
        }
        playout.on_packet(packet, arrival);
        Ok(())
    })
}

/// Streams every frame, feeding receiver statistics to the controller.
///
/// Returns the number of packets actually sent.
async fn send_all(
    config: &TrialConfig,
    audio: &AudioData,
    stream: &mut RtpStream,
    tracker: &SharedTracker,
    playout: &Playout,
    controller: Option<&BitrateController>,
) -> Result<u64> {
    // ---
    let frame_samples = stream
        .codec()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .frame_samples();

    let mut ticker = tokio::time::interval(config.frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_feedback = Instant::now();
    let mut sent = 0u64;

    for frame in audio.frames(frame_samples) {
        ticker.tick().await;

        let sequence = stream.session().sequence();
        lock(tracker).in_flight.insert(sequence, Instant::now());
        match stream.send_frame(&frame).await {
            Ok(_) => sent += 1,
            Err(e) if e.is_transient() => {
                warn!("Frame seq={} not sent: {}", sequence, e);
                lock(tracker).in_flight.remove(&sequence);
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(controller) = controller {
            if last_feedback.elapsed() >= config.feedback_interval {
                feed_controller(controller, tracker, playout);
                last_feedback = Instant::now();
            }
        }
    }

    debug!("Sent {} packets", sent);
    Ok(sent)
}

/// Reports what the receiver has seen so far to the controller.
///
/// RTT is approximated as twice the mean one-way delay.
fn feed_controller(controller: &BitrateController, tracker: &SharedTracker, playout: &Playout) {
    // ---
    let network = playout.report().network;
    let loss = network.loss_percentage() / 100.0;
    let one_way = {
        let tracker = lock(tracker);
        let recent = &tracker.samples_ms[tracker.samples_ms.len().saturating_sub(50)..];
        if recent.is_empty() {
            0.0
        } else {
            recent.iter().sum::<f64>() / recent.len() as f64
        }
    };
    controller.update_network_stats(loss, network.smoothed_jitter_ms(), one_way * 2.0);
}

/// Pads the receiver's loss trace up to `sent` entries.
///
/// The receiver only sees the range between its first and last arrival;
/// losses outside it are appended at the end.
fn loss_trace(sent: u64, observed: &[bool]) -> Vec<bool> {
    // ---
    let mut trace = observed.to_vec();
    let missing_tail = (sent as usize).saturating_sub(trace.len());
    trace.extend(std::iter::repeat(true).take(missing_tail));
    trace
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_loss_trace_counts_tail_losses() {
        // ---
        let trace = loss_trace(6, &[false, true, false]);
        assert_eq!(trace, vec![false, true, false, true, true, true]);

        // Nothing arrived at all
        assert_eq!(loss_trace(3, &[]), vec![true; 3]);
    }

    #[test]
    fn test_max_transit_covers_reorder_delay() {
        // ---
        let config = TrialConfig {
            conditions: NetworkConditions::default()
                .with_latency_ms(100.0)
                .with_jitter_ms(30.0),
            ..TrialConfig::default()
        };
        assert_eq!(config.max_transit(), Duration::from_millis(335));
    }
}
