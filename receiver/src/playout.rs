//! Playout pipeline: jitter buffer, decode, concealment and output.
//!
//! Arrivals are fed in from the session's receive task through
//! [`Playout::handler`]; a separate playout task drains the jitter buffer
//! once per frame interval.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use voip_bench_common::codec::FRAME_DURATION_MS;
use voip_bench_common::{AudioCodec, MetricsContext, PacketHandler, RtpPacket};

use crate::audio::WavSink;
use crate::jitter_buffer::{
    seq_forward_distance, JitterBuffer, JitterBufferConfig, JitterBufferStats,
};
use crate::stats::ReceiverStats;

/// Receiver-side configuration.
#[derive(Debug, Clone)]
pub struct PlayoutConfig {
    // ---
    pub jitter: JitterBufferConfig,

    /// How often the playout task pulls a frame's worth from the buffer
    pub interval: Duration,

    /// Ticks to wait for a missing packet while later ones are buffered
    /// before playing past it
    pub max_stall_ticks: u32,

    /// Interval of the periodic stats log line
    pub log_interval: Duration,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        // ---
        Self {
            jitter: JitterBufferConfig::default(),
            interval: Duration::from_millis(FRAME_DURATION_MS as u64),
            max_stall_ticks: 5,
            log_interval: Duration::from_secs(5),
        }
    }
}

/// Final figures for one receive run.
#[derive(Debug, Clone)]
pub struct PlayoutReport {
    pub network: ReceiverStats,
    pub buffer: JitterBufferStats,
    pub frames_decoded: u64,
    pub frames_concealed: u64,
    pub decode_errors: u64,
    pub samples_played: u64,
    /// Mean RTP payload size of decoded packets
    pub mean_payload_bytes: f64,
}

struct PlayoutState {
    buffer: JitterBuffer,
    stats: ReceiverStats,
    codec: Box<dyn AudioCodec>,
    sink: Option<WavSink>,
    /// Every played sample, when capture is enabled
    captured: Option<Vec<i16>>,

    frames_decoded: u64,
    frames_concealed: u64,
    decode_errors: u64,
    samples_played: u64,
    payload_bytes: u64,
    stalled_ticks: u32,
}

impl PlayoutState {
    // ---
    fn play(&mut self, samples: &[i16]) -> Result<()> {
        // ---
        self.samples_played += samples.len() as u64;
        if let Some(captured) = self.captured.as_mut() {
            captured.extend_from_slice(samples);
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.write_frame(samples)?;
        }
        Ok(())
    }

    fn conceal(&mut self, frames: u64) -> Result<()> {
        // ---
        for _ in 0..frames {
            let samples = self.codec.conceal_loss()?;
            self.frames_concealed += 1;
            self.play(&samples)?;
        }
        Ok(())
    }

    fn decode(&mut self, packet: &RtpPacket, metrics: Option<&MetricsContext>) -> Result<()> {
        // ---
        if packet.payload_type != self.codec.payload_type() {
            warn!(
                "Unexpected payload type {} for {} (seq={}), concealing",
                packet.payload_type,
                self.codec.name(),
                packet.sequence
            );
            self.decode_errors += 1;
            return self.conceal(1);
        }

        let started = Instant::now();
        let decoded = self.codec.decode(&packet.payload);
        if let Some(m) = metrics {
            m.decode_seconds.observe(started.elapsed().as_secs_f64());
        }

        match decoded {
            Ok(samples) => {
                self.frames_decoded += 1;
                self.payload_bytes += packet.payload.len() as u64;
                self.play(&samples)
            }
            Err(e) => {
                warn!("Failed to decode packet seq={}: {:#}", packet.sequence, e);
                self.decode_errors += 1;
                self.conceal(1)
            }
        }
    }

    /// Plays `packet`, first concealing the `skipped` frames before it.
    fn release(
        &mut self,
        packet: RtpPacket,
        skipped: u64,
        metrics: Option<&MetricsContext>,
    ) -> Result<()> {
        // ---
        if skipped > 0 {
            if let Some(m) = metrics {
                m.jitter_buffer_lost_total.inc_by(skipped);
            }
            self.conceal(skipped)?;
        }
        self.decode(&packet, metrics)
    }
}

/// Shared receive-side pipeline.
///
/// Cloning shares the same buffer, statistics and decoder.
#[derive(Clone)]
pub struct Playout {
    // ---
    state: Arc<Mutex<PlayoutState>>,
    metrics: Option<MetricsContext>,
    config: PlayoutConfig,
}

impl Playout {
    // ---
    pub fn new(config: PlayoutConfig, codec: Box<dyn AudioCodec>) -> Self {
        // ---
        let state = PlayoutState {
            buffer: JitterBuffer::new(config.jitter.clone()),
            stats: ReceiverStats::new(codec.sample_rate(), config.log_interval),
            codec,
            sink: None,
            captured: None,
            frames_decoded: 0,
            frames_concealed: 0,
            decode_errors: 0,
            samples_played: 0,
            payload_bytes: 0,
            stalled_ticks: 0,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            metrics: None,
            config,
        }
    }

    /// Writes every played frame to `sink`.
    pub fn with_sink(self, sink: WavSink) -> Self {
        // ---
        self.lock().sink = Some(sink);
        self
    }

    /// Keeps a copy of every played sample for [`take_captured`](Self::take_captured).
    pub fn with_capture(self) -> Self {
        // ---
        self.lock().captured = Some(Vec::new());
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Hands over the samples played so far, concealment included.
    ///
    /// Empty unless the playout was built [`with_capture`](Self::with_capture).
    pub fn take_captured(&self) -> Vec<i16> {
        // ---
        self.lock()
            .captured
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, PlayoutState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pins the first sequence number the buffer will release.
    pub fn expect_sequence(&self, sequence: u16) {
        self.lock().buffer.expect_sequence(sequence);
    }

    /// Packet handler for [`RtpSession::start_receiving`](voip_bench_common::RtpSession::start_receiving).
    pub fn handler(&self) -> PacketHandler {
        // ---
        let playout = self.clone();
        Box::new(move |packet: RtpPacket, _from: SocketAddr| {
            playout.on_packet(packet, Instant::now());
            Ok(())
        })
    }

    /// Records an arrival and offers it to the jitter buffer.
    ///
    /// Returns `true` if the buffer accepted the packet.
    pub fn on_packet(&self, packet: RtpPacket, arrival: Instant) -> bool {
        // ---
        let mut state = self.lock();
        let first_arrival = state
            .stats
            .record_packet(packet.sequence, packet.timestamp, arrival);

        let duplicates_before = state.buffer.stats().duplicates;
        let sequence = packet.sequence;
        let accepted = state.buffer.add_packet(packet);

        if !accepted {
            // A repeat of a played packet is a duplicate, not a late arrival
            if first_arrival && state.buffer.stats().duplicates == duplicates_before {
                debug!("Packet seq={} missed its playout slot", sequence);
                state.stats.record_late_packet();
            }
            if let Some(m) = &self.metrics {
                m.jitter_buffer_dropped_total.inc();
            }
        }
        if let Some(m) = &self.metrics {
            m.jitter_buffer_occupancy_packets.set(state.buffer.len() as i64);
        }
        accepted
    }

    /// Releases and plays every packet the buffer has ready.
    ///
    /// When the next packet has been missing for `max_stall_ticks` ticks
    /// while later packets wait, it is written off and concealed.
    ///
    /// Returns the number of frames played, concealed ones included.
    ///
    /// # Errors
    ///
    /// Returns error if concealment or the output sink fails.
    pub fn tick(&self) -> Result<u64> {
        // ---
        let mut state = self.lock();
        let metrics = self.metrics.as_ref();
        let before = state.frames_decoded + state.frames_concealed;

        loop {
            let lost_before = state.buffer.stats().packets_lost;
            if let Some(packet) = state.buffer.get_next_packet() {
                state.stalled_ticks = 0;
                let skipped = state.buffer.stats().packets_lost - lost_before;
                state.release(packet, skipped, metrics)?;
                continue;
            }
            if state.buffer.is_empty() {
                state.stalled_ticks = 0;
                break;
            }

            state.stalled_ticks += 1;
            if state.stalled_ticks < self.config.max_stall_ticks {
                break;
            }
            let skipped = state.buffer.skip_gap();
            state.stalled_ticks = 0;
            if let Some(m) = metrics {
                m.jitter_buffer_lost_total.inc_by(u64::from(skipped));
            }
            state.conceal(u64::from(skipped))?;
        }

        if let Some(m) = metrics {
            m.jitter_buffer_occupancy_packets.set(state.buffer.len() as i64);
        }
        Ok(state.frames_decoded + state.frames_concealed - before)
    }

    /// Plays out everything left in the buffer at end of stream.
    pub fn drain(&self) -> Result<u64> {
        // ---
        let mut state = self.lock();
        let metrics = self.metrics.as_ref();
        let before = state.frames_decoded + state.frames_concealed;

        let mut next = state.buffer.stats().next_sequence;
        for packet in state.buffer.flush() {
            let skipped = next.map_or(0, |n| seq_forward_distance(n, packet.sequence) as u64);
            next = Some(packet.sequence.wrapping_add(1));
            state.release(packet, skipped, metrics)?;
        }

        Ok(state.frames_decoded + state.frames_concealed - before)
    }

    /// Spawns the periodic playout task.
    pub fn spawn(&self) -> PlayoutTask {
        // ---
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let playout = self.clone();
        let period = self.config.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = playout.tick() {
                            warn!("Playout failed: {:#}", e);
                        }
                    }
                }
            }
            debug!("Playout task stopped");
        });

        PlayoutTask { shutdown, handle }
    }

    /// Finalizes the output file and returns the run's figures.
    pub fn finish(&self) -> Result<PlayoutReport> {
        // ---
        let mut state = self.lock();
        if let Some(sink) = state.sink.as_mut() {
            sink.finalize()?;
        }
        state.stats.log();
        info!(
            "Playout: {} decoded, {} concealed, {} decode errors",
            state.frames_decoded, state.frames_concealed, state.decode_errors
        );
        Ok(Self::snapshot(&state))
    }

    pub fn report(&self) -> PlayoutReport {
        Self::snapshot(&self.lock())
    }

    fn snapshot(state: &PlayoutState) -> PlayoutReport {
        // ---
        PlayoutReport {
            network: state.stats.clone(),
            buffer: state.buffer.stats(),
            frames_decoded: state.frames_decoded,
            frames_concealed: state.frames_concealed,
            decode_errors: state.decode_errors,
            samples_played: state.samples_played,
            mean_payload_bytes: if state.frames_decoded == 0 {
                0.0
            } else {
                state.payload_bytes as f64 / state.frames_decoded as f64
            },
        }
    }
}

/// Handle to a running playout task.
pub struct PlayoutTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PlayoutTask {
    // ---
    pub async fn stop(self) {
        // ---
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!("Playout task ended abnormally: {}", e);
        }
    }
}
