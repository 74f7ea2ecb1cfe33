//! Trial results.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use netsim::{NetworkConditions, SimulatorStats};
use receiver::quality::DistributionStats;
use receiver::{JitterBufferStats, VoipMetrics};
use sender::{BitrateStats, Strategy};
use voip_bench_common::CodecKind;

/// Configured conditions next to what was measured, plus the score.
#[derive(Debug, Clone)]
pub struct TrialReport {
    // ---
    pub conditions: NetworkConditions,
    pub codec: CodecKind,
    pub strategy: Option<Strategy>,

    pub packets_sent: u64,
    /// Distinct packets that reached the receiver
    pub packets_received: u64,
    pub bytes_sent: u64,

    /// Measured loss rate in `[0, 1]`
    pub packet_loss: f64,
    pub burst_ratio: f64,
    /// One-way delay in milliseconds
    pub latency: DistributionStats,
    /// Interarrival jitter in milliseconds
    pub jitter: DistributionStats,
    pub quality: VoipMetrics,

    pub simulator: SimulatorStats,
    pub relay_forwarded: u64,
    pub jitter_buffer: JitterBufferStats,
    pub frames_decoded: u64,
    pub frames_concealed: u64,
    /// Decoded audio against the input in dB; `None` if nothing played
    pub psnr: Option<f64>,
    pub bitrate: Option<BitrateStats>,

    /// Decoded audio, if it was recorded
    pub output: Option<PathBuf>,
    /// Time spent sending
    pub elapsed: Duration,
}

impl TrialReport {
    // ---
    /// `true` if nothing made it through the network.
    pub fn is_empty(&self) -> bool {
        self.packets_received == 0
    }

    pub fn summary_line(&self) -> String {
        // ---
        format!(
            "MOS {:.2} ({}) | loss {:.2}% | latency {:.1}ms | jitter {:.1}ms | {}/{} packets",
            self.quality.mos,
            self.quality.rating,
            self.packet_loss * 100.0,
            self.latency.mean,
            self.jitter.mean,
            self.packets_received,
            self.packets_sent
        )
    }
}

impl fmt::Display for TrialReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let c = &self.conditions;
        writeln!(f, "Conditions")?;
        writeln!(
            f,
            "  configured: loss {:.1}%  latency {:.0}ms  jitter ±{:.0}ms  dup {:.1}%  reorder {:.1}%  corrupt {:.1}%",
            c.packet_loss() * 100.0,
            c.latency_ms(),
            c.jitter_ms(),
            c.duplicate_prob() * 100.0,
            c.reorder_prob() * 100.0,
            c.corrupt_prob() * 100.0
        )?;
        writeln!(
            f,
            "  measured:   loss {:.2}%  latency {:.1}ms (p95 {:.1})  jitter {:.1}ms (p95 {:.1})  burst ratio {:.2}",
            self.packet_loss * 100.0,
            self.latency.mean,
            self.latency.p95,
            self.jitter.mean,
            self.jitter.p95,
            self.burst_ratio
        )?;

        writeln!(f, "Traffic")?;
        writeln!(
            f,
            "  {} sent, {} received, {} bytes in {:.2}s",
            self.packets_sent,
            self.packets_received,
            self.bytes_sent,
            self.elapsed.as_secs_f64()
        )?;
        let s = &self.simulator;
        writeln!(
            f,
            "  simulator: {} processed, {} dropped, {} delivered, {} duplicated, {} corrupted, {} reordered",
            s.packets_processed,
            s.packets_dropped,
            s.packets_delivered,
            s.packets_duplicated,
            s.packets_corrupted,
            s.packets_reordered
        )?;
        let jb = &self.jitter_buffer;
        writeln!(
            f,
            "  jitter buffer: {} added, {} played, {} dropped, {} out of order, {} lost",
            jb.packets_added, jb.packets_retrieved, jb.packets_dropped, jb.packets_out_of_order, jb.packets_lost
        )?;
        writeln!(
            f,
            "  playout: {} decoded, {} concealed",
            self.frames_decoded, self.frames_concealed
        )?;

        if let Some(b) = &self.bitrate {
            writeln!(f, "Bitrate ({})", b.strategy)?;
            writeln!(
                f,
                "  final {} bps, {} up, {} down, {} congestion events",
                b.current_bitrate, b.adjustments_up, b.adjustments_down, b.congestion_events
            )?;
        }

        let q = &self.quality;
        writeln!(f, "Quality")?;
        writeln!(
            f,
            "  MOS {:.2} ({}), R-factor {:.1}",
            q.mos, q.rating, q.r_factor
        )?;
        writeln!(
            f,
            "  {:.1} kbps effective, {:.1} kbps on the wire ({:.0}% overhead)",
            q.effective_bitrate / 1000.0,
            q.network_bandwidth_bps / 1000.0,
            q.overhead_ratio * 100.0
        )?;
        match self.psnr {
            Some(db) => writeln!(f, "  PSNR {:.1} dB", db)?,
            None => writeln!(f, "  PSNR n/a")?,
        }
        if let Some(path) = &self.output {
            writeln!(f, "  decoded audio: {}", path.display())?;
        }
        Ok(())
    }
}
