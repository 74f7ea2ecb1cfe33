//! Statistics tracking for the RTP receiver.
//!
//! Tracks loss (sequence gaps), reordering, duplicates, late packets and
//! interarrival jitter, and keeps a per-sequence loss trace for burst
//! analysis.

use std::time::{Duration, Instant};
use tracing::info;

/// Network and reception statistics.
///
/// Sequence numbers are unwrapped into a monotonically growing index so
/// the loss trace survives 16-bit wraparound.
#[derive(Debug, Clone)]
pub struct ReceiverStats {
    // ---
    /// Distinct packets received
    pub packets_received: u64,

    /// Sequence numbers inside the observed range that never arrived
    pub packets_lost: u64,

    /// Packets that arrived after a higher sequence number
    pub packets_reordered: u64,

    /// Packets that arrived too late for playout
    pub packets_late: u64,

    /// Repeat arrivals of an already received sequence number
    pub packets_duplicate: u64,

    /// Clock rate of the RTP timestamps
    sample_rate: u32,

    /// Unwrapped index of the first and highest sequence seen
    first_index: Option<i64>,
    highest: Option<(u16, i64)>,

    /// `true` for every received index, starting at `first_index`
    received_mask: Vec<bool>,

    /// Arrival time and RTP timestamp of the previous packet
    last_arrival: Option<(Instant, u32)>,

    /// |Δarrival − Δtimestamp| per packet, in milliseconds
    jitter_samples: Vec<f64>,

    /// RFC 3550 running jitter estimate in milliseconds
    smoothed_jitter_ms: f64,

    start_time: Instant,
    last_log_time: Instant,
    log_interval: Duration,
}

impl ReceiverStats {
    // ---
    /// Creates a new stats tracker.
    ///
    /// # Arguments
    ///
    /// * `sample_rate` - RTP clock rate, used to convert timestamps to time
    /// * `log_interval` - How often to automatically log stats
    pub fn new(sample_rate: u32, log_interval: Duration) -> Self {
        // ---
        let now = Instant::now();
        Self {
            packets_received: 0,
            packets_lost: 0,
            packets_reordered: 0,
            packets_late: 0,
            packets_duplicate: 0,
            sample_rate: sample_rate.max(1),
            first_index: None,
            highest: None,
            received_mask: Vec::new(),
            last_arrival: None,
            jitter_samples: Vec::new(),
            smoothed_jitter_ms: 0.0,
            start_time: now,
            last_log_time: now,
            log_interval,
        }
    }

    /// Records a received packet.
    ///
    /// # Arguments
    ///
    /// * `sequence` - RTP sequence number
    /// * `timestamp` - RTP timestamp
    /// * `arrival` - When the packet arrived
    ///
    /// Returns `false` if the sequence number was already received.
    pub fn record_packet(&mut self, sequence: u16, timestamp: u32, arrival: Instant) -> bool {
        // ---
        let index = match self.highest {
            None => 0,
            Some((high_seq, high_index)) => {
                high_index + i64::from(sequence.wrapping_sub(high_seq) as i16)
            }
        };
        let first = *self.first_index.get_or_insert(index);

        if index < first {
            // Older than anything in the trace; still a real arrival.
            self.packets_received += 1;
            self.packets_reordered += 1;
            self.maybe_log();
            return true;
        }

        let slot = (index - first) as usize;
        if slot < self.received_mask.len() {
            if self.received_mask[slot] {
                self.packets_duplicate += 1;
                return false;
            }
            // Fills a hole counted as lost when the gap was first seen
            self.received_mask[slot] = true;
            self.packets_lost = self.packets_lost.saturating_sub(1);
            self.packets_reordered += 1;
        } else {
            let gap = slot - self.received_mask.len();
            self.packets_lost += gap as u64;
            self.received_mask.resize(slot, false);
            self.received_mask.push(true);
            self.highest = Some((sequence, index));
        }

        self.packets_received += 1;
        self.record_arrival(timestamp, arrival);
        self.maybe_log();
        true
    }

    fn record_arrival(&mut self, timestamp: u32, arrival: Instant) {
        // ---
        if let Some((prev_arrival, prev_ts)) = self.last_arrival {
            let arrival_ms = if arrival >= prev_arrival {
                (arrival - prev_arrival).as_secs_f64() * 1000.0
            } else {
                -(prev_arrival - arrival).as_secs_f64() * 1000.0
            };
            let media_ms =
                f64::from(timestamp.wrapping_sub(prev_ts) as i32) * 1000.0 / f64::from(self.sample_rate);
            let d = (arrival_ms - media_ms).abs();

            self.jitter_samples.push(d);
            self.smoothed_jitter_ms += (d - self.smoothed_jitter_ms) / 16.0;
        }
        self.last_arrival = Some((arrival, timestamp));
    }

    /// Records a packet that arrived too late to be played.
    pub fn record_late_packet(&mut self) {
        // ---
        self.packets_late += 1;
    }

    /// Sequence numbers covered so far, from first to highest.
    pub fn packets_expected(&self) -> u64 {
        self.received_mask.len() as u64
    }

    /// Per-sequence loss trace, `true` where the packet never arrived.
    pub fn loss_events(&self) -> Vec<bool> {
        self.received_mask.iter().map(|&received| !received).collect()
    }

    pub fn jitter_samples(&self) -> &[f64] {
        &self.jitter_samples
    }

    pub fn mean_jitter_ms(&self) -> f64 {
        // ---
        if self.jitter_samples.is_empty() {
            0.0
        } else {
            self.jitter_samples.iter().sum::<f64>() / self.jitter_samples.len() as f64
        }
    }

    pub fn smoothed_jitter_ms(&self) -> f64 {
        self.smoothed_jitter_ms
    }

    /// Calculates current packet loss percentage.
    pub fn loss_percentage(&self) -> f64 {
        // ---
        let total = self.packets_expected();
        if total == 0 {
            0.0
        } else {
            (self.packets_lost as f64 / total as f64) * 100.0
        }
    }

    /// Calculates reorder percentage.
    pub fn reorder_percentage(&self) -> f64 {
        // ---
        if self.packets_received == 0 {
            0.0
        } else {
            (self.packets_reordered as f64 / self.packets_received as f64) * 100.0
        }
    }

    /// Calculates packets per second reception rate.
    pub fn packets_per_second(&self) -> f64 {
        // ---
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.packets_received as f64 / elapsed
        }
    }

    /// Returns runtime duration.
    pub fn runtime(&self) -> Duration {
        // ---
        self.start_time.elapsed()
    }

    /// Logs statistics if interval has elapsed.
    fn maybe_log(&mut self) {
        // ---
        if self.last_log_time.elapsed() >= self.log_interval {
            self.log();
            self.last_log_time = Instant::now();
        }
    }

    /// Force log current statistics.
    pub fn log(&self) {
        // ---
        info!(
            "RX Stats: {} pkts ({:.2} pkt/s), {:.2}% loss, {:.2}% reordered, {} late, {} dup, jitter {:.2}ms",
            self.packets_received,
            self.packets_per_second(),
            self.loss_percentage(),
            self.reorder_percentage(),
            self.packets_late,
            self.packets_duplicate,
            self.smoothed_jitter_ms
        );
    }
}

impl Default for ReceiverStats {
    fn default() -> Self {
        // ---
        Self::new(16000, Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    /// Feeds packets 20ms apart in both arrival time and media time.
    fn feed(stats: &mut ReceiverStats, sequences: &[u16]) {
        // ---
        let base = Instant::now();
        for (i, &seq) in sequences.iter().enumerate() {
            stats.record_packet(
                seq,
                seq as u32 * 320,
                base + Duration::from_millis(20 * i as u64),
            );
        }
    }

    #[test]
    fn test_stats_no_loss() {
        // ---
        let mut stats = ReceiverStats::default();
        feed(&mut stats, &[0, 1, 2]);

        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_lost, 0);
        assert_eq!(stats.loss_percentage(), 0.0);
        assert!(stats.mean_jitter_ms() < 1e-6);
    }

    #[test]
    fn test_stats_with_loss() {
        // ---
        let mut stats = ReceiverStats::default();
        feed(&mut stats, &[0, 1, 5]); // Gap: lost 2, 3, 4

        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_lost, 3);
        assert_eq!(stats.loss_percentage(), 50.0); // 3 lost out of 6 expected
        assert_eq!(
            stats.loss_events(),
            vec![false, false, true, true, true, false]
        );
    }

    #[test]
    fn test_stats_with_reordering() {
        // ---
        let mut stats = ReceiverStats::default();
        feed(&mut stats, &[0, 2, 1]);

        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_reordered, 1);
        assert_eq!(stats.packets_lost, 0);

        // Use approximate equality for floating point
        let expected = 100.0 / 3.0;
        let actual = stats.reorder_percentage();
        assert!(
            (actual - expected).abs() < 0.001,
            "Expected ~{}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn test_sequence_wraparound() {
        // ---
        let mut stats = ReceiverStats::default();
        feed(&mut stats, &[65534, 65535, 0, 1]);

        assert_eq!(stats.packets_received, 4);
        assert_eq!(stats.packets_lost, 0);
        assert_eq!(stats.packets_expected(), 4);
    }

    #[test]
    fn test_duplicates_not_counted_twice() {
        // ---
        let mut stats = ReceiverStats::default();
        feed(&mut stats, &[0, 1, 1, 2]);

        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_duplicate, 1);
    }

    #[test]
    fn test_interarrival_jitter() {
        // ---
        let mut stats = ReceiverStats::new(16000, Duration::from_secs(5));
        let base = Instant::now();

        stats.record_packet(0, 0, base);
        // Media says 20ms later, network delivered it 30ms later
        stats.record_packet(1, 320, base + Duration::from_millis(30));

        assert_eq!(stats.jitter_samples().len(), 1);
        assert!((stats.jitter_samples()[0] - 10.0).abs() < 1e-6);
        assert!((stats.smoothed_jitter_ms() - 10.0 / 16.0).abs() < 1e-6);
    }

    #[test]
    fn test_late_packets() {
        // ---
        let mut stats = ReceiverStats::default();
        feed(&mut stats, &[0]);
        stats.record_late_packet();
        stats.record_late_packet();

        assert_eq!(stats.packets_late, 2);
    }
}
