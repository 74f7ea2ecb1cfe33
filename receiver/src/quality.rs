//! Call quality scoring.
//!
//! Converts measured loss, latency and jitter into an E-model (ITU-T
//! G.107) R-factor and a mean opinion score, plus the supporting loss and
//! distribution statistics a benchmark report needs.

use std::fmt;

/// IPv4 + UDP + RTP header bytes added to every voice packet.
pub const IP_UDP_RTP_OVERHEAD: usize = 40;

/// Base R-factor before any impairment.
const R_BASE: f64 = 93.2;

/// Full-scale 16-bit sample value
const PSNR_PEAK: f64 = 32767.0;

/// Computes the E-model transmission rating.
///
/// # Arguments
///
/// * `packet_loss` - Loss rate in `[0, 1]`
/// * `latency_ms` - One-way delay
/// * `jitter_ms` - Delay variation
pub fn r_factor(packet_loss: f64, latency_ms: f64, jitter_ms: f64) -> f64 {
    // ---
    let loss_percent = packet_loss.clamp(0.0, 1.0) * 100.0;

    // Delay impairment kicks in at 160ms, capped at 14
    let id = if latency_ms < 160.0 {
        0.0
    } else {
        (0.024 * latency_ms - 3.84).clamp(0.0, 14.0)
    };

    // Equipment impairment from loss, logarithmic and saturating
    let ie_eff = 30.0 * (1.0 + 15.0 * loss_percent).ln() / 16f64.ln();

    let jitter_penalty = if jitter_ms > 40.0 {
        ((jitter_ms - 40.0) * 0.05).min(10.0)
    } else {
        0.0
    };

    R_BASE - id - ie_eff - jitter_penalty
}

/// Estimates a mean opinion score in `[1.0, 5.0]`.
///
/// R is mapped with `1 + 0.035R + R(R-60)(100-R)·7e-6`. Ratings above 100
/// map to 4.5 rather than following the curve, so the score never
/// reaches 5.0; negative ratings map to 1.0.
///
/// # Example
///
/// ```
/// use receiver::quality::estimate_mos;
///
/// let clean = estimate_mos(0.0, 20.0, 5.0);
/// let lossy = estimate_mos(0.05, 20.0, 5.0);
/// assert!(clean > 4.0);
/// assert!(lossy < clean);
/// ```
pub fn estimate_mos(packet_loss: f64, latency_ms: f64, jitter_ms: f64) -> f64 {
    // ---
    let r = r_factor(packet_loss, latency_ms, jitter_ms);

    let mos = if r < 0.0 {
        1.0
    } else if r > 100.0 {
        4.5
    } else {
        1.0 + 0.035 * r + r * (r - 60.0) * (100.0 - r) * 7e-6
    };

    mos.clamp(1.0, 5.0)
}

/// Fraction of sent packets that never arrived.
///
/// Duplicates can push `received` above `sent`; that reads as no loss.
pub fn packet_loss_ratio(sent: u64, received: u64) -> f64 {
    // ---
    if sent == 0 {
        return 0.0;
    }
    sent.saturating_sub(received) as f64 / sent as f64
}

/// Loss rate and burst ratio of a per-packet loss trace.
///
/// `lost[i]` is `true` when the i-th packet in sequence order was lost.
/// The burst ratio is the mean observed loss-run length over the mean
/// run length independent losses would produce, `1 / (1 − loss_rate)`.
/// Equivalently, the run count expected under independence,
/// `losses × (1 − loss_rate)`, divided by the run count observed.
/// Independent loss gives about 1.0, bursty loss above 1.0 and loss
/// spread out as isolated singletons below 1.0. Traces with nothing to
/// compare (empty, no loss, or total loss) report 1.0.
pub fn packet_loss_burst_ratio(lost: &[bool]) -> (f64, f64) {
    // ---
    if lost.is_empty() {
        return (0.0, 1.0);
    }

    let losses = lost.iter().filter(|&&l| l).count();
    let loss_rate = losses as f64 / lost.len() as f64;

    let runs = lost
        .iter()
        .enumerate()
        .filter(|&(i, &l)| l && (i == 0 || !lost[i - 1]))
        .count();

    let expected_runs = losses as f64 * (1.0 - loss_rate);
    if expected_runs <= 0.0 || runs == 0 {
        return (loss_rate, 1.0);
    }

    (loss_rate, expected_runs / runs as f64)
}

/// Peak signal-to-noise ratio of `processed` against `original`, in dB.
///
/// Compares the overlapping prefix of the two signals with a 16-bit peak
/// of 32767. Identical signals give `f64::INFINITY`; `None` when there is
/// no overlap to compare.
pub fn psnr(original: &[i16], processed: &[i16]) -> Option<f64> {
    // ---
    let len = original.len().min(processed.len());
    if len == 0 {
        return None;
    }

    let sum_sq: f64 = original[..len]
        .iter()
        .zip(&processed[..len])
        .map(|(&a, &b)| {
            let d = f64::from(a) - f64::from(b);
            d * d
        })
        .sum();
    let mse = sum_sq / len as f64;
    if mse == 0.0 {
        return Some(f64::INFINITY);
    }
    Some(20.0 * PSNR_PEAK.log10() - 10.0 * mse.log10())
}

/// Summary of a sample distribution, in the samples' unit.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DistributionStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    /// Population standard deviation
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
    pub p99: f64,
}

impl DistributionStats {
    // ---
    /// Summarizes `samples`; NaN values are ignored and an empty input
    /// gives all zeros.
    pub fn from_samples(samples: &[f64]) -> Self {
        // ---
        let mut sorted: Vec<f64> = samples.iter().copied().filter(|v| !v.is_nan()).collect();
        if sorted.is_empty() {
            return Self::default();
        }
        sorted.sort_by(f64::total_cmp);

        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        Self {
            count: sorted.len(),
            mean,
            median: percentile(&sorted, 50.0),
            stddev: variance.sqrt(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        }
    }
}

/// Linear-interpolated percentile of an ascending, non-empty slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    // ---
    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

pub fn jitter_statistics(jitter_ms: &[f64]) -> DistributionStats {
    DistributionStats::from_samples(jitter_ms)
}

pub fn latency_statistics(latency_ms: &[f64]) -> DistributionStats {
    DistributionStats::from_samples(latency_ms)
}

/// Listening-quality band for a MOS value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityRating {
    Bad,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityRating {
    // ---
    pub fn from_mos(mos: f64) -> Self {
        // ---
        if mos >= 4.3 {
            QualityRating::Excellent
        } else if mos >= 4.0 {
            QualityRating::Good
        } else if mos >= 3.6 {
            QualityRating::Fair
        } else if mos >= 3.1 {
            QualityRating::Poor
        } else {
            QualityRating::Bad
        }
    }
}

impl fmt::Display for QualityRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let s = match self {
            QualityRating::Excellent => "Excellent",
            QualityRating::Good => "Good",
            QualityRating::Fair => "Fair",
            QualityRating::Poor => "Poor",
            QualityRating::Bad => "Bad",
        };
        f.write_str(s)
    }
}

/// Per-impairment verdict used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorRating {
    Good,
    Fair,
    Poor,
}

impl FactorRating {
    fn grade(value: f64, good_below: f64, fair_below: f64) -> Self {
        if value < good_below {
            FactorRating::Good
        } else if value < fair_below {
            FactorRating::Fair
        } else {
            FactorRating::Poor
        }
    }
}

/// Combined quality and bandwidth figures for one call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoipMetrics {
    pub mos: f64,
    pub r_factor: f64,
    pub rating: QualityRating,
    /// Codec bitrate scaled by the fraction of packets delivered
    pub effective_bitrate: f64,
    /// Bandwidth on the wire including IP/UDP/RTP headers
    pub network_bandwidth_bps: f64,
    pub overhead_ratio: f64,
    pub packet_rate: f64,
    pub latency_factor: FactorRating,
    pub jitter_factor: FactorRating,
    pub packet_loss_factor: FactorRating,
}

/// Scores a call and derives its bandwidth profile.
///
/// # Arguments
///
/// * `packet_loss` - Loss rate in `[0, 1]`
/// * `latency_ms` - One-way delay
/// * `jitter_ms` - Delay variation
/// * `codec_bitrate` - Codec output in bits per second
/// * `payload_size` - Average RTP payload bytes per packet
/// * `packet_interval_ms` - Frame duration
pub fn voip_metrics(
    packet_loss: f64,
    latency_ms: f64,
    jitter_ms: f64,
    codec_bitrate: u32,
    payload_size: usize,
    packet_interval_ms: u32,
) -> VoipMetrics {
    // ---
    let mos = estimate_mos(packet_loss, latency_ms, jitter_ms);
    let packet_rate = if packet_interval_ms > 0 {
        1000.0 / packet_interval_ms as f64
    } else {
        0.0
    };
    let wire_size = payload_size + IP_UDP_RTP_OVERHEAD;

    VoipMetrics {
        mos,
        r_factor: r_factor(packet_loss, latency_ms, jitter_ms),
        rating: QualityRating::from_mos(mos),
        effective_bitrate: codec_bitrate as f64 * (1.0 - packet_loss.clamp(0.0, 1.0)),
        network_bandwidth_bps: wire_size as f64 * 8.0 * packet_rate,
        overhead_ratio: IP_UDP_RTP_OVERHEAD as f64 / wire_size as f64,
        packet_rate,
        latency_factor: FactorRating::grade(latency_ms, 150.0, 300.0),
        jitter_factor: FactorRating::grade(jitter_ms, 20.0, 50.0),
        packet_loss_factor: FactorRating::grade(packet_loss, 0.01, 0.03),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_mos_decreases_with_loss() {
        // ---
        let clean = estimate_mos(0.0, 0.0, 0.0);
        let some = estimate_mos(0.05, 0.0, 0.0);
        let heavy = estimate_mos(0.15, 0.0, 0.0);

        assert!(clean > some && some > heavy);
        assert!((4.3..4.5).contains(&clean));
    }

    #[test]
    fn test_mos_non_increasing_with_latency() {
        // ---
        let mut previous = f64::INFINITY;
        for latency in (50..=400).step_by(10) {
            let mos = estimate_mos(0.01, latency as f64, 10.0);
            assert!(mos <= previous);
            previous = mos;
        }
        assert!(estimate_mos(0.0, 400.0, 0.0) < estimate_mos(0.0, 50.0, 0.0));
    }

    #[test]
    fn test_jitter_penalty_starts_at_40ms() {
        // ---
        assert!(approx(r_factor(0.0, 0.0, 40.0), R_BASE));
        assert!(approx(r_factor(0.0, 0.0, 60.0), R_BASE - 1.0));
        // capped at 10
        assert!(approx(r_factor(0.0, 0.0, 1000.0), R_BASE - 10.0));
    }

    #[test]
    fn test_mos_bounds() {
        // ---
        assert_eq!(estimate_mos(1.0, 1000.0, 1000.0), 1.0);
        for loss in [0.0, 0.01, 0.1, 0.5] {
            let mos = estimate_mos(loss, 100.0, 20.0);
            assert!((1.0..=5.0).contains(&mos));
        }
    }

    #[test]
    fn test_packet_loss_ratio() {
        // ---
        assert_eq!(packet_loss_ratio(100, 90), 0.1);
        assert_eq!(packet_loss_ratio(0, 0), 0.0);
        assert_eq!(packet_loss_ratio(10, 12), 0.0);
    }

    #[test]
    fn test_burst_ratio() {
        // ---
        assert_eq!(packet_loss_burst_ratio(&[]), (0.0, 1.0));
        assert_eq!(packet_loss_burst_ratio(&[false; 8]), (0.0, 1.0));
        assert_eq!(packet_loss_burst_ratio(&[true; 4]), (1.0, 1.0));

        // 3 losses in 6, 2 runs, expected 3 × 0.5 = 1.5
        let (rate, ratio) = packet_loss_burst_ratio(&[false, true, true, false, true, false]);
        assert!(approx(rate, 0.5));
        assert!(approx(ratio, 1.5 / 2.0));

        // One run of 10 is bursty, 10 singletons are spread out
        let mut clustered = vec![false; 100];
        let mut spread = vec![false; 100];
        for i in 0..10 {
            clustered[40 + i] = true;
            spread[i * 10] = true;
        }
        let (_, clustered_ratio) = packet_loss_burst_ratio(&clustered);
        let (_, spread_ratio) = packet_loss_burst_ratio(&spread);
        assert!(approx(clustered_ratio, 9.0));
        assert!(approx(spread_ratio, 0.9));
        assert!(clustered_ratio > 1.0 && spread_ratio < 1.0);
    }

    #[test]
    fn test_psnr() {
        // ---
        let tone: Vec<i16> = (0..320).map(|i| ((i % 40) * 400 - 8000) as i16).collect();
        assert_eq!(psnr(&tone, &tone), Some(f64::INFINITY));
        assert_eq!(psnr(&[], &tone), None);

        // Constant error of 1 over the overlap: 20·log10(32767)
        let off_by_one: Vec<i16> = tone.iter().map(|s| s + 1).collect();
        let db = psnr(&tone, &off_by_one[..160]).unwrap();
        assert!(approx(db, 20.0 * 32767f64.log10()));

        // More noise, lower PSNR
        let noisy: Vec<i16> = tone.iter().map(|s| s + 100).collect();
        assert!(psnr(&tone, &noisy).unwrap() < db);
    }

    #[test]
    fn test_distribution_stats() {
        // ---
        let stats = jitter_statistics(&[4.0, 1.0, 3.0, 2.0, 5.0]);
        assert_eq!(stats.count, 5);
        assert!(approx(stats.mean, 3.0));
        assert!(approx(stats.median, 3.0));
        assert!(approx(stats.stddev, 2f64.sqrt()));
        assert_eq!((stats.min, stats.max), (1.0, 5.0));
        assert!(approx(stats.p95, 4.8));

        assert_eq!(latency_statistics(&[]), DistributionStats::default());
    }

    #[test]
    fn test_quality_rating_bands() {
        // ---
        assert_eq!(QualityRating::from_mos(4.4), QualityRating::Excellent);
        assert_eq!(QualityRating::from_mos(4.0), QualityRating::Good);
        assert_eq!(QualityRating::from_mos(3.7), QualityRating::Fair);
        assert_eq!(QualityRating::from_mos(3.1), QualityRating::Poor);
        assert_eq!(QualityRating::from_mos(2.0), QualityRating::Bad);
        assert_eq!(QualityRating::Good.to_string(), "Good");
    }

    #[test]
    fn test_voip_metrics() {
        // ---
        let m = voip_metrics(0.02, 100.0, 10.0, 24000, 60, 20);

        assert!(approx(m.packet_rate, 50.0));
        assert!(approx(m.network_bandwidth_bps, 100.0 * 8.0 * 50.0));
        assert!(approx(m.overhead_ratio, 0.4));
        assert!(approx(m.effective_bitrate, 23520.0));
        assert_eq!(m.latency_factor, FactorRating::Good);
        assert_eq!(m.packet_loss_factor, FactorRating::Fair);
        assert_eq!(m.rating, QualityRating::from_mos(m.mos));
    }
}
