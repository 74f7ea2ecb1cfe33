//! RTP receiver library.
//!
//! Jitter buffering, decoding with loss concealment, reception statistics
//! and call-quality scoring for an inbound RTP audio stream. Used by the
//! `receiver` binary and the end-to-end benchmark.

pub mod audio;
pub mod jitter_buffer;
pub mod playout;
pub mod quality;
pub mod stats;

pub use audio::{write_wav, WavSink};
pub use jitter_buffer::{JitterBuffer, JitterBufferConfig, JitterBufferStats};
pub use playout::{Playout, PlayoutConfig, PlayoutReport, PlayoutTask};
pub use quality::{estimate_mos, psnr, voip_metrics, QualityRating, VoipMetrics};
pub use stats::ReceiverStats;

use anyhow::Result;
use tracing::info;
use voip_bench_common::codec::FRAME_DURATION_MS;
use voip_bench_common::RtpSession;

/// Receives on `session` until `shutdown` resolves, then drains the
/// buffer and returns the run's figures.
///
/// # Errors
///
/// Returns error if the session cannot start receiving or the output
/// sink fails.
pub async fn receive_until<F>(
    session: &mut RtpSession,
    playout: &Playout,
    shutdown: F,
) -> Result<PlayoutReport>
where
    F: std::future::Future<Output = ()>,
{
    // ---
    session.start_receiving(playout.handler())?;
    let task = playout.spawn();
    info!("Receiving on {}", session.local_addr());

    shutdown.await;

    session.stop_receiving().await;
    task.stop().await;
    playout.drain()?;
    playout.finish()
}

/// Scores a finished run.
///
/// `latency_ms` is the one-way delay to assume, since a lone receiver
/// cannot measure it.
pub fn score(report: &PlayoutReport, latency_ms: f64, codec_bitrate: u32) -> VoipMetrics {
    // ---
    let loss = report.network.loss_percentage() / 100.0;
    voip_metrics(
        loss,
        latency_ms,
        report.network.smoothed_jitter_ms(),
        codec_bitrate,
        report.mean_payload_bytes.round() as usize,
        FRAME_DURATION_MS as u32,
    )
}
