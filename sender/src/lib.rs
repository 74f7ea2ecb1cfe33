//! RTP sender library.
//!
//! Audio input, the outbound RTP stream and adaptive bitrate control.
//! Used by the `sender` binary and the end-to-end benchmark.

pub mod audio;
pub mod bitrate;
pub mod stream;

pub use audio::{read_wav, AudioData};
pub use bitrate::{BitrateConfig, BitrateController, BitrateStats, NetworkSample, Strategy};
pub use stream::{RtpStream, StreamError};

use anyhow::Result;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Outcome of one pass over the audio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub frames_sent: u64,
    /// Frames skipped because the datagram could not be sent
    pub frames_failed: u64,
}

/// Streams audio frames over RTP in real time.
///
/// Each frame is encoded and sent on its own tick of `interval`. A send
/// the OS rejects skips that frame and streaming continues.
///
/// # Arguments
///
/// * `audio` - Audio at the codec's sample rate
/// * `stream` - Outbound stream (session + codec)
/// * `interval` - Time between packets, normally the frame duration
///
/// # Errors
///
/// Returns error if encoding fails or the session is unusable
/// (closed, no remote endpoint).
pub async fn stream_audio(
    audio: &AudioData,
    stream: &mut RtpStream,
    interval: Duration,
) -> Result<StreamSummary> {
    // ---
    let frame_samples = stream
        .codec()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .frame_samples();

    let mut summary = StreamSummary::default();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for frame in audio.frames(frame_samples) {
        ticker.tick().await;

        match stream.send_frame(&frame).await {
            Ok(_) => summary.frames_sent += 1,
            Err(e) if e.is_transient() => {
                warn!("Skipping frame: {}", e);
                summary.frames_failed += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(
        "Streamed {} frames ({} failed)",
        summary.frames_sent, summary.frames_failed
    );
    Ok(summary)
}
