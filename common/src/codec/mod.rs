//! Audio codec capability boundary.
//!
//! The transport, stream and bitrate controller only ever see
//! [`AudioCodec`]; which concrete codec sits behind it is wired up by the
//! binaries and the benchmark harness.

mod l16;
mod opus_codec;

pub use l16::L16Codec;
pub use opus_codec::OpusCodec;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::Result;

/// Sample rate used by the benchmark pipeline (16kHz wideband)
pub const SAMPLE_RATE: u32 = 16000;

/// Frame duration in milliseconds
pub const FRAME_DURATION_MS: usize = 20;

/// Samples per frame (20ms at 16kHz)
pub const SAMPLES_PER_FRAME: usize = (SAMPLE_RATE as usize * FRAME_DURATION_MS) / 1000;

/// Encode/decode capability for one audio codec.
///
/// Frames are mono 16-bit PCM of exactly [`frame_samples`](Self::frame_samples)
/// samples.
pub trait AudioCodec: Send {
    // ---
    fn name(&self) -> &'static str;

    /// RTP payload type this codec's frames are sent with.
    fn payload_type(&self) -> u8;

    fn sample_rate(&self) -> u32;

    fn frame_samples(&self) -> usize;

    /// Compresses one PCM frame.
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>>;

    /// Decompresses one frame back to PCM.
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>>;

    /// Synthesizes a frame to stand in for a lost packet.
    ///
    /// Codecs without loss concealment play silence.
    fn conceal_loss(&mut self) -> Result<Vec<i16>> {
        Ok(vec![0; self.frame_samples()])
    }

    /// Current target bitrate in bits per second.
    fn bitrate(&self) -> u32;

    /// Requests a new target bitrate. Fixed-rate codecs may ignore it.
    fn set_bitrate(&mut self, bps: u32) -> Result<()>;
}

/// Codec handle shared between the outbound stream and the bitrate
/// controller.
pub type SharedCodec = Arc<Mutex<dyn AudioCodec>>;

pub fn shared_codec<C: AudioCodec + 'static>(codec: C) -> SharedCodec {
    Arc::new(Mutex::new(codec))
}

/// Codec selection for command-line tools and trial configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecKind {
    #[default]
    Opus,
    L16,
}

impl CodecKind {
    // ---
    /// Instantiates the selected codec at the pipeline sample rate.
    pub fn build(self) -> Result<Box<dyn AudioCodec>> {
        // ---
        Ok(match self {
            CodecKind::Opus => Box::new(OpusCodec::new()?),
            CodecKind::L16 => Box::new(L16Codec::new(SAMPLE_RATE)),
        })
    }

    /// Same as [`build`](Self::build), wrapped for sharing with a bitrate
    /// controller.
    pub fn build_shared(self) -> Result<SharedCodec> {
        // ---
        Ok(match self {
            CodecKind::Opus => shared_codec(OpusCodec::new()?),
            CodecKind::L16 => shared_codec(L16Codec::new(SAMPLE_RATE)),
        })
    }
}

impl FromStr for CodecKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "opus" => Ok(CodecKind::Opus),
            "l16" | "pcm" => Ok(CodecKind::L16),
            other => anyhow::bail!("unknown codec: {other}"),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CodecKind::Opus => "opus",
            CodecKind::L16 => "l16",
        })
    }
}
