//! Opus codec adapter.
//!
//! Pairs an encoder and decoder so a single handle can serve both ends of
//! a benchmark trial, and exposes the encoder's target bitrate to the
//! adaptive bitrate controller.

use ::opus::{Application, Bitrate, Channels, Decoder, Encoder};
use anyhow::{Context, Result};
use tracing::debug;

use super::{AudioCodec, SAMPLES_PER_FRAME, SAMPLE_RATE};
use crate::rtp::PAYLOAD_TYPE_OPUS;

/// Default target bitrate in bits per second
pub const DEFAULT_BITRATE: u32 = 24000;

/// Lowest bitrate libopus accepts
pub const MIN_BITRATE: u32 = 6000;

/// Highest bitrate libopus accepts
pub const MAX_BITRATE: u32 = 510_000;

/// Largest encoded frame we ever expect from libopus
const MAX_PACKET: usize = 4000;

/// Opus wrapper for voice compression.
///
/// # Configuration
///
/// - Sample Rate: 16kHz (wideband)
/// - Channels: Mono
/// - Bitrate: 24 kbps by default, adjustable at runtime
/// - Frame Size: 20ms (320 samples)
/// - Application: VOIP (optimized for speech)
///
/// # Example
///
/// ```no_run
/// use voip_bench_common::{AudioCodec, OpusCodec};
///
/// let mut codec = OpusCodec::new().unwrap();
/// let pcm_samples = vec![0i16; 320]; // 20ms of silence
/// let compressed = codec.encode(&pcm_samples).unwrap();
/// let decoded = codec.decode(&compressed).unwrap();
/// ```
pub struct OpusCodec {
    // ---
    encoder: Encoder,
    decoder: Decoder,
    bitrate: u32,
}

impl OpusCodec {
    // ---
    /// Creates an encoder/decoder pair with voice-optimized settings.
    ///
    /// # Errors
    ///
    /// Returns error if libopus rejects the configuration.
    pub fn new() -> Result<Self> {
        // ---
        let mut encoder = Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)
            .context("failed to create Opus encoder")?;
        encoder
            .set_bitrate(Bitrate::Bits(DEFAULT_BITRATE as i32))
            .context("failed to set bitrate")?;

        let decoder =
            Decoder::new(SAMPLE_RATE, Channels::Mono).context("failed to create Opus decoder")?;

        Ok(Self {
            encoder,
            decoder,
            bitrate: DEFAULT_BITRATE,
        })
    }

    fn expect_full_frame(decoded: usize, what: &str) -> Result<()> {
        // ---
        if decoded != SAMPLES_PER_FRAME {
            anyhow::bail!(
                "unexpected {} frame size: expected {}, got {}",
                what,
                SAMPLES_PER_FRAME,
                decoded
            );
        }
        Ok(())
    }
}

impl AudioCodec for OpusCodec {
    // ---
    fn name(&self) -> &'static str {
        "opus"
    }

    fn payload_type(&self) -> u8 {
        PAYLOAD_TYPE_OPUS
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn frame_samples(&self) -> usize {
        SAMPLES_PER_FRAME
    }

    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        // ---
        if pcm.len() != SAMPLES_PER_FRAME {
            anyhow::bail!(
                "invalid frame size: expected {}, got {}",
                SAMPLES_PER_FRAME,
                pcm.len()
            );
        }

        let mut output = vec![0u8; MAX_PACKET];
        let len = self
            .encoder
            .encode(pcm, &mut output)
            .context("Opus encoding failed")?;

        output.truncate(len);
        Ok(output)
    }

    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>> {
        // ---
        let mut output = vec![0i16; SAMPLES_PER_FRAME];
        let decoded = self
            .decoder
            .decode(data, &mut output, false)
            .context("Opus decoding failed")?;

        Self::expect_full_frame(decoded, "decoded")?;
        Ok(output)
    }

    /// Runs Opus packet loss concealment for one missing frame.
    fn conceal_loss(&mut self) -> Result<Vec<i16>> {
        // ---
        let mut output = vec![0i16; SAMPLES_PER_FRAME];
        let decoded = self
            .decoder
            .decode(&[], &mut output, true) // empty input triggers PLC
            .context("Opus PLC failed")?;

        Self::expect_full_frame(decoded, "PLC")?;
        Ok(output)
    }

    fn bitrate(&self) -> u32 {
        self.bitrate
    }

    fn set_bitrate(&mut self, bps: u32) -> Result<()> {
        // ---
        let bps = bps.clamp(MIN_BITRATE, MAX_BITRATE);
        self.encoder
            .set_bitrate(Bitrate::Bits(bps as i32))
            .with_context(|| format!("failed to set Opus bitrate to {bps}"))?;

        debug!("Opus bitrate {} -> {} bps", self.bitrate, bps);
        self.bitrate = bps;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn tone() -> Vec<i16> {
        // ---
        (0..SAMPLES_PER_FRAME)
            .map(|i| {
                let t = i as f32 * 2.0 * std::f32::consts::PI * 440.0 / SAMPLE_RATE as f32;
                (t.sin() * 16000.0) as i16
            })
            .collect()
    }

    #[test]
    fn test_encode_silence() {
        // ---
        let mut codec = OpusCodec::new().expect("codec creation failed");
        let encoded = codec
            .encode(&vec![0i16; SAMPLES_PER_FRAME])
            .expect("encode failed");

        assert!(!encoded.is_empty());
        // Opus should compress silence very efficiently
        assert!(encoded.len() < 100);
    }

    #[test]
    fn test_encode_invalid_frame_size() {
        // ---
        let mut codec = OpusCodec::new().expect("codec creation failed");
        assert!(codec.encode(&[0i16; 160]).is_err());
    }

    #[test]
    fn test_encode_decode_tone() {
        // ---
        let mut codec = OpusCodec::new().expect("codec creation failed");
        let encoded = codec.encode(&tone()).expect("encode failed");
        assert!(encoded.len() > 20);

        let decoded = codec.decode(&encoded).expect("decode failed");
        assert_eq!(decoded.len(), SAMPLES_PER_FRAME);
    }

    #[test]
    fn test_packet_loss_concealment() {
        // ---
        let mut codec = OpusCodec::new().expect("codec creation failed");
        let concealed = codec.conceal_loss().expect("PLC failed");
        assert_eq!(concealed.len(), SAMPLES_PER_FRAME);
    }

    #[test]
    fn test_set_bitrate_is_clamped() {
        // ---
        let mut codec = OpusCodec::new().expect("codec creation failed");
        assert_eq!(codec.bitrate(), DEFAULT_BITRATE);

        codec.set_bitrate(12000).expect("set_bitrate failed");
        assert_eq!(codec.bitrate(), 12000);

        codec.set_bitrate(100).expect("set_bitrate failed");
        assert_eq!(codec.bitrate(), MIN_BITRATE);
    }
}
