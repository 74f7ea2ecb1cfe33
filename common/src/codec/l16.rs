//! Uncompressed 16-bit linear PCM (RFC 3551 L16).

use anyhow::Result;
use tracing::debug;

use super::{AudioCodec, FRAME_DURATION_MS};
use crate::rtp::PAYLOAD_TYPE_L16;

/// Reference codec that sends samples as big-endian 16-bit words.
///
/// Its bitrate is fixed by the sample rate; bitrate requests are
/// acknowledged and ignored.
#[derive(Debug, Clone)]
pub struct L16Codec {
    // ---
    sample_rate: u32,
    frame_samples: usize,
}

impl L16Codec {
    // ---
    pub fn new(sample_rate: u32) -> Self {
        // ---
        Self {
            sample_rate,
            frame_samples: sample_rate as usize * FRAME_DURATION_MS / 1000,
        }
    }
}

impl AudioCodec for L16Codec {
    // ---
    fn name(&self) -> &'static str {
        "l16"
    }

    fn payload_type(&self) -> u8 {
        PAYLOAD_TYPE_L16
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        // ---
        if pcm.len() != self.frame_samples {
            anyhow::bail!(
                "invalid frame size: expected {}, got {}",
                self.frame_samples,
                pcm.len()
            );
        }
        Ok(pcm.iter().flat_map(|s| s.to_be_bytes()).collect())
    }

    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>> {
        // ---
        if data.len() % 2 != 0 {
            anyhow::bail!("odd L16 payload length: {}", data.len());
        }
        Ok(data
            .chunks_exact(2)
            .map(|b| i16::from_be_bytes([b[0], b[1]]))
            .collect())
    }

    fn bitrate(&self) -> u32 {
        self.sample_rate * 16
    }

    fn set_bitrate(&mut self, bps: u32) -> Result<()> {
        debug!("L16 is fixed-rate; ignoring bitrate request of {} bps", bps);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_l16_is_lossless() {
        // ---
        let mut codec = L16Codec::new(16000);
        let frame: Vec<i16> = (0..320).map(|i| (i * 97 - 15000) as i16).collect();

        let encoded = codec.encode(&frame).expect("encode failed");
        assert_eq!(&encoded[..2], &frame[0].to_be_bytes());
        assert_eq!(codec.decode(&encoded).expect("decode failed"), frame);
    }

    #[test]
    fn test_l16_fixed_bitrate() {
        // ---
        let mut codec = L16Codec::new(8000);
        assert_eq!(codec.frame_samples(), 160);
        codec.set_bitrate(12000).expect("set_bitrate failed");
        assert_eq!(codec.bitrate(), 128_000);
    }

    #[test]
    fn test_l16_rejects_odd_payload() {
        // ---
        let mut codec = L16Codec::new(16000);
        assert!(codec.decode(&[1, 2, 3]).is_err());
        assert_eq!(codec.conceal_loss().unwrap(), vec![0; 320]);
    }
}
