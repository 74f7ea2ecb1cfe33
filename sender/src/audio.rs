//! Audio sources for the outbound stream.
//!
//! Loads WAV files (any rate, mono or multi-channel, 16-bit PCM or 32-bit
//! float) and converts them to mono at the codec's sample rate, or
//! synthesizes a test tone when no input file is given.

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader};
use std::f32::consts::PI;
use std::path::Path;
use tracing::{debug, info};

/// Mono PCM audio at a fixed sample rate.
#[derive(Debug, Clone)]
pub struct AudioData {
    // ---
    /// PCM samples as 16-bit signed integers
    pub samples: Vec<i16>,

    /// Rate of `samples`
    pub sample_rate: u32,

    /// Rate and channel count of the source, for logging
    pub source_rate: u32,
    pub source_channels: u16,
}

impl AudioData {
    // ---
    pub fn from_samples(samples: Vec<i16>, sample_rate: u32) -> Self {
        // ---
        Self {
            samples,
            sample_rate,
            source_rate: sample_rate,
            source_channels: 1,
        }
    }

    /// Generates a sine tone, a stand-in for speech when no file is given.
    ///
    /// # Arguments
    ///
    /// * `frequency` - Tone frequency in Hz
    /// * `duration_secs` - Length of the clip
    /// * `sample_rate` - Output rate
    pub fn tone(frequency: f32, duration_secs: f64, sample_rate: u32) -> Self {
        // ---
        let len = (duration_secs * sample_rate as f64) as usize;
        let samples = (0..len)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                ((2.0 * PI * frequency * t).sin() * 8000.0) as i16
            })
            .collect();
        Self::from_samples(samples, sample_rate)
    }

    /// Splits the audio into frames of exactly `frame_samples` samples,
    /// zero-padding the last one.
    pub fn frames(&self, frame_samples: usize) -> impl Iterator<Item = Vec<i16>> + '_ {
        // ---
        self.samples.chunks(frame_samples.max(1)).map(move |chunk| {
            let mut frame = chunk.to_vec();
            frame.resize(frame_samples, 0);
            frame
        })
    }

    pub fn frame_count(&self, frame_samples: usize) -> usize {
        self.samples.len().div_ceil(frame_samples.max(1))
    }

    /// Returns the total duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        // ---
        self.samples.len() as f64 / self.sample_rate.max(1) as f64
    }
}

/// Reads a WAV file and converts it to mono at `target_rate`.
///
/// # Errors
///
/// Returns error if the file cannot be opened or decoded, or uses a
/// sample format other than 16-bit integer or 32-bit float.
///
/// # Example
///
/// ```no_run
/// use sender::audio::read_wav;
///
/// let audio = read_wav("voice.wav", 16000).unwrap();
/// println!("Duration: {:.2}s", audio.duration_secs());
/// ```
pub fn read_wav<P: AsRef<Path>>(path: P, target_rate: u32) -> Result<AudioData> {
    // ---
    let path = path.as_ref();
    let mut reader = WavReader::open(path)
        .with_context(|| format!("failed to open WAV file: {}", path.display()))?;

    let spec = reader.spec();
    info!(
        "Reading {}: {}Hz, {} channels, {} bits",
        path.display(),
        spec.sample_rate,
        spec.channels,
        spec.bits_per_sample
    );

    let interleaved: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read 16-bit PCM WAV samples")?,

        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read 32-bit float WAV samples")?,

        (format, bits) => {
            anyhow::bail!(
                "unsupported WAV sample format: {:?} {}-bit (16-bit PCM or 32-bit float only)",
                format,
                bits
            );
        }
    };

    let mono = downmix(&interleaved, spec.channels.max(1) as usize);
    let samples = resample_linear(&mono, spec.sample_rate, target_rate);
    debug!(
        "Converted {} source samples to {} samples at {}Hz",
        interleaved.len(),
        samples.len(),
        target_rate
    );

    Ok(AudioData {
        samples,
        sample_rate: target_rate,
        source_rate: spec.sample_rate,
        source_channels: spec.channels,
    })
}

/// Averages interleaved channels into one.
fn downmix(samples: &[i16], channels: usize) -> Vec<i16> {
    // ---
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| (frame.iter().map(|&s| s as i32).sum::<i32>() / channels as i32) as i16)
        .collect()
}

/// Linear-interpolation resampler. Adequate for speech, not music.
fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    // ---
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let new_len = (samples.len() as f64 / ratio) as usize;
    let last = samples.len() - 1;

    (0..new_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            if idx >= last {
                samples[last]
            } else {
                let frac = pos - idx as f64;
                let s0 = samples[idx] as f64;
                let s1 = samples[idx + 1] as f64;
                (s0 + (s1 - s0) * frac) as i16
            }
        })
        .collect()
}
