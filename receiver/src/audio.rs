//! Decoded audio output.
//!
//! Writes the playout stream to a 16-bit mono WAV file so a run can be
//! listened to afterwards.

use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Streaming WAV writer for decoded frames.
pub struct WavSink {
    // ---
    writer: Option<WavWriter<BufWriter<File>>>,
    path: PathBuf,
    samples_written: u64,
    sample_rate: u32,
}

impl WavSink {
    // ---
    /// Creates (or truncates) the output file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P, sample_rate: u32) -> Result<Self> {
        // ---
        let path = path.as_ref().to_path_buf();
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(&path, spec)
            .with_context(|| format!("failed to create WAV file: {}", path.display()))?;

        info!("Writing decoded audio to {}", path.display());
        Ok(Self {
            writer: Some(writer),
            path,
            samples_written: 0,
            sample_rate,
        })
    }

    /// Appends one frame of samples.
    pub fn write_frame(&mut self, samples: &[i16]) -> Result<()> {
        // ---
        let writer = self
            .writer
            .as_mut()
            .context("WAV sink already finalized")?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        self.samples_written += samples.len() as u64;
        Ok(())
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples_written as f64 / self.sample_rate.max(1) as f64
    }

    /// Flushes the header and closes the file. Later calls are no-ops.
    pub fn finalize(&mut self) -> Result<()> {
        // ---
        if let Some(writer) = self.writer.take() {
            writer
                .finalize()
                .with_context(|| format!("failed to finalize {}", self.path.display()))?;
            debug!(
                "Finalized {} ({} samples)",
                self.path.display(),
                self.samples_written
            );
        }
        Ok(())
    }
}

impl Drop for WavSink {
    fn drop(&mut self) {
        // ---
        if let Err(e) = self.finalize() {
            tracing::warn!("WAV sink: {e:#}");
        }
    }
}

/// Writes a complete buffer of samples to `path` in one go.
pub fn write_wav<P: AsRef<Path>>(path: P, samples: &[i16], sample_rate: u32) -> Result<()> {
    // ---
    let mut sink = WavSink::create(path, sample_rate)?;
    sink.write_frame(samples)?;
    sink.finalize()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("receiver-{tag}-{}.wav", std::process::id()))
    }

    #[test]
    fn test_sink_writes_readable_wav() {
        // ---
        let path = temp_path("sink");
        let mut sink = WavSink::create(&path, 16000).expect("create failed");
        sink.write_frame(&[1, 2, 3]).expect("write failed");
        sink.write_frame(&[4, 5]).expect("write failed");
        sink.finalize().expect("finalize failed");
        assert_eq!(sink.samples_written(), 5);

        let mut reader = hound::WavReader::open(&path).expect("open failed");
        let spec = reader.spec();
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        std::fs::remove_file(&path).ok();

        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16000);
        assert_eq!(samples, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_write_after_finalize_fails() {
        // ---
        let path = temp_path("final");
        let mut sink = WavSink::create(&path, 16000).expect("create failed");
        sink.finalize().expect("finalize failed");
        sink.finalize().expect("second finalize should be a no-op");

        assert!(sink.write_frame(&[0]).is_err());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_write_wav_duration() {
        // ---
        let path = temp_path("whole");
        write_wav(&path, &vec![0i16; 8000], 16000).expect("write failed");

        let reader = hound::WavReader::open(&path).expect("open failed");
        assert_eq!(reader.duration(), 8000);
        std::fs::remove_file(&path).ok();
    }
}
