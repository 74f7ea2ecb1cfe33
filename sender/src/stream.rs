//! Outbound RTP audio stream.

use anyhow::{Context, Result};
use std::sync::PoisonError;
use std::time::Instant;
use tracing::debug;
use voip_bench_common::{MetricsContext, RtpSession, SessionStats, SharedCodec, TransportError};

/// Encodes PCM frames and sends them as one RTP stream.
///
/// Owns the session's stream state: the sequence number advances inside
/// [`RtpSession::send`], the timestamp advances here by each frame's
/// sample count.
pub struct RtpStream {
    // ---
    session: RtpSession,
    codec: SharedCodec,
    metrics: Option<MetricsContext>,
    frames_sent: u64,
    started: bool,
}

impl RtpStream {
    // ---
    /// # Arguments
    ///
    /// * `session` - Session with its remote endpoint already set
    /// * `codec` - Encoder, shared with the bitrate controller
    pub fn new(session: RtpSession, codec: SharedCodec) -> Self {
        // ---
        Self {
            session,
            codec,
            metrics: None,
            frames_sent: 0,
            started: false,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Encodes and sends one frame. The first packet carries the marker bit.
    ///
    /// The timestamp advances even when the send fails, so the next frame
    /// still carries its correct media time.
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails, or the session's
    /// [`TransportError`] if the datagram could not be sent.
    pub async fn send_frame(&mut self, pcm: &[i16]) -> Result<usize, StreamError> {
        // ---
        let (payload, payload_type) = {
            let mut codec = self.codec.lock().unwrap_or_else(PoisonError::into_inner);
            let started = Instant::now();
            let payload = codec
                .encode(pcm)
                .with_context(|| format!("failed to encode frame {}", self.frames_sent))
                .map_err(StreamError::Encode)?;
            if let Some(m) = &self.metrics {
                m.encode_seconds.observe(started.elapsed().as_secs_f64());
            }
            (payload, codec.payload_type())
        };

        let marker = !self.started;
        let result = self.session.send(&payload, payload_type, marker).await;
        self.session.advance_timestamp(pcm.len() as u32);

        let sent = result.map_err(StreamError::Transport)?;
        self.started = true;
        self.frames_sent += 1;
        debug!(
            "Sent frame {} ({} bytes payload, seq={})",
            self.frames_sent,
            payload.len(),
            self.session.sequence().wrapping_sub(1)
        );
        Ok(sent)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn session(&self) -> &RtpSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut RtpSession {
        &mut self.session
    }

    pub fn codec(&self) -> &SharedCodec {
        &self.codec
    }

    pub fn stats(&self) -> SessionStats {
        self.session.stats()
    }

    /// Closes the underlying session.
    pub async fn close(mut self) -> SessionStats {
        // ---
        self.session.close().await;
        self.session.stats()
    }
}

/// Failure to send one frame.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Encode(anyhow::Error),

    #[error(transparent)]
    Transport(TransportError),
}

impl StreamError {
    /// `true` for failures worth skipping a frame over rather than
    /// stopping the stream.
    pub fn is_transient(&self) -> bool {
        matches!(self, StreamError::Transport(TransportError::Send { .. }))
    }
}
