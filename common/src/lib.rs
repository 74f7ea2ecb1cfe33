//! Shared building blocks for the VoIP benchmark.
//!
//! This crate provides the RTP packet codec, the UDP session transport,
//! the audio codec capability boundary and the observability/CLI policy
//! shared by the sender, receiver, simulator and benchmark crates.

pub mod cli;
pub mod codec;
pub mod error;
pub mod observability;
pub mod rtp;
pub mod session;

pub use cli::{parse_seconds, ColorWhen};
pub use codec::{shared_codec, AudioCodec, CodecKind, L16Codec, OpusCodec, SharedCodec};
pub use error::{ConfigError, RtpError, TransportError};
pub use observability::{init_tracing, MetricsContext, MetricsServerConfig};
pub use rtp::{RtpExtension, RtpPacket};
pub use session::{PacketHandler, RtpSession, SessionStats};
