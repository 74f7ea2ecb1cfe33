//! Error taxonomy for the protocol, transport and configuration layers.
//!
//! Protocol errors are non-fatal on the receive path (the datagram is
//! logged and dropped). Transport and configuration errors surface to
//! the caller as typed failures so a harness can tell "could not bind"
//! apart from "bound fine, nothing arrived".

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Malformed, truncated or unsupported RTP datagrams.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RtpError {
    #[error("packet too small for RTP header: {0} bytes")]
    TruncatedHeader(usize),

    #[error("unsupported RTP version: {0}")]
    UnsupportedVersion(u8),

    #[error("CSRC list truncated: {declared} entries declared, {available} bytes available")]
    TruncatedCsrcList { declared: u8, available: usize },

    #[error("header extension truncated")]
    TruncatedExtension,

    #[error("invalid padding length: {0}")]
    InvalidPadding(u8),

    #[error("invalid packet: {0}")]
    InvalidPacket(String),
}

/// Socket-level failures raised by [`crate::session::RtpSession`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind UDP socket to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("no remote endpoint configured")]
    NoRemoteEndpoint,

    #[error("failed to resolve remote endpoint {0}")]
    Resolve(String),

    #[error("failed to send datagram to {addr}: {source}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("session is closed")]
    Closed,

    #[error("failed to build outbound packet: {0}")]
    Encode(#[from] RtpError),
}

/// Rejected component configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid bitrate bounds: min={min} max={max}")]
    InvalidBitrateBounds { min: u32, max: u32 },

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: f64 },
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn transport_error_wraps_rtp_error() {
        // ---
        let err: TransportError = RtpError::TruncatedHeader(5).into();
        assert!(matches!(
            err,
            TransportError::Encode(RtpError::TruncatedHeader(5))
        ));
        assert!(err.to_string().contains("5 bytes"));
    }
}
