//! RTP audio sender - CLI binary.
//!
//! Reads a WAV file (or synthesizes a tone), encodes it, packetizes it
//! into RTP and transmits it via UDP to a receiver.

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tracing::{info, warn};

use sender::{stream_audio, AudioData, RtpStream};
use voip_bench_common::codec::SAMPLE_RATE;
use voip_bench_common::{
    init_tracing, parse_seconds, CodecKind, ColorWhen, MetricsContext, MetricsServerConfig,
    RtpSession, TransportError,
};

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum ColorArg {
    Auto,
    Always,
    Never,
}

impl From<ColorArg> for ColorWhen {
    fn from(v: ColorArg) -> Self {
        match v {
            ColorArg::Auto => ColorWhen::Auto,
            ColorArg::Always => ColorWhen::Always,
            ColorArg::Never => ColorWhen::Never,
        }
    }
}

/// RTP Sender - Stream audio over RTP
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Input audio file (WAV format); a 440Hz tone is sent if omitted
    #[arg(short, long)]
    input: Option<String>,

    /// Tone length in seconds when no input file is given
    #[arg(long = "tone-secs", default_value = "5", value_parser = parse_seconds)]
    tone: Duration,

    /// Remote host to send to
    #[arg(short, long, default_value = "127.0.0.1")]
    remote: String,

    /// Remote port
    #[arg(short, long, default_value = "5004")]
    port: u16,

    /// Local address to bind; falls back to loopback if unavailable
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Codec (opus, l16)
    #[arg(long, default_value = "opus")]
    codec: CodecKind,

    /// Target codec bitrate in bits per second
    #[arg(long, default_value = "24000")]
    bitrate: u32,

    /// Packet transmission interval in milliseconds
    ///
    /// Controls pacing of packet transmission. Default 20ms matches
    /// the frame duration for real-time streaming.
    #[arg(short = 't', long, default_value = "20")]
    interval_ms: u64,

    /// Replay input audio continuously (default). Use `--no-loop` to play once and exit.
    #[arg(long = "no-loop", default_value_t = true, action = clap::ArgAction::SetFalse)]
    loop_audio: bool,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long)]
    metrics_bind: Option<String>,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorArg,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Binds `addr`, retrying on loopback if the address is unavailable.
async fn open_with_loopback_fallback(addr: &str) -> Result<RtpSession, TransportError> {
    // ---
    match RtpSession::open(addr, 0).await {
        Ok(session) => Ok(session),
        Err(TransportError::Bind { addr, source }) if addr != "127.0.0.1:0" => {
            warn!("Could not bind {}: {}, falling back to loopback", addr, source);
            RtpSession::open("127.0.0.1", 0).await
        }
        Err(e) => Err(e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();

    init_tracing(args.color.into())?;

    info!("Starting RTP sender v{VERSION}");
    info!("Remote address: {}:{}", args.remote, args.port);
    info!("Transmission interval: {}ms", args.interval_ms);
    info!("Loop audio: {}", args.loop_audio);

    let metrics = MetricsContext::new("sender")?;
    if let Some(bind) = &args.metrics_bind {
        info!("Metrics bind: {}", bind);
        let bind = bind.parse().context("invalid metrics bind")?;
        let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(bind));
    }

    let audio = match args.input.clone() {
        Some(path) => {
            // Read and preprocess audio in blocking task
            info!("Reading audio file {}...", path);
            tokio::task::spawn_blocking(move || sender::read_wav(path, SAMPLE_RATE))
                .await
                .context("audio reading task failed")??
        }
        None => AudioData::tone(440.0, args.tone.as_secs_f64(), SAMPLE_RATE),
    };
    info!("Loaded {:.2}s of audio", audio.duration_secs());

    let codec = args.codec.build_shared().context("failed to create encoder")?;
    codec
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .set_bitrate(args.bitrate)?;

    let mut session = open_with_loopback_fallback(&args.bind)
        .await
        .context("failed to open RTP session")?
        .with_metrics(metrics.clone());
    session
        .set_remote(&args.remote, args.port)
        .await
        .context("failed to resolve remote")?;
    info!("Session SSRC: 0x{:08X}", session.ssrc());

    let mut stream = RtpStream::new(session, codec).with_metrics(metrics);
    let interval = Duration::from_millis(args.interval_ms);

    info!("Starting transmission...");
    loop {
        tokio::select! {
            result = stream_audio(&audio, &mut stream, interval) => {
                result?;
                if !args.loop_audio {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    let stats = stream.close().await;
    info!(
        "Transmission complete: {} packets, {} bytes",
        stats.packets_sent, stats.bytes_sent
    );

    Ok(())
}
