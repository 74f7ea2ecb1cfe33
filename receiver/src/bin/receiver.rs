//! RTP receiver - CLI binary.
//!
//! Receives an RTP audio stream over UDP, plays it out through the
//! jitter buffer and optionally records the result to a WAV file.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use receiver::{receive_until, score, JitterBufferConfig, Playout, PlayoutConfig, WavSink};
use voip_bench_common::{
    init_tracing, CodecKind, ColorWhen, MetricsContext, MetricsServerConfig, RtpSession,
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

/// RTP Receiver - Receive, buffer and score audio streams
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on
    #[arg(short, long, default_value = "5004")]
    port: u16,

    /// Codec the stream is encoded with (opus, l16)
    #[arg(long, default_value = "opus")]
    codec: CodecKind,

    /// Jitter buffer size in packets
    #[arg(short = 'b', long, default_value = "50")]
    buffer_packets: usize,

    /// Write decoded audio to this WAV file
    #[arg(short, long)]
    output: Option<String>,

    /// One-way latency assumed when scoring the call
    #[arg(long, default_value = "0")]
    latency_ms: f64,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9200")]
    metrics_bind: String,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorArg,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.color.into())?;
    info!("Starting RTP receiver v{VERSION}");
    info!("Listening on {}:{}", args.bind, args.port);
    info!("Jitter buffer: {} packets", args.buffer_packets);
    info!("Metrics bind: {}", args.metrics_bind);

    let metrics = MetricsContext::new("receiver")?;
    let metrics_bind = args.metrics_bind.parse().context("invalid metrics bind")?;
    let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(metrics_bind));

    let codec = args.codec.build().context("failed to create decoder")?;
    let bitrate = codec.bitrate();
    let sample_rate = codec.sample_rate();

    let config = PlayoutConfig {
        jitter: JitterBufferConfig {
            max_size: args.buffer_packets,
        },
        ..PlayoutConfig::default()
    };
    let mut playout = Playout::new(config, codec).with_metrics(metrics.clone());
    if let Some(path) = &args.output {
        playout = playout.with_sink(WavSink::create(path, sample_rate)?);
    }

    let mut session = RtpSession::open(&args.bind, args.port)
        .await
        .context("failed to open RTP session")?
        .with_metrics(metrics.clone());

    info!("Ready to receive audio, Ctrl-C to stop...");
    let report = receive_until(&mut session, &playout, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    session.close().await;

    let quality = score(&report, args.latency_ms, bitrate);
    metrics.mos.set(quality.mos);
    info!(
        "MOS {:.2} ({}), R={:.1}, loss {:.2}%, jitter {:.2}ms",
        quality.mos,
        quality.rating,
        quality.r_factor,
        report.network.loss_percentage(),
        report.network.smoothed_jitter_ms()
    );

    Ok(())
}
