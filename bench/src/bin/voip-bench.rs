//! VoIP benchmark - CLI binary.
//!
//! Streams audio through a simulated network on loopback and prints
//! the measured conditions and call-quality score.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use netsim::NetworkConditions;
use receiver::JitterBufferConfig;
use sender::{BitrateConfig, Strategy};
use voip_bench::{NamedConditions, Sweep, Trial, TrialConfig};
use voip_bench_common::{
    init_tracing, parse_seconds, CodecKind, ColorWhen, MetricsContext, MetricsServerConfig,
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

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum StrategyArg {
    Conservative,
    Aggressive,
    Balanced,
    Quality,
}

impl From<StrategyArg> for Strategy {
    fn from(v: StrategyArg) -> Self {
        match v {
            StrategyArg::Conservative | StrategyArg::Aggressive => Strategy::Conservative,
            StrategyArg::Balanced => Strategy::Balanced,
            StrategyArg::Quality => Strategy::Quality,
        }
    }
}

/// VoIP Benchmark - Score audio quality across simulated network conditions
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Run every named profile (perfect, good, poor) instead of one trial
    #[arg(long, conflicts_with = "compare_codecs")]
    sweep: bool,

    /// Run one trial per codec under the same conditions, e.g. `opus,l16`
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    compare_codecs: Vec<CodecKind>,

    /// Start from a named network profile (perfect, good, poor)
    #[arg(long)]
    preset: Option<String>,

    /// Packet loss probability (0.0 - 1.0)
    #[arg(long)]
    packet_loss: Option<f64>,

    /// Jitter in milliseconds (± around the latency)
    #[arg(long)]
    jitter_ms: Option<f64>,

    /// One-way latency in milliseconds
    #[arg(long)]
    latency_ms: Option<f64>,

    /// Duplication probability (0.0 - 1.0)
    #[arg(long)]
    duplicate: Option<f64>,

    /// Reordering probability (0.0 - 1.0)
    #[arg(long)]
    reorder: Option<f64>,

    /// Payload corruption probability (0.0 - 1.0)
    #[arg(long)]
    corrupt: Option<f64>,

    /// Random seed for a reproducible network
    #[arg(long)]
    seed: Option<u64>,

    /// Codec (opus, l16)
    #[arg(long, default_value = "opus")]
    codec: CodecKind,

    /// Enable adaptive bitrate with this strategy
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,

    /// Starting codec bitrate in bits per second
    #[arg(long, default_value = "24000")]
    bitrate: u32,

    /// Input audio file (WAV); a tone is used if omitted
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Tone length in seconds
    #[arg(long = "duration-secs", default_value = "5", value_parser = parse_seconds)]
    duration: Duration,

    /// Write the decoded audio to this WAV file (a directory of them with
    /// --sweep or --compare-codecs)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Jitter buffer size in packets
    #[arg(long, default_value = "50")]
    buffer_packets: usize,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long)]
    metrics_bind: Option<String>,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorArg,
}

impl Args {
    // ---
    fn conditions(&self) -> Result<NetworkConditions> {
        // ---
        let base = match &self.preset {
            Some(name) => NetworkConditions::preset(name)
                .with_context(|| format!("unknown preset: {name}"))?,
            None => NetworkConditions::default(),
        };

        let c = NetworkConditions::try_new(
            self.packet_loss.unwrap_or(base.packet_loss()),
            self.jitter_ms.unwrap_or(base.jitter_ms()),
            self.latency_ms.unwrap_or(base.latency_ms()),
            self.duplicate.unwrap_or(base.duplicate_prob()),
            self.reorder.unwrap_or(base.reorder_prob()),
            self.corrupt.unwrap_or(base.corrupt_prob()),
        )?;
        Ok(c)
    }
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.color.into())?;
    info!("Starting VoIP benchmark v{VERSION}");

    let batch = args.sweep || !args.compare_codecs.is_empty();
    let config = TrialConfig {
        conditions: args.conditions()?,
        seed: args.seed,
        codec: args.codec,
        strategy: args.strategy.map(Strategy::from),
        bitrate: BitrateConfig {
            start_bitrate: args.bitrate,
            ..BitrateConfig::default()
        },
        input: args.input.clone(),
        duration: args.duration,
        jitter_buffer: JitterBufferConfig {
            max_size: args.buffer_packets,
        },
        output: if batch { None } else { args.output.clone() },
        ..TrialConfig::default()
    };

    let metrics = match &args.metrics_bind {
        Some(bind) => {
            info!("Metrics bind: {}", bind);
            let metrics = MetricsContext::new("bench")?;
            let bind = bind.parse().context("invalid metrics bind")?;
            let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(bind));
            Some(metrics)
        }
        None => None,
    };

    if batch {
        let mut sweep = Sweep::new(config);
        if let Some(dir) = &args.output {
            sweep = sweep.with_output_dir(dir);
        }
        if let Some(m) = metrics {
            sweep = sweep.with_metrics(m);
        }

        let report = if args.sweep {
            sweep.run(&NamedConditions::presets()).await?
        } else {
            sweep.compare_codecs(&args.compare_codecs).await?
        };
        print!("{report}");
        return Ok(());
    }

    let mut trial = Trial::new(config);
    if let Some(m) = metrics {
        trial = trial.with_metrics(m);
    }

    let report = trial.run().await.context("trial failed")?;
    if report.is_empty() {
        info!("No packets reached the receiver");
    }
    print!("{report}");

    Ok(())
}
