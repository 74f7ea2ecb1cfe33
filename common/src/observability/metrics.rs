//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is intended per process. Sessions, the simulator,
//! the jitter buffer and the bitrate controller report into it when a
//! context is attached; binaries decide whether to expose it over HTTP.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9100`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus metrics registry + handles.
///
/// Thin wrapper around the `prometheus` crate so hot-path instrumentation
/// is just counter increments and histogram observations. Cloning shares
/// the underlying registry.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Session transport
    pub packets_sent_total: IntCounter,
    pub packets_received_total: IntCounter,
    pub bytes_sent_total: IntCounter,
    pub bytes_received_total: IntCounter,
    pub invalid_datagrams_total: IntCounter,

    // Jitter buffer
    pub jitter_buffer_dropped_total: IntCounter,
    pub jitter_buffer_lost_total: IntCounter,
    pub jitter_buffer_occupancy_packets: IntGauge,

    // Network simulator
    pub sim_processed_total: IntCounter,
    pub sim_dropped_total: IntCounter,
    pub sim_delivered_total: IntCounter,
    pub sim_duplicated_total: IntCounter,
    pub sim_corrupted_total: IntCounter,
    pub sim_reordered_total: IntCounter,
    pub network_transit_seconds: Histogram,

    // Codec and quality
    pub encode_seconds: Histogram,
    pub decode_seconds: Histogram,
    pub current_bitrate_bps: IntGauge,
    pub mos: Gauge,
}

fn counter(name: &str, help: &str) -> Result<IntCounter> {
    Ok(IntCounter::with_opts(Opts::new(name, help))?)
}

fn histogram(name: &str, help: &str) -> Result<Histogram> {
    Ok(Histogram::with_opts(HistogramOpts::new(name, help))?)
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("voip_bench".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let ctx = Self {
            registry,
            packets_sent_total: counter("rtp_packets_sent_total", "Total RTP packets sent")?,
            packets_received_total: counter(
                "rtp_packets_received_total",
                "Total valid RTP packets received",
            )?,
            bytes_sent_total: counter("rtp_bytes_sent_total", "Total RTP bytes sent")?,
            bytes_received_total: counter(
                "rtp_bytes_received_total",
                "Total RTP bytes received",
            )?,
            invalid_datagrams_total: counter(
                "rtp_invalid_datagrams_total",
                "Datagrams dropped because they did not parse as RTP",
            )?,
            jitter_buffer_dropped_total: counter(
                "jitter_buffer_dropped_total",
                "Packets rejected by the jitter buffer (too old, duplicate or evicted)",
            )?,
            jitter_buffer_lost_total: counter(
                "jitter_buffer_lost_total",
                "Sequence numbers skipped by the jitter buffer as lost",
            )?,
            jitter_buffer_occupancy_packets: IntGauge::with_opts(Opts::new(
                "jitter_buffer_occupancy_packets",
                "Current jitter buffer occupancy in packets",
            ))?,
            sim_processed_total: counter(
                "netsim_packets_processed_total",
                "Packets submitted to the network simulator",
            )?,
            sim_dropped_total: counter(
                "netsim_packets_dropped_total",
                "Packets dropped by the network simulator",
            )?,
            sim_delivered_total: counter(
                "netsim_packets_delivered_total",
                "Packets delivered by the network simulator, duplicates included",
            )?,
            sim_duplicated_total: counter(
                "netsim_packets_duplicated_total",
                "Duplicate deliveries scheduled by the network simulator",
            )?,
            sim_corrupted_total: counter(
                "netsim_packets_corrupted_total",
                "Deliveries whose payload was corrupted",
            )?,
            sim_reordered_total: counter(
                "netsim_packets_reordered_total",
                "Packets given an extra reordering delay",
            )?,
            network_transit_seconds: histogram(
                "network_transit_seconds",
                "Simulated network transit time (seconds)",
            )?,
            encode_seconds: histogram("codec_encode_seconds", "Encode duration in seconds")?,
            decode_seconds: histogram("codec_decode_seconds", "Decode duration in seconds")?,
            current_bitrate_bps: IntGauge::with_opts(Opts::new(
                "codec_bitrate_bps",
                "Current codec target bitrate",
            ))?,
            mos: Gauge::with_opts(Opts::new("mos", "Most recent MOS estimate"))?,
        };

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(ctx.packets_sent_total.clone()),
            Box::new(ctx.packets_received_total.clone()),
            Box::new(ctx.bytes_sent_total.clone()),
            Box::new(ctx.bytes_received_total.clone()),
            Box::new(ctx.invalid_datagrams_total.clone()),
            Box::new(ctx.jitter_buffer_dropped_total.clone()),
            Box::new(ctx.jitter_buffer_lost_total.clone()),
            Box::new(ctx.jitter_buffer_occupancy_packets.clone()),
            Box::new(ctx.sim_processed_total.clone()),
            Box::new(ctx.sim_dropped_total.clone()),
            Box::new(ctx.sim_delivered_total.clone()),
            Box::new(ctx.sim_duplicated_total.clone()),
            Box::new(ctx.sim_corrupted_total.clone()),
            Box::new(ctx.sim_reordered_total.clone()),
            Box::new(ctx.network_transit_seconds.clone()),
            Box::new(ctx.encode_seconds.clone()),
            Box::new(ctx.decode_seconds.clone()),
            Box::new(ctx.current_bitrate_bps.clone()),
            Box::new(ctx.mos.clone()),
        ];
        for collector in collectors {
            ctx.registry.register(collector)?;
        }

        Ok(ctx)
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        // ---
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { handle_metrics_request(req, registry).await }
                    }))
                }
            });

            let server = Server::bind(&cfg.bind).serve(make_svc);
            server.await.map_err(|e| anyhow::anyhow!(e))?;
            Ok(())
        })
    }
}

async fn handle_metrics_request(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = Vec::new();

            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                let mut resp = Response::new(Body::from(format!("encode error: {e}")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return Ok(resp);
            }

            let mut resp = Response::new(Body::from(buffer));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(resp)
        }
        _ => {
            let mut resp = Response::new(Body::from("not found"));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Ok(resp)
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn metrics_context_gathers_something() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        let families = ctx.gather();
        assert!(!families.is_empty());
    }

    #[test]
    fn metrics_are_namespaced_and_labelled() {
        // ---
        let ctx = MetricsContext::new("bench").expect("MetricsContext should init");
        ctx.sim_dropped_total.inc_by(3);
        ctx.mos.set(4.1);

        let text = ctx.render().expect("render failed");
        assert!(text.contains("voip_bench_netsim_packets_dropped_total{process=\"bench\"} 3"));
        assert!(text.contains("voip_bench_mos{process=\"bench\"} 4.1"));
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        let req = Request::builder()
            .uri("/nope")
            .body(Body::empty())
            .expect("request build failed");

        let resp = handle_metrics_request(req, Arc::new(ctx.registry.clone()))
            .await
            .expect("handler failed");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
