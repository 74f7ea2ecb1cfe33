//! UDP relay that routes a real RTP stream through the simulator.
//!
//! ```text
//! sender --udp--> [ingress session] -> NetworkSimulator -> [egress session] --udp--> receiver
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use voip_bench_common::{MetricsContext, RtpPacket, RtpSession, TransportError};

use crate::simulator::{NetworkSimulator, SimulatorConfig, SimulatorStats};

/// Where the relay listens and where it forwards to.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    // ---
    pub listen_addr: String,

    /// 0 picks an ephemeral port; see [`Relay::local_addr`]
    pub listen_port: u16,

    pub destination_host: String,
    pub destination_port: u16,
    pub simulator: SimulatorConfig,
}

impl RelayConfig {
    pub fn loopback(destination_port: u16, simulator: SimulatorConfig) -> Self {
        Self {
            listen_addr: "127.0.0.1".into(),
            listen_port: 0,
            destination_host: "127.0.0.1".into(),
            destination_port,
            simulator,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelayStats {
    pub forwarded: u64,
    pub forward_errors: u64,
    pub simulator: SimulatorStats,
}

#[derive(Debug, Default)]
struct ForwardCounters {
    forwarded: AtomicU64,
    errors: AtomicU64,
}

struct ForwardTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Network simulator wired between two UDP sockets.
pub struct Relay {
    // ---
    ingress: RtpSession,
    simulator: Arc<NetworkSimulator>,
    counters: Arc<ForwardCounters>,
    forwarder: Option<ForwardTask>,
    destination: SocketAddr,
}

impl Relay {
    // ---
    /// Binds both sockets and starts receiving, simulating and forwarding.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if either socket cannot be bound or
    /// the destination cannot be resolved.
    pub async fn start(
        config: RelayConfig,
        metrics: Option<MetricsContext>,
    ) -> Result<Self, TransportError> {
        // ---
        let mut egress = RtpSession::open(&config.listen_addr, 0).await?;
        let destination = egress
            .set_remote(&config.destination_host, config.destination_port)
            .await?;
        let mut ingress = RtpSession::open(&config.listen_addr, config.listen_port).await?;

        let (tx, rx) = mpsc::unbounded_channel::<RtpPacket>();
        let mut simulator = NetworkSimulator::new(
            config.simulator,
            Arc::new(move |packet: RtpPacket, _is_duplicate: bool, _is_corrupted: bool| {
                tx.send(packet)
                    .map_err(|_| anyhow::anyhow!("relay forwarder has shut down"))
            }),
        );
        if let Some(m) = metrics {
            simulator = simulator.with_metrics(m);
        }
        let simulator = Arc::new(simulator);
        simulator.start();

        let counters = Arc::new(ForwardCounters::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(forward_loop(
            egress,
            rx,
            shutdown_rx,
            Arc::clone(&counters),
        ));

        let sim = Arc::clone(&simulator);
        ingress.start_receiving(Box::new(move |packet: RtpPacket, _src: SocketAddr| {
            sim.process_packet(packet);
            Ok(())
        }))?;

        info!(
            "Relay listening on {} forwarding to {}",
            ingress.local_addr(),
            destination
        );

        Ok(Self {
            ingress,
            simulator,
            counters,
            forwarder: Some(ForwardTask { shutdown, handle }),
            destination,
        })
    }

    /// Address senders should target.
    pub fn local_addr(&self) -> SocketAddr {
        self.ingress.local_addr()
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn simulator(&self) -> &NetworkSimulator {
        &self.simulator
    }

    /// Waits for every scheduled delivery to leave the simulator.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.simulator.wait_idle(timeout).await
    }

    /// Stops ingress, the simulator and the forwarder, in that order.
    ///
    /// Packets already handed to the forwarder are still sent; anything
    /// still scheduled inside the simulator is discarded. Idempotent.
    pub async fn stop(&mut self) {
        // ---
        self.ingress.close().await;
        self.simulator.stop().await;

        if let Some(task) = self.forwarder.take() {
            let _ = task.shutdown.send(true);
            if let Err(e) = task.handle.await {
                warn!("Relay forwarder ended abnormally: {}", e);
            }
        }
    }

    pub fn stats(&self) -> RelayStats {
        // ---
        RelayStats {
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            forward_errors: self.counters.errors.load(Ordering::Relaxed),
            simulator: self.simulator.stats(),
        }
    }
}

async fn forward_loop(
    mut egress: RtpSession,
    mut rx: mpsc::UnboundedReceiver<RtpPacket>,
    mut shutdown: watch::Receiver<bool>,
    counters: Arc<ForwardCounters>,
) {
    // ---
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(packet) => forward(&egress, &packet, &counters).await,
                None => break,
            },
            _ = shutdown.changed() => {
                rx.close();
                while let Some(packet) = rx.recv().await {
                    forward(&egress, &packet, &counters).await;
                }
                break;
            }
        }
    }

    egress.close().await;
    debug!("Relay forwarder exited");
}

async fn forward(egress: &RtpSession, packet: &RtpPacket, counters: &ForwardCounters) {
    // ---
    match egress.send_packet(packet).await {
        Ok(_) => {
            counters.forwarded.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!("Relay failed to forward seq={}: {}", packet.sequence, e);
        }
    }
}
